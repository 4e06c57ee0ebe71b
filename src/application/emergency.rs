//! Emergency stop via a sentinel file.
//!
//! The operator creates `EMERGENCY_STOP` under the state directory to halt
//! the worker from outside the process. A watcher task polls for it every
//! five seconds; on detection the file's contents become the reported
//! reason, the file is deleted (so the next start does not loop), and the
//! handler cancels all pending orders, notifies and stops the engine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const STOP_FILE_NAME: &str = "EMERGENCY_STOP";
const CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait EmergencyHandler: Send + Sync {
    async fn on_emergency_stop(&self, reason: &str);
}

pub struct EmergencyStop {
    stop_file: PathBuf,
    triggered: AtomicBool,
}

impl EmergencyStop {
    pub fn new(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        let stop_file = state_dir.join(STOP_FILE_NAME);
        info!("EmergencyStop initialized: watching {}", stop_file.display());
        Ok(Self {
            stop_file,
            triggered: AtomicBool::new(false),
        })
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// One poll. On first detection: read the reason, delete the file,
    /// latch the trigger.
    pub fn check_once(&self) -> Option<String> {
        if self.is_triggered() || !self.stop_file.exists() {
            return None;
        }
        self.triggered.store(true, Ordering::SeqCst);

        let reason = std::fs::read_to_string(&self.stop_file)
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "EMERGENCY_STOP file detected".to_string());

        if let Err(e) = std::fs::remove_file(&self.stop_file) {
            error!("failed to remove emergency stop file: {e}");
        } else {
            info!("emergency stop file removed");
        }
        Some(reason)
    }

    /// Create the sentinel from inside the process (operator tooling).
    pub fn trigger_manually(&self, reason: &str) -> Result<()> {
        if self.is_triggered() {
            warn!("emergency stop already triggered");
            return Ok(());
        }
        std::fs::write(&self.stop_file, reason).context("failed to write emergency stop file")?;
        info!("emergency stop file created: {reason}");
        Ok(())
    }

    pub fn spawn_watcher(
        self: &Arc<Self>,
        handler: Arc<dyn EmergencyHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            info!("emergency stop watcher started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(reason) = watcher.check_once() {
                            error!("EMERGENCY STOP triggered: {reason}");
                            handler.on_emergency_stop(&reason).await;
                            return;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("emergency stop watcher stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn sentinel_contents_become_the_reason() {
        let dir = tempfile::tempdir().unwrap();
        let stop = EmergencyStop::new(dir.path()).unwrap();

        std::fs::write(dir.path().join(STOP_FILE_NAME), "fat finger, stop now\n").unwrap();
        assert_eq!(stop.check_once().as_deref(), Some("fat finger, stop now"));

        // The file is consumed and the trigger latched.
        assert!(!dir.path().join(STOP_FILE_NAME).exists());
        assert!(stop.is_triggered());
        assert!(stop.check_once().is_none());
    }

    #[test]
    fn empty_sentinel_gets_a_default_reason() {
        let dir = tempfile::tempdir().unwrap();
        let stop = EmergencyStop::new(dir.path()).unwrap();
        std::fs::write(dir.path().join(STOP_FILE_NAME), "").unwrap();
        assert_eq!(
            stop.check_once().as_deref(),
            Some("EMERGENCY_STOP file detected")
        );
    }

    #[test]
    fn no_file_no_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let stop = EmergencyStop::new(dir.path()).unwrap();
        assert!(stop.check_once().is_none());
        assert!(!stop.is_triggered());
    }

    struct Recorder {
        reasons: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl EmergencyHandler for Recorder {
        async fn on_emergency_stop(&self, reason: &str) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_fires_handler_once() {
        let dir = tempfile::tempdir().unwrap();
        let stop = Arc::new(EmergencyStop::new(dir.path()).unwrap());
        stop.trigger_manually("pull the plug").unwrap();

        let handler = Arc::new(Recorder {
            reasons: StdMutex::new(Vec::new()),
        });
        let (_tx, rx) = watch::channel(false);
        let handle = stop.spawn_watcher(handler.clone(), rx);

        // First interval tick fires immediately under the paused clock.
        handle.await.unwrap();
        assert_eq!(handler.reasons.lock().unwrap().as_slice(), ["pull the plug"]);
    }
}
