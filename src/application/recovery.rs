//! Crash detection and session-state heartbeat.
//!
//! A session-state file under the state directory records the live
//! session; a heartbeat task rewrites it every 30 seconds. Finding the
//! file still in `running` at startup means the previous process died
//! without a graceful stop: the state is recorded to a capped crash log
//! and handed to the caller, which re-syncs positions from the broker
//! (local state is treated as a suspect cache). A clean stop writes
//! `stopped`, defeating detection on the next start.

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CRASH_LOG_CAP: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub pid: u32,
    /// running | stopped | crashed
    pub status: String,
    pub started_at: String,
    pub last_heartbeat: String,
    #[serde(default)]
    pub active_orders: Vec<String>,
    #[serde(default)]
    pub positions: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashLogEntry {
    pub detected_at: String,
    pub session: SessionState,
}

pub struct RecoveryManager {
    state_file: PathBuf,
    crash_log_file: PathBuf,
    session_id: StdMutex<Option<String>>,
}

impl RecoveryManager {
    pub fn new(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        info!("RecoveryManager initialized: {}", state_dir.display());
        Ok(Self {
            state_file: state_dir.join("session_state.json"),
            crash_log_file: state_dir.join("crash_log.json"),
            session_id: StdMutex::new(None),
        })
    }

    /// Detect an abnormal end of the previous session. On detection the
    /// state file is rewritten as `crashed`, so subsequent starts do not
    /// report the same crash again.
    pub fn check_previous_crash(&self) -> Option<SessionState> {
        let raw = std::fs::read_to_string(&self.state_file).ok()?;
        let state: SessionState = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!("unreadable session state file: {e}");
                return None;
            }
        };
        if state.status != "running" {
            return None;
        }

        warn!(
            "previous session crash detected: {} (last heartbeat {})",
            state.session_id, state.last_heartbeat
        );
        self.append_crash_log(&state);

        let mut crashed = state.clone();
        crashed.status = "crashed".to_string();
        if let Err(e) = self.write_state(&crashed) {
            error!("failed to mark session state as crashed: {e:#}");
        }

        let mut detected = state;
        detected.status = "crashed".to_string();
        Some(detected)
    }

    fn append_crash_log(&self, state: &SessionState) {
        let mut entries: Vec<CrashLogEntry> = std::fs::read_to_string(&self.crash_log_file)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        entries.push(CrashLogEntry {
            detected_at: Local::now().naive_local().to_string(),
            session: state.clone(),
        });
        if entries.len() > CRASH_LOG_CAP {
            let excess = entries.len() - CRASH_LOG_CAP;
            entries.drain(..excess);
        }
        match serde_json::to_string_pretty(&entries) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&self.crash_log_file, body) {
                    error!("failed to write crash log: {e}");
                }
            }
            Err(e) => error!("failed to serialize crash log: {e}"),
        }
    }

    /// Begin a new session: record it as running.
    pub fn start_session(&self, session_id: &str) -> Result<()> {
        {
            let mut guard = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(session_id.to_string());
        }
        self.save("running", None, None)?;
        info!("session started: {session_id}");
        Ok(())
    }

    /// Graceful end: the next start must not see a crash.
    pub fn stop_session(&self) -> Result<()> {
        self.save("stopped", None, None)?;
        let session = self.session_id.lock().unwrap_or_else(|e| e.into_inner()).clone();
        info!("session stopped: {}", session.unwrap_or_default());
        Ok(())
    }

    pub fn update_active_orders(&self, order_ids: Vec<String>) {
        if let Err(e) = self.save("running", Some(order_ids), None) {
            error!("failed to update session active orders: {e:#}");
        }
    }

    pub fn update_positions(&self, symbols: Vec<String>) {
        if let Err(e) = self.save("running", None, Some(symbols)) {
            error!("failed to update session positions: {e:#}");
        }
    }

    /// Heartbeat task: refresh the state file every 30 seconds while the
    /// engine runs.
    pub fn spawn_heartbeat(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = manager.save("running", None, None) {
                            error!("heartbeat write failed: {e:#}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("heartbeat task stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    pub fn crash_logs(&self, limit: usize) -> Vec<CrashLogEntry> {
        let entries: Vec<CrashLogEntry> = std::fs::read_to_string(&self.crash_log_file)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        entries.into_iter().rev().take(limit).collect()
    }

    fn save(
        &self,
        status: &str,
        active_orders: Option<Vec<String>>,
        positions: Option<Vec<String>>,
    ) -> Result<()> {
        let existing: Option<SessionState> = std::fs::read_to_string(&self.state_file)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let now = Local::now().naive_local().to_string();
        let session_id = self
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .or_else(|| existing.as_ref().map(|s| s.session_id.clone()))
            .unwrap_or_default();

        let state = SessionState {
            session_id,
            pid: std::process::id(),
            status: status.to_string(),
            started_at: existing
                .as_ref()
                .map(|s| s.started_at.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| now.clone()),
            last_heartbeat: now,
            active_orders: active_orders
                .or_else(|| existing.as_ref().map(|s| s.active_orders.clone()))
                .unwrap_or_default(),
            positions: positions
                .or_else(|| existing.as_ref().map(|s| s.positions.clone()))
                .unwrap_or_default(),
            metadata: existing
                .map(|s| s.metadata)
                .unwrap_or(serde_json::Value::Null),
        };
        self.write_state(&state)
    }

    /// Atomic write: temp file then rename, so a crash mid-write cannot
    /// leave a torn state file.
    fn write_state(&self, state: &SessionState) -> Result<()> {
        let body = serde_json::to_string_pretty(state)?;
        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, body).context("failed to write session state temp file")?;
        std::fs::rename(&tmp, &self.state_file).context("failed to swap session state file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_stop_defeats_crash_detection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RecoveryManager::new(dir.path()).unwrap();

        manager.start_session("sess-1").unwrap();
        manager.stop_session().unwrap();

        let next = RecoveryManager::new(dir.path()).unwrap();
        assert!(next.check_previous_crash().is_none());
    }

    #[test]
    fn abrupt_end_is_detected_once() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = RecoveryManager::new(dir.path()).unwrap();
            manager.start_session("sess-crash").unwrap();
            manager.update_active_orders(vec!["ORD-1".into(), "ORD-2".into()]);
            // Dropped without stop_session: simulated crash.
        }

        let next = RecoveryManager::new(dir.path()).unwrap();
        let crashed = next.check_previous_crash().expect("crash must be detected");
        assert_eq!(crashed.session_id, "sess-crash");
        assert_eq!(crashed.status, "crashed");
        assert_eq!(crashed.active_orders.len(), 2);

        // One crash-log entry, and no duplicate detection afterwards.
        assert_eq!(next.crash_logs(10).len(), 1);
        assert!(next.check_previous_crash().is_none());
        let again = RecoveryManager::new(dir.path()).unwrap();
        assert!(again.check_previous_crash().is_none());
    }

    #[test]
    fn crash_log_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(CRASH_LOG_CAP + 5) {
            let manager = RecoveryManager::new(dir.path()).unwrap();
            manager.start_session(&format!("sess-{i}")).unwrap();
            drop(manager);
            let detector = RecoveryManager::new(dir.path()).unwrap();
            detector.check_previous_crash();
        }
        let manager = RecoveryManager::new(dir.path()).unwrap();
        assert_eq!(manager.crash_logs(usize::MAX).len(), CRASH_LOG_CAP);
        // Newest first.
        let newest = &manager.crash_logs(1)[0];
        assert_eq!(newest.session.session_id, format!("sess-{}", CRASH_LOG_CAP + 4));
    }

    #[test]
    fn started_at_survives_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RecoveryManager::new(dir.path()).unwrap();
        manager.start_session("sess-hb").unwrap();
        let first: SessionState = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("session_state.json")).unwrap(),
        )
        .unwrap();

        manager.update_active_orders(vec!["ORD-9".into()]);
        let second: SessionState = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("session_state.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(second.active_orders, vec!["ORD-9".to_string()]);
    }
}
