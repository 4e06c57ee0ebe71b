//! Periodic health probes.
//!
//! Components register probes; a background task runs the set every
//! minute, rolls individual results up into an overall status, and reports
//! transitions into the unhealthy band to a listener (which notifies).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

impl ComponentHealth {
    pub fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: String::new(),
        }
    }

    pub fn degraded(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Degraded,
            message: message.to_string(),
        }
    }

    pub fn unhealthy(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unhealthy,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl SystemHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn unhealthy_components(&self) -> Vec<String> {
        self.components
            .values()
            .filter(|c| c.status == HealthStatus::Unhealthy)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> ComponentHealth;
}

#[async_trait]
pub trait HealthListener: Send + Sync {
    async fn on_unhealthy(&self, health: &SystemHealth);
}

pub struct HealthChecker {
    probes: Mutex<Vec<Arc<dyn HealthProbe>>>,
    last: Mutex<Option<SystemHealth>>,
    listener: Arc<dyn HealthListener>,
}

impl HealthChecker {
    pub fn new(listener: Arc<dyn HealthListener>) -> Self {
        info!("HealthChecker initialized");
        Self {
            probes: Mutex::new(Vec::new()),
            last: Mutex::new(None),
            listener,
        }
    }

    pub async fn register(&self, probe: Arc<dyn HealthProbe>) {
        self.probes.lock().await.push(probe);
    }

    pub async fn last_health(&self) -> Option<SystemHealth> {
        self.last.lock().await.clone()
    }

    /// Run every probe once and roll up. A probe panic counts as
    /// unhealthy for that component, never for the process.
    pub async fn check_now(&self) -> SystemHealth {
        let probes: Vec<Arc<dyn HealthProbe>> = self.probes.lock().await.clone();
        let mut components = BTreeMap::new();
        let mut overall = HealthStatus::Healthy;

        for probe in probes {
            let result = tokio::spawn(async move { probe.check().await }).await;
            let health = match result {
                Ok(health) => health,
                Err(e) => {
                    error!("health probe panicked: {e}");
                    ComponentHealth::unhealthy("unknown", "probe panicked")
                }
            };
            match health.status {
                HealthStatus::Unhealthy => overall = HealthStatus::Unhealthy,
                HealthStatus::Degraded if overall == HealthStatus::Healthy => {
                    overall = HealthStatus::Degraded
                }
                _ => {}
            }
            components.insert(health.name.clone(), health);
        }

        let health = SystemHealth {
            status: overall,
            components,
        };
        *self.last.lock().await = Some(health.clone());
        health
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            // The first tick fires immediately; skip it so startup noise
            // settles before the first verdict.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let health = checker.check_now().await;
                        match health.status {
                            HealthStatus::Unhealthy => {
                                error!(
                                    "system UNHEALTHY: {:?}",
                                    health.unhealthy_components()
                                );
                                checker.listener.on_unhealthy(&health).await;
                            }
                            HealthStatus::Degraded => {
                                warn!("system degraded");
                            }
                            HealthStatus::Healthy => debug!("health check passed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("health checker stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}
