/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file health.rs
 * @brief Liveness checks of the primary and secondary stores
 */

use crate::connection::ConnectionHandle;
use crate::replication::ReplicationStats;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub instance_id: Uuid,
    pub checks: HashMap<String, HealthCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "degraded")]
    Degraded,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthState,
    pub message: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
}

pub struct HealthChecker {
    probe_timeout: Duration,
    version: String,
    instance_id: Uuid,
}

impl HealthChecker {
    pub fn new(probe_timeout: Duration, instance_id: Uuid) -> Self {
        Self {
            probe_timeout,
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id,
        }
    }

    pub async fn check_health(
        &self,
        primary: &ConnectionHandle,
        secondary: Option<&ConnectionHandle>,
        replication: Option<ReplicationStats>,
    ) -> HealthReport {
        let mut checks = HashMap::new();
        checks.insert("primary".to_string(), self.check_store(primary, false).await);
        let secondary_check = match secondary {
            Some(handle) => self.check_store(handle, true).await,
            None => HealthCheck {
                status: HealthState::Degraded,
                message: "No secondary store; serving from primary only".to_string(),
                duration_ms: 0,
                details: None,
            },
        };
        checks.insert("secondary".to_string(), secondary_check);

        HealthReport {
            status: determine_overall_status(&checks),
            timestamp: chrono::Utc::now(),
            version: self.version.clone(),
            instance_id: self.instance_id,
            checks,
            replication,
        }
    }

    /// Ping a store. A failing secondary only degrades service, so its
    /// failures report `Degraded`.
    async fn check_store(&self, handle: &ConnectionHandle, optional: bool) -> HealthCheck {
        let start = Instant::now();
        let failed = if optional { HealthState::Degraded } else { HealthState::Unhealthy };
        let mut details = HashMap::from([
            ("uri".to_string(), handle.uri().to_string()),
            ("kind".to_string(), handle.store().kind().to_string()),
        ]);

        if !handle.is_alive() {
            return HealthCheck {
                status: failed,
                message: format!("{} store marked unavailable", handle.role()),
                duration_ms: 0,
                details: Some(details),
            };
        }

        match timeout(self.probe_timeout, handle.store().ping()).await {
            Ok(Ok(())) => HealthCheck {
                status: HealthState::Healthy,
                message: format!("{} store reachable", handle.role()),
                duration_ms: start.elapsed().as_millis() as u64,
                details: Some(details),
            },
            Ok(Err(e)) => {
                details.insert("error".to_string(), e.to_string());
                HealthCheck {
                    status: failed,
                    message: format!("{} store ping failed: {}", handle.role(), e),
                    duration_ms: start.elapsed().as_millis() as u64,
                    details: Some(details),
                }
            }
            Err(_) => {
                details.insert("timeout_ms".to_string(), self.probe_timeout.as_millis().to_string());
                HealthCheck {
                    status: failed,
                    message: format!("{} store check timeout", handle.role()),
                    duration_ms: start.elapsed().as_millis() as u64,
                    details: Some(details),
                }
            }
        }
    }
}

fn determine_overall_status(checks: &HashMap<String, HealthCheck>) -> HealthState {
    let mut has_unhealthy = false;
    let mut has_degraded = false;

    for check in checks.values() {
        match check.status {
            HealthState::Unhealthy => has_unhealthy = true,
            HealthState::Degraded => has_degraded = true,
            HealthState::Healthy => {}
        }
    }

    if has_unhealthy {
        HealthState::Unhealthy
    } else if has_degraded {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StoreRole;
    use crate::connection_pool::PoolSettings;
    use crate::memory_store::InMemoryStore;
    use std::sync::Arc;

    fn handle(role: StoreRole, store: Arc<InMemoryStore>) -> ConnectionHandle {
        ConnectionHandle::new(role, "memory://health", PoolSettings::default(), store)
    }

    #[tokio::test]
    async fn test_status_levels() {
        let checker = HealthChecker::new(Duration::from_millis(200), Uuid::new_v4());
        let primary_store = Arc::new(InMemoryStore::new());
        let secondary_store = Arc::new(InMemoryStore::new());
        let primary = handle(StoreRole::Primary, primary_store.clone());
        let secondary = handle(StoreRole::Secondary, secondary_store.clone());

        let report = checker.check_health(&primary, Some(&secondary), None).await;
        assert_eq!(report.status, HealthState::Healthy);

        secondary_store.set_offline(true);
        let report = checker.check_health(&primary, Some(&secondary), None).await;
        assert_eq!(report.status, HealthState::Degraded);

        let report = checker.check_health(&primary, None, None).await;
        assert_eq!(report.status, HealthState::Degraded);

        primary_store.set_offline(true);
        let report = checker.check_health(&primary, Some(&secondary), None).await;
        assert_eq!(report.status, HealthState::Unhealthy);
        assert_eq!(report.status.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let checker = HealthChecker::new(Duration::from_millis(20), Uuid::new_v4());
        let store = Arc::new(InMemoryStore::new());
        store.set_latency(Duration::from_millis(200));
        let primary = handle(StoreRole::Primary, store);

        let report = checker.check_health(&primary, None, None).await;
        assert_eq!(report.checks["primary"].status, HealthState::Unhealthy);
        assert!(report.checks["primary"].message.contains("timeout"));
    }
}
