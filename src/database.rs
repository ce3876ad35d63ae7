/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file database.rs
 * @brief Database facade and the process-wide entry point
 */

use crate::config::HybridConfig;
use crate::connection::{ConnectionHandle, ConnectionManager, StoreRole};
use crate::connection_pool::PoolSettings;
use crate::drift::{DriftCorrector, DriftOutcome};
use crate::error::{HybridError, Result};
use crate::health::{HealthChecker, HealthReport};
use crate::proxy::{CollectionProxy, Router};
use crate::replication::{ReplicationScheduler, ReplicationStats, SchedulerSettings};
use crate::store::DocumentStore;
use crate::sync_lock::SyncLocks;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info};
use uuid::Uuid;

static DATABASE: OnceCell<Database> = OnceCell::const_new();

/// The process-wide database, connected from `HYBRIDDB_*` environment
/// variables on first use. Every call also starts a drift check in the
/// background; the check itself is rate limited.
pub async fn get_database() -> Result<Database> {
    let database = DATABASE
        .get_or_try_init(|| async {
            let config = HybridConfig::from_env()?;
            Database::connect(config).await
        })
        .await?
        .clone();
    database.trigger_drift_check();
    Ok(database)
}

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    id: Uuid,
    config: HybridConfig,
    manager: Option<ConnectionManager>,
    router: Arc<Router>,
    drift: Arc<DriftCorrector>,
    health: HealthChecker,
}

impl Database {
    /// Connect both stores described by `config`. Only a primary failure is
    /// an error; a missing secondary leaves the database in primary-only mode.
    pub async fn connect(config: HybridConfig) -> Result<Self> {
        config.validate()?;
        let manager = ConnectionManager::new(config.clone());
        let primary = manager.connect_primary().await?;
        let secondary = manager.connect_secondary().await;
        Ok(Self::assemble(config, Some(manager), primary, secondary))
    }

    /// Build a database over stores the caller already holds. Must be called
    /// inside a Tokio runtime.
    pub fn from_stores(
        primary: Arc<dyn DocumentStore>,
        secondary: Option<Arc<dyn DocumentStore>>,
        config: HybridConfig,
    ) -> Self {
        let settings = PoolSettings::from_config(&config);
        let primary = Arc::new(ConnectionHandle::new(
            StoreRole::Primary,
            "injected://primary",
            settings.clone(),
            primary,
        ));
        let secondary = secondary.map(|store| {
            Arc::new(ConnectionHandle::new(
                StoreRole::Secondary,
                "injected://secondary",
                settings,
                store,
            ))
        });
        Self::assemble(config, None, primary, secondary)
    }

    fn assemble(
        config: HybridConfig,
        manager: Option<ConnectionManager>,
        primary: Arc<ConnectionHandle>,
        secondary: Option<Arc<ConnectionHandle>>,
    ) -> Self {
        let locks = SyncLocks::new();
        let scheduler = secondary.as_ref().map(|secondary| {
            Arc::new(ReplicationScheduler::start(
                Arc::clone(primary.store()),
                Arc::clone(secondary),
                locks.clone(),
                SchedulerSettings::from_config(&config),
            ))
        });
        let drift = Arc::new(DriftCorrector::new(
            Arc::clone(primary.store()),
            secondary.clone(),
            locks,
            config.drift_check_interval(),
        ));
        let id = Uuid::new_v4();
        info!(
            "Database {} ready (primary {}, secondary {})",
            id,
            primary.uri(),
            secondary.as_ref().map(|s| s.uri()).unwrap_or("none")
        );

        Self {
            inner: Arc::new(DatabaseInner {
                id,
                health: HealthChecker::new(config.connect_timeout(), id),
                config,
                manager,
                router: Arc::new(Router::new(primary, secondary, scheduler)),
                drift,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &HybridConfig {
        &self.inner.config
    }

    pub fn collection(&self, name: &str) -> CollectionProxy {
        CollectionProxy::new(name, Arc::clone(&self.inner.router))
    }

    pub fn secondary_available(&self) -> bool {
        self.inner.router.live_secondary().is_some()
    }

    pub fn trigger_drift_check(&self) {
        if !self.secondary_available() {
            return;
        }
        let drift = Arc::clone(&self.inner.drift);
        tokio::spawn(async move {
            drift.check().await;
        });
    }

    pub async fn force_sync(&self) -> Result<DriftOutcome> {
        Ok(self.inner.drift.force().await)
    }

    pub fn drift_scans(&self) -> u64 {
        self.inner.drift.scans_started()
    }

    pub fn replication_stats(&self) -> ReplicationStats {
        self.inner
            .router
            .scheduler()
            .map(|scheduler| scheduler.stats())
            .unwrap_or_default()
    }

    pub async fn wait_for_replication(&self, timeout: Duration) -> Result<()> {
        match self.inner.router.scheduler() {
            Some(scheduler) if !scheduler.wait_idle(timeout).await => Err(HybridError::Timeout(timeout)),
            _ => Ok(()),
        }
    }

    pub async fn health(&self) -> HealthReport {
        let router = &self.inner.router;
        self.inner
            .health
            .check_health(
                router.primary(),
                router.secondary().map(|s| s.as_ref()),
                router.scheduler().map(|s| s.stats()),
            )
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let drained = match self.inner.router.scheduler() {
            Some(scheduler) => scheduler.shutdown().await,
            None => Ok(()),
        };
        if let Err(e) = &drained {
            error!("Replication queue not fully drained: {}", e);
        }

        match &self.inner.manager {
            Some(manager) => manager.shutdown().await,
            None => {
                if let Some(secondary) = self.inner.router.secondary() {
                    secondary.store().close().await;
                }
                self.inner.router.primary().store().close().await;
            }
        }
        info!("Database {} shut down", self.inner.id);
        drained
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("primary", self.inner.router.primary())
            .field("secondary", &self.inner.router.secondary())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryStore;
    use crate::proxy::Collection;
    use bson::doc;

    #[tokio::test]
    async fn test_connect_with_memory_stores() {
        let config = HybridConfig {
            secondary_uri: "memory://db-unit-s".to_string(),
            ..HybridConfig::with_primary("memory://db-unit-p")
        };
        let db = Database::connect(config).await.unwrap();
        assert!(db.secondary_available());

        db.collection("users").insert_one(doc! { "_id": 1 }).await.unwrap();
        db.wait_for_replication(Duration::from_secs(2)).await.unwrap();
        assert_eq!(InMemoryStore::named("db-unit-s").documents("users").len(), 1);
        db.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let err = Database::connect(HybridConfig::default()).await.unwrap_err();
        assert!(matches!(err, HybridError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_primary_only_database() {
        let db = Database::from_stores(Arc::new(InMemoryStore::new()), None, HybridConfig::default());
        assert!(!db.secondary_available());
        assert_eq!(db.force_sync().await.unwrap(), DriftOutcome::NoSecondary);
        assert_eq!(db.replication_stats(), ReplicationStats::default());
        db.wait_for_replication(Duration::from_millis(10)).await.unwrap();
    }
}
