/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file drift.rs
 * @brief Periodic count comparison and repair of diverged collections
 */

use crate::connection::ConnectionHandle;
use crate::replication::full_resync;
use crate::store::DocumentStore;
use crate::sync_lock::SyncLocks;
use bson::Document;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub checked: Vec<String>,
    pub resynced: Vec<String>,
    pub failed: Vec<CollectionFailure>,
    /// Collections passed over because a resync already held their lock.
    pub skipped: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionFailure {
    pub collection: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DriftOutcome {
    NoSecondary,
    RateLimited,
    AlreadyRunning,
    Completed(DriftReport),
}

impl DriftOutcome {
    pub fn report(&self) -> Option<&DriftReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct DriftState {
    last_check: Option<Instant>,
    in_progress: bool,
}

struct ScanGuard<'a>(&'a Mutex<DriftState>);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().in_progress = false;
    }
}

pub struct DriftCorrector {
    primary: Arc<dyn DocumentStore>,
    secondary: Option<Arc<ConnectionHandle>>,
    locks: SyncLocks,
    interval: Duration,
    state: Mutex<DriftState>,
    scans: AtomicU64,
}

impl DriftCorrector {
    pub fn new(
        primary: Arc<dyn DocumentStore>,
        secondary: Option<Arc<ConnectionHandle>>,
        locks: SyncLocks,
        interval: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            locks,
            interval,
            state: Mutex::new(DriftState::default()),
            scans: AtomicU64::new(0),
        }
    }

    pub fn scans_started(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().in_progress
    }

    pub async fn check(&self) -> DriftOutcome {
        let Some(secondary) = self.live_secondary() else {
            return DriftOutcome::NoSecondary;
        };
        let guard = {
            let mut state = self.state.lock();
            if state.in_progress {
                return DriftOutcome::AlreadyRunning;
            }
            if let Some(last) = state.last_check {
                if last.elapsed() < self.interval {
                    return DriftOutcome::RateLimited;
                }
            }
            state.in_progress = true;
            state.last_check = Some(Instant::now());
            ScanGuard(&self.state)
        };

        let report = self.scan(&secondary).await;
        drop(guard);
        DriftOutcome::Completed(report)
    }

    /// Forget when the last scan ran and scan now. A scan already running is
    /// left alone and reported as `AlreadyRunning`.
    pub async fn force(&self) -> DriftOutcome {
        self.state.lock().last_check = None;
        self.check().await
    }

    fn live_secondary(&self) -> Option<Arc<ConnectionHandle>> {
        self.secondary.as_ref().filter(|s| s.is_alive()).cloned()
    }

    async fn scan(&self, secondary: &ConnectionHandle) -> DriftReport {
        self.scans.fetch_add(1, Ordering::SeqCst);
        counter!("hybriddb_drift_scans_total").increment(1);
        let started = Instant::now();
        let mut report = DriftReport::default();

        let collections = match self.primary.list_collections().await {
            Ok(collections) => collections,
            Err(e) => {
                warn!("Drift check could not list primary collections: {}", e);
                report.failed.push(CollectionFailure {
                    collection: "*".to_string(),
                    error: e.to_string(),
                });
                report.duration_ms = started.elapsed().as_millis() as u64;
                return report;
            }
        };

        for collection in collections {
            if !secondary.is_alive() {
                warn!("Secondary became unavailable, stopping drift check");
                break;
            }
            let Some(_lock) = self.locks.try_acquire(&collection) else {
                debug!("Drift check skipping {}: resync in progress", collection);
                report.skipped.push(collection);
                continue;
            };
            report.checked.push(collection.clone());

            match self.reconcile(secondary, &collection).await {
                Ok(true) => report.resynced.push(collection),
                Ok(false) => {}
                Err(e) => {
                    if e.is_connection() && secondary.mark_unavailable() {
                        warn!("Secondary store marked unavailable during drift check: {}", e);
                    }
                    warn!("Drift check failed for {}: {}", collection, e);
                    report.failed.push(CollectionFailure {
                        collection,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Drift check finished: {} checked, {} resynced, {} failed, {} skipped in {}ms",
            report.checked.len(),
            report.resynced.len(),
            report.failed.len(),
            report.skipped.len(),
            report.duration_ms
        );
        report
    }

    async fn reconcile(&self, secondary: &ConnectionHandle, collection: &str) -> crate::error::StoreResult<bool> {
        let on_primary = self.primary.count_documents(collection, Document::new()).await?;
        let on_secondary = secondary.store().count_documents(collection, Document::new()).await?;
        if on_primary == on_secondary {
            return Ok(false);
        }
        info!(
            "Collection {} drifted (primary {}, secondary {}), resyncing",
            collection, on_primary, on_secondary
        );
        let _access = self.locks.rebuild_access(collection).await;
        full_resync(self.primary.as_ref(), secondary.store().as_ref(), collection).await?;
        counter!("hybriddb_drift_resyncs_total").increment(1);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StoreRole;
    use crate::connection_pool::PoolSettings;
    use crate::memory_store::InMemoryStore;
    use bson::doc;

    fn corrector(interval: Duration) -> (Arc<InMemoryStore>, Arc<InMemoryStore>, DriftCorrector) {
        let primary = Arc::new(InMemoryStore::new());
        let secondary = Arc::new(InMemoryStore::new());
        let handle = Arc::new(ConnectionHandle::new(
            StoreRole::Secondary,
            "memory://drift",
            PoolSettings::default(),
            secondary.clone(),
        ));
        let corrector = DriftCorrector::new(primary.clone(), Some(handle), SyncLocks::new(), interval);
        (primary, secondary, corrector)
    }

    #[tokio::test]
    async fn test_resyncs_only_diverged_collections() {
        let (primary, secondary, corrector) = corrector(Duration::from_secs(300));
        primary.insert_many("users", vec![doc! { "_id": 1 }, doc! { "_id": 2 }]).await.unwrap();
        secondary.insert_one("users", doc! { "_id": 1 }).await.unwrap();
        primary.insert_one("courses", doc! { "_id": 1 }).await.unwrap();
        secondary.insert_one("courses", doc! { "_id": 1 }).await.unwrap();

        let outcome = corrector.check().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.checked, vec!["users".to_string(), "courses".to_string()]);
        assert_eq!(report.resynced, vec!["users".to_string()]);
        assert_eq!(secondary.documents("users").len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_until_forced() {
        let (_primary, _secondary, corrector) = corrector(Duration::from_secs(300));
        assert!(matches!(corrector.check().await, DriftOutcome::Completed(_)));
        assert_eq!(corrector.check().await, DriftOutcome::RateLimited);
        assert!(matches!(corrector.force().await, DriftOutcome::Completed(_)));
        assert_eq!(corrector.scans_started(), 2);
        assert!(!corrector.is_running());
    }

    #[tokio::test]
    async fn test_busy_collection_is_skipped() {
        let (primary, _secondary, corrector) = corrector(Duration::ZERO);
        primary.insert_one("enrollments", doc! { "_id": 1 }).await.unwrap();
        let _held = corrector.locks.try_acquire("enrollments").unwrap();

        let report = corrector.check().await.report().cloned().unwrap();
        assert_eq!(report.skipped, vec!["enrollments".to_string()]);
        assert!(report.resynced.is_empty());
    }

    #[tokio::test]
    async fn test_failure_in_one_collection_does_not_stop_scan() {
        let (primary, secondary, corrector) = corrector(Duration::ZERO);
        primary.insert_one("a", doc! { "_id": 1 }).await.unwrap();
        primary.insert_one("b", doc! { "_id": 1 }).await.unwrap();
        secondary.set_fail_writes(true);

        let report = corrector.check().await.report().cloned().unwrap();
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.checked.len(), 2);
        assert!(!corrector.is_running());
    }

    #[tokio::test]
    async fn test_without_secondary() {
        let corrector = DriftCorrector::new(
            Arc::new(InMemoryStore::new()),
            None,
            SyncLocks::new(),
            Duration::ZERO,
        );
        assert_eq!(corrector.force().await, DriftOutcome::NoSecondary);
    }
}
