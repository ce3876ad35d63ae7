/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file replication.rs
 * @brief Background replication of primary writes onto the secondary
 */

//! Writes hand the scheduler a job and return. Jobs sit in a bounded queue
//! that a few workers drain: inserts are replayed verbatim, every other write
//! rebuilds the touched collection from the primary.

use crate::connection::ConnectionHandle;
use crate::error::{HybridError, Result, StoreError, StoreResult};
use crate::operation::Operation;
use crate::query::FindOptions;
use crate::store::DocumentStore;
use crate::sync_lock::{SyncLockGuard, SyncLocks};
use bson::Document;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retrigger_skipped_resync: bool,
    pub drain_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1024,
            retrigger_skipped_resync: false,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &crate::config::HybridConfig) -> Self {
        Self {
            workers: config.replication_workers,
            queue_capacity: config.replication_queue_capacity,
            retrigger_skipped_resync: config.retrigger_skipped_resync,
            drain_timeout: config.shutdown_drain_timeout(),
        }
    }
}

#[derive(Debug)]
pub enum ReplicationJob {
    Replay {
        collection: String,
        documents: Vec<Document>,
    },
    Resync {
        guard: SyncLockGuard,
        origin: Operation,
    },
}

impl ReplicationJob {
    pub fn collection(&self) -> &str {
        match self {
            Self::Replay { collection, .. } => collection,
            Self::Resync { guard, .. } => guard.collection(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    replays: AtomicU64,
    replay_failures: AtomicU64,
    resyncs_started: AtomicU64,
    resyncs_completed: AtomicU64,
    resyncs_failed: AtomicU64,
    resyncs_skipped: AtomicU64,
    jobs_dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStats {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub replays: u64,
    pub replay_failures: u64,
    pub resyncs_started: u64,
    pub resyncs_completed: u64,
    pub resyncs_failed: u64,
    pub resyncs_skipped: u64,
    pub jobs_dropped: u64,
}

impl ReplicationStats {
    pub fn is_idle(&self) -> bool {
        self.queue_depth == 0 && self.in_flight == 0
    }
}

/// Rebuild `collection` on the secondary from a snapshot of the primary.
/// Returns the number of documents copied.
pub async fn full_resync(
    primary: &dyn DocumentStore,
    secondary: &dyn DocumentStore,
    collection: &str,
) -> StoreResult<u64> {
    let snapshot = primary.find(collection, Document::new(), FindOptions::default()).await?;
    secondary.delete_many(collection, Document::new()).await?;
    let copied = snapshot.len() as u64;
    if !snapshot.is_empty() {
        secondary.insert_many(collection, snapshot).await?;
    }
    Ok(copied)
}

struct Shared {
    primary: Arc<dyn DocumentStore>,
    secondary: Arc<ConnectionHandle>,
    locks: SyncLocks,
    counters: Counters,
    settings: SchedulerSettings,
}

struct InFlight<'a>(&'a Counters);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ReplicationScheduler {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<ReplicationJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationScheduler {
    pub fn start(
        primary: Arc<dyn DocumentStore>,
        secondary: Arc<ConnectionHandle>,
        locks: SyncLocks,
        settings: SchedulerSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let worker_count = settings.workers.max(1);
        let shared = Arc::new(Shared {
            primary,
            secondary,
            locks,
            counters: Counters::default(),
            settings,
        });

        let workers = (0..worker_count)
            .map(|id| {
                let shared = Arc::clone(&shared);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move { worker_loop(id, shared, receiver).await })
            })
            .collect();

        info!("Replication scheduler started with {} workers", worker_count);
        Self {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    pub fn locks(&self) -> &SyncLocks {
        &self.shared.locks
    }

    pub fn schedule_replay(&self, collection: &str, documents: Vec<Document>) -> bool {
        if documents.is_empty() {
            return false;
        }
        self.enqueue(ReplicationJob::Replay {
            collection: collection.to_string(),
            documents,
        })
    }

    /// Queue a full resync unless one is already running for `collection`.
    /// The lock is taken here, before this returns, so a second write in
    /// quick succession sees it held and skips.
    pub fn schedule_resync(&self, collection: &str, origin: Operation) -> bool {
        match self.shared.locks.try_acquire(collection) {
            Some(guard) => self.enqueue(ReplicationJob::Resync { guard, origin }),
            None => {
                self.shared.counters.resyncs_skipped.fetch_add(1, Ordering::SeqCst);
                counter!("hybriddb_replication_resyncs_skipped_total").increment(1);
                if self.shared.settings.retrigger_skipped_resync && self.shared.locks.mark_dirty(collection) {
                    debug!("Resync of {} after {} deferred until the running one finishes", collection, origin);
                } else {
                    warn!("Resync of {} after {} skipped: another resync is in progress", collection, origin);
                }
                false
            }
        }
    }

    fn enqueue(&self, job: ReplicationJob) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            self.record_drop(job.collection(), "scheduler is shut down");
            return false;
        };
        // Counted before sending so a worker never sees a job the depth gauge
        // does not include.
        self.shared.counters.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(job) {
            Ok(()) => {
                gauge!("hybriddb_replication_queue_depth").set(self.shared.counters.queued.load(Ordering::SeqCst) as f64);
                true
            }
            Err(err) => {
                self.shared.counters.queued.fetch_sub(1, Ordering::SeqCst);
                let (job, reason) = match err {
                    mpsc::error::TrySendError::Full(job) => (job, "queue is full"),
                    mpsc::error::TrySendError::Closed(job) => (job, "queue is closed"),
                };
                self.record_drop(job.collection(), reason);
                false
            }
        }
    }

    fn record_drop(&self, collection: &str, reason: &str) {
        self.shared.counters.jobs_dropped.fetch_add(1, Ordering::SeqCst);
        counter!("hybriddb_replication_jobs_dropped_total").increment(1);
        warn!("Dropped replication job for {}: {}", collection, reason);
    }

    pub fn stats(&self) -> ReplicationStats {
        let c = &self.shared.counters;
        ReplicationStats {
            queue_depth: c.queued.load(Ordering::SeqCst),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            replays: c.replays.load(Ordering::SeqCst),
            replay_failures: c.replay_failures.load(Ordering::SeqCst),
            resyncs_started: c.resyncs_started.load(Ordering::SeqCst),
            resyncs_completed: c.resyncs_completed.load(Ordering::SeqCst),
            resyncs_failed: c.resyncs_failed.load(Ordering::SeqCst),
            resyncs_skipped: c.resyncs_skipped.load(Ordering::SeqCst),
            jobs_dropped: c.jobs_dropped.load(Ordering::SeqCst),
        }
    }

    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stats().is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop accepting jobs, let the workers finish what is queued, and wait
    /// for them up to the drain timeout.
    pub async fn shutdown(&self) -> Result<()> {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return Ok(());
        }
        drop(sender);

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let timeout = self.shared.settings.drain_timeout;
        let pending = self.stats().queue_depth;
        info!("Draining {} queued replication jobs", pending);

        match tokio::time::timeout(timeout, futures::future::join_all(workers)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Replication worker ended abnormally: {}", e);
                    }
                }
                info!("Replication scheduler stopped");
                Ok(())
            }
            Err(_) => {
                warn!("Replication drain did not finish within {:?}", timeout);
                Err(HybridError::Timeout(timeout))
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<ReplicationJob>>>,
) {
    debug!("Replication worker {} started", id);
    loop {
        let job = { receiver.lock().await.recv().await };
        let Some(job) = job else { break };

        shared.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        shared.counters.queued.fetch_sub(1, Ordering::SeqCst);
        gauge!("hybriddb_replication_queue_depth").set(shared.counters.queued.load(Ordering::SeqCst) as f64);
        let _in_flight = InFlight(&shared.counters);

        if !shared.secondary.is_alive() {
            debug!("Secondary unavailable, discarding job for {}", job.collection());
            continue;
        }
        match job {
            ReplicationJob::Replay { collection, documents } => replay(&shared, &collection, documents).await,
            ReplicationJob::Resync { guard, origin } => resync(&shared, guard, origin).await,
        }
    }
    debug!("Replication worker {} stopped", id);
}

async fn replay(shared: &Shared, collection: &str, documents: Vec<Document>) {
    let count = documents.len();
    let _access = shared.locks.replay_access(collection).await;
    match shared.secondary.store().insert_many(collection, documents).await {
        Ok(_) => {
            shared.counters.replays.fetch_add(1, Ordering::SeqCst);
            counter!("hybriddb_replication_replays_total").increment(1);
            debug!("Replayed {} inserts into {}", count, collection);
        }
        // A rebuild that ran after the primary insert already copied them.
        Err(StoreError::DuplicateKey { key, .. }) => {
            shared.counters.replays.fetch_add(1, Ordering::SeqCst);
            debug!("Replay into {} found {} already present", collection, key);
        }
        Err(source) => {
            shared.counters.replay_failures.fetch_add(1, Ordering::SeqCst);
            counter!("hybriddb_replication_failures_total").increment(1);
            note_secondary_failure(shared, &source);
            let err = HybridError::Replication {
                collection: collection.to_string(),
                source,
            };
            error!("Insert replay failed: {}", err);
        }
    }
}

async fn resync(shared: &Shared, guard: SyncLockGuard, origin: Operation) {
    let collection = guard.collection().to_string();
    // One extra pass when writes were skipped while this one ran.
    let passes = if shared.settings.retrigger_skipped_resync { 2 } else { 1 };
    for pass in 0..passes {
        if pass > 0 && !guard.take_dirty() {
            break;
        }
        shared.counters.resyncs_started.fetch_add(1, Ordering::SeqCst);
        counter!("hybriddb_replication_resyncs_started_total").increment(1);
        let started = Instant::now();
        let _access = shared.locks.rebuild_access(&collection).await;

        match full_resync(shared.primary.as_ref(), shared.secondary.store().as_ref(), &collection).await {
            Ok(copied) => {
                shared.counters.resyncs_completed.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "Resynced {} ({} documents) after {} in {:?}",
                    collection,
                    copied,
                    origin,
                    started.elapsed()
                );
            }
            Err(source) => {
                shared.counters.resyncs_failed.fetch_add(1, Ordering::SeqCst);
                counter!("hybriddb_replication_failures_total").increment(1);
                note_secondary_failure(shared, &source);
                let err = HybridError::Replication {
                    collection: collection.clone(),
                    source,
                };
                error!("Full resync after {} failed: {}", origin, err);
                break;
            }
        }
    }
    drop(guard);
}

fn note_secondary_failure(shared: &Shared, err: &StoreError) {
    if err.is_connection() && shared.secondary.mark_unavailable() {
        warn!("Secondary store marked unavailable after replication failure: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StoreRole;
    use crate::connection_pool::PoolSettings;
    use crate::memory_store::InMemoryStore;
    use bson::doc;

    fn scheduler(settings: SchedulerSettings) -> (Arc<InMemoryStore>, Arc<InMemoryStore>, ReplicationScheduler) {
        let primary = Arc::new(InMemoryStore::new());
        let secondary = Arc::new(InMemoryStore::new());
        let handle = Arc::new(ConnectionHandle::new(
            StoreRole::Secondary,
            "memory://test",
            PoolSettings::default(),
            secondary.clone(),
        ));
        let scheduler = ReplicationScheduler::start(primary.clone(), handle, SyncLocks::new(), settings);
        (primary, secondary, scheduler)
    }

    #[tokio::test]
    async fn test_full_resync_copies_snapshot() {
        let primary = InMemoryStore::new();
        let secondary = InMemoryStore::new();
        primary.insert_many("courses", vec![doc! { "_id": 1 }, doc! { "_id": 2 }]).await.unwrap();
        secondary.insert_one("courses", doc! { "_id": 99 }).await.unwrap();

        let copied = full_resync(&primary, &secondary, "courses").await.unwrap();
        assert_eq!(copied, 2);
        assert_eq!(secondary.documents("courses"), primary.documents("courses"));
    }

    #[tokio::test]
    async fn test_replay_and_resync_jobs_run() {
        let (primary, secondary, scheduler) = scheduler(SchedulerSettings::default());
        primary.insert_one("users", doc! { "_id": 1, "name": "ana" }).await.unwrap();

        assert!(scheduler.schedule_replay("users", vec![doc! { "_id": 1, "name": "ana" }]));
        assert!(scheduler.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(secondary.documents("users").len(), 1);

        primary
            .update_one("users", doc! { "_id": 1 }, doc! { "$set": { "name": "bo" } }, Default::default())
            .await
            .unwrap();
        assert!(scheduler.schedule_resync("users", Operation::UpdateOne));
        assert!(scheduler.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(secondary.documents("users"), primary.documents("users"));

        let stats = scheduler.stats();
        assert_eq!(stats.replays, 1);
        assert_eq!(stats.resyncs_completed, 1);
        assert!(!scheduler.locks().is_held("users"));
    }

    #[tokio::test]
    async fn test_replay_waits_for_running_resync() {
        let (primary, secondary, scheduler) = scheduler(SchedulerSettings::default());
        let seed: Vec<Document> = (1..=5).map(|i| doc! { "_id": i, "n": 0 }).collect();
        primary.insert_many("courses", seed.clone()).await.unwrap();
        secondary.insert_many("courses", seed).await.unwrap();
        secondary.set_per_document_latency(Duration::from_millis(20));

        primary
            .update_many("courses", doc! {}, doc! { "$inc": { "n": 1 } }, Default::default())
            .await
            .unwrap();
        assert!(scheduler.schedule_resync("courses", Operation::UpdateMany));
        primary.insert_one("courses", doc! { "_id": 6, "n": 0 }).await.unwrap();
        assert!(scheduler.schedule_replay("courses", vec![doc! { "_id": 6, "n": 0 }]));
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);

        let stats = scheduler.stats();
        assert_eq!(stats.resyncs_failed, 0);
        assert_eq!(stats.replay_failures, 0);
        assert_eq!(secondary.documents("courses"), primary.documents("courses"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_jobs() {
        let settings = SchedulerSettings {
            workers: 1,
            queue_capacity: 1,
            ..SchedulerSettings::default()
        };
        let (_primary, secondary, scheduler) = scheduler(settings);
        secondary.set_latency(Duration::from_millis(100));

        let mut accepted = 0;
        for i in 0..5 {
            if scheduler.schedule_replay("logs", vec![doc! { "_id": i }]) {
                accepted += 1;
            }
        }
        assert!(accepted < 5);
        assert_eq!(scheduler.stats().jobs_dropped, 5 - accepted);
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_failed_resync_releases_lock() {
        let (_primary, secondary, scheduler) = scheduler(SchedulerSettings::default());
        secondary.set_fail_writes(true);

        assert!(scheduler.schedule_resync("quizzes", Operation::DeleteMany));
        assert!(scheduler.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(scheduler.stats().resyncs_failed, 1);
        assert!(!scheduler.locks().is_held("quizzes"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (_primary, secondary, scheduler) = scheduler(SchedulerSettings::default());
        secondary.set_latency(Duration::from_millis(20));
        for i in 0..6 {
            scheduler.schedule_replay("events", vec![doc! { "_id": i }]);
        }
        scheduler.shutdown().await.unwrap();
        assert_eq!(secondary.documents("events").len(), 6);
        assert!(!scheduler.schedule_replay("events", vec![doc! { "_id": 7 }]));
    }

    #[tokio::test]
    async fn test_skipped_resync_is_retriggered_when_enabled() {
        let settings = SchedulerSettings {
            retrigger_skipped_resync: true,
            ..SchedulerSettings::default()
        };
        let (primary, secondary, scheduler) = scheduler(settings);
        secondary.set_latency(Duration::from_millis(50));

        assert!(scheduler.schedule_resync("comments", Operation::UpdateMany));
        primary.insert_one("comments", doc! { "_id": 1 }).await.unwrap();
        assert!(!scheduler.schedule_resync("comments", Operation::UpdateMany));
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);

        let stats = scheduler.stats();
        assert_eq!(stats.resyncs_skipped, 1);
        assert_eq!(stats.resyncs_started, 2);
        assert_eq!(secondary.documents("comments"), primary.documents("comments"));
    }
}
