/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file sync_lock.rs
 * @brief Per-collection resync locks
 */

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Default, Clone, Copy)]
struct LockState {
    held: bool,
    dirty: bool,
}

/// Table of collections with a resync in flight. Freed entries are removed,
/// so the table only ever holds busy collections.
///
/// Separately, every collection has an apply gate. Replays hold it shared
/// while they write to the secondary and rebuilds hold it exclusively, so an
/// insert never lands between a rebuild's clear and its bulk copy.
#[derive(Debug, Default, Clone)]
pub struct SyncLocks {
    table: Arc<Mutex<HashMap<String, LockState>>>,
    gates: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, collection: &str) -> Option<SyncLockGuard> {
        let mut table = self.table.lock();
        let state = table.entry(collection.to_string()).or_default();
        if state.held {
            return None;
        }
        state.held = true;
        state.dirty = false;
        Some(SyncLockGuard {
            locks: self.clone(),
            collection: collection.to_string(),
        })
    }

    pub fn is_held(&self, collection: &str) -> bool {
        self.table.lock().get(collection).map(|s| s.held).unwrap_or(false)
    }

    /// Record that a resync was skipped while the lock was busy. Returns false
    /// when the lock is free, in which case nothing is recorded.
    pub fn mark_dirty(&self, collection: &str) -> bool {
        match self.table.lock().get_mut(collection) {
            Some(state) if state.held => {
                state.dirty = true;
                true
            }
            _ => false,
        }
    }

    fn gate(&self, collection: &str) -> Arc<RwLock<()>> {
        Arc::clone(self.gates.lock().entry(collection.to_string()).or_default())
    }

    pub async fn replay_access(&self, collection: &str) -> OwnedRwLockReadGuard<()> {
        self.gate(collection).read_owned().await
    }

    /// Waits for replays already writing to `collection` and holds off new
    /// ones until dropped.
    pub async fn rebuild_access(&self, collection: &str) -> OwnedRwLockWriteGuard<()> {
        self.gate(collection).write_owned().await
    }

    pub fn held_count(&self) -> usize {
        self.table.lock().values().filter(|s| s.held).count()
    }

    fn take_dirty(&self, collection: &str) -> bool {
        match self.table.lock().get_mut(collection) {
            Some(state) => std::mem::take(&mut state.dirty),
            None => false,
        }
    }

    fn release(&self, collection: &str) {
        self.table.lock().remove(collection);
    }
}

/// Holding this means owning the collection's resync slot; dropping it frees
/// the slot whatever happened in between.
#[derive(Debug)]
pub struct SyncLockGuard {
    locks: SyncLocks,
    collection: String,
}

impl SyncLockGuard {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn take_dirty(&self) -> bool {
        self.locks.take_dirty(&self.collection)
    }
}

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.collection);
    }
}
