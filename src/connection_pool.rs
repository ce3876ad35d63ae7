/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file connection_pool.rs
 * @brief PostgreSQL connection pool construction and statistics
 */

use crate::error::{StoreError, StoreResult};
use deadpool_postgres::{Config, Pool, PoolConfig, Runtime, Timeouts};
use metrics::gauge;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_size: u32,
    pub min_idle: u32,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 2,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &crate::config::HybridConfig) -> Self {
        Self {
            max_size: config.pool_max_size,
            min_idle: config.pool_min_size,
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Build a pool and prove it reachable by opening `min_idle` connections
/// (at least one) and running `SELECT 1` on each.
pub async fn connect_pool(connection_string: &str, settings: &PoolSettings) -> StoreResult<Pool> {
    debug!("Creating connection pool with settings: {:?}", settings);

    let mut pg_config = Config::new();
    pg_config.url = Some(connection_string.to_string());
    pg_config.connect_timeout = Some(settings.connect_timeout);

    let mut pool_config = PoolConfig::new(settings.max_size as usize);
    pool_config.timeouts = Timeouts {
        wait: Some(settings.connect_timeout),
        create: Some(settings.connect_timeout),
        recycle: Some(settings.connect_timeout),
    };
    pg_config.pool = Some(pool_config);

    let pool = pg_config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StoreError::Connection(format!("Failed to create connection pool: {}", e)))?;

    let warm = settings.min_idle.max(1) as usize;
    let mut held = Vec::with_capacity(warm);
    for _ in 0..warm {
        let client = tokio::time::timeout(settings.connect_timeout, pool.get())
            .await
            .map_err(|_| StoreError::Connection(format!("Timed out after {:?} connecting", settings.connect_timeout)))??;
        client.execute("SELECT 1", &[]).await?;
        held.push(client);
    }
    // Returning the warm connections leaves them idle in the pool.
    drop(held);

    info!("Connection pool ready with {} max connections", settings.max_size);
    Ok(pool)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolStatsSnapshot {
    pub max_size: usize,
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
}

pub fn pool_stats(pool: &Pool, label: &'static str) -> PoolStatsSnapshot {
    let status = pool.status();
    let snapshot = PoolStatsSnapshot {
        max_size: status.max_size as usize,
        size: status.size as usize,
        available: status.available.max(0) as usize,
        waiting: status.waiting as usize,
    };
    gauge!("hybriddb_pool_connections", "store" => label).set(snapshot.size as f64);
    gauge!("hybriddb_pool_available_connections", "store" => label).set(snapshot.available as f64);
    snapshot
}

impl std::fmt::Display for PoolStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: size={}, available={}, waiting={}, max_size={}",
            self.size, self.available, self.waiting, self.max_size
        )
    }
}
