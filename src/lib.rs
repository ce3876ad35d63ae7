/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file lib.rs
 * @brief HybridDB library entry point
 */

pub mod error;
pub mod config;
pub mod logger;
pub mod shutdown;

// Document model and store backends
pub mod query;
pub mod aggregation_pipeline;
pub mod store;
pub mod memory_store;
pub mod connection_pool;
pub mod postgres_store;
pub mod stub_store;

// Routing, replication and repair
pub mod operation;
pub mod connection;
pub mod sync_lock;
pub mod replication;
pub mod drift;
pub mod proxy;
pub mod health;
pub mod database;

// Re-export main types for external use
pub use error::{HybridError, Result, StoreError, StoreResult};
pub use config::HybridConfig;
pub use logger::{init_tracing_logger, LogLevel};
pub use query::FindOptions;
pub use aggregation_pipeline::AggregationPipeline;
pub use store::{
    DeleteResult, DocumentStore, FindOneAndOptions, InsertManyResult, InsertOneResult, ReturnDocument,
    UpdateOptions, UpdateResult,
};
pub use memory_store::InMemoryStore;
pub use postgres_store::PostgresStore;
pub use stub_store::BuildStubStore;
pub use operation::{Operation, OperationKind, ReplicationStrategy};
pub use connection::{ConnectionHandle, ConnectionManager, StoreRole};
pub use replication::{ReplicationScheduler, ReplicationStats};
pub use drift::{DriftCorrector, DriftOutcome, DriftReport};
pub use proxy::{Collection, CollectionProxy};
pub use health::{HealthReport, HealthState};
pub use database::{get_database, Database};
