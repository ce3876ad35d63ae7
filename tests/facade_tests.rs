/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file facade_tests.rs
 * @brief Process-wide database entry point
 */

use anyhow::Result;
use bson::doc;
use hybriddb::*;
use std::time::Duration;

// The process-wide database outlives a single test runtime, so everything
// that touches it lives in this one test.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_database_is_memoized_and_repairs_drift() -> Result<()> {
    let primary = InMemoryStore::named("facade-p");
    primary
        .insert_many("users", vec![doc! { "_id": 1, "name": "ana" }, doc! { "_id": 2, "name": "bo" }])
        .await?;
    std::env::set_var("HYBRIDDB_PRIMARY_URI", "memory://facade-p");
    std::env::set_var("HYBRIDDB_SECONDARY_URI", "memory://facade-s");

    let first = get_database().await?;
    let second = get_database().await?;
    assert_eq!(first.id(), second.id());
    assert!(first.secondary_available());

    // The first call started a drift check that copies the existing data.
    let secondary = InMemoryStore::named("facade-s");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while secondary.documents("users").len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "drift check never repaired users");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(first.drift_scans(), 1);

    let users = second.collection("users");
    users.insert_one(doc! { "_id": 3, "name": "cy" }).await?;
    first.wait_for_replication(Duration::from_secs(5)).await?;
    assert_eq!(secondary.documents("users").len(), 3);
    assert_eq!(users.count_documents(doc! {}).await?, 3);
    Ok(())
}
