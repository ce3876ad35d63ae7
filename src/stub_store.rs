/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file stub_store.rs
 * @brief Placeholder store used while the application is being built
 */

use crate::error::{StoreError, StoreResult};
use crate::query::FindOptions;
use crate::store::{
    DeleteResult, DocumentStore, FindOneAndOptions, InsertManyResult, InsertOneResult, UpdateOptions,
    UpdateResult,
};
use async_trait::async_trait;
use bson::Document;

/// Answers every read with nothing and refuses every write, so code paths that
/// touch the database at build time do not need a reachable server.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuildStubStore;

#[async_trait]
impl DocumentStore for BuildStubStore {
    fn kind(&self) -> &'static str {
        "stub"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn find(&self, _collection: &str, _filter: Document, _options: FindOptions) -> StoreResult<Vec<Document>> {
        Ok(Vec::new())
    }

    async fn count_documents(&self, _collection: &str, _filter: Document) -> StoreResult<u64> {
        Ok(0)
    }

    async fn insert_one(&self, _collection: &str, _document: Document) -> StoreResult<InsertOneResult> {
        Err(StoreError::BuildPhase)
    }

    async fn insert_many(&self, _collection: &str, _documents: Vec<Document>) -> StoreResult<InsertManyResult> {
        Err(StoreError::BuildPhase)
    }

    async fn update_one(&self, _collection: &str, _filter: Document, _update: Document, _options: UpdateOptions) -> StoreResult<UpdateResult> {
        Err(StoreError::BuildPhase)
    }

    async fn update_many(&self, _collection: &str, _filter: Document, _update: Document, _options: UpdateOptions) -> StoreResult<UpdateResult> {
        Err(StoreError::BuildPhase)
    }

    async fn replace_one(&self, _collection: &str, _filter: Document, _replacement: Document, _options: UpdateOptions) -> StoreResult<UpdateResult> {
        Err(StoreError::BuildPhase)
    }

    async fn delete_one(&self, _collection: &str, _filter: Document) -> StoreResult<DeleteResult> {
        Err(StoreError::BuildPhase)
    }

    async fn delete_many(&self, _collection: &str, _filter: Document) -> StoreResult<DeleteResult> {
        Err(StoreError::BuildPhase)
    }

    async fn find_one_and_update(&self, _collection: &str, _filter: Document, _update: Document, _options: FindOneAndOptions) -> StoreResult<Option<Document>> {
        Err(StoreError::BuildPhase)
    }

    async fn find_one_and_replace(&self, _collection: &str, _filter: Document, _replacement: Document, _options: FindOneAndOptions) -> StoreResult<Option<Document>> {
        Err(StoreError::BuildPhase)
    }

    async fn find_one_and_delete(&self, _collection: &str, _filter: Document, _options: FindOneAndOptions) -> StoreResult<Option<Document>> {
        Err(StoreError::BuildPhase)
    }

    async fn create_index(&self, _collection: &str, _keys: Document) -> StoreResult<String> {
        Err(StoreError::BuildPhase)
    }

    async fn list_indexes(&self, _collection: &str) -> StoreResult<Vec<Document>> {
        Ok(Vec::new())
    }

    async fn drop_collection(&self, _collection: &str) -> StoreResult<()> {
        Err(StoreError::BuildPhase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn test_reads_are_empty_and_writes_refused() {
        let stub = BuildStubStore;
        assert!(stub.find("users", doc! {}, FindOptions::default()).await.unwrap().is_empty());
        assert_eq!(stub.count_documents("users", doc! {}).await.unwrap(), 0);
        assert_eq!(
            stub.insert_one("users", doc! { "name": "a" }).await.unwrap_err(),
            StoreError::BuildPhase
        );
    }
}
