/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file memory_store.rs
 * @brief Process-local document store with fault injection
 */

use crate::error::{StoreError, StoreResult};
use crate::query::{self, FindOptions};
use crate::store::{
    self, check_unique_ids, plan_delete, plan_update, DeleteResult, DocumentStore,
    FindOneAndOptions, InsertManyResult, InsertOneResult, Mutation, UpdateOptions, UpdateResult,
    UpdateSpec, WritePlan,
};
use async_trait::async_trait;
use bson::{doc, Document};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryCollection {
    documents: Vec<Document>,
    indexes: Vec<Document>,
}

#[derive(Debug, Default)]
pub struct FaultInjection {
    offline: AtomicBool,
    fail_writes: AtomicBool,
    latency_ms: AtomicU64,
    per_document_us: AtomicU64,
}

#[derive(Debug, Default)]
pub struct OperationCounters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<IndexMap<String, MemoryCollection>>,
    faults: FaultInjection,
    counters: OperationCounters,
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<InMemoryStore>>>> = OnceLock::new();

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared store for `memory://<name>`; the same name always yields the
    /// same store within a process.
    pub fn named(name: &str) -> Arc<Self> {
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        registry
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Self::new()))
            .clone()
    }

    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.faults.offline.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.faults.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.faults.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Extra delay per inserted document, so bulk copies slow down with size.
    pub fn set_per_document_latency(&self, latency: Duration) {
        self.faults.per_document_us.store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> u64 {
        self.counters.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.counters.writes.load(Ordering::SeqCst)
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.collections.write().clear();
    }

    async fn enter(&self, write: bool) -> StoreResult<()> {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.is_offline() {
            return Err(StoreError::Connection("memory store is offline".into()));
        }
        if write {
            if self.faults.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("injected write failure".into()));
            }
            self.counters.writes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn insert_delay(&self, documents: usize) {
        let per_document = self.faults.per_document_us.load(Ordering::SeqCst);
        if per_document > 0 {
            tokio::time::sleep(Duration::from_micros(per_document * documents as u64)).await;
        }
    }

    fn snapshot(&self, collection: &str) -> StoreResult<Vec<Document>> {
        store::validate_collection_name(collection)?;
        Ok(self.documents(collection))
    }

    fn write_with<F>(&self, collection: &str, plan: F) -> StoreResult<WritePlan>
    where
        F: FnOnce(&[Document]) -> StoreResult<WritePlan>,
    {
        store::validate_collection_name(collection)?;
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_string()).or_default();
        let plan = plan(&entry.documents)?;

        let inserts: Vec<Document> = plan
            .mutations
            .iter()
            .filter_map(|m| match m {
                Mutation::Insert(doc) => Some(doc.clone()),
                _ => None,
            })
            .collect();
        check_unique_ids(collection, entry.documents.iter(), &inserts)?;

        let mut deletions = Vec::new();
        for mutation in &plan.mutations {
            match mutation {
                Mutation::Replace { index, document } => entry.documents[*index] = document.clone(),
                Mutation::Insert(document) => entry.documents.push(document.clone()),
                Mutation::Delete { index } => deletions.push(*index),
            }
        }
        deletions.sort_unstable_by(|a, b| b.cmp(a));
        for index in deletions {
            entry.documents.remove(index);
        }
        Ok(plan)
    }

    fn insert_documents(&self, collection: &str, mut documents: Vec<Document>) -> StoreResult<Vec<bson::Bson>> {
        store::validate_collection_name(collection)?;
        let ids: Vec<bson::Bson> = documents.iter_mut().map(query::ensure_id).collect();
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_string()).or_default();
        check_unique_ids(collection, entry.documents.iter(), &documents)?;
        entry.documents.extend(documents);
        Ok(ids)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.enter(false).await
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        self.enter(false).await?;
        Ok(self.collections.read().keys().cloned().collect())
    }

    async fn find(&self, collection: &str, filter: Document, options: FindOptions) -> StoreResult<Vec<Document>> {
        self.enter(false).await?;
        let docs = self.snapshot(collection)?;
        query::run_find(docs, &filter, &options)
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> StoreResult<u64> {
        self.enter(false).await?;
        let docs = self.snapshot(collection)?;
        if filter.is_empty() {
            return Ok(docs.len() as u64);
        }
        let mut count = 0;
        for doc in &docs {
            if query::matches(doc, &filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> StoreResult<InsertOneResult> {
        self.enter(true).await?;
        self.insert_delay(1).await;
        let mut ids = self.insert_documents(collection, vec![document])?;
        Ok(InsertOneResult { inserted_id: ids.remove(0) })
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> StoreResult<InsertManyResult> {
        self.enter(true).await?;
        self.insert_delay(documents.len()).await;
        let inserted_ids = self.insert_documents(collection, documents)?;
        Ok(InsertManyResult { inserted_ids })
    }

    async fn update_one(&self, collection: &str, filter: Document, update: Document, options: UpdateOptions) -> StoreResult<UpdateResult> {
        self.enter(true).await?;
        let spec = UpdateSpec::Operators(update);
        let plan = self.write_with(collection, |docs| plan_update(docs, &filter, &spec, false, options.upsert, None))?;
        Ok(plan.update_result())
    }

    async fn update_many(&self, collection: &str, filter: Document, update: Document, options: UpdateOptions) -> StoreResult<UpdateResult> {
        self.enter(true).await?;
        let spec = UpdateSpec::Operators(update);
        let plan = self.write_with(collection, |docs| plan_update(docs, &filter, &spec, true, options.upsert, None))?;
        Ok(plan.update_result())
    }

    async fn replace_one(&self, collection: &str, filter: Document, replacement: Document, options: UpdateOptions) -> StoreResult<UpdateResult> {
        self.enter(true).await?;
        let spec = UpdateSpec::Replacement(replacement);
        let plan = self.write_with(collection, |docs| plan_update(docs, &filter, &spec, false, options.upsert, None))?;
        Ok(plan.update_result())
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> StoreResult<DeleteResult> {
        self.enter(true).await?;
        let plan = self.write_with(collection, |docs| plan_delete(docs, &filter, false, None))?;
        Ok(plan.delete_result())
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> StoreResult<DeleteResult> {
        self.enter(true).await?;
        let plan = self.write_with(collection, |docs| plan_delete(docs, &filter, true, None))?;
        Ok(plan.delete_result())
    }

    async fn find_one_and_update(&self, collection: &str, filter: Document, update: Document, options: FindOneAndOptions) -> StoreResult<Option<Document>> {
        self.enter(true).await?;
        let spec = UpdateSpec::Operators(update);
        let plan = self.write_with(collection, |docs| {
            plan_update(docs, &filter, &spec, false, options.upsert, options.sort.as_ref())
        })?;
        plan.returned(&options)
    }

    async fn find_one_and_replace(&self, collection: &str, filter: Document, replacement: Document, options: FindOneAndOptions) -> StoreResult<Option<Document>> {
        self.enter(true).await?;
        let spec = UpdateSpec::Replacement(replacement);
        let plan = self.write_with(collection, |docs| {
            plan_update(docs, &filter, &spec, false, options.upsert, options.sort.as_ref())
        })?;
        plan.returned(&options)
    }

    async fn find_one_and_delete(&self, collection: &str, filter: Document, options: FindOneAndOptions) -> StoreResult<Option<Document>> {
        self.enter(true).await?;
        let plan = self.write_with(collection, |docs| plan_delete(docs, &filter, false, options.sort.as_ref()))?;
        plan.returned(&FindOneAndOptions { return_document: crate::store::ReturnDocument::Before, ..options })
    }

    async fn create_index(&self, collection: &str, keys: Document) -> StoreResult<String> {
        self.enter(true).await?;
        store::validate_collection_name(collection)?;
        let name = store::index_name(&keys);
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_string()).or_default();
        if !entry.indexes.iter().any(|ix| ix.get_str("name").ok() == Some(name.as_str())) {
            entry.indexes.push(doc! { "name": name.clone(), "key": keys });
        }
        Ok(name)
    }

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<Document>> {
        self.enter(false).await?;
        store::validate_collection_name(collection)?;
        let mut indexes = vec![doc! { "name": "_id_", "key": { "_id": 1 } }];
        if let Some(entry) = self.collections.read().get(collection) {
            indexes.extend(entry.indexes.iter().cloned());
        }
        Ok(indexes)
    }

    async fn drop_collection(&self, collection: &str) -> StoreResult<()> {
        self.enter(true).await?;
        store::validate_collection_name(collection)?;
        self.collections.write().shift_remove(collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReturnDocument;

    #[tokio::test]
    async fn test_insert_assigns_id_and_rejects_duplicates() {
        let store = InMemoryStore::new();
        let result = store.insert_one("users", doc! { "name": "ana" }).await.unwrap();
        assert!(matches!(result.inserted_id, bson::Bson::ObjectId(_)));

        store.insert_one("users", doc! { "_id": 7, "name": "bo" }).await.unwrap();
        let err = store.insert_one("users", doc! { "_id": 7 }).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(store.count_documents("users", doc! {}).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_many_is_all_or_nothing() {
        let store = InMemoryStore::new();
        store.insert_one("users", doc! { "_id": 1 }).await.unwrap();
        let err = store
            .insert_many("users", vec![doc! { "_id": 2 }, doc! { "_id": 1 }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(store.documents("users").len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = InMemoryStore::new();
        store
            .insert_many("courses", vec![doc! { "_id": 1, "level": 1 }, doc! { "_id": 2, "level": 1 }])
            .await
            .unwrap();

        let result = store
            .update_many("courses", doc! { "level": 1 }, doc! { "$inc": { "level": 1 } }, UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(result.matched_count, 2);
        assert_eq!(result.modified_count, 2);

        let deleted = store.delete_one("courses", doc! { "level": 2 }).await.unwrap();
        assert_eq!(deleted.deleted_count, 1);
        assert_eq!(store.documents("courses"), vec![doc! { "_id": 2, "level": 2 }]);
    }

    #[tokio::test]
    async fn test_upsert_creates_document() {
        let store = InMemoryStore::new();
        let result = store
            .update_one("users", doc! { "email": "a@b.c" }, doc! { "$set": { "xp": 5 } }, UpdateOptions::upsert())
            .await
            .unwrap();
        assert_eq!(result.matched_count, 0);
        assert!(result.upserted_id.is_some());
        let found = store.find_one("users", doc! { "email": "a@b.c" }, FindOptions::default()).await.unwrap();
        assert_eq!(found.unwrap().get_i32("xp").unwrap(), 5);
    }

    #[tokio::test]
    async fn test_find_one_and_update_returns_after() {
        let store = InMemoryStore::new();
        store.insert_one("users", doc! { "_id": 1, "xp": 1 }).await.unwrap();
        let after = store
            .find_one_and_update(
                "users",
                doc! { "_id": 1 },
                doc! { "$inc": { "xp": 9 } },
                FindOneAndOptions { return_document: ReturnDocument::After, ..Default::default() },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.get_i32("xp").unwrap(), 10);

        let deleted = store
            .find_one_and_delete("users", doc! { "_id": 1 }, FindOneAndOptions::default())
            .await
            .unwrap();
        assert!(deleted.is_some());
        assert!(store.documents("users").is_empty());
    }

    #[tokio::test]
    async fn test_offline_and_failing_writes() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        let err = store.find("users", doc! {}, FindOptions::default()).await.unwrap_err();
        assert!(err.is_connection());

        store.set_offline(false);
        store.set_fail_writes(true);
        assert!(store.insert_one("users", doc! {}).await.is_err());
        assert!(store.find("users", doc! {}, FindOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_named_registry_shares_stores() {
        let a = InMemoryStore::named("registry-test");
        let b = InMemoryStore::named("registry-test");
        a.insert_one("users", doc! { "_id": 1 }).await.unwrap();
        assert_eq!(b.documents("users").len(), 1);
    }

    #[tokio::test]
    async fn test_indexes_and_drop() {
        let store = InMemoryStore::new();
        let name = store.create_index("users", doc! { "email": 1 }).await.unwrap();
        assert_eq!(name, "email_1");
        assert_eq!(store.list_indexes("users").await.unwrap().len(), 2);
        assert_eq!(store.list_collections().await.unwrap(), vec!["users".to_string()]);
        store.drop_collection("users").await.unwrap();
        assert!(store.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_via_trait_default() {
        let store = InMemoryStore::new();
        store
            .insert_many("quizzes", vec![doc! { "score": 3 }, doc! { "score": 5 }])
            .await
            .unwrap();
        let out = store
            .aggregate("quizzes", vec![doc! { "$group": { "_id": null, "total": { "$sum": "$score" } } }])
            .await
            .unwrap();
        assert_eq!(out[0].get_i32("total").unwrap(), 8);
    }
}
