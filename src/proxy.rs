/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file proxy.rs
 * @brief Collection handle that routes each operation to the right store
 */

//! Reads go to the secondary while it is live, writes go to the primary and
//! are then queued for replication, admin calls go to the primary. What a
//! caller gets back is never decided by the secondary.

use crate::connection::ConnectionHandle;
use crate::error::{Result, StoreResult};
use crate::operation::{Operation, OperationKind, ReplicationStrategy};
use crate::query::{self, FindOptions};
use crate::replication::ReplicationScheduler;
use crate::store::{
    DeleteResult, DocumentStore, FindOneAndOptions, InsertManyResult, InsertOneResult, UpdateOptions,
    UpdateResult,
};
use async_trait::async_trait;
use bson::{Bson, Document};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>>;

    async fn find_one(&self, filter: Document, options: FindOptions) -> Result<Option<Document>>;

    async fn count_documents(&self, filter: Document) -> Result<u64>;

    async fn estimated_document_count(&self) -> Result<u64>;

    async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<Bson>>;

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>>;

    async fn insert_one(&self, document: Document) -> Result<InsertOneResult>;

    async fn insert_many(&self, documents: Vec<Document>) -> Result<InsertManyResult>;

    async fn update_one(&self, filter: Document, update: Document, options: UpdateOptions) -> Result<UpdateResult>;

    async fn update_many(&self, filter: Document, update: Document, options: UpdateOptions) -> Result<UpdateResult>;

    async fn replace_one(&self, filter: Document, replacement: Document, options: UpdateOptions) -> Result<UpdateResult>;

    async fn delete_one(&self, filter: Document) -> Result<DeleteResult>;

    async fn delete_many(&self, filter: Document) -> Result<DeleteResult>;

    async fn find_one_and_update(&self, filter: Document, update: Document, options: FindOneAndOptions) -> Result<Option<Document>>;

    async fn find_one_and_replace(&self, filter: Document, replacement: Document, options: FindOneAndOptions) -> Result<Option<Document>>;

    async fn find_one_and_delete(&self, filter: Document, options: FindOneAndOptions) -> Result<Option<Document>>;

    async fn create_index(&self, keys: Document) -> Result<String>;

    async fn list_indexes(&self) -> Result<Vec<Document>>;

    async fn drop(&self) -> Result<()>;
}

pub struct Router {
    primary: Arc<ConnectionHandle>,
    secondary: Option<Arc<ConnectionHandle>>,
    scheduler: Option<Arc<ReplicationScheduler>>,
}

impl Router {
    pub fn new(
        primary: Arc<ConnectionHandle>,
        secondary: Option<Arc<ConnectionHandle>>,
        scheduler: Option<Arc<ReplicationScheduler>>,
    ) -> Self {
        Self {
            primary,
            secondary,
            scheduler,
        }
    }

    pub fn primary(&self) -> &Arc<ConnectionHandle> {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&Arc<ConnectionHandle>> {
        self.secondary.as_ref()
    }

    pub fn scheduler(&self) -> Option<&Arc<ReplicationScheduler>> {
        self.scheduler.as_ref()
    }

    pub fn live_secondary(&self) -> Option<&Arc<ConnectionHandle>> {
        self.secondary.as_ref().filter(|s| s.is_alive())
    }

    fn replicator(&self) -> Option<&Arc<ReplicationScheduler>> {
        self.live_secondary().and(self.scheduler.as_ref())
    }
}

#[derive(Clone)]
pub struct CollectionProxy {
    name: String,
    router: Arc<Router>,
}

impl CollectionProxy {
    pub fn new(name: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            name: name.into(),
            router,
        }
    }

    fn primary(&self) -> &Arc<dyn DocumentStore> {
        self.router.primary.store()
    }

    /// Try the live secondary, then the primary. Only the primary's error is
    /// ever returned.
    async fn read<T, F, Fut>(&self, op: Operation, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn DocumentStore>) -> Fut + Send + Sync,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        debug_assert_eq!(op.kind(), OperationKind::Read);
        if let Some(secondary) = self.router.live_secondary() {
            match call(Arc::clone(secondary.store())).await {
                Ok(value) => {
                    debug!("{} on {} served by secondary", op, self.name);
                    return Ok(value);
                }
                Err(e) if e.is_connection() => {
                    if secondary.mark_unavailable() {
                        warn!(
                            "Secondary store unreachable during {} on {}, switching to primary only: {}",
                            op, self.name, e
                        );
                    }
                }
                Err(e) => {
                    warn!("Secondary {} on {} failed, retrying on primary: {}", op, self.name, e);
                }
            }
        }
        debug!("{} on {} served by primary", op, self.name);
        Ok(call(Arc::clone(self.primary())).await?)
    }

    fn replicate(&self, op: Operation, inserted: Option<Vec<Document>>) {
        let Some(scheduler) = self.router.replicator() else {
            return;
        };
        match (op.kind(), inserted) {
            (OperationKind::Write(ReplicationStrategy::Replay), Some(documents)) => {
                scheduler.schedule_replay(&self.name, documents);
            }
            (OperationKind::Write(ReplicationStrategy::FullResync), _) | (OperationKind::Admin, _) => {
                scheduler.schedule_resync(&self.name, op);
            }
            _ => {}
        }
    }

    fn replay_copy(&self, documents: &[Document]) -> Option<Vec<Document>> {
        self.router.replicator().map(|_| documents.to_vec())
    }
}

#[async_trait]
impl Collection for CollectionProxy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<Vec<Document>> {
        let name = &self.name;
        self.read(Operation::Find, |store| {
            let (name, filter, options) = (name.clone(), filter.clone(), options.clone());
            async move { store.find(&name, filter, options).await }
        })
        .await
    }

    async fn find_one(&self, filter: Document, options: FindOptions) -> Result<Option<Document>> {
        let name = &self.name;
        self.read(Operation::FindOne, |store| {
            let (name, filter, options) = (name.clone(), filter.clone(), options.clone());
            async move { store.find_one(&name, filter, options).await }
        })
        .await
    }

    async fn count_documents(&self, filter: Document) -> Result<u64> {
        let name = &self.name;
        self.read(Operation::CountDocuments, |store| {
            let (name, filter) = (name.clone(), filter.clone());
            async move { store.count_documents(&name, filter).await }
        })
        .await
    }

    async fn estimated_document_count(&self) -> Result<u64> {
        let name = &self.name;
        self.read(Operation::EstimatedDocumentCount, |store| {
            let name = name.clone();
            async move { store.estimated_document_count(&name).await }
        })
        .await
    }

    async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<Bson>> {
        let name = &self.name;
        self.read(Operation::Distinct, |store| {
            let (name, field, filter) = (name.clone(), field.to_string(), filter.clone());
            async move { store.distinct(&name, &field, filter).await }
        })
        .await
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let name = &self.name;
        self.read(Operation::Aggregate, |store| {
            let (name, pipeline) = (name.clone(), pipeline.clone());
            async move { store.aggregate(&name, pipeline).await }
        })
        .await
    }

    async fn insert_one(&self, mut document: Document) -> Result<InsertOneResult> {
        // The `_id` is fixed here so the replayed insert carries the same one.
        query::ensure_id(&mut document);
        let replay = self.replay_copy(std::slice::from_ref(&document));
        let result = self.primary().insert_one(&self.name, document).await?;
        self.replicate(Operation::InsertOne, replay);
        Ok(result)
    }

    async fn insert_many(&self, mut documents: Vec<Document>) -> Result<InsertManyResult> {
        for document in documents.iter_mut() {
            query::ensure_id(document);
        }
        let replay = self.replay_copy(&documents);
        let result = self.primary().insert_many(&self.name, documents).await?;
        self.replicate(Operation::InsertMany, replay);
        Ok(result)
    }

    async fn update_one(&self, filter: Document, update: Document, options: UpdateOptions) -> Result<UpdateResult> {
        let result = self.primary().update_one(&self.name, filter, update, options).await?;
        self.replicate(Operation::UpdateOne, None);
        Ok(result)
    }

    async fn update_many(&self, filter: Document, update: Document, options: UpdateOptions) -> Result<UpdateResult> {
        let result = self.primary().update_many(&self.name, filter, update, options).await?;
        self.replicate(Operation::UpdateMany, None);
        Ok(result)
    }

    async fn replace_one(&self, filter: Document, replacement: Document, options: UpdateOptions) -> Result<UpdateResult> {
        let result = self.primary().replace_one(&self.name, filter, replacement, options).await?;
        self.replicate(Operation::ReplaceOne, None);
        Ok(result)
    }

    async fn delete_one(&self, filter: Document) -> Result<DeleteResult> {
        let result = self.primary().delete_one(&self.name, filter).await?;
        self.replicate(Operation::DeleteOne, None);
        Ok(result)
    }

    async fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
        let result = self.primary().delete_many(&self.name, filter).await?;
        self.replicate(Operation::DeleteMany, None);
        Ok(result)
    }

    async fn find_one_and_update(&self, filter: Document, update: Document, options: FindOneAndOptions) -> Result<Option<Document>> {
        let result = self.primary().find_one_and_update(&self.name, filter, update, options).await?;
        self.replicate(Operation::FindOneAndUpdate, None);
        Ok(result)
    }

    async fn find_one_and_replace(&self, filter: Document, replacement: Document, options: FindOneAndOptions) -> Result<Option<Document>> {
        let result = self
            .primary()
            .find_one_and_replace(&self.name, filter, replacement, options)
            .await?;
        self.replicate(Operation::FindOneAndReplace, None);
        Ok(result)
    }

    async fn find_one_and_delete(&self, filter: Document, options: FindOneAndOptions) -> Result<Option<Document>> {
        let result = self.primary().find_one_and_delete(&self.name, filter, options).await?;
        self.replicate(Operation::FindOneAndDelete, None);
        Ok(result)
    }

    async fn create_index(&self, keys: Document) -> Result<String> {
        Ok(self.primary().create_index(&self.name, keys).await?)
    }

    async fn list_indexes(&self) -> Result<Vec<Document>> {
        Ok(self.primary().list_indexes(&self.name).await?)
    }

    /// Drops the collection on the primary, then empties the secondary copy
    /// through the usual resync path.
    async fn drop(&self) -> Result<()> {
        self.primary().drop_collection(&self.name).await?;
        self.replicate(Operation::Drop, None);
        Ok(())
    }
}

impl std::fmt::Debug for CollectionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionProxy").field("name", &self.name).finish()
    }
}
