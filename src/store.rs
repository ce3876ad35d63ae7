/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file store.rs
 * @brief Storage backend trait and shared write planning
 */

use crate::aggregation_pipeline::AggregationPipeline;
use crate::error::{StoreError, StoreResult};
use crate::query::{self, FindOptions, ID_FIELD};
use async_trait::async_trait;
use bson::{Bson, Document};

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Bson>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOptions {
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self { upsert: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindOneAndOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub upsert: bool,
    pub return_document: ReturnDocument,
}

/// Async storage backend. Every method names its collection explicitly;
/// backends create collections on first write.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    async fn list_collections(&self) -> StoreResult<Vec<String>>;

    async fn find(&self, collection: &str, filter: Document, options: FindOptions) -> StoreResult<Vec<Document>>;

    async fn find_one(&self, collection: &str, filter: Document, options: FindOptions) -> StoreResult<Option<Document>> {
        let options = FindOptions { limit: Some(1), ..options };
        Ok(self.find(collection, filter, options).await?.into_iter().next())
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> StoreResult<u64>;

    async fn estimated_document_count(&self, collection: &str) -> StoreResult<u64> {
        self.count_documents(collection, Document::new()).await
    }

    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> StoreResult<Vec<Bson>> {
        let docs = self.find(collection, filter, FindOptions::default()).await?;
        Ok(distinct_values(&docs, field))
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> StoreResult<Vec<Document>> {
        let pipeline = AggregationPipeline::from_stages(pipeline)?;
        let docs = self.find(collection, Document::new(), FindOptions::default()).await?;
        pipeline.execute(docs)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> StoreResult<InsertOneResult>;

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> StoreResult<InsertManyResult>;

    async fn update_one(&self, collection: &str, filter: Document, update: Document, options: UpdateOptions) -> StoreResult<UpdateResult>;

    async fn update_many(&self, collection: &str, filter: Document, update: Document, options: UpdateOptions) -> StoreResult<UpdateResult>;

    async fn replace_one(&self, collection: &str, filter: Document, replacement: Document, options: UpdateOptions) -> StoreResult<UpdateResult>;

    async fn delete_one(&self, collection: &str, filter: Document) -> StoreResult<DeleteResult>;

    async fn delete_many(&self, collection: &str, filter: Document) -> StoreResult<DeleteResult>;

    async fn find_one_and_update(&self, collection: &str, filter: Document, update: Document, options: FindOneAndOptions) -> StoreResult<Option<Document>>;

    async fn find_one_and_replace(&self, collection: &str, filter: Document, replacement: Document, options: FindOneAndOptions) -> StoreResult<Option<Document>>;

    async fn find_one_and_delete(&self, collection: &str, filter: Document, options: FindOneAndOptions) -> StoreResult<Option<Document>>;

    async fn create_index(&self, collection: &str, keys: Document) -> StoreResult<String>;

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<Document>>;

    async fn drop_collection(&self, collection: &str) -> StoreResult<()>;

    async fn close(&self) {}
}

pub fn distinct_values(docs: &[Document], field: &str) -> Vec<Bson> {
    let mut seen = std::collections::HashSet::new();
    let mut values = Vec::new();
    for doc in docs {
        let candidates: Vec<&Bson> = match query::get_path(doc, field) {
            Some(Bson::Array(items)) => items.iter().collect(),
            Some(value) => vec![value],
            None => Vec::new(),
        };
        for value in candidates {
            if seen.insert(query::id_key(value)) {
                values.push(value.clone());
            }
        }
    }
    values
}

pub fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| format!("{}_{}", field, direction))
        .collect::<Vec<_>>()
        .join("_")
}

/// Collection names double as table names, so keep them to a safe alphabet.
pub fn validate_collection_name(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollectionName(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum UpdateSpec {
    Operators(Document),
    Replacement(Document),
}

/// One change to a collection's document set, addressed by position in the
/// snapshot the plan was computed from.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Replace { index: usize, document: Document },
    Insert(Document),
    Delete { index: usize },
}

#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    pub mutations: Vec<Mutation>,
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

fn matching_indices(docs: &[Document], filter: &Document, sort: Option<&Document>) -> StoreResult<Vec<usize>> {
    let mut indices = Vec::new();
    for (index, doc) in docs.iter().enumerate() {
        if query::matches(doc, filter)? {
            indices.push(index);
        }
    }
    if let Some(sort) = sort {
        let mut sorted: Vec<Document> = indices.iter().map(|&i| docs[i].clone()).collect();
        // Carry the original position through the sort.
        for (doc, index) in sorted.iter_mut().zip(indices.iter()) {
            doc.insert("__hybriddb_pos", *index as i64);
        }
        query::sort_documents(&mut sorted, sort)?;
        indices = sorted
            .iter()
            .filter_map(|doc| doc.get_i64("__hybriddb_pos").ok().map(|p| p as usize))
            .collect();
    }
    Ok(indices)
}

/// Compute the effect of an update/replace against a snapshot.
pub fn plan_update(
    docs: &[Document],
    filter: &Document,
    spec: &UpdateSpec,
    multi: bool,
    upsert: bool,
    sort: Option<&Document>,
) -> StoreResult<WritePlan> {
    let mut plan = WritePlan::default();
    let mut targets = matching_indices(docs, filter, sort)?;
    if !multi {
        targets.truncate(1);
    }

    for index in targets {
        let current = &docs[index];
        let next = match spec {
            UpdateSpec::Operators(update) => {
                let mut next = current.clone();
                query::apply_update(&mut next, update, false)?;
                next
            }
            UpdateSpec::Replacement(replacement) => query::apply_replacement(current, replacement)?,
        };
        plan.matched += 1;
        if plan.before.is_none() {
            plan.before = Some(current.clone());
            plan.after = Some(next.clone());
        }
        if &next != current {
            plan.modified += 1;
            plan.mutations.push(Mutation::Replace { index, document: next });
        }
    }

    if plan.matched == 0 && upsert {
        let mut seed = query::upsert_seed(filter)?;
        let mut document = match spec {
            UpdateSpec::Operators(update) => {
                query::apply_update(&mut seed, update, true)?;
                seed
            }
            UpdateSpec::Replacement(replacement) => {
                let mut doc = query::apply_replacement(&Document::new(), replacement)?;
                if let Some(id) = seed.get(ID_FIELD).or_else(|| replacement.get(ID_FIELD)) {
                    doc.insert(ID_FIELD, id.clone());
                }
                doc
            }
        };
        let id = query::ensure_id(&mut document);
        plan.upserted_id = Some(id);
        plan.after = Some(document.clone());
        plan.mutations.push(Mutation::Insert(document));
    }
    Ok(plan)
}

pub fn plan_delete(docs: &[Document], filter: &Document, multi: bool, sort: Option<&Document>) -> StoreResult<WritePlan> {
    let mut plan = WritePlan::default();
    let mut targets = matching_indices(docs, filter, sort)?;
    if !multi {
        targets.truncate(1);
    }
    for index in targets {
        if plan.before.is_none() {
            plan.before = Some(docs[index].clone());
        }
        plan.matched += 1;
        plan.mutations.push(Mutation::Delete { index });
    }
    Ok(plan)
}

impl WritePlan {
    pub fn update_result(&self) -> UpdateResult {
        UpdateResult {
            matched_count: self.matched,
            modified_count: self.modified,
            upserted_id: self.upserted_id.clone(),
        }
    }

    pub fn delete_result(&self) -> DeleteResult {
        DeleteResult { deleted_count: self.matched }
    }

    pub fn returned(&self, options: &FindOneAndOptions) -> StoreResult<Option<Document>> {
        let chosen = match options.return_document {
            ReturnDocument::Before => self.before.as_ref(),
            ReturnDocument::After => self.after.as_ref().or(self.before.as_ref()),
        };
        match (chosen, &options.projection) {
            (Some(doc), Some(projection)) => Ok(Some(query::project(doc, projection)?)),
            (Some(doc), None) => Ok(Some(doc.clone())),
            (None, _) => Ok(None),
        }
    }
}

/// Reject a batch whose `_id`s collide with each other or with `existing`.
pub fn check_unique_ids<'a, I>(collection: &str, existing: I, incoming: &[Document]) -> StoreResult<()>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut seen: std::collections::HashSet<String> = existing
        .into_iter()
        .filter_map(|doc| doc.get(ID_FIELD).map(query::id_key))
        .collect();
    for doc in incoming {
        if let Some(id) = doc.get(ID_FIELD) {
            let key = query::id_key(id);
            if !seen.insert(key.clone()) {
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    key,
                });
            }
        }
    }
    Ok(())
}

pub fn same_document(a: &Document, b: &Document) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(key, value)| match (value, b.get(key)) {
        (Bson::Document(x), Some(Bson::Document(y))) => same_document(x, y),
        (x, Some(y)) => query::values_equal(x, y),
        (_, None) => false,
    })
}
