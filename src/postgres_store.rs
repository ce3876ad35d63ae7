/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file postgres_store.rs
 * @brief Document collections stored as PostgreSQL JSONB tables
 */

//! Every collection is a table `(id BIGSERIAL, doc_id TEXT UNIQUE, data JSONB)`.
//! Documents are kept as canonical extended JSON so BSON types survive a
//! round trip; filters and updates are evaluated by [`crate::query`] after the
//! rows are loaded, with `_id` and simple equality terms narrowed in SQL.

use crate::connection_pool::{self, PoolSettings, PoolStatsSnapshot};
use crate::error::{StoreError, StoreResult};
use crate::query::{self, FindOptions, ID_FIELD};
use crate::store::{
    self, plan_delete, plan_update, DeleteResult, DocumentStore, FindOneAndOptions,
    InsertManyResult, InsertOneResult, Mutation, ReturnDocument, UpdateOptions, UpdateResult,
    UpdateSpec, WritePlan,
};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use deadpool_postgres::{GenericClient, Pool};
use parking_lot::RwLock;
use std::collections::HashSet;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tracing::debug;

pub struct PostgresStore {
    pool: Pool,
    known_tables: RwLock<HashSet<String>>,
}

fn table(collection: &str) -> StoreResult<String> {
    store::validate_collection_name(collection)?;
    Ok(format!("\"{}\"", collection))
}

fn encode(document: &Document) -> StoreResult<String> {
    let value = Bson::Document(document.clone()).into_canonical_extjson();
    Ok(serde_json::to_string(&value)?)
}

fn decode(text: &str) -> StoreResult<Document> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match Bson::try_from(value)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(StoreError::Serialization(format!("Stored value is not a document: {}", other))),
    }
}

fn doc_id(document: &Document) -> StoreResult<String> {
    document
        .get(ID_FIELD)
        .map(query::id_key)
        .ok_or_else(|| StoreError::Backend("Document has no _id".into()))
}

fn map_error(collection: &str, document_key: Option<&str>, err: tokio_postgres::Error) -> StoreError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return StoreError::DuplicateKey {
            collection: collection.to_string(),
            key: document_key.unwrap_or("unknown").to_string(),
        };
    }
    StoreError::from(err)
}

fn is_missing_table(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNDEFINED_TABLE)
}

/// Top-level equality terms of `filter` as `(field, stored JSON)`. Only
/// strings, booleans and object ids qualify: numbers may be stored with a
/// different width than the filter uses and still be equal.
fn equality_terms(filter: &Document) -> Vec<(String, String)> {
    filter
        .iter()
        .filter(|(field, _)| field.as_str() != ID_FIELD && !field.starts_with('$') && !field.contains('.'))
        .filter_map(|(field, value)| {
            let value = match value {
                Bson::Document(ops) if ops.len() == 1 => ops.get("$eq")?,
                other => other,
            };
            match value {
                Bson::String(_) | Bson::Boolean(_) | Bson::ObjectId(_) => {
                    Some((field.clone(), value.clone().into_canonical_extjson().to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

/// ` WHERE ...` clause and its parameters for the rows `filter` can match.
/// A term matches the field itself or an array holding it.
fn narrowing_predicate(filter: &Document) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    if let Some(id) = query::pinned_id(filter) {
        params.push(query::id_key(id));
        clauses.push(format!("doc_id = ${}", params.len()));
    }
    for (field, value) in equality_terms(filter) {
        params.push(field);
        let field_param = params.len();
        params.push(value);
        let value_param = params.len();
        clauses.push(format!(
            "((data -> ${f}::text) = ${v}::text::jsonb OR (data -> ${f}::text) @> jsonb_build_array(${v}::text::jsonb))",
            f = field_param,
            v = value_param
        ));
    }
    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}

fn index_expression(field: &str) -> StoreResult<String> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return Err(StoreError::InvalidQuery(format!("Invalid index field: {}", field)));
    }
    Ok(format!("(data #> '{{{}}}')", field.replace('.', ",")))
}

impl PostgresStore {
    pub async fn connect(connection_string: &str, settings: &PoolSettings) -> StoreResult<Self> {
        let pool = connection_pool::connect_pool(connection_string, settings).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            known_tables: RwLock::new(HashSet::new()),
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        connection_pool::pool_stats(&self.pool, "postgres")
    }

    async fn ensure_table(&self, client: &impl GenericClient, collection: &str) -> StoreResult<String> {
        let name = table(collection)?;
        if self.known_tables.read().contains(collection) {
            return Ok(name);
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                doc_id TEXT NOT NULL UNIQUE,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )",
            name
        );
        client.batch_execute(&ddl).await?;
        self.known_tables.write().insert(collection.to_string());
        debug!("Ensured table for collection {}", collection);
        Ok(name)
    }

    /// Rows of a collection as `(row id, document)`, optionally locked for
    /// update. The SQL narrows on `_id` and plain equality terms; callers
    /// still apply the full filter to what comes back.
    async fn load_rows(
        &self,
        client: &impl GenericClient,
        collection: &str,
        filter: &Document,
        for_update: bool,
    ) -> StoreResult<Vec<(i64, Document)>> {
        let name = table(collection)?;
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let (predicate, params) = narrowing_predicate(filter);
        let sql = format!("SELECT id, data::text FROM {}{} ORDER BY id{}", name, predicate, lock);
        let params: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let result = client.query(&sql, &params).await;
        let rows = match result {
            Ok(rows) => rows,
            Err(err) if is_missing_table(&err) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get(0)?;
                let text: String = row.try_get(1)?;
                Ok((id, decode(&text)?))
            })
            .collect()
    }

    async fn load_documents(&self, collection: &str, filter: &Document) -> StoreResult<Vec<Document>> {
        let client = self.pool.get().await?;
        Ok(self
            .load_rows(&client, collection, filter, false)
            .await?
            .into_iter()
            .map(|(_, doc)| doc)
            .collect())
    }

    async fn write_with<F>(&self, collection: &str, filter: &Document, plan: F) -> StoreResult<WritePlan>
    where
        F: FnOnce(&[Document]) -> StoreResult<WritePlan> + Send,
    {
        let mut client = self.pool.get().await?;
        let name = self.ensure_table(&client, collection).await?;
        let tx = client.transaction().await?;

        let rows = self.load_rows(&tx, collection, filter, true).await?;
        let (row_ids, docs): (Vec<i64>, Vec<Document>) = rows.into_iter().unzip();
        let plan = plan(&docs)?;

        let mut deletions = Vec::new();
        for mutation in &plan.mutations {
            match mutation {
                Mutation::Replace { index, document } => {
                    let data = encode(document)?;
                    let sql = format!("UPDATE {} SET data = $1::text::jsonb WHERE id = $2", name);
                    tx.execute(&sql, &[&data, &row_ids[*index]]).await?;
                }
                Mutation::Insert(document) => {
                    let key = doc_id(document)?;
                    let data = encode(document)?;
                    let sql = format!("INSERT INTO {} (doc_id, data) VALUES ($1, $2::text::jsonb)", name);
                    tx.execute(&sql, &[&key, &data])
                        .await
                        .map_err(|e| map_error(collection, Some(&key), e))?;
                }
                Mutation::Delete { index } => deletions.push(row_ids[*index]),
            }
        }
        if !deletions.is_empty() {
            let sql = format!("DELETE FROM {} WHERE id = ANY($1)", name);
            tx.execute(&sql, &[&deletions]).await?;
        }
        tx.commit().await?;
        Ok(plan)
    }

    async fn insert_documents(&self, collection: &str, mut documents: Vec<Document>) -> StoreResult<Vec<Bson>> {
        let ids: Vec<Bson> = documents.iter_mut().map(query::ensure_id).collect();
        store::check_unique_ids(collection, std::iter::empty(), &documents)?;

        let mut client = self.pool.get().await?;
        let name = self.ensure_table(&client, collection).await?;
        let tx = client.transaction().await?;
        let sql = format!("INSERT INTO {} (doc_id, data) VALUES ($1, $2::text::jsonb)", name);
        let statement = tx.prepare(&sql).await?;
        for document in &documents {
            let key = doc_id(document)?;
            let data = encode(document)?;
            tx.execute(&statement, &[&key, &data])
                .await
                .map_err(|e| map_error(collection, Some(&key), e))?;
        }
        tx.commit().await?;
        Ok(ids)
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT table_name::text FROM information_schema.columns
                 WHERE table_schema = current_schema() AND column_name IN ('doc_id', 'data')
                 GROUP BY table_name HAVING COUNT(*) = 2 ORDER BY table_name",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(StoreError::from))
            .collect()
    }

    async fn find(&self, collection: &str, filter: Document, options: FindOptions) -> StoreResult<Vec<Document>> {
        let docs = self.load_documents(collection, &filter).await?;
        query::run_find(docs, &filter, &options)
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> StoreResult<u64> {
        if filter.is_empty() {
            let client = self.pool.get().await?;
            let sql = format!("SELECT COUNT(*) FROM {}", table(collection)?);
            return match client.query_one(&sql, &[]).await {
                Ok(row) => Ok(row.try_get::<_, i64>(0)? as u64),
                Err(err) if is_missing_table(&err) => Ok(0),
                Err(err) => Err(err.into()),
            };
        }
        let docs = self.load_documents(collection, &filter).await?;
        let mut count = 0;
        for doc in &docs {
            if query::matches(doc, &filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> StoreResult<InsertOneResult> {
        let mut ids = self.insert_documents(collection, vec![document]).await?;
        Ok(InsertOneResult { inserted_id: ids.remove(0) })
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> StoreResult<InsertManyResult> {
        let inserted_ids = self.insert_documents(collection, documents).await?;
        Ok(InsertManyResult { inserted_ids })
    }

    async fn update_one(&self, collection: &str, filter: Document, update: Document, options: UpdateOptions) -> StoreResult<UpdateResult> {
        let spec = UpdateSpec::Operators(update);
        let plan = self
            .write_with(collection, &filter, |docs| plan_update(docs, &filter, &spec, false, options.upsert, None))
            .await?;
        Ok(plan.update_result())
    }

    async fn update_many(&self, collection: &str, filter: Document, update: Document, options: UpdateOptions) -> StoreResult<UpdateResult> {
        let spec = UpdateSpec::Operators(update);
        let plan = self
            .write_with(collection, &filter, |docs| plan_update(docs, &filter, &spec, true, options.upsert, None))
            .await?;
        Ok(plan.update_result())
    }

    async fn replace_one(&self, collection: &str, filter: Document, replacement: Document, options: UpdateOptions) -> StoreResult<UpdateResult> {
        let spec = UpdateSpec::Replacement(replacement);
        let plan = self
            .write_with(collection, &filter, |docs| plan_update(docs, &filter, &spec, false, options.upsert, None))
            .await?;
        Ok(plan.update_result())
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> StoreResult<DeleteResult> {
        let plan = self
            .write_with(collection, &filter, |docs| plan_delete(docs, &filter, false, None))
            .await?;
        Ok(plan.delete_result())
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> StoreResult<DeleteResult> {
        if filter.is_empty() {
            let client = self.pool.get().await?;
            let sql = format!("DELETE FROM {}", table(collection)?);
            return match client.execute(&sql, &[]).await {
                Ok(deleted_count) => Ok(DeleteResult { deleted_count }),
                Err(err) if is_missing_table(&err) => Ok(DeleteResult::default()),
                Err(err) => Err(err.into()),
            };
        }
        let plan = self
            .write_with(collection, &filter, |docs| plan_delete(docs, &filter, true, None))
            .await?;
        Ok(plan.delete_result())
    }

    async fn find_one_and_update(&self, collection: &str, filter: Document, update: Document, options: FindOneAndOptions) -> StoreResult<Option<Document>> {
        let spec = UpdateSpec::Operators(update);
        let sort = options.sort.clone();
        let plan = self
            .write_with(collection, &filter, |docs| {
                plan_update(docs, &filter, &spec, false, options.upsert, sort.as_ref())
            })
            .await?;
        plan.returned(&options)
    }

    async fn find_one_and_replace(&self, collection: &str, filter: Document, replacement: Document, options: FindOneAndOptions) -> StoreResult<Option<Document>> {
        let spec = UpdateSpec::Replacement(replacement);
        let sort = options.sort.clone();
        let plan = self
            .write_with(collection, &filter, |docs| {
                plan_update(docs, &filter, &spec, false, options.upsert, sort.as_ref())
            })
            .await?;
        plan.returned(&options)
    }

    async fn find_one_and_delete(&self, collection: &str, filter: Document, options: FindOneAndOptions) -> StoreResult<Option<Document>> {
        let sort = options.sort.clone();
        let plan = self
            .write_with(collection, &filter, |docs| plan_delete(docs, &filter, false, sort.as_ref()))
            .await?;
        plan.returned(&FindOneAndOptions { return_document: ReturnDocument::Before, ..options })
    }

    async fn create_index(&self, collection: &str, keys: Document) -> StoreResult<String> {
        let client = self.pool.get().await?;
        let name = self.ensure_table(&client, collection).await?;
        let index = store::index_name(&keys);
        let expressions = keys
            .keys()
            .map(|field| index_expression(field))
            .collect::<StoreResult<Vec<_>>>()?;
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS \"{}_{}\" ON {} ({})",
            collection,
            index.replace('-', "n"),
            name,
            expressions.join(", ")
        );
        client.batch_execute(&sql).await?;
        Ok(index)
    }

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<Document>> {
        store::validate_collection_name(collection)?;
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT indexname::text, indexdef FROM pg_indexes WHERE schemaname = current_schema() AND tablename = $1",
                &[&collection],
            )
            .await?;
        let mut indexes = vec![doc! { "name": "_id_", "key": { "_id": 1 } }];
        for row in rows {
            let name: String = row.try_get(0)?;
            let definition: String = row.try_get(1)?;
            indexes.push(doc! { "name": name, "definition": definition });
        }
        Ok(indexes)
    }

    async fn drop_collection(&self, collection: &str) -> StoreResult<()> {
        let client = self.pool.get().await?;
        let sql = format!("DROP TABLE IF EXISTS {}", table(collection)?);
        client.batch_execute(&sql).await?;
        self.known_tables.write().remove(collection);
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;

    #[test]
    fn test_encode_decode_preserves_types() {
        let original = doc! {
            "_id": ObjectId::new(),
            "small": 5_i64,
            "ratio": 1.0,
            "when": bson::DateTime::from_millis(1_700_000_000_000),
            "nested": { "list": [1, "two", null] },
        };
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_table_names_are_quoted_and_validated() {
        assert_eq!(table("users").unwrap(), "\"users\"");
        assert!(table("users\"; --").is_err());
    }

    #[test]
    fn test_equality_terms_keep_unambiguous_values() {
        let oid = ObjectId::new();
        let filter = doc! {
            "title": "lifetimes",
            "published": true,
            "author": oid,
            "level": { "$eq": "advanced" },
            "minutes": 30,
            "meta.views": "x",
            "tags": { "$in": ["rust"] },
            "_id": "abc",
            "$or": [{ "title": "ownership" }],
        };
        let terms = equality_terms(&filter);
        let fields: Vec<&str> = terms.iter().map(|(field, _)| field.as_str()).collect();
        assert_eq!(fields, vec!["title", "published", "author", "level"]);
        assert_eq!(terms[0].1, "\"lifetimes\"");
        assert_eq!(terms[1].1, "true");
        assert_eq!(terms[2].1, format!("{{\"$oid\":\"{}\"}}", oid.to_hex()));
    }

    #[test]
    fn test_narrowing_predicate() {
        let (predicate, params) = narrowing_predicate(&doc! { "minutes": { "$gt": 40 } });
        assert!(predicate.is_empty());
        assert!(params.is_empty());

        let (predicate, params) = narrowing_predicate(&doc! { "_id": 7, "title": "lifetimes" });
        assert!(predicate.starts_with(" WHERE doc_id = $1 AND "));
        assert!(predicate.contains("(data -> $2::text) = $3::text::jsonb"));
        assert!(predicate.contains("@> jsonb_build_array($3::text::jsonb)"));
        assert_eq!(params, vec!["7".to_string(), "title".to_string(), "\"lifetimes\"".to_string()]);
    }

    #[test]
    fn test_index_expression() {
        assert_eq!(index_expression("profile.email").unwrap(), "(data #> '{profile,email}')");
        assert!(index_expression("a'b").is_err());
    }
}
