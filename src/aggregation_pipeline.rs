/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file aggregation_pipeline.rs
 * @brief In-process aggregation pipeline evaluation
 */

use crate::error::{StoreError, StoreResult};
use crate::query::{self, compare_values, get_path};
use bson::{Bson, Document};
use indexmap::IndexMap;
use std::cmp::Ordering;

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::InvalidQuery(message.into())
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStage {
    Match(Document),
    Group(Document),
    Project(Document),
    AddFields(Document),
    Sort(Document),
    Limit(usize),
    Skip(usize),
    Unwind(UnwindOptions),
    Count(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnwindOptions {
    pub path: String,
    pub preserve_null_and_empty_arrays: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationPipeline {
    stages: Vec<PipelineStage>,
}

fn count_value(stage: &str, value: &Bson) -> StoreResult<usize> {
    match value {
        Bson::Int32(n) if *n >= 0 => Ok(*n as usize),
        Bson::Int64(n) if *n >= 0 => Ok(*n as usize),
        Bson::Double(n) if *n >= 0.0 && n.fract() == 0.0 => Ok(*n as usize),
        _ => Err(invalid(format!("{} stage must be a non-negative integer", stage))),
    }
}

fn stage_document(stage: &str, value: Bson) -> StoreResult<Document> {
    match value {
        Bson::Document(doc) => Ok(doc),
        _ => Err(invalid(format!("{} stage must be a document", stage))),
    }
}

fn field_reference(value: &str) -> StoreResult<&str> {
    value
        .strip_prefix('$')
        .filter(|path| !path.is_empty())
        .ok_or_else(|| invalid(format!("Expected a field path starting with '$', got '{}'", value)))
}

fn evaluate(doc: &Document, expr: &Bson) -> StoreResult<Bson> {
    match expr {
        Bson::String(s) if s.starts_with('$') => {
            Ok(get_path(doc, field_reference(s)?).cloned().unwrap_or(Bson::Null))
        }
        Bson::Document(fields) => {
            if fields.keys().next().map_or(false, |k| k.starts_with('$')) {
                return Err(invalid(format!("Unsupported expression: {:?}", fields)));
            }
            let mut out = Document::new();
            for (key, value) in fields {
                out.insert(key.clone(), evaluate(doc, value)?);
            }
            Ok(Bson::Document(out))
        }
        literal => Ok(literal.clone()),
    }
}

fn add_numbers(a: &Bson, b: &Bson) -> Bson {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => x
            .checked_add(*y)
            .map(Bson::Int32)
            .unwrap_or(Bson::Int64(*x as i64 + *y as i64)),
        (Bson::Int64(x), Bson::Int32(y)) => Bson::Int64(x + *y as i64),
        (Bson::Int32(x), Bson::Int64(y)) => Bson::Int64(*x as i64 + y),
        (Bson::Int64(x), Bson::Int64(y)) => Bson::Int64(x + y),
        _ => {
            let x = number(a).unwrap_or(0.0);
            let y = number(b).unwrap_or(0.0);
            Bson::Double(x + y)
        }
    }
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Bson),
    Avg { total: f64, count: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Last(Bson),
    Push(Vec<Bson>),
}

impl Accumulator {
    fn new(op: &str) -> StoreResult<Self> {
        Ok(match op {
            "$sum" => Accumulator::Sum(Bson::Int32(0)),
            "$avg" => Accumulator::Avg { total: 0.0, count: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(Bson::Null),
            "$push" => Accumulator::Push(Vec::new()),
            other => return Err(invalid(format!("Unsupported accumulator: {}", other))),
        })
    }

    fn accept(&mut self, value: Bson) {
        match self {
            Accumulator::Sum(total) => {
                if number(&value).is_some() {
                    *total = add_numbers(total, &value);
                }
            }
            Accumulator::Avg { total, count } => {
                if let Some(n) = number(&value) {
                    *total += n;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                if !matches!(value, Bson::Null)
                    && current.as_ref().map_or(true, |c| compare_values(&value, c) == Ordering::Less)
                {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if !matches!(value, Bson::Null)
                    && current.as_ref().map_or(true, |c| compare_values(&value, c) == Ordering::Greater)
                {
                    *current = Some(value);
                }
            }
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Accumulator::Last(current) => *current = value,
            Accumulator::Push(items) => items.push(value),
        }
    }

    fn finish(self) -> Bson {
        match self {
            Accumulator::Sum(total) => total,
            Accumulator::Avg { total, count } => {
                if count == 0 {
                    Bson::Null
                } else {
                    Bson::Double(total / count as f64)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) => v.unwrap_or(Bson::Null),
            Accumulator::Last(v) => v,
            Accumulator::Push(items) => Bson::Array(items),
        }
    }
}

impl AggregationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn from_stages(pipeline: Vec<Document>) -> StoreResult<Self> {
        let stages = pipeline
            .into_iter()
            .map(Self::parse_stage)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Self { stages })
    }

    fn parse_stage(doc: Document) -> StoreResult<PipelineStage> {
        if doc.len() != 1 {
            return Err(invalid("Pipeline stage must have exactly one operator"));
        }
        let Some((stage_name, stage_value)) = doc.into_iter().next() else {
            return Err(invalid("Empty pipeline stage"));
        };

        match stage_name.as_str() {
            "$match" => Ok(PipelineStage::Match(stage_document("$match", stage_value)?)),
            "$group" => {
                let group = stage_document("$group", stage_value)?;
                if !group.contains_key("_id") {
                    return Err(invalid("$group stage requires an _id field"));
                }
                Ok(PipelineStage::Group(group))
            }
            "$project" => Ok(PipelineStage::Project(stage_document("$project", stage_value)?)),
            "$addFields" | "$set" => Ok(PipelineStage::AddFields(stage_document("$addFields", stage_value)?)),
            "$sort" => Ok(PipelineStage::Sort(stage_document("$sort", stage_value)?)),
            "$limit" => Ok(PipelineStage::Limit(count_value("$limit", &stage_value)?)),
            "$skip" => Ok(PipelineStage::Skip(count_value("$skip", &stage_value)?)),
            "$unwind" => Ok(PipelineStage::Unwind(Self::parse_unwind_stage(stage_value)?)),
            "$count" => match stage_value {
                Bson::String(name) if !name.is_empty() && !name.starts_with('$') => Ok(PipelineStage::Count(name)),
                _ => Err(invalid("$count stage requires a non-empty field name")),
            },
            other => Err(invalid(format!("Unsupported aggregation stage: {}", other))),
        }
    }

    fn parse_unwind_stage(value: Bson) -> StoreResult<UnwindOptions> {
        match value {
            Bson::String(path) => Ok(UnwindOptions {
                path: field_reference(&path)?.to_string(),
                preserve_null_and_empty_arrays: false,
            }),
            Bson::Document(doc) => {
                let path = doc
                    .get_str("path")
                    .map_err(|_| invalid("$unwind requires a path"))?;
                Ok(UnwindOptions {
                    path: field_reference(path)?.to_string(),
                    preserve_null_and_empty_arrays: doc
                        .get_bool("preserveNullAndEmptyArrays")
                        .unwrap_or(false),
                })
            }
            _ => Err(invalid("$unwind stage must be a string or document")),
        }
    }

    pub fn execute(&self, input: Vec<Document>) -> StoreResult<Vec<Document>> {
        let mut docs = input;
        for stage in &self.stages {
            docs = Self::execute_stage(stage, docs)?;
        }
        Ok(docs)
    }

    fn execute_stage(stage: &PipelineStage, docs: Vec<Document>) -> StoreResult<Vec<Document>> {
        match stage {
            PipelineStage::Match(filter) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if query::matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                Ok(kept)
            }
            PipelineStage::Sort(sort) => {
                let mut docs = docs;
                query::sort_documents(&mut docs, sort)?;
                Ok(docs)
            }
            PipelineStage::Limit(limit) => Ok(docs.into_iter().take(*limit).collect()),
            PipelineStage::Skip(skip) => Ok(docs.into_iter().skip(*skip).collect()),
            PipelineStage::Project(projection) => docs.iter().map(|doc| Self::project_stage(doc, projection)).collect(),
            PipelineStage::AddFields(fields) => docs
                .into_iter()
                .map(|mut doc| {
                    for (key, expr) in fields {
                        let value = evaluate(&doc, expr)?;
                        doc.insert(key.clone(), value);
                    }
                    Ok(doc)
                })
                .collect(),
            PipelineStage::Unwind(options) => Ok(Self::unwind_stage(docs, options)),
            PipelineStage::Group(group) => Self::group_stage(docs, group),
            PipelineStage::Count(field) => {
                let mut out = Document::new();
                if !docs.is_empty() {
                    out.insert(field.clone(), docs.len() as i64);
                    return Ok(vec![out]);
                }
                Ok(Vec::new())
            }
        }
    }

    /// `$project` accepts field references in addition to 0/1 flags.
    fn project_stage(doc: &Document, projection: &Document) -> StoreResult<Document> {
        let computed: Vec<(&String, &Bson)> = projection
            .iter()
            .filter(|(_, v)| matches!(v, Bson::String(_) | Bson::Document(_)))
            .collect();
        if computed.is_empty() {
            return query::project(doc, projection);
        }
        let mut flags = Document::new();
        for (key, value) in projection {
            if !matches!(value, Bson::String(_) | Bson::Document(_)) {
                flags.insert(key.clone(), value.clone());
            }
        }
        let mut out = if flags.iter().any(|(k, _)| k != "_id") {
            query::project(doc, &flags)?
        } else {
            let mut base = Document::new();
            let keep_id = !matches!(flags.get("_id"), Some(Bson::Int32(0)) | Some(Bson::Boolean(false)));
            if keep_id {
                if let Some(id) = doc.get("_id") {
                    base.insert("_id", id.clone());
                }
            }
            base
        };
        for (key, expr) in computed {
            out.insert(key.clone(), evaluate(doc, expr)?);
        }
        Ok(out)
    }

    fn unwind_stage(docs: Vec<Document>, options: &UnwindOptions) -> Vec<Document> {
        let mut out = Vec::new();
        for doc in docs {
            match get_path(&doc, &options.path).cloned() {
                Some(Bson::Array(items)) if !items.is_empty() => {
                    for item in items {
                        let mut copy = doc.clone();
                        copy.insert(options.path.clone(), item);
                        out.push(copy);
                    }
                }
                Some(Bson::Array(_)) | Some(Bson::Null) | None => {
                    if options.preserve_null_and_empty_arrays {
                        out.push(doc);
                    }
                }
                Some(_) => out.push(doc),
            }
        }
        out
    }

    fn group_stage(docs: Vec<Document>, group: &Document) -> StoreResult<Vec<Document>> {
        let id_expr = group.get("_id").cloned().unwrap_or(Bson::Null);
        let mut specs = Vec::new();
        for (field, spec) in group {
            if field == "_id" {
                continue;
            }
            let spec = match spec {
                Bson::Document(spec) if spec.len() == 1 => spec,
                _ => return Err(invalid(format!("Accumulator for '{}' must be a single-operator document", field))),
            };
            let Some((op, expr)) = spec.iter().next() else {
                return Err(invalid(format!("Accumulator for '{}' is empty", field)));
            };
            Accumulator::new(op)?;
            specs.push((field.clone(), op.clone(), expr.clone()));
        }

        let mut groups: IndexMap<String, (Bson, Vec<Accumulator>)> = IndexMap::new();
        for doc in &docs {
            let key = evaluate(doc, &id_expr)?;
            let slot = query::id_key(&key);
            if !groups.contains_key(&slot) {
                let accumulators = specs
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<StoreResult<Vec<_>>>()?;
                groups.insert(slot.clone(), (key, accumulators));
            }
            if let Some((_, accumulators)) = groups.get_mut(&slot) {
                for (accumulator, (_, _, expr)) in accumulators.iter_mut().zip(specs.iter()) {
                    accumulator.accept(evaluate(doc, expr)?);
                }
            }
        }

        Ok(groups
            .into_values()
            .map(|(key, accumulators)| {
                let mut out = Document::new();
                out.insert("_id", key);
                for (accumulator, (field, _, _)) in accumulators.into_iter().zip(specs.iter()) {
                    out.insert(field.clone(), accumulator.finish());
                }
                out
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn enrollments() -> Vec<Document> {
        vec![
            doc! { "_id": 1, "course": "rust", "xp": 10, "tags": ["a", "b"] },
            doc! { "_id": 2, "course": "rust", "xp": 30, "tags": [] },
            doc! { "_id": 3, "course": "go", "xp": 5, "tags": ["c"] },
        ]
    }

    #[test]
    fn test_parse_rejects_unknown_stage() {
        let err = AggregationPipeline::from_stages(vec![doc! { "$lookup": {} }]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
    }

    #[test]
    fn test_parse_rejects_multi_operator_stage() {
        assert!(AggregationPipeline::from_stages(vec![doc! { "$match": {}, "$limit": 1 }]).is_err());
    }

    #[test]
    fn test_match_sort_limit() {
        let pipeline = AggregationPipeline::from_stages(vec![
            doc! { "$match": { "course": "rust" } },
            doc! { "$sort": { "xp": -1 } },
            doc! { "$limit": 1 },
        ])
        .unwrap();
        let out = pipeline.execute(enrollments()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_i32("_id").unwrap(), 2);
    }

    #[test]
    fn test_group_with_accumulators() {
        let pipeline = AggregationPipeline::from_stages(vec![
            doc! { "$group": {
                "_id": "$course",
                "total": { "$sum": "$xp" },
                "count": { "$sum": 1 },
                "avg": { "$avg": "$xp" },
                "best": { "$max": "$xp" },
            } },
            doc! { "$sort": { "_id": 1 } },
        ])
        .unwrap();
        let out = pipeline.execute(enrollments()).unwrap();
        assert_eq!(
            out,
            vec![
                doc! { "_id": "go", "total": 5, "count": 1, "avg": 5.0, "best": 5 },
                doc! { "_id": "rust", "total": 40, "count": 2, "avg": 20.0, "best": 30 },
            ]
        );
    }

    #[test]
    fn test_unwind_and_count() {
        let pipeline = AggregationPipeline::from_stages(vec![
            doc! { "$unwind": "$tags" },
            doc! { "$count": "n" },
        ])
        .unwrap();
        let out = pipeline.execute(enrollments()).unwrap();
        assert_eq!(out, vec![doc! { "n": 3_i64 }]);
    }

    #[test]
    fn test_unwind_preserving_empty() {
        let pipeline = AggregationPipeline::from_stages(vec![
            doc! { "$unwind": { "path": "$tags", "preserveNullAndEmptyArrays": true } },
        ])
        .unwrap();
        assert_eq!(pipeline.execute(enrollments()).unwrap().len(), 4);
    }

    #[test]
    fn test_project_with_field_reference() {
        let pipeline = AggregationPipeline::from_stages(vec![
            doc! { "$project": { "name": "$course", "_id": 0 } },
        ])
        .unwrap();
        let out = pipeline.execute(enrollments()).unwrap();
        assert_eq!(out[0], doc! { "name": "rust" });
    }
}
