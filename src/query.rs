/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file query.rs
 * @brief Filter matching, update operators, sort and projection
 */

//! Document query evaluation.
//!
//! Every backend evaluates filters and updates through this module so the
//! primary and the replica give the same answer for the same request.

use crate::error::{StoreError, StoreResult};
use bson::{oid::ObjectId, Bson, Document};
use regex::RegexBuilder;
use std::cmp::Ordering;

pub const ID_FIELD: &str = "_id";

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::InvalidQuery(message.into())
}

pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> StoreResult<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !doc.contains_key(head) {
                doc.insert(head, Document::new());
            }
            match doc.get_mut(head) {
                Some(Bson::Document(inner)) => set_path(inner, rest, value),
                _ => Err(invalid(format!("Cannot create field '{}' in non-document '{}'", rest, head))),
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 255,
        _ => 12,
    }
}

pub fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => (x.time, x.increment).cmp(&(y.time, y.increment)),
        (Bson::Array(x), Bson::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Document(x), Bson::Document(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn is_operator_doc(value: &Bson) -> bool {
    match value {
        Bson::Document(inner) => inner.keys().next().map_or(false, |k| k.starts_with('$')),
        _ => false,
    }
}

/// Equality with Mongo's array semantics: an array field matches a scalar
/// if any element equals it.
fn equality_matches(field: Option<&Bson>, expected: &Bson) -> bool {
    match field {
        None => matches!(expected, Bson::Null),
        Some(value) => {
            if values_equal(value, expected) {
                return true;
            }
            match value {
                Bson::Array(items) => items.iter().any(|item| values_equal(item, expected)),
                _ => false,
            }
        }
    }
}

fn candidates(field: Option<&Bson>) -> Vec<&Bson> {
    match field {
        Some(Bson::Array(items)) => {
            let mut all: Vec<&Bson> = items.iter().collect();
            all.push(field.unwrap_or(&Bson::Null));
            all
        }
        Some(value) => vec![value],
        None => Vec::new(),
    }
}

fn range_matches(field: Option<&Bson>, operand: &Bson, accept: fn(Ordering) -> bool) -> bool {
    candidates(field).into_iter().any(|value| {
        type_rank(value) == type_rank(operand) && accept(compare_values(value, operand))
    })
}

fn regex_matches(field: Option<&Bson>, pattern: &str, options: &str) -> StoreResult<bool> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| invalid(format!("Invalid $regex: {}", e)))?;

    Ok(candidates(field).into_iter().any(|value| match value {
        Bson::String(s) => regex.is_match(s),
        _ => false,
    }))
}

fn operators_match(field: Option<&Bson>, operators: &Document) -> StoreResult<bool> {
    for (op, operand) in operators {
        let matched = match op.as_str() {
            "$eq" => equality_matches(field, operand),
            "$ne" => !equality_matches(field, operand),
            "$gt" => range_matches(field, operand, |o| o == Ordering::Greater),
            "$gte" => range_matches(field, operand, |o| o != Ordering::Less),
            "$lt" => range_matches(field, operand, |o| o == Ordering::Less),
            "$lte" => range_matches(field, operand, |o| o != Ordering::Greater),
            "$in" => match operand {
                Bson::Array(values) => values.iter().any(|v| equality_matches(field, v)),
                _ => return Err(invalid("$in requires an array")),
            },
            "$nin" => match operand {
                Bson::Array(values) => !values.iter().any(|v| equality_matches(field, v)),
                _ => return Err(invalid("$nin requires an array")),
            },
            "$exists" => {
                let wanted = match operand {
                    Bson::Boolean(b) => *b,
                    other => as_f64(other).map_or(true, |n| n != 0.0),
                };
                field.is_some() == wanted
            }
            "$regex" => {
                let options = operators.get_str("$options").unwrap_or("");
                match operand {
                    Bson::String(pattern) => regex_matches(field, pattern, options)?,
                    Bson::RegularExpression(re) => regex_matches(field, &re.pattern, &re.options)?,
                    _ => return Err(invalid("$regex requires a string")),
                }
            }
            "$options" => true,
            "$size" => {
                let wanted = as_f64(operand).ok_or_else(|| invalid("$size requires a number"))?;
                matches!(field, Some(Bson::Array(items)) if items.len() as f64 == wanted)
            }
            "$not" => match operand {
                Bson::Document(inner) => !operators_match(field, inner)?,
                _ => return Err(invalid("$not requires an operator document")),
            },
            other => return Err(invalid(format!("Unsupported operator: {}", other))),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clause_list<'a>(op: &str, value: &'a Bson) -> StoreResult<Vec<&'a Document>> {
    match value {
        Bson::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| match item {
                Bson::Document(d) => Ok(d),
                _ => Err(invalid(format!("{} entries must be documents", op))),
            })
            .collect(),
        _ => Err(invalid(format!("{} requires a non-empty array", op))),
    }
}

pub fn matches(doc: &Document, filter: &Document) -> StoreResult<bool> {
    for (key, value) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clause_list("$and", value)? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clause_list("$or", value)? {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clause_list("$nor", value)? {
                    if matches(doc, clause)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(invalid(format!("Unsupported top-level operator: {}", op)))
            }
            path => {
                let field = get_path(doc, path);
                match value {
                    Bson::Document(operators) if is_operator_doc(value) => {
                        operators_match(field, operators)?
                    }
                    Bson::RegularExpression(re) => regex_matches(field, &re.pattern, &re.options)?,
                    expected => equality_matches(field, expected),
                }
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn pinned_id(filter: &Document) -> Option<&Bson> {
    filter.get(ID_FIELD).filter(|value| !is_operator_doc(value))
}

pub fn id_key(id: &Bson) -> String {
    id.clone().into_relaxed_extjson().to_string()
}

pub fn ensure_id(doc: &mut Document) -> Bson {
    if let Some(id) = doc.get(ID_FIELD) {
        return id.clone();
    }
    let id = Bson::ObjectId(ObjectId::new());
    // `_id` leads the document like a Mongo driver would place it.
    let mut with_id = Document::new();
    with_id.insert(ID_FIELD, id.clone());
    for (key, value) in std::mem::take(doc) {
        with_id.insert(key, value);
    }
    *doc = with_id;
    id
}

pub fn is_update_document(update: &Document) -> bool {
    update.keys().next().map_or(false, |k| k.starts_with('$'))
}

fn numeric_op(current: Option<&Bson>, operand: &Bson, op: &str) -> StoreResult<Bson> {
    let missing = Bson::Int32(0);
    let current = current.unwrap_or(&missing);
    let combine = |a: f64, b: f64| if op == "$inc" { a + b } else { a * b };
    match (current, operand) {
        (Bson::Int32(a), Bson::Int32(b)) => Ok(if op == "$inc" {
            a.checked_add(*b).map(Bson::Int32).unwrap_or(Bson::Int64(*a as i64 + *b as i64))
        } else {
            a.checked_mul(*b).map(Bson::Int32).unwrap_or(Bson::Int64(*a as i64 * *b as i64))
        }),
        (Bson::Int32(_), Bson::Int64(_)) | (Bson::Int64(_), Bson::Int32(_)) | (Bson::Int64(_), Bson::Int64(_)) => {
            let a = as_f64(current).unwrap_or(0.0) as i64;
            let b = as_f64(operand).unwrap_or(0.0) as i64;
            Ok(Bson::Int64(if op == "$inc" { a + b } else { a * b }))
        }
        _ => match (as_f64(current), as_f64(operand)) {
            (Some(a), Some(b)) => Ok(Bson::Double(combine(a, b))),
            _ => Err(invalid(format!("{} requires numeric values", op))),
        },
    }
}

fn field_operands<'a>(op: &str, value: &'a Bson) -> StoreResult<&'a Document> {
    match value {
        Bson::Document(fields) => Ok(fields),
        _ => Err(invalid(format!("{} requires a document", op))),
    }
}

/// Apply an operator update document in place. `inserting` enables
/// `$setOnInsert`.
pub fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> StoreResult<()> {
    if !is_update_document(update) {
        return Err(invalid("Update document requires atomic operators"));
    }
    for (op, value) in update {
        let fields = field_operands(op, value)?;
        for (path, operand) in fields {
            if path == ID_FIELD && op != "$setOnInsert" {
                return Err(invalid("Performing an update on the path '_id' is not allowed"));
            }
            match op.as_str() {
                "$set" => set_path(doc, path, operand.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        set_path(doc, path, operand.clone())?;
                    }
                }
                "$unset" => remove_path(doc, path),
                "$inc" | "$mul" => {
                    let next = numeric_op(get_path(doc, path), operand, op)?;
                    set_path(doc, path, next)?;
                }
                "$push" => {
                    let mut items = match get_path(doc, path) {
                        None => Vec::new(),
                        Some(Bson::Array(items)) => items.clone(),
                        Some(_) => return Err(invalid(format!("$push target '{}' is not an array", path))),
                    };
                    match operand {
                        Bson::Document(each) if each.contains_key("$each") => match each.get("$each") {
                            Some(Bson::Array(values)) => items.extend(values.iter().cloned()),
                            _ => return Err(invalid("$each requires an array")),
                        },
                        other => items.push(other.clone()),
                    }
                    set_path(doc, path, Bson::Array(items))?;
                }
                "$pull" => {
                    if let Some(Bson::Array(items)) = get_path(doc, path) {
                        let mut kept = Vec::with_capacity(items.len());
                        for item in items {
                            let remove = match (operand, item) {
                                (Bson::Document(cond), Bson::Document(sub)) if !is_operator_doc(operand) => {
                                    matches(sub, cond)?
                                }
                                (Bson::Document(cond), _) if is_operator_doc(operand) => {
                                    operators_match(Some(item), cond)?
                                }
                                (expected, _) => values_equal(item, expected),
                            };
                            if !remove {
                                kept.push(item.clone());
                            }
                        }
                        set_path(doc, path, Bson::Array(kept))?;
                    }
                }
                other => return Err(invalid(format!("Unsupported update operator: {}", other))),
            }
        }
    }
    Ok(())
}

pub fn apply_replacement(existing: &Document, replacement: &Document) -> StoreResult<Document> {
    if is_update_document(replacement) {
        return Err(invalid("Replacement document must not contain update operators"));
    }
    let mut next = Document::new();
    if let Some(id) = existing.get(ID_FIELD) {
        if let Some(new_id) = replacement.get(ID_FIELD) {
            if !values_equal(id, new_id) {
                return Err(invalid("The _id field cannot be changed by a replacement"));
            }
        }
        next.insert(ID_FIELD, id.clone());
    }
    for (key, value) in replacement {
        if key != ID_FIELD {
            next.insert(key.clone(), value.clone());
        }
    }
    Ok(next)
}

/// Seed document for an upsert: the filter's plain equality fields.
pub fn upsert_seed(filter: &Document) -> StoreResult<Document> {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        match value {
            Bson::Document(ops) if is_operator_doc(value) => {
                if let Some(eq) = ops.get("$eq") {
                    set_path(&mut seed, key, eq.clone())?;
                }
            }
            _ => set_path(&mut seed, key, value.clone())?,
        }
    }
    Ok(seed)
}

pub fn sort_documents(docs: &mut [Document], sort: &Document) -> StoreResult<()> {
    let mut keys = Vec::with_capacity(sort.len());
    for (field, direction) in sort {
        let descending = match as_f64(direction) {
            Some(d) if d == 1.0 => false,
            Some(d) if d == -1.0 => true,
            _ => return Err(invalid("Sort direction must be 1 or -1")),
        };
        keys.push((field.as_str(), descending));
    }
    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let left = get_path(a, field).unwrap_or(&Bson::Null);
            let right = get_path(b, field).unwrap_or(&Bson::Null);
            let ord = compare_values(left, right);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

pub fn project(doc: &Document, projection: &Document) -> StoreResult<Document> {
    if projection.is_empty() {
        return Ok(doc.clone());
    }
    let flag = |value: &Bson| match value {
        Bson::Boolean(b) => Ok(*b),
        other => as_f64(other)
            .map(|n| n != 0.0)
            .ok_or_else(|| invalid("Projection values must be 0/1 or booleans")),
    };

    let mut include_id = true;
    let mut inclusions = Vec::new();
    let mut exclusions = Vec::new();
    for (field, value) in projection {
        let included = flag(value)?;
        if field == ID_FIELD {
            include_id = included;
        } else if included {
            inclusions.push(field.as_str());
        } else {
            exclusions.push(field.as_str());
        }
    }
    if !inclusions.is_empty() && !exclusions.is_empty() {
        return Err(invalid("Cannot mix inclusion and exclusion in a projection"));
    }

    let mut out = if inclusions.is_empty() {
        let mut out = doc.clone();
        for field in exclusions {
            remove_path(&mut out, field);
        }
        out.remove(ID_FIELD);
        out
    } else {
        let mut out = Document::new();
        for field in inclusions {
            if let Some(value) = get_path(doc, field) {
                set_path(&mut out, field, value.clone())?;
            }
        }
        out
    };
    if include_id {
        if let Some(id) = doc.get(ID_FIELD) {
            let mut with_id = Document::new();
            with_id.insert(ID_FIELD, id.clone());
            for (key, value) in std::mem::take(&mut out) {
                with_id.insert(key, value);
            }
            out = with_id;
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub projection: Option<Document>,
}

impl FindOptions {
    pub fn sorted(sort: Document) -> Self {
        Self { sort: Some(sort), ..Self::default() }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }
}

pub fn run_find<I>(docs: I, filter: &Document, options: &FindOptions) -> StoreResult<Vec<Document>>
where
    I: IntoIterator<Item = Document>,
{
    let mut selected = Vec::new();
    for doc in docs {
        if matches(&doc, filter)? {
            selected.push(doc);
        }
    }
    if let Some(sort) = &options.sort {
        sort_documents(&mut selected, sort)?;
    }
    let skip = options.skip.unwrap_or(0) as usize;
    let limit = match options.limit {
        Some(n) if n != 0 => n.unsigned_abs() as usize,
        _ => usize::MAX,
    };
    selected
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(|doc| match &options.projection {
            Some(projection) => project(&doc, projection),
            None => Ok(doc),
        })
        .collect()
}
