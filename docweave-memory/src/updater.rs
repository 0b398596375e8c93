//! Application of update operations to stored documents.

use bson::{Bson, DateTime, Document, oid::ObjectId};
use std::cmp::Ordering;

use docweave_core::{
    filter::{Expr, FieldOp},
    update::{Update, UpdateOp},
};

use crate::{
    error::{MemoryResult, MemoryStoreError},
    evaluator::{compare_values, values_equal},
    parse,
    paths::{get_path, remove_path, set_path},
};

/// Applies `update` in place. Returns whether the document changed.
///
/// # Errors
///
/// Fails on type mismatches (incrementing a string, pushing to a scalar)
/// and on any attempt to change `_id`; the document is left untouched then.
pub(crate) fn apply(document: &mut Document, update: &Update, collection: &str) -> MemoryResult<bool> {
    let mut working = document.clone();
    for op in update.ops() {
        apply_op(&mut working, op)?;
    }
    if working.get("_id") != document.get("_id") {
        return Err(MemoryStoreError::ImmutableId(collection.to_string()));
    }
    let changed = working != *document;
    *document = working;
    Ok(changed)
}

fn apply_op(document: &mut Document, op: &UpdateOp) -> MemoryResult<()> {
    match op {
        UpdateOp::Set(path, value) => set_path(document, path, value.clone()),
        UpdateOp::Unset(path) => {
            remove_path(document, path);
            Ok(())
        }
        UpdateOp::Inc(path, by) => {
            let current = get_path(document, path).cloned();
            let next = match current {
                None => by.clone(),
                Some(value) => arithmetic("$inc", &value, by, i64::checked_add, |a, b| a + b)?,
            };
            set_path(document, path, next)
        }
        UpdateOp::Mul(path, by) => {
            let current = get_path(document, path).cloned();
            let next = match current {
                None => arithmetic("$mul", &zero_like(by), by, i64::checked_mul, |a, b| a * b)?,
                Some(value) => arithmetic("$mul", &value, by, i64::checked_mul, |a, b| a * b)?,
            };
            set_path(document, path, next)
        }
        UpdateOp::Min(path, value) => replace_if(document, path, value, Ordering::Less),
        UpdateOp::Max(path, value) => replace_if(document, path, value, Ordering::Greater),
        UpdateOp::Rename(from, to) => {
            if let Some(value) = remove_path(document, from) {
                set_path(document, to, value)?;
            }
            Ok(())
        }
        UpdateOp::Push(path, value) => {
            let mut items = array_at(document, path, "$push")?;
            items.extend(each(value));
            set_path(document, path, Bson::Array(items))
        }
        UpdateOp::AddToSet(path, value) => {
            let mut items = array_at(document, path, "$addToSet")?;
            for value in each(value) {
                if !items.iter().any(|item| values_equal(item, &value)) {
                    items.push(value);
                }
            }
            set_path(document, path, Bson::Array(items))
        }
        UpdateOp::Pull(path, value) => {
            if get_path(document, path).is_none() {
                return Ok(());
            }
            let mut items = array_at(document, path, "$pull")?;
            items.retain(|item| !values_equal(item, value));
            set_path(document, path, Bson::Array(items))
        }
        UpdateOp::CurrentDate(path) => set_path(document, path, Bson::DateTime(DateTime::now())),
        UpdateOp::Raw(raw) => parse::update(raw)?.iter().try_for_each(|op| apply_op(document, op)),
    }
}

/// Values appended by `$push`/`$addToSet`, expanding `{$each: [...]}`.
fn each(value: &Bson) -> Vec<Bson> {
    match value {
        Bson::Document(spec) => match spec.get_array("$each") {
            Ok(items) => items.clone(),
            Err(_) => vec![value.clone()],
        },
        other => vec![other.clone()],
    }
}

fn array_at(document: &Document, path: &str, operator: &str) -> MemoryResult<Vec<Bson>> {
    match get_path(document, path) {
        None => Ok(Vec::new()),
        Some(Bson::Array(items)) => Ok(items.clone()),
        Some(other) => Err(MemoryStoreError::operand(
            operator,
            format!("{path} holds a {:?}, not an array", other.element_type()),
        )),
    }
}

fn replace_if(document: &mut Document, path: &str, value: &Bson, wanted: Ordering) -> MemoryResult<()> {
    let replace = match get_path(document, path) {
        None => true,
        Some(current) => compare_values(Some(value), Some(current)) == wanted,
    };
    if replace {
        set_path(document, path, value.clone())?;
    }
    Ok(())
}

fn zero_like(value: &Bson) -> Bson {
    match value {
        Bson::Int32(_) => Bson::Int32(0),
        Bson::Int64(_) => Bson::Int64(0),
        _ => Bson::Double(0.0),
    }
}

/// Numeric arithmetic following the store's widening rules: two `Int32`
/// stay `Int32` unless they overflow, any `Int64` widens to `Int64`, any
/// `Double` makes the result a `Double`.
fn arithmetic(
    operator: &str,
    current: &Bson,
    operand: &Bson,
    integer: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> MemoryResult<Bson> {
    let as_f64 = |value: &Bson| match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    };
    let result = match (current, operand) {
        (Bson::Int32(a), Bson::Int32(b)) => {
            let wide = integer(i64::from(*a), i64::from(*b)).ok_or_else(|| overflow(operator))?;
            i32::try_from(wide).map(Bson::Int32).unwrap_or(Bson::Int64(wide))
        }
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let a = integer_of(current);
            let b = integer_of(operand);
            Bson::Int64(integer(a, b).ok_or_else(|| overflow(operator))?)
        }
        _ => match (as_f64(current), as_f64(operand)) {
            (Some(a), Some(b)) => Bson::Double(float(a, b)),
            _ => {
                return Err(MemoryStoreError::operand(
                    operator,
                    format!(
                        "cannot combine {:?} with {:?}",
                        current.element_type(),
                        operand.element_type()
                    ),
                ));
            }
        },
    };
    Ok(result)
}

fn integer_of(value: &Bson) -> i64 {
    match value {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        _ => 0,
    }
}

fn overflow(operator: &str) -> MemoryStoreError {
    MemoryStoreError::operand(operator, "integer overflow")
}

/// Builds the document inserted by an upsert: the filter's equality
/// conditions, then the update, with a fresh `_id` if none was given.
pub(crate) fn upsert_seed(filter: &Expr, update: Option<&Update>, collection: &str) -> MemoryResult<Document> {
    let mut seed = Document::new();
    seed_from(filter, &mut seed)?;
    if let Some(update) = update {
        apply(&mut seed, update, collection)?;
    }
    Ok(with_id(seed))
}

fn seed_from(filter: &Expr, seed: &mut Document) -> MemoryResult<()> {
    match filter {
        Expr::And(parts) => parts.iter().try_for_each(|part| seed_from(part, seed)),
        Expr::Field { field, op: FieldOp::Eq, value } => set_path(seed, field, value.clone()),
        Expr::Raw(document) => seed_from(&parse::filter(document)?, seed),
        _ => Ok(()),
    }
}

/// Puts `_id` first, generating an ObjectId when absent.
pub(crate) fn with_id(mut document: Document) -> Document {
    let id = document.remove("_id").unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
    let mut ordered = Document::new();
    ordered.insert("_id", id);
    ordered.extend(document);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docweave_core::filter::Filter;

    #[test]
    fn operations_apply_in_order() {
        let mut document = doc! { "_id": 1, "n": 1, "tags": ["a"], "old": "x" };
        let update = Update::new()
            .inc("n", 2)
            .add_to_set("tags", "a")
            .push("tags", "b")
            .rename("old", "new")
            .max("n", 10);
        assert!(apply(&mut document, &update, "c").unwrap());
        assert_eq!(document, doc! { "_id": 1, "n": 10, "tags": ["a", "b"], "new": "x" });
    }

    #[test]
    fn unchanged_documents_are_reported() {
        let mut document = doc! { "_id": 1, "n": 5 };
        assert!(!apply(&mut document, &Update::new().set("n", 5), "c").unwrap());
    }

    #[test]
    fn int32_overflow_widens() {
        let mut document = doc! { "n": i32::MAX };
        apply(&mut document, &Update::new().inc("n", 1), "c").unwrap();
        assert_eq!(document.get("n"), Some(&Bson::Int64(i64::from(i32::MAX) + 1)));
    }

    #[test]
    fn id_changes_are_rejected() {
        let mut document = doc! { "_id": 1 };
        let update = Update::new().raw(doc! { "$set": { "_id": 2 } });
        assert!(matches!(apply(&mut document, &update, "c"), Err(MemoryStoreError::ImmutableId(_))));
        assert_eq!(document, doc! { "_id": 1 });
    }

    #[test]
    fn upserts_start_from_filter_equalities() {
        let filter = Filter::and([Filter::eq("parent_id", 1), Filter::eq("child_id", 2), Filter::gt("x", 0)]);
        let seed = upsert_seed(&filter, None, "c").unwrap();
        assert!(seed.get_object_id("_id").is_ok());
        assert_eq!(seed.get("parent_id"), Some(&Bson::Int32(1)));
        assert_eq!(seed.get("child_id"), Some(&Bson::Int32(2)));
        assert!(seed.get("x").is_none());
    }
}
