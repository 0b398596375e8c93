//! Interpretation of store-native documents.
//!
//! Raw filters, updates and pipeline stages reach the in-memory backend as
//! documents in the store's own syntax. They are converted into the typed
//! forms here, so evaluation has a single path.

use bson::{Bson, Document};

use docweave_core::{
    filter::{Expr, FieldOp, Projection, Sort},
    pipeline::Stage,
    update::UpdateOp,
};

use crate::error::{MemoryResult, MemoryStoreError};

/// Converts a native filter document into an expression.
pub(crate) fn filter(document: &Document) -> MemoryResult<Expr> {
    let mut parts = Vec::new();
    for (key, value) in document {
        match key.as_str() {
            "$and" => parts.push(Expr::And(branches(key, value)?)),
            "$or" => parts.push(Expr::Or(branches(key, value)?)),
            "$nor" => parts.push(Expr::Not(Box::new(Expr::Or(branches(key, value)?)))),
            "$text" => {
                let search = value
                    .as_document()
                    .and_then(|text| text.get_str("$search").ok())
                    .ok_or_else(|| MemoryStoreError::operand("$text", "expected {$search: <string>}"))?;
                parts.push(Expr::Text { search: search.to_string() });
            }
            operator if operator.starts_with('$') => {
                return Err(MemoryStoreError::UnsupportedOperator(operator.to_string()));
            }
            field => parts.extend(condition(field, value)?),
        }
    }
    Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::And(parts) })
}

fn branches(operator: &str, value: &Bson) -> MemoryResult<Vec<Expr>> {
    let Bson::Array(items) = value else {
        return Err(MemoryStoreError::operand(operator, "expected an array of filters"));
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(document) => filter(document),
            _ => Err(MemoryStoreError::operand(operator, "expected an array of filters")),
        })
        .collect()
}

fn is_operator_document(value: &Bson) -> bool {
    matches!(value, Bson::Document(document) if document.keys().next().is_some_and(|k| k.starts_with('$')))
}

fn field(field: &str, op: FieldOp, value: &Bson) -> Expr {
    Expr::Field { field: field.to_string(), op, value: value.clone() }
}

fn condition(path: &str, value: &Bson) -> MemoryResult<Vec<Expr>> {
    let Bson::Document(operators) = value else {
        return match value {
            Bson::RegularExpression(regex) => Ok(vec![pattern(path, regex.pattern.as_str())?]),
            _ => Ok(vec![field(path, FieldOp::Eq, value)]),
        };
    };
    if !is_operator_document(value) {
        return Ok(vec![field(path, FieldOp::Eq, value)]);
    }
    operators
        .iter()
        .map(|(operator, operand)| {
            Ok(match operator.as_str() {
                "$eq" => field(path, FieldOp::Eq, operand),
                "$ne" => field(path, FieldOp::Ne, operand),
                "$gt" => field(path, FieldOp::Gt, operand),
                "$gte" => field(path, FieldOp::Gte, operand),
                "$lt" => field(path, FieldOp::Lt, operand),
                "$lte" => field(path, FieldOp::Lte, operand),
                "$in" => field(path, FieldOp::AnyOf, operand),
                "$nin" => field(path, FieldOp::NoneOf, operand),
                "$exists" => Expr::Exists(path.to_string(), truthy(operand)),
                "$not" => Expr::Not(Box::new(Expr::And(condition(path, operand)?))),
                "$regex" => match operand {
                    Bson::String(text) => pattern(path, text)?,
                    Bson::RegularExpression(regex) => pattern(path, regex.pattern.as_str())?,
                    _ => return Err(MemoryStoreError::operand("$regex", "expected a pattern")),
                },
                "$options" => Expr::And(Vec::new()),
                other => return Err(MemoryStoreError::UnsupportedOperator(other.to_string())),
            })
        })
        .collect()
}

/// Supports anchored and unanchored literal patterns only.
fn pattern(path: &str, regex: &str) -> MemoryResult<Expr> {
    let (anchored_start, rest) = match regex.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, regex),
    };
    let (anchored_end, literal) = match rest.strip_suffix('$') {
        Some(literal) if !literal.ends_with('\\') => (true, literal),
        _ => (false, rest),
    };
    let literal = unescape(literal)
        .ok_or_else(|| MemoryStoreError::operand("$regex", format!("unsupported pattern {regex}")))?;
    let value = Bson::String(literal);
    Ok(match (anchored_start, anchored_end) {
        (true, true) => field(path, FieldOp::Eq, &value),
        (true, false) => field(path, FieldOp::StartsWith, &value),
        (false, true) => field(path, FieldOp::EndsWith, &value),
        (false, false) => field(path, FieldOp::Contains, &value),
    })
}

/// Removes escapes from a literal pattern; `None` if it uses metacharacters.
fn unescape(pattern: &str) -> Option<String> {
    let mut literal = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => literal.push(chars.next()?),
            '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' => return None,
            other => literal.push(other),
        }
    }
    Some(literal)
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(flag) => *flag,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        Bson::Null => false,
        _ => true,
    }
}

/// Converts a native update document into operations.
pub(crate) fn update(document: &Document) -> MemoryResult<Vec<UpdateOp>> {
    let mut ops = Vec::new();
    for (operator, fields) in document {
        let Bson::Document(fields) = fields else {
            return Err(MemoryStoreError::operand(operator, "expected a document of fields"));
        };
        for (path, value) in fields {
            let path = path.clone();
            ops.push(match operator.as_str() {
                "$set" => UpdateOp::Set(path, value.clone()),
                "$unset" => UpdateOp::Unset(path),
                "$inc" => UpdateOp::Inc(path, value.clone()),
                "$mul" => UpdateOp::Mul(path, value.clone()),
                "$min" => UpdateOp::Min(path, value.clone()),
                "$max" => UpdateOp::Max(path, value.clone()),
                "$push" => UpdateOp::Push(path, value.clone()),
                "$pull" => UpdateOp::Pull(path, value.clone()),
                "$addToSet" => UpdateOp::AddToSet(path, value.clone()),
                "$currentDate" => UpdateOp::CurrentDate(path),
                "$rename" => match value {
                    Bson::String(to) => UpdateOp::Rename(path, to.clone()),
                    _ => return Err(MemoryStoreError::operand("$rename", "expected a field name")),
                },
                other => return Err(MemoryStoreError::UnsupportedOperator(other.to_string())),
            });
        }
    }
    Ok(ops)
}

/// Converts a native stage document into a stage.
pub(crate) fn stage(document: &Document) -> MemoryResult<Stage> {
    let Some((operator, value)) = document.iter().next() else {
        return Err(MemoryStoreError::operand("stage", "empty stage document"));
    };
    let expect_document = || {
        value
            .as_document()
            .ok_or_else(|| MemoryStoreError::operand(operator, "expected a document"))
    };
    Ok(match operator.as_str() {
        "$match" => Stage::Match(filter(expect_document()?)?),
        "$sort" => Stage::Sort(sort(expect_document()?)?),
        "$skip" => Stage::Skip(count(operator, value)?),
        "$limit" => Stage::Limit(count(operator, value)?),
        "$project" => Stage::Project(projection(expect_document()?)?),
        "$lookup" => {
            let spec = expect_document()?;
            let text = |key: &str| {
                spec.get_str(key)
                    .map(str::to_string)
                    .map_err(|_| MemoryStoreError::operand("$lookup", format!("missing {key}")))
            };
            Stage::Lookup {
                from: text("from")?,
                local_field: text("localField")?,
                foreign_field: text("foreignField")?,
                as_field: text("as")?,
            }
        }
        "$unwind" => match value {
            Bson::String(path) => Stage::Unwind(field_ref(operator, path)?),
            Bson::Document(spec) => Stage::Unwind(field_ref(
                operator,
                spec.get_str("path")
                    .map_err(|_| MemoryStoreError::operand("$unwind", "missing path"))?,
            )?),
            _ => return Err(MemoryStoreError::operand("$unwind", "expected a field path")),
        },
        "$replaceRoot" => Stage::ReplaceRoot(field_ref(
            operator,
            expect_document()?
                .get_str("newRoot")
                .map_err(|_| MemoryStoreError::operand("$replaceRoot", "expected newRoot path"))?,
        )?),
        "$replaceWith" => match value {
            Bson::String(path) => Stage::ReplaceRoot(field_ref(operator, path)?),
            _ => return Err(MemoryStoreError::operand("$replaceWith", "expected a field path")),
        },
        "$count" => match value {
            Bson::String(name) => Stage::Count(name.clone()),
            _ => return Err(MemoryStoreError::operand("$count", "expected a field name")),
        },
        "$facet" => {
            let mut facets = Vec::new();
            for (name, stages) in expect_document()? {
                let Bson::Array(stages) = stages else {
                    return Err(MemoryStoreError::operand("$facet", "expected arrays of stages"));
                };
                let stages = stages
                    .iter()
                    .map(|stage_doc| match stage_doc {
                        Bson::Document(inner) => stage(inner),
                        _ => Err(MemoryStoreError::operand("$facet", "expected stage documents")),
                    })
                    .collect::<MemoryResult<Vec<_>>>()?;
                facets.push((name.clone(), stages));
            }
            Stage::Facet(facets)
        }
        other => return Err(MemoryStoreError::UnsupportedOperator(other.to_string())),
    })
}

fn field_ref(operator: &str, path: &str) -> MemoryResult<String> {
    path.strip_prefix('$')
        .map(str::to_string)
        .ok_or_else(|| MemoryStoreError::operand(operator, format!("expected a $field reference, got {path}")))
}

fn count(operator: &str, value: &Bson) -> MemoryResult<u64> {
    let n = match value {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        Bson::Double(n) if n.fract() == 0.0 => *n as i64,
        _ => return Err(MemoryStoreError::operand(operator, "expected an integer")),
    };
    u64::try_from(n).map_err(|_| MemoryStoreError::operand(operator, "expected a non-negative integer"))
}

fn sort(spec: &Document) -> MemoryResult<Vec<Sort>> {
    spec.iter()
        .map(|(path, direction)| match direction {
            Bson::Document(meta) if meta.get_str("$meta").is_ok_and(|m| m == "textScore") => Ok(Sort::TextScore),
            Bson::Int32(n) if *n < 0 => Ok(Sort::desc(path.clone())),
            Bson::Int64(n) if *n < 0 => Ok(Sort::desc(path.clone())),
            Bson::Double(n) if *n < 0.0 => Ok(Sort::desc(path.clone())),
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => Ok(Sort::asc(path.clone())),
            _ => Err(MemoryStoreError::operand("$sort", format!("invalid direction for {path}"))),
        })
        .collect()
}

fn projection(spec: &Document) -> MemoryResult<Projection> {
    let mut projection = Projection::default();
    for (path, flag) in spec {
        if truthy(flag) {
            projection.include.push(path.clone());
        } else {
            projection.exclude.push(path.clone());
        }
    }
    if !projection.include.is_empty() && projection.exclude.iter().any(|f| f != "_id") {
        return Err(MemoryStoreError::operand("$project", "cannot mix inclusion and exclusion"));
    }
    Ok(projection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docweave_core::filter::Filter;

    #[test]
    fn operator_documents_become_expressions() {
        let expr = filter(&doc! { "age": { "$gte": 18, "$lt": 65 }, "name": "Ada" }).unwrap();
        assert_eq!(
            expr,
            Expr::And(vec![Filter::gte("age", 18), Filter::lt("age", 65), Filter::eq("name", "Ada")])
        );
    }

    #[test]
    fn literal_regexes_are_supported() {
        assert_eq!(
            filter(&doc! { "name": { "$regex": "^Jo" } }).unwrap(),
            Filter::starts_with("name", "Jo")
        );
        assert_eq!(
            filter(&doc! { "name": { "$regex": "a\\.b$" } }).unwrap(),
            Filter::ends_with("name", "a.b")
        );
        assert!(filter(&doc! { "name": { "$regex": "a.*b" } }).is_err());
    }

    #[test]
    fn stages_parse() {
        assert_eq!(stage(&doc! { "$limit": 5_i64 }).unwrap(), Stage::Limit(5));
        assert_eq!(stage(&doc! { "$unwind": "$items" }).unwrap(), Stage::Unwind("items".into()));
        assert_eq!(
            stage(&doc! { "$sort": { "age": -1, "score": { "$meta": "textScore" } } }).unwrap(),
            Stage::Sort(vec![Sort::desc("age"), Sort::TextScore])
        );
        assert!(stage(&doc! { "$group": { "_id": "$x" } }).is_err());
    }

    #[test]
    fn updates_parse() {
        let ops = update(&doc! { "$set": { "a": 1 }, "$rename": { "b": "c" } }).unwrap();
        assert_eq!(
            ops,
            vec![UpdateOp::Set("a".into(), Bson::Int32(1)), UpdateOp::Rename("b".into(), "c".into())]
        );
    }
}
