//! Query expression evaluation for in-memory document filtering.
//!
//! This module provides the evaluation engine for filter expressions,
//! the value comparison rules shared by sorting and updates, and the
//! word-based text matching that stands in for a full-text index.

use bson::{Bson, Document, datetime::DateTime, oid::ObjectId};
use std::{cmp::Ordering, collections::HashMap};

use docweave_core::{
    filter::{Expr, FieldOp, QueryVisitor, Sort},
    fuzzy::strip_diacritics,
};

use crate::{
    error::MemoryStoreError,
    parse,
    paths::{collect_strings, get_path},
};

/// Type-erased, comparable representation of BSON values.
///
/// Numeric types are normalized to `f64`, so `Int32(1)`, `Int64(1)` and
/// `Double(1.0)` compare equal as they do in the store.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Bool(bool),
    Number(f64),
    DateTime(DateTime),
    String(&'a str),
    ObjectId(ObjectId),
    Binary(&'a [u8]),
    Array(Vec<Comparable<'a>>),
    Map(HashMap<&'a str, Comparable<'a>>),
    Other(&'a Bson),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null | Bson::Undefined => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(f64::from(*value)),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::ObjectId(value) => Comparable::ObjectId(*value),
            Bson::Binary(binary) => Comparable::Binary(&binary.bytes),
            Bson::Array(arr) => Comparable::Array(arr.iter().map(Comparable::from).collect()),
            Bson::Document(doc) => Comparable::Map(
                doc.iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect(),
            ),
            other => Comparable::Other(other),
        }
    }
}

impl Comparable<'_> {
    /// Rank of the value's type in the store's cross-type sort order.
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Number(_) => 1,
            Comparable::String(_) => 2,
            Comparable::Map(_) => 3,
            Comparable::Array(_) => 4,
            Comparable::Binary(_) => 5,
            Comparable::ObjectId(_) => 6,
            Comparable::Bool(_) => 7,
            Comparable::DateTime(_) => 8,
            Comparable::Other(_) => 9,
        }
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a == b,
            (Comparable::Binary(a), Comparable::Binary(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            (Comparable::Other(a), Comparable::Other(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.partial_cmp(b),
            (Comparable::Binary(a), Comparable::Binary(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Equality under the store's rules.
pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
    Comparable::from(a) == Comparable::from(b)
}

/// Total order used for sorting; missing values sort first.
pub(crate) fn compare_values(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let a = a.map(Comparable::from).unwrap_or(Comparable::Null);
    let b = b.map(Comparable::from).unwrap_or(Comparable::Null);
    a.rank()
        .cmp(&b.rank())
        .then_with(|| a.partial_cmp(&b).unwrap_or(Ordering::Equal))
}

/// Sorts documents by `keys`, keeping the relative order of ties.
///
/// `text` supplies the search term and text fields for relevance keys.
pub(crate) fn sort_documents(documents: &mut [Document], keys: &[Sort], text: Option<&TextSearch>) {
    let scores = text
        .filter(|_| keys.contains(&Sort::TextScore))
        .map(|search| documents.iter().map(|doc| search.score(doc)).collect::<Vec<_>>());
    let mut order = (0..documents.len()).collect::<Vec<_>>();
    order.sort_by(|&i, &j| {
        for key in keys {
            let ordering = match key {
                Sort::Field { field, direction } => {
                    let ordering = compare_values(get_path(&documents[i], field), get_path(&documents[j], field));
                    if direction.as_i32() < 0 { ordering.reverse() } else { ordering }
                }
                Sort::TextScore => match &scores {
                    Some(scores) => scores[j].partial_cmp(&scores[i]).unwrap_or(Ordering::Equal),
                    None => Ordering::Equal,
                },
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    let sorted = order.iter().map(|&i| documents[i].clone()).collect::<Vec<_>>();
    documents.clone_from_slice(&sorted);
}

/// Lower-cased, diacritic-free words of a text.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| strip_diacritics(word).to_lowercase())
}

/// A text search term matched against a collection's text fields.
#[derive(Debug, Clone)]
pub(crate) struct TextSearch {
    terms: Vec<String>,
    /// Paths covered by the text index; every string when empty.
    fields: Vec<String>,
}

impl TextSearch {
    pub(crate) fn new(search: &str, fields: &[String]) -> Self {
        Self { terms: words(search).collect(), fields: fields.to_vec() }
    }

    fn document_words(&self, document: &Document) -> Vec<String> {
        let mut strings = Vec::new();
        if self.fields.is_empty() {
            document.values().for_each(|value| collect_strings(value, &mut strings));
        } else {
            for field in &self.fields {
                if let Some(value) = get_path(document, field) {
                    collect_strings(value, &mut strings);
                }
            }
        }
        strings.into_iter().flat_map(words).collect()
    }

    /// Matches when any search term appears as a word of the indexed text.
    pub(crate) fn matches(&self, document: &Document) -> bool {
        let words = self.document_words(document);
        self.terms.iter().any(|term| words.contains(term))
    }

    /// Relevance: occurrences of search terms relative to the text length.
    pub(crate) fn score(&self, document: &Document) -> f64 {
        let words = self.document_words(document);
        if words.is_empty() {
            return 0.0;
        }
        let hits = words.iter().filter(|word| self.terms.contains(word)).count();
        hits as f64 / words.len() as f64 + hits as f64
    }
}

/// First text term in an expression tree.
pub(crate) fn text_term(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Text { search } => Some(search.clone()),
        Expr::And(list) | Expr::Or(list) => list.iter().find_map(text_term),
        Expr::Not(inner) => text_term(inner),
        Expr::Raw(document) => parse::filter(document).ok().as_ref().and_then(text_term),
        Expr::Exists(..) | Expr::Field { .. } => None,
    }
}

pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
    text_fields: &'a [String],
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document, text_fields: &'a [String]) -> Self {
        Self { document, text_fields }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> Result<bool, MemoryStoreError> {
        self.visit_expr(expr)
    }

    /// Keeps the documents matching `expr`, or all of them without one.
    pub fn filter_documents(
        documents: impl IntoIterator<Item = &'a Document>,
        expr: Option<&Expr>,
        text_fields: &'a [String],
    ) -> Result<Vec<Document>, MemoryStoreError> {
        let mut matched = Vec::new();
        for document in documents {
            let keep = match expr {
                Some(expr) => DocumentEvaluator::new(document, text_fields).evaluate(expr)?,
                None => true,
            };
            if keep {
                matched.push(document.clone());
            }
        }
        Ok(matched)
    }
}

fn contains(haystack: &Bson, needle: &Bson) -> bool {
    match (haystack, needle) {
        (Bson::Array(items), _) => items.iter().any(|item| values_equal(item, needle)),
        (Bson::String(left), Bson::String(right)) => left.contains(right.as_str()),
        _ => false,
    }
}

/// Equality where an array field also matches when one element is equal.
fn matches_eq(field_value: &Bson, value: &Bson) -> bool {
    values_equal(field_value, value)
        || matches!(field_value, Bson::Array(items) if items.iter().any(|item| values_equal(item, value)))
}

fn matches_any(field_value: &Bson, values: &Bson) -> bool {
    match values {
        Bson::Array(values) => values.iter().any(|value| matches_eq(field_value, value)),
        single => matches_eq(field_value, single),
    }
}

impl QueryVisitor for DocumentEvaluator<'_> {
    type Output = bool;
    type Error = MemoryStoreError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if !self.visit_expr(expr)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if self.visit_expr(expr)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_expr(expr)?)
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(get_path(self.document, field).is_some() == should_exist)
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let Some(field_value) = get_path(self.document, field) else {
            // A missing field only satisfies the negative operators.
            return Ok(matches!(op, FieldOp::Ne | FieldOp::NoneOf | FieldOp::NotContains)
                || (*op == FieldOp::Eq && *value == Bson::Null));
        };
        let ordered = |accept: fn(Ordering) -> bool| {
            Comparable::from(field_value)
                .partial_cmp(&Comparable::from(value))
                .is_some_and(accept)
        };
        Ok(match op {
            FieldOp::Eq => matches_eq(field_value, value),
            FieldOp::Ne => !matches_eq(field_value, value),
            FieldOp::Gt => ordered(Ordering::is_gt),
            FieldOp::Gte => ordered(Ordering::is_ge),
            FieldOp::Lt => ordered(Ordering::is_lt),
            FieldOp::Lte => ordered(Ordering::is_le),
            FieldOp::Contains => contains(field_value, value),
            FieldOp::NotContains => !contains(field_value, value),
            FieldOp::StartsWith => match (field_value, value) {
                (Bson::String(left), Bson::String(right)) => left.starts_with(right.as_str()),
                _ => false,
            },
            FieldOp::EndsWith => match (field_value, value) {
                (Bson::String(left), Bson::String(right)) => left.ends_with(right.as_str()),
                _ => false,
            },
            FieldOp::AnyOf => matches_any(field_value, value),
            FieldOp::NoneOf => !matches_any(field_value, value),
        })
    }

    fn visit_text(&mut self, search: &str) -> Result<Self::Output, Self::Error> {
        Ok(TextSearch::new(search, self.text_fields).matches(self.document))
    }

    fn visit_raw(&mut self, document: &Document) -> Result<Self::Output, Self::Error> {
        let expr = parse::filter(document)?;
        self.visit_expr(&expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docweave_core::filter::Filter;

    fn eval(document: &Document, expr: &Expr) -> bool {
        DocumentEvaluator::new(document, &[]).evaluate(expr).unwrap()
    }

    #[test]
    fn numbers_compare_across_widths() {
        let document = doc! { "age": 111_i64 };
        assert!(eval(&document, &Filter::eq("age", 111)));
        assert!(eval(&document, &Filter::gt("age", 110.5)));
        assert!(!eval(&document, &Filter::lt("age", 111)));
    }

    #[test]
    fn missing_fields_satisfy_only_negations() {
        let document = doc! { "name": "Ada" };
        assert!(eval(&document, &Filter::ne("deleted", true)));
        assert!(!eval(&document, &Filter::eq("deleted", true)));
        assert!(eval(&document, &Filter::none_of("tag", ["x"])));
        assert!(eval(&document, &Filter::not_exists("deleted")));
    }

    #[test]
    fn arrays_match_elements() {
        let document = doc! { "tags": ["rust", "db"] };
        assert!(eval(&document, &Filter::eq("tags", "db")));
        assert!(eval(&document, &Filter::contains("tags", "rust")));
        assert!(eval(&document, &Filter::any_of("tags", ["go", "rust"])));
        assert!(!eval(&document, &Filter::none_of("tags", ["db"])));
    }

    #[test]
    fn text_matches_words_without_accents() {
        let document = doc! { "title": "Crème Brûlée recipe", "n": 3 };
        assert!(eval(&document, &Filter::text("creme")));
        assert!(!eval(&document, &Filter::text("cream")));

        let indexed = vec!["hash".to_string()];
        let fuzzy = doc! { "title": "other", "hash": "KRM PRL" };
        assert!(DocumentEvaluator::new(&fuzzy, &indexed).evaluate(&Filter::text("KRM")).unwrap());
        assert!(!DocumentEvaluator::new(&fuzzy, &indexed).evaluate(&Filter::text("other")).unwrap());
    }

    #[test]
    fn sorting_orders_types_and_keeps_ties() {
        let mut documents = vec![
            doc! { "k": 2, "i": 0 },
            doc! { "i": 1 },
            doc! { "k": 1, "i": 2 },
            doc! { "k": 2, "i": 3 },
        ];
        sort_documents(&mut documents, &[Sort::asc("k")], None);
        let order = documents.iter().map(|d| d.get_i32("i").unwrap()).collect::<Vec<_>>();
        assert_eq!(order, vec![1, 2, 0, 3]);
    }
}
