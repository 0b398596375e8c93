//! Filter, sort and projection construction.
//!
//! Filters are built as a backend-neutral expression tree ([`Expr`]) which each
//! backend either interprets directly or translates into its native query
//! language through a [`QueryVisitor`].
//!
//! # Filter Expression API
//!
//! The [`Filter`] struct provides static constructors for untyped paths:
//!
//! - Comparison: `eq`, `ne`, `gt`, `gte`, `lt`, `lte`
//! - String: `starts_with`, `ends_with`, `contains`, `not_contains`
//! - Existence: `exists`, `not_exists`
//! - Array: `any_of`, `none_of`
//! - Logical: `and`, `or`
//! - Escape hatches: `text` (full-text match) and `raw` (a store-native filter
//!   document passed through untouched)
//!
//! [`Field`] offers the same comparisons bound to an entity type and value type,
//! so a field reference can only be built from a declared descriptor:
//!
//! ```ignore
//! const AGE: Field<Author, i32> = Field::new("age");
//!
//! let expr = AGE.gte(18).and(Filter::starts_with("name", "A"));
//! ```
//!
//! Every path is checked by [`Expr::validate`] before a command leaves the
//! process, so a malformed selector never reaches the store.

use bson::{Bson, Document, doc};
use std::marker::PhantomData;

use crate::{
    error::{OdmError, OdmResult},
    id::EntityId,
};

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

impl SortDirection {
    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

/// One sort key. Keys are applied in the order they were added.
#[derive(Debug, Clone, PartialEq)]
pub enum Sort {
    /// Sort by a field path.
    Field {
        field: String,
        direction: SortDirection,
    },
    /// Sort by full-text relevance, best match first.
    TextScore,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Sort::Field { field: field.into(), direction: SortDirection::Asc }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Sort::Field { field: field.into(), direction: SortDirection::Desc }
    }
}

/// Field comparison operators for filter expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    /// Equal to (exact match).
    Eq,
    /// Not equal to.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// String or array contains value.
    Contains,
    /// String or array does not contain value.
    NotContains,
    /// String starts with value.
    StartsWith,
    /// String ends with value.
    EndsWith,
    /// Field equals any of the values in the array.
    AnyOf,
    /// Field equals none of the values in the array.
    NoneOf,
}

/// A filter expression for querying documents.
///
/// Expressions can be combined using logical operators (`And`, `Or`, `Not`)
/// to build complex filter predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match).
    Or(Vec<Expr>),
    /// Logical NOT of an expression (inverts the result).
    Not(Box<Expr>),
    /// Checks if a field exists or doesn't exist.
    Exists(String, bool),
    /// Field comparison expression.
    Field {
        /// The field path to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The value to compare against.
        value: Bson,
    },
    /// Full-text match against the collection's text index.
    Text {
        /// Whitespace-separated search terms.
        search: String,
    },
    /// A store-native filter document, passed through as-is.
    Raw(Document),
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: String, op: FieldOp, value: Bson) -> Self {
        Expr::Field { field, op, value }
    }

    /// Combines this expression with another using logical AND.
    ///
    /// If this expression is already an AND, the other expression is appended
    /// to the list. Otherwise, a new AND expression is created.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Returns `true` if a full-text clause appears anywhere in the tree.
    pub fn has_text(&self) -> bool {
        match self {
            Expr::Text { .. } => true,
            Expr::And(list) | Expr::Or(list) => list.iter().any(Expr::has_text),
            Expr::Not(inner) => inner.has_text(),
            Expr::Raw(document) => document.contains_key("$text"),
            Expr::Exists(..) | Expr::Field { .. } => false,
        }
    }

    /// Checks the expression's structure.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] for an invalid field path, an empty
    /// `Or`, an empty text search, a string operator given a non-string value,
    /// or a set operator given a non-array value.
    pub fn validate(&self) -> OdmResult<()> {
        match self {
            Expr::And(list) => list.iter().try_for_each(Expr::validate),
            Expr::Or(list) => {
                if list.is_empty() {
                    return Err(OdmError::validation("an OR filter needs at least one branch"));
                }
                list.iter().try_for_each(Expr::validate)
            }
            Expr::Not(inner) => inner.validate(),
            Expr::Exists(field, _) => validate_field_path(field),
            Expr::Field { field, op, value } => {
                validate_field_path(field)?;
                match (op, value) {
                    (FieldOp::StartsWith | FieldOp::EndsWith, Bson::String(_)) => Ok(()),
                    (FieldOp::StartsWith | FieldOp::EndsWith, other) => Err(OdmError::validation(
                        format!("'{field}': {op:?} needs a string value, got {:?}", other.element_type()),
                    )),
                    (FieldOp::AnyOf | FieldOp::NoneOf, Bson::Array(_)) => Ok(()),
                    (FieldOp::AnyOf | FieldOp::NoneOf, other) => Err(OdmError::validation(
                        format!("'{field}': {op:?} needs an array value, got {:?}", other.element_type()),
                    )),
                    _ => Ok(()),
                }
            }
            Expr::Text { search } => {
                if search.trim().is_empty() {
                    Err(OdmError::validation("text search term is empty"))
                } else {
                    Ok(())
                }
            }
            Expr::Raw(_) => Ok(()),
        }
    }
}

/// Checks that `path` is usable as a field reference.
///
/// A path is a non-empty, dot-separated list of non-empty segments. It may
/// not start with `$` (which would make it an operator) or contain NUL.
///
/// # Errors
///
/// Returns [`OdmError::Validation`] describing the problem.
pub fn validate_field_path(path: &str) -> OdmResult<()> {
    if path.is_empty() {
        return Err(OdmError::validation("field path is empty"));
    }
    if path.starts_with('$') {
        return Err(OdmError::validation(format!(
            "'{path}' is an operator, not a field reference"
        )));
    }
    if path.contains('\0') {
        return Err(OdmError::validation(format!("field path {path:?} contains NUL")));
    }
    if path.split('.').any(str::is_empty) {
        return Err(OdmError::validation(format!("field path '{path}' has an empty segment")));
    }
    Ok(())
}

/// Helper struct for constructing filter expressions over untyped paths.
pub struct Filter;

impl Filter {
    /// Creates an equality filter expression.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Eq, value.into())
    }

    /// Creates a not-equal filter expression.
    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Ne, value.into())
    }

    /// Creates a greater-than filter expression.
    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gt, value.into())
    }

    /// Creates a greater-than-or-equal filter expression.
    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gte, value.into())
    }

    /// Creates a less-than filter expression.
    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lt, value.into())
    }

    /// Creates a less-than-or-equal filter expression.
    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lte, value.into())
    }

    /// Matches string fields starting with `value`.
    pub fn starts_with(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::StartsWith, value.into())
    }

    /// Matches string fields ending with `value`.
    pub fn ends_with(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::EndsWith, value.into())
    }

    /// Matches string fields containing `value` as a substring, or array
    /// fields containing `value` as an element.
    pub fn contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Contains, value.into())
    }

    /// Negation of [`Filter::contains`].
    pub fn not_contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::NotContains, value.into())
    }

    /// Matches documents where the field is present.
    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    /// Matches documents where the field is absent.
    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    /// All expressions must match.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    /// Any expression must match.
    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }

    /// Matches documents where the field equals any of the listed values.
    pub fn any_of<V: Into<Bson>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Expr {
        let values = values.into_iter().map(Into::into).collect::<Vec<_>>();
        Expr::field(field.into(), FieldOp::AnyOf, Bson::Array(values))
    }

    /// Matches documents where the field equals none of the listed values.
    pub fn none_of<V: Into<Bson>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Expr {
        let values = values.into_iter().map(Into::into).collect::<Vec<_>>();
        Expr::field(field.into(), FieldOp::NoneOf, Bson::Array(values))
    }

    /// Matches the document with the given identifier.
    pub fn id(id: &EntityId) -> Expr {
        Filter::eq("_id", id.to_bson())
    }

    /// Matches documents whose identifier is one of `ids`.
    pub fn ids<'a>(ids: impl IntoIterator<Item = &'a EntityId>) -> Expr {
        Filter::ids_at("_id", ids)
    }

    /// Matches documents whose `field` holds one of `ids`.
    pub fn ids_at<'a>(field: impl Into<String>, ids: impl IntoIterator<Item = &'a EntityId>) -> Expr {
        Filter::any_of(field, ids.into_iter().map(EntityId::to_bson))
    }

    /// Full-text match against the collection's text index.
    pub fn text(search: impl Into<String>) -> Expr {
        Expr::Text { search: search.into() }
    }

    /// Store-native filter document, passed through without interpretation.
    pub fn raw(document: Document) -> Expr {
        Expr::Raw(document)
    }
}

/// A field descriptor bound to an entity type and a value type.
///
/// Descriptors are declared once as constants and give type-checked
/// comparisons; the value type must convert into BSON.
pub struct Field<E, T> {
    path: &'static str,
    _marker: PhantomData<fn() -> (E, T)>,
}

impl<E, T> Field<E, T> {
    pub const fn new(path: &'static str) -> Self {
        Self { path, _marker: PhantomData }
    }

    pub fn path(&self) -> &'static str {
        self.path
    }

    pub fn exists(&self) -> Expr {
        Filter::exists(self.path)
    }

    pub fn not_exists(&self) -> Expr {
        Filter::not_exists(self.path)
    }

    pub fn asc(&self) -> Sort {
        Sort::asc(self.path)
    }

    pub fn desc(&self) -> Sort {
        Sort::desc(self.path)
    }
}

impl<E, T: Into<Bson>> Field<E, T> {
    pub fn eq(&self, value: impl Into<T>) -> Expr {
        Filter::eq(self.path, value.into().into())
    }

    pub fn ne(&self, value: impl Into<T>) -> Expr {
        Filter::ne(self.path, value.into().into())
    }

    pub fn gt(&self, value: impl Into<T>) -> Expr {
        Filter::gt(self.path, value.into().into())
    }

    pub fn gte(&self, value: impl Into<T>) -> Expr {
        Filter::gte(self.path, value.into().into())
    }

    pub fn lt(&self, value: impl Into<T>) -> Expr {
        Filter::lt(self.path, value.into().into())
    }

    pub fn lte(&self, value: impl Into<T>) -> Expr {
        Filter::lte(self.path, value.into().into())
    }

    pub fn any_of(&self, values: impl IntoIterator<Item = T>) -> Expr {
        Filter::any_of(self.path, values)
    }

    pub fn none_of(&self, values: impl IntoIterator<Item = T>) -> Expr {
        Filter::none_of(self.path, values)
    }
}

impl<E> Field<E, String> {
    pub fn starts_with(&self, prefix: impl Into<String>) -> Expr {
        Filter::starts_with(self.path, prefix.into())
    }

    pub fn ends_with(&self, suffix: impl Into<String>) -> Expr {
        Filter::ends_with(self.path, suffix.into())
    }

    pub fn contains(&self, needle: impl Into<String>) -> Expr {
        Filter::contains(self.path, needle.into())
    }
}

impl<E, T> Clone for Field<E, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E, T> Copy for Field<E, T> {}

impl<E, T> std::fmt::Debug for Field<E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Field").field(&self.path).finish()
    }
}

/// Which fields a read returns.
///
/// Inclusion and exclusion may only be mixed to exclude `_id`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Projection {
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { include: fields.into_iter().map(Into::into).collect(), exclude: Vec::new() }
    }

    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { include: Vec::new(), exclude: fields.into_iter().map(Into::into).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] for invalid paths or for mixing
    /// inclusion with exclusion of anything other than `_id`.
    pub fn validate(&self) -> OdmResult<()> {
        self.include
            .iter()
            .chain(self.exclude.iter())
            .try_for_each(|f| validate_field_path(f))?;
        if !self.include.is_empty() && self.exclude.iter().any(|f| f != "_id") {
            return Err(OdmError::validation(
                "a projection cannot mix included and excluded fields",
            ));
        }
        Ok(())
    }

    /// Renders the projection as a `{field: 0|1}` document.
    pub fn to_document(&self) -> Document {
        let mut document = Document::new();
        for field in &self.include {
            document.insert(field.clone(), 1);
        }
        for field in &self.exclude {
            document.insert(field.clone(), 0);
        }
        document
    }
}

/// A structured read: filter, ordered sort keys, skip/limit and projection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Optional filter expression to match documents.
    pub filter: Option<Expr>,
    /// Sort keys, most significant first.
    pub sort: Vec<Sort>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Maximum number of documents to return.
    pub limit: Option<u64>,
    /// Fields to return.
    pub projection: Option<Projection>,
}

impl Query {
    /// Creates a new empty query matching every document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new query builder for fluent construction.
    pub fn builder() -> QueryBuilder {
        QueryBuilder::new()
    }

    /// Validates every part of the query.
    ///
    /// # Errors
    ///
    /// Returns the first [`OdmError::Validation`] found.
    pub fn validate(&self) -> OdmResult<()> {
        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        for sort in &self.sort {
            if let Sort::Field { field, .. } = sort {
                validate_field_path(field)?;
            }
        }
        if self.sort.contains(&Sort::TextScore) && !self.filter.as_ref().is_some_and(Expr::has_text) {
            return Err(OdmError::validation("sorting by text score requires a text filter"));
        }
        if let Some(projection) = &self.projection {
            projection.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    /// Creates a new query builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter expression for this query.
    pub fn filter(mut self, filter: Expr) -> Self {
        self.query.filter = Some(filter);
        self
    }

    /// Sets the maximum number of documents to return.
    pub fn limit(mut self, limit: u64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// Sets the number of documents to skip.
    pub fn skip(mut self, skip: u64) -> Self {
        self.query.skip = Some(skip);
        self
    }

    /// Appends a sort key.
    pub fn sort(mut self, sort: Sort) -> Self {
        self.query.sort.push(sort);
        self
    }

    /// Sets the projection.
    pub fn projection(mut self, projection: Projection) -> Self {
        self.query.projection = Some(projection);
        self
    }

    /// Builds and returns the final query.
    pub fn build(self) -> Query {
        self.query
    }
}

/// Where a global filter is placed relative to the caller's filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterPosition {
    /// Global filter comes first.
    #[default]
    Prepend,
    /// Global filter comes after the caller's filter.
    Append,
}

/// Joins filter fragments in order into a single conjunction.
///
/// Returns `None` when there is nothing to filter on, and the fragment itself
/// when there is only one.
pub fn conjunction(parts: impl IntoIterator<Item = Expr>) -> Option<Expr> {
    let mut parts = parts
        .into_iter()
        .flat_map(|part| match part {
            Expr::And(list) => list,
            other => vec![other],
        })
        .collect::<Vec<_>>();
    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(Expr::And(parts)),
    }
}

/// How a text term is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Search {
    /// Terms are matched as written.
    #[default]
    Full,
    /// Terms are replaced by their phonetic hash before matching, so they are
    /// matched against [`FuzzyString`](crate::fuzzy::FuzzyString) hashes.
    Fuzzy,
}

/// Visitor over [`Expr`] trees, used by backends to translate or evaluate
/// filters.
pub trait QueryVisitor {
    type Output;
    type Error: Into<OdmError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error>;
    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error>;
    fn visit_text(&mut self, search: &str) -> Result<Self::Output, Self::Error>;
    fn visit_raw(&mut self, document: &Document) -> Result<Self::Output, Self::Error>;

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
            Expr::Text { search } => self.visit_text(search),
            Expr::Raw(document) => self.visit_raw(document),
        }
    }
}

/// Renders a sort list as an ordered `{field: 1|-1}` document.
pub fn sort_document(sort: &[Sort]) -> Document {
    let mut document = Document::new();
    for key in sort {
        match key {
            Sort::Field { field, direction } => {
                document.insert(field.clone(), direction.as_i32());
            }
            Sort::TextScore => {
                document.insert("score", doc! { "$meta": "textScore" });
            }
        }
    }
    document
}
