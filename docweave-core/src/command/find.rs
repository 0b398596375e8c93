//! Typed queries returning entities, projections or counts.

use bson::Document;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    command::{Criteria, race},
    context::Context,
    entity::{Entity, EntityExt, decode},
    error::{OdmError, OdmResult},
    filter::{Expr, Projection, Query, Search, Sort},
    id::EntityId,
};

/// Builder for reads.
///
/// ```ignore
/// let adults = ctx
///     .find::<Person>()
///     .matching(Filter::gte("age", 18))
///     .sort(Sort::asc("name"))
///     .limit(20)
///     .execute()
///     .await?;
/// ```
pub struct FindCommand<'a, E> {
    ctx: &'a Context,
    criteria: Criteria,
    sort: Vec<Sort>,
    skip: Option<u64>,
    limit: Option<u64>,
    projection: Option<Projection>,
    token: Option<CancellationToken>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity> FindCommand<'a, E> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            criteria: Criteria::default(),
            sort: Vec::new(),
            skip: None,
            limit: None,
            projection: None,
            token: None,
            _entity: PhantomData,
        }
    }

    pub fn match_id(mut self, id: &EntityId) -> Self {
        self.criteria.match_id(id);
        self
    }

    pub fn match_ids<'i>(mut self, ids: impl IntoIterator<Item = &'i EntityId>) -> Self {
        self.criteria.push(crate::filter::Filter::ids(ids));
        self
    }

    /// Adds a filter expression. Repeated calls are combined with AND.
    pub fn matching(mut self, expr: Expr) -> Self {
        self.criteria.push(expr);
        self
    }

    /// Adds a store-native filter document.
    pub fn match_raw(mut self, document: Document) -> Self {
        self.criteria.match_raw(document);
        self
    }

    /// Adds a full-text match. Fuzzy terms are hashed phonetically first.
    pub fn match_text(mut self, term: &str, search: Search) -> Self {
        self.criteria.match_text(term, search);
        self
    }

    /// Appends a sort key; earlier keys are more significant.
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort.push(sort);
        self
    }

    /// Orders by text relevance, best first. Requires a text match.
    pub fn sort_by_text_score(mut self) -> Self {
        self.sort.push(Sort::TextScore);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns only the listed fields (plus `_id`).
    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(Projection::include(fields));
        self
    }

    /// Returns every field except the listed ones.
    pub fn exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(Projection::exclude(fields));
        self
    }

    pub fn ignore_global_filters(mut self) -> Self {
        self.criteria.ignore_global();
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    fn query(&self) -> OdmResult<Query> {
        self.criteria.validate()?;
        let query = Query {
            filter: self.criteria.resolve::<E>(self.ctx),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
            projection: self.projection.clone(),
        };
        query.validate()?;
        Ok(query)
    }

    async fn documents(&self, query: Query) -> OdmResult<Vec<Document>> {
        let collection = self.ctx.collection_name::<E>();
        debug!(collection, filter = ?query.filter, "find");
        let session = self.ctx.session().await;
        race(
            self.token.as_ref(),
            self.ctx.backend().find(collection, query, session),
        )
        .await
    }

    /// Runs the query and decodes every match as `E`.
    pub async fn execute(self) -> OdmResult<Vec<E>> {
        let query = self.query()?;
        self.documents(query).await?.into_iter().map(E::from_document).collect()
    }

    /// Runs the query and decodes every match as `R`, for projections.
    pub async fn execute_as<R: DeserializeOwned>(self) -> OdmResult<Vec<R>> {
        let query = self.query()?;
        self.documents(query).await?.into_iter().map(decode).collect()
    }

    /// The first match, if any.
    pub async fn execute_first(mut self) -> OdmResult<Option<E>> {
        self.limit = Some(1);
        Ok(self.execute().await?.into_iter().next())
    }

    /// The only match, if any.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] if more than one document matches.
    pub async fn execute_single(mut self) -> OdmResult<Option<E>> {
        self.limit = Some(2);
        let mut found = self.execute().await?;
        if found.len() > 1 {
            return Err(OdmError::validation(format!(
                "expected at most one {} but the filter matched several",
                E::type_name()
            )));
        }
        Ok(found.pop())
    }

    /// Counts matches, ignoring sort, skip, limit and projection.
    pub async fn count(self) -> OdmResult<u64> {
        self.criteria.validate()?;
        let filter = self.criteria.resolve::<E>(self.ctx);
        let collection = self.ctx.collection_name::<E>();
        let session = self.ctx.session().await;
        race(
            self.token.as_ref(),
            self.ctx.backend().count(collection, filter, session),
        )
        .await
    }

    /// Fetches one entity by identifier. A miss is `None`.
    pub async fn one_by_id(self, id: &EntityId) -> OdmResult<Option<E>> {
        self.match_id(id).execute_first().await
    }

    /// Fetches the entities with the given identifiers, in store order.
    pub async fn many_by_ids<'i>(
        self,
        ids: impl IntoIterator<Item = &'i EntityId>,
    ) -> OdmResult<Vec<E>> {
        self.match_ids(ids).execute().await
    }
}
