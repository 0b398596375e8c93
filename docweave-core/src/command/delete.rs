//! Deletes, with join-record cleanup for entities that take part in
//! relations.

use bson::Document;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    command::{Criteria, check_cancelled, require_criteria},
    context::Context,
    entity::Entity,
    error::OdmResult,
    filter::{Expr, Filter, Projection, Query},
    id::EntityId,
};

/// Counts reported by a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: u64,
    /// Join records removed because they referenced a deleted entity.
    pub join_records_deleted: u64,
}

/// Builder for deletes of every matching document.
///
/// When the type takes part in relations, the join records referencing the
/// deleted entities are removed too. Inside a transaction that cleanup is
/// atomic with the delete. Outside one it runs afterwards, one join
/// collection at a time; a failure there leaves the entities deleted and
/// some join records orphaned, and is returned to the caller.
pub struct DeleteCommand<'a, E> {
    ctx: &'a Context,
    criteria: Criteria,
    match_all: bool,
    token: Option<CancellationToken>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity> DeleteCommand<'a, E> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            criteria: Criteria::default(),
            match_all: false,
            token: None,
            _entity: PhantomData,
        }
    }

    pub fn match_id(mut self, id: &EntityId) -> Self {
        self.criteria.match_id(id);
        self
    }

    pub fn match_ids<'i>(mut self, ids: impl IntoIterator<Item = &'i EntityId>) -> Self {
        self.criteria.push(Filter::ids(ids));
        self
    }

    pub fn matching(mut self, expr: Expr) -> Self {
        self.criteria.push(expr);
        self
    }

    pub fn match_raw(mut self, document: Document) -> Self {
        self.criteria.match_raw(document);
        self
    }

    /// Targets every document of the collection (still subject to global
    /// filters).
    pub fn match_all(mut self) -> Self {
        self.match_all = true;
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

    pub async fn execute(self) -> OdmResult<DeleteSummary> {
        check_cancelled(self.token.as_ref())?;
        require_criteria(&self.criteria, self.match_all, "delete")?;
        let filter = self.criteria.resolve_or_all::<E>(self.ctx);
        let collection = self.ctx.collection_name::<E>();
        let backend = self.ctx.backend();
        let session = self.ctx.session().await;

        if !self.ctx.schema().has_relations(E::type_name()) {
            check_cancelled(self.token.as_ref())?;
            debug!(collection, filter = ?filter, "delete");
            let deleted = backend.delete(collection, filter, true, session).await?;
            return Ok(DeleteSummary { deleted, join_records_deleted: 0 });
        }

        let query = Query::builder()
            .filter(filter)
            .projection(Projection::include(["_id"]))
            .build();
        let ids = backend
            .find(collection, query, session)
            .await?
            .iter()
            .filter_map(|doc| doc.get("_id"))
            .map(EntityId::try_from)
            .collect::<OdmResult<Vec<_>>>()?;
        if ids.is_empty() {
            return Ok(DeleteSummary::default());
        }

        check_cancelled(self.token.as_ref())?;
        debug!(collection, count = ids.len(), "delete with join cleanup");
        let deleted = backend.delete(collection, Filter::ids(&ids), true, session).await?;
        let join_records_deleted =
            self.ctx.cascade_join_records(E::type_name(), &ids, session).await?;
        Ok(DeleteSummary { deleted, join_records_deleted })
    }
}
