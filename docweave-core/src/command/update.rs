//! Field-level updates, queued into one bulk write, and atomic
//! find-and-modify.

use bson::{Bson, Document};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    backend::{FindAndModify, UpdateSpec, WriteModel, WriteSummary},
    command::{Criteria, check_cancelled, require_criteria},
    context::Context,
    entity::{Entity, EntityExt, decode},
    error::{OdmError, OdmResult},
    filter::{Expr, Projection, Sort},
    id::EntityId,
    update::Update,
};

struct Pending {
    criteria: Criteria,
    match_all: bool,
    update: Update,
    upsert: bool,
}

impl Pending {
    fn new() -> Self {
        Self { criteria: Criteria::default(), match_all: false, update: Update::new(), upsert: false }
    }

    fn is_blank(&self) -> bool {
        self.criteria.is_empty() && !self.match_all && self.update.is_empty()
    }
}

/// Builder for updates applied to every matching document.
///
/// Several independent (filter, modification) pairs can be queued with
/// [`add_to_queue`](Self::add_to_queue); they are sent as one bulk write in
/// which no pair sees another's filter or modification.
///
/// ```ignore
/// ctx.update::<Person>()
///     .matching(Filter::eq("name", "Ada"))
///     .set("age", 37)
///     .add_to_queue()
///     .matching(Filter::eq("name", "Grace"))
///     .modify(Update::new().inc("age", 1))
///     .execute()
///     .await?;
/// ```
pub struct UpdateCommand<'a, E> {
    ctx: &'a Context,
    current: Pending,
    queue: Vec<Pending>,
    ignore_global: bool,
    token: Option<CancellationToken>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity> UpdateCommand<'a, E> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            current: Pending::new(),
            queue: Vec::new(),
            ignore_global: false,
            token: None,
            _entity: PhantomData,
        }
    }

    pub fn match_id(mut self, id: &EntityId) -> Self {
        self.current.criteria.match_id(id);
        self
    }

    pub fn matching(mut self, expr: Expr) -> Self {
        self.current.criteria.push(expr);
        self
    }

    pub fn match_raw(mut self, document: Document) -> Self {
        self.current.criteria.match_raw(document);
        self
    }

    /// Targets every document of the collection (still subject to global
    /// filters).
    pub fn match_all(mut self) -> Self {
        self.current.match_all = true;
        self
    }

    /// Adds the operations of `update` to the current modification.
    pub fn modify(mut self, update: Update) -> Self {
        for op in update.ops() {
            self.current.update.push_op(op.clone());
        }
        self
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.current.update = self.current.update.set(field, value);
        self
    }

    /// Inserts a document built from the filter when nothing matches.
    pub fn upsert(mut self) -> Self {
        self.current.upsert = true;
        self
    }

    /// Closes the current (filter, modification) pair and starts a new one.
    pub fn add_to_queue(mut self) -> Self {
        let finished = std::mem::replace(&mut self.current, Pending::new());
        self.queue.push(finished);
        self
    }

    /// Skips the context's global filters for every queued pair.
    pub fn ignore_global_filters(mut self) -> Self {
        self.ignore_global = true;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Validates every pair, runs the update hooks once per pair and sends
    /// the writes in one round trip.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] for a pair without criteria (unless
    /// `match_all` was called) or without modifications, and
    /// [`OdmError::Cancelled`] if the token fired before sending.
    pub async fn execute(mut self) -> OdmResult<WriteSummary> {
        check_cancelled(self.token.as_ref())?;
        if !self.current.is_blank() {
            self.queue.push(std::mem::replace(&mut self.current, Pending::new()));
        }
        if self.queue.is_empty() {
            return Err(OdmError::validation("update has nothing to apply"));
        }

        let mut prepared = Vec::with_capacity(self.queue.len());
        for mut pending in self.queue {
            require_criteria(&pending.criteria, pending.match_all, "update")?;
            pending.update.validate()?;
            if self.ignore_global {
                pending.criteria.ignore_global();
            }
            let filter = pending.criteria.resolve_or_all::<E>(self.ctx);
            self.ctx.apply_update_hooks::<E>(&mut pending.update)?;
            prepared.push((filter, pending.update, pending.upsert));
        }

        let collection = self.ctx.collection_name::<E>();
        let session = self.ctx.session().await;
        check_cancelled(self.token.as_ref())?;
        debug!(collection, pairs = prepared.len(), "update");

        if prepared.len() == 1 {
            let Some((filter, update, upsert)) = prepared.pop() else {
                return Ok(WriteSummary::default());
            };
            let spec = UpdateSpec::many(filter, update).upsert(upsert);
            return self.ctx.backend().update(collection, spec, session).await;
        }
        let models = prepared
            .into_iter()
            .map(|(filter, update, upsert)| WriteModel::UpdateMany { filter, update, upsert })
            .collect();
        self.ctx.backend().bulk_write(collection, models, session).await
    }
}

/// Builder for an atomic find-and-modify returning the updated document.
pub struct UpdateAndGet<'a, E> {
    ctx: &'a Context,
    criteria: Criteria,
    match_all: bool,
    update: Update,
    sort: Vec<Sort>,
    projection: Option<Projection>,
    upsert: bool,
    token: Option<CancellationToken>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity> UpdateAndGet<'a, E> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            criteria: Criteria::default(),
            match_all: false,
            update: Update::new(),
            sort: Vec::new(),
            projection: None,
            upsert: false,
            token: None,
            _entity: PhantomData,
        }
    }

    pub fn match_id(mut self, id: &EntityId) -> Self {
        self.criteria.match_id(id);
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

    pub fn match_all(mut self) -> Self {
        self.match_all = true;
        self
    }

    pub fn modify(mut self, update: Update) -> Self {
        for op in update.ops() {
            self.update.push_op(op.clone());
        }
        self
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.update = self.update.set(field, value);
        self
    }

    /// Decides which match is modified when several qualify.
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(Projection::include(fields));
        self
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
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

    async fn document(mut self) -> OdmResult<Option<Document>> {
        check_cancelled(self.token.as_ref())?;
        require_criteria(&self.criteria, self.match_all, "update")?;
        self.update.validate()?;
        if let Some(projection) = &self.projection {
            projection.validate()?;
        }
        self.ctx.apply_update_hooks::<E>(&mut self.update)?;
        let spec = FindAndModify {
            filter: self.criteria.resolve_or_all::<E>(self.ctx),
            update: self.update,
            sort: self.sort,
            projection: self.projection,
            upsert: self.upsert,
        };
        let collection = self.ctx.collection_name::<E>();
        let session = self.ctx.session().await;
        check_cancelled(self.token.as_ref())?;
        debug!(collection, filter = ?spec.filter, "find one and update");
        self.ctx.backend().find_one_and_update(collection, spec, session).await
    }

    /// Updates one document and returns it as it is after the update.
    /// `None` when nothing matched and no upsert happened.
    pub async fn execute(self) -> OdmResult<Option<E>> {
        self.document().await?.map(E::from_document).transpose()
    }

    /// Like [`execute`](Self::execute), decoding the result as `R`.
    pub async fn execute_as<R: DeserializeOwned>(self) -> OdmResult<Option<R>> {
        self.document().await?.map(decode).transpose()
    }
}
