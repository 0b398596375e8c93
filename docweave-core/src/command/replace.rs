//! Whole-document replacements.

use bson::Document;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    backend::{WriteModel, WriteSummary},
    command::{Criteria, check_cancelled, require_criteria},
    context::Context,
    entity::{Entity, EntityExt},
    error::{OdmError, OdmResult},
    filter::Expr,
};

struct Pending<E> {
    criteria: Criteria,
    entity: Option<E>,
    upsert: bool,
}

impl<E> Pending<E> {
    fn new() -> Self {
        Self { criteria: Criteria::default(), entity: None, upsert: false }
    }

    fn is_blank(&self) -> bool {
        self.criteria.is_empty() && self.entity.is_none()
    }
}

/// Builder for whole-document replacements.
///
/// Without explicit criteria a replacement targets the document with the
/// entity's own identifier. The stored `_id` is never changed: an entity
/// whose identifier is unset replaces the matched document's content only.
///
/// An upsert of an entity without an identifier first assigns it one of the
/// declared kind, as a save would. The replacement then carries that `_id`,
/// so criteria matching a stored document with another identifier are
/// rejected by the store.
pub struct ReplaceCommand<'a, E> {
    ctx: &'a Context,
    current: Pending<E>,
    queue: Vec<Pending<E>>,
    ignore_global: bool,
    token: Option<CancellationToken>,
}

impl<'a, E: Entity> ReplaceCommand<'a, E> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            current: Pending::new(),
            queue: Vec::new(),
            ignore_global: false,
            token: None,
        }
    }

    pub fn with_entity(mut self, entity: E) -> Self {
        self.current.entity = Some(entity);
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

    /// Inserts the replacement when nothing matches.
    pub fn upsert(mut self) -> Self {
        self.current.upsert = true;
        self
    }

    /// Closes the current (filter, replacement) pair and starts a new one.
    pub fn add_to_queue(mut self) -> Self {
        let finished = std::mem::replace(&mut self.current, Pending::new());
        self.queue.push(finished);
        self
    }

    pub fn ignore_global_filters(mut self) -> Self {
        self.ignore_global = true;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Runs the save hooks on each replacement and sends the writes in one
    /// round trip.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] for a pair without a replacement, or
    /// without criteria when the replacement has no identifier.
    pub async fn execute(mut self) -> OdmResult<WriteSummary> {
        check_cancelled(self.token.as_ref())?;
        if !self.current.is_blank() {
            self.queue.push(std::mem::replace(&mut self.current, Pending::new()));
        }
        if self.queue.is_empty() {
            return Err(OdmError::validation("replace has nothing to apply"));
        }

        let mut models = Vec::with_capacity(self.queue.len());
        for mut pending in self.queue {
            let Some(mut entity) = pending.entity.take() else {
                return Err(OdmError::validation("replace requires an entity; call with_entity()"));
            };
            if pending.criteria.is_empty() && !entity.id().is_unset() {
                pending.criteria.match_id(entity.id());
            }
            require_criteria(&pending.criteria, false, "replace")?;
            if self.ignore_global {
                pending.criteria.ignore_global();
            }
            let replacement = if entity.id().is_unset() && !pending.upsert {
                self.ctx.apply_save_hooks(&mut entity);
                let mut replacement = entity.to_document()?;
                replacement.remove("_id");
                replacement
            } else {
                self.ctx.prepare_save(&mut entity, self.ctx.collection_name::<E>()).await?.0
            };
            models.push(WriteModel::ReplaceOne {
                filter: pending.criteria.resolve_or_all::<E>(self.ctx),
                replacement,
                upsert: pending.upsert,
            });
        }

        let collection = self.ctx.collection_name::<E>();
        let session = self.ctx.session().await;
        check_cancelled(self.token.as_ref())?;
        debug!(collection, pairs = models.len(), "replace");

        if models.len() > 1 {
            return self.ctx.backend().bulk_write(collection, models, session).await;
        }
        match models.pop() {
            Some(WriteModel::ReplaceOne { filter, replacement, upsert }) => {
                self.ctx
                    .backend()
                    .replace_one(collection, filter, replacement, upsert, session)
                    .await
            }
            _ => Ok(WriteSummary::default()),
        }
    }
}
