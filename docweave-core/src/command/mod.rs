//! Fluent command builders.
//!
//! Builders are obtained from a [`Context`](crate::context::Context), collect
//! their parameters without doing any I/O, validate everything locally and
//! then execute as a single round trip where the store allows it.
//!
//! Every builder accepts a [`CancellationToken`]. Reads race the token and
//! give up with [`OdmError::Cancelled`] as soon as it fires. Writes only check
//! the token before the round trip starts: a write already sent to the store
//! is never interrupted, so a document is either fully modified or untouched.

use bson::Document;
use futures::future::{Either, select};
use std::{future::Future, pin::pin};
use tokio_util::sync::CancellationToken;

use crate::{
    context::Context,
    entity::Entity,
    error::{OdmError, OdmResult},
    filter::{Expr, Filter, Search, conjunction},
    fuzzy::phonetic_hash,
    id::EntityId,
};

mod delete;
mod find;
mod paged;
mod pipeline;
mod replace;
mod update;

pub use delete::{DeleteCommand, DeleteSummary};
pub use find::FindCommand;
pub use paged::PagedSearch;
pub use pipeline::PipelineCommand;
pub use replace::ReplaceCommand;
pub use update::{UpdateAndGet, UpdateCommand};

/// Fails with [`OdmError::Cancelled`] if the token has fired.
pub(crate) fn check_cancelled(token: Option<&CancellationToken>) -> OdmResult<()> {
    match token {
        Some(token) if token.is_cancelled() => Err(OdmError::Cancelled),
        _ => Ok(()),
    }
}

/// Runs a read, abandoning it when the token fires first.
pub(crate) async fn race<T>(
    token: Option<&CancellationToken>,
    operation: impl Future<Output = OdmResult<T>>,
) -> OdmResult<T> {
    let Some(token) = token else {
        return operation.await;
    };
    check_cancelled(Some(token))?;
    let operation = pin!(operation);
    let cancelled = pin!(token.cancelled());
    match select(operation, cancelled).await {
        Either::Left((result, _)) => result,
        Either::Right(_) => Err(OdmError::Cancelled),
    }
}

/// Match criteria shared by the builders.
#[derive(Debug, Clone, Default)]
pub(crate) struct Criteria {
    parts: Vec<Expr>,
    ignore_global: bool,
}

impl Criteria {
    pub(crate) fn push(&mut self, expr: Expr) {
        self.parts.push(expr);
    }

    pub(crate) fn match_id(&mut self, id: &EntityId) {
        self.push(Filter::id(id));
    }

    pub(crate) fn match_raw(&mut self, document: Document) {
        self.push(Filter::raw(document));
    }

    pub(crate) fn match_text(&mut self, term: &str, search: Search) {
        let term = match search {
            Search::Full => term.to_string(),
            Search::Fuzzy => phonetic_hash(term),
        };
        self.push(Filter::text(term));
    }

    pub(crate) fn ignore_global(&mut self) {
        self.ignore_global = true;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Validates the caller's fragments.
    pub(crate) fn validate(&self) -> OdmResult<()> {
        self.parts.iter().try_for_each(Expr::validate)
    }

    /// The caller's fragments merged with the context's global filters.
    pub(crate) fn resolve<E: Entity>(&self, ctx: &Context) -> Option<Expr> {
        ctx.scoped_filter(
            E::type_name(),
            conjunction(self.parts.iter().cloned()),
            self.ignore_global,
        )
    }

    /// Like [`resolve`](Self::resolve), but a missing filter becomes
    /// match-all, as write models require one.
    pub(crate) fn resolve_or_all<E: Entity>(&self, ctx: &Context) -> Expr {
        self.resolve::<E>(ctx).unwrap_or_else(|| Expr::And(Vec::new()))
    }
}

/// Rejects a write with no criteria unless the caller opted into matching
/// every document.
pub(crate) fn require_criteria(criteria: &Criteria, match_all: bool, verb: &str) -> OdmResult<()> {
    if criteria.is_empty() && !match_all {
        return Err(OdmError::validation(format!(
            "{verb} without match criteria; call match_all() to target every document"
        )));
    }
    criteria.validate()
}
