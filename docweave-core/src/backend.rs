//! Document-store client abstraction.
//!
//! This module defines the seam between the mapping layer and the document
//! store. Everything the core needs from a store (per-collection CRUD, bulk
//! writes, aggregation, index creation and session-scoped transactions) is
//! expressed by [`StoreBackend`]. The core never talks to a store any other way.
//!
//! # Traits
//!
//! - [`StoreBackend`]: the object-safe async interface implemented by every backend
//! - [`StoreBackendBuilder`]: factory trait for creating backend instances
//!
//! # Sessions
//!
//! Transactions are identified by an opaque [`SessionId`] handed out by
//! [`StoreBackend::start_transaction`]. Every data operation takes an optional
//! session; when one is given the operation runs inside that transaction.
//!
//! # Examples
//!
//! ```ignore
//! use docweave::backend::{StoreBackend, UpdateSpec};
//! use docweave::filter::Filter;
//! use docweave::update::Update;
//!
//! let summary = backend
//!     .update(
//!         "authors",
//!         UpdateSpec::many(Filter::eq("active", false), Update::new().set("archived", true)),
//!         None,
//!     )
//!     .await?;
//! println!("{} modified", summary.modified);
//! ```

use async_trait::async_trait;
use bson::Document;
use futures::stream::{self, BoxStream, StreamExt};
use std::{fmt::Debug, sync::Arc};

use crate::{
    error::OdmResult,
    filter::{Expr, Projection, Query, Sort},
    pipeline::Stage,
    update::Update,
};

/// Opaque handle of an open store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Parameters of an update round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSpec {
    /// Documents to modify. `Expr::And(vec![])` matches every document.
    pub filter: Expr,
    pub update: Update,
    /// Modify every match instead of the first one.
    pub multi: bool,
    /// Insert a document built from the filter's equalities when nothing matches.
    pub upsert: bool,
}

impl UpdateSpec {
    pub fn one(filter: Expr, update: Update) -> Self {
        Self { filter, update, multi: false, upsert: false }
    }

    pub fn many(filter: Expr, update: Update) -> Self {
        Self { filter, update, multi: true, upsert: false }
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }
}

/// Parameters of an atomic find-and-modify round trip.
///
/// The backend returns the document as it is after the update.
#[derive(Debug, Clone, PartialEq)]
pub struct FindAndModify {
    pub filter: Expr,
    pub update: Update,
    /// Picks which match is modified when several qualify.
    pub sort: Vec<Sort>,
    pub projection: Option<Projection>,
    pub upsert: bool,
}

/// One write inside a bulk request.
///
/// Each model is applied on its own: its filter and modification never see
/// the other models' parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne(Document),
    UpdateOne { filter: Expr, update: Update, upsert: bool },
    UpdateMany { filter: Expr, update: Update, upsert: bool },
    ReplaceOne { filter: Expr, replacement: Document, upsert: bool },
    DeleteOne(Expr),
    DeleteMany(Expr),
}

/// Counters reported by a write.
///
/// A write that matched nothing reports zeros; it is not an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    pub deleted: u64,
}

impl WriteSummary {
    /// Adds another summary's counters to this one.
    pub fn absorb(&mut self, other: WriteSummary) {
        self.inserted += other.inserted;
        self.matched += other.matched;
        self.modified += other.modified;
        self.upserted += other.upserted;
        self.deleted += other.deleted;
    }
}

/// Kind of a single index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Asc,
    Desc,
    /// Full-text index over the field's string content.
    Text,
}

/// Description of an index to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexModel {
    /// Explicit index name; backends derive one from the keys when absent.
    pub name: Option<String>,
    pub keys: Vec<(String, IndexKind)>,
    pub unique: bool,
}

impl IndexModel {
    pub fn new(keys: impl IntoIterator<Item = (String, IndexKind)>) -> Self {
        Self { name: None, keys: keys.into_iter().collect(), unique: false }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// The explicit name, or `field_1_other_-1` style derived from the keys.
    pub fn effective_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.keys
            .iter()
            .map(|(field, kind)| {
                let suffix = match kind {
                    IndexKind::Asc => "1",
                    IndexKind::Desc => "-1",
                    IndexKind::Text => "text",
                };
                format!("{field}_{suffix}")
            })
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Abstract interface for document-store clients.
///
/// Implementations must be thread-safe; a single backend instance is shared
/// by every context built on it. Errors from the underlying client are
/// returned as [`OdmError::Store`](crate::error::OdmError::Store) without
/// translation, and no operation is retried implicitly.
///
/// The trait is object safe; contexts hold backends as `Arc<dyn StoreBackend>`.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Inserts documents, returning how many were written.
    ///
    /// # Errors
    ///
    /// Fails if a document violates a unique index, including `_id`.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<SessionId>,
    ) -> OdmResult<u64>;

    /// Runs a query and returns the matching documents in order.
    async fn find(
        &self,
        collection: &str,
        query: Query,
        session: Option<SessionId>,
    ) -> OdmResult<Vec<Document>>;

    /// Counts documents matching `filter`, or every document when `None`.
    async fn count(
        &self,
        collection: &str,
        filter: Option<Expr>,
        session: Option<SessionId>,
    ) -> OdmResult<u64>;

    /// Applies an update to the first or to every matching document.
    async fn update(
        &self,
        collection: &str,
        spec: UpdateSpec,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary>;

    /// Replaces the first matching document, keeping its `_id`.
    async fn replace_one(
        &self,
        collection: &str,
        filter: Expr,
        replacement: Document,
        upsert: bool,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary>;

    /// Atomically updates one document and returns it after modification.
    ///
    /// Returns `None` when nothing matched and no upsert happened.
    async fn find_one_and_update(
        &self,
        collection: &str,
        spec: FindAndModify,
        session: Option<SessionId>,
    ) -> OdmResult<Option<Document>>;

    /// Deletes the first or every matching document, returning the count.
    async fn delete(
        &self,
        collection: &str,
        filter: Expr,
        multi: bool,
        session: Option<SessionId>,
    ) -> OdmResult<u64>;

    /// Applies several independent writes in one round trip.
    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary>;

    /// Runs an aggregation pipeline and collects its output.
    async fn aggregate(
        &self,
        collection: &str,
        stages: Vec<Stage>,
        session: Option<SessionId>,
    ) -> OdmResult<Vec<Document>>;

    /// Runs an aggregation pipeline and returns its output as a stream.
    ///
    /// The default implementation collects the whole result first; backends
    /// with server-side cursors override it.
    async fn aggregate_stream(
        &self,
        collection: &str,
        stages: Vec<Stage>,
        session: Option<SessionId>,
    ) -> OdmResult<BoxStream<'static, OdmResult<Document>>> {
        let documents = self.aggregate(collection, stages, session).await?;
        Ok(stream::iter(documents.into_iter().map(Ok)).boxed())
    }

    /// Creates an index unless one with the same name exists.
    ///
    /// # Errors
    ///
    /// A unique index fails to build if existing documents violate it.
    async fn create_index(&self, collection: &str, index: IndexModel) -> OdmResult<()>;

    /// Drops a collection and its indexes. Dropping a missing collection is a no-op.
    async fn drop_collection(&self, name: &str) -> OdmResult<()>;

    /// Lists the names of all collections.
    async fn list_collections(&self) -> OdmResult<Vec<String>>;

    /// Opens a session and begins a transaction on it.
    async fn start_transaction(&self) -> OdmResult<SessionId>;

    /// Commits and closes the session's transaction.
    async fn commit_transaction(&self, session: SessionId) -> OdmResult<()>;

    /// Aborts and closes the session's transaction, discarding its writes.
    async fn abort_transaction(&self, session: SessionId) -> OdmResult<()>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op.
    async fn shutdown(self) -> OdmResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[async_trait]
impl<B> StoreBackend for Arc<B>
where
    B: StoreBackend + ?Sized,
{
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        (**self).insert_many(collection, documents, session).await
    }

    async fn find(
        &self,
        collection: &str,
        query: Query,
        session: Option<SessionId>,
    ) -> OdmResult<Vec<Document>> {
        (**self).find(collection, query, session).await
    }

    async fn count(
        &self,
        collection: &str,
        filter: Option<Expr>,
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        (**self).count(collection, filter, session).await
    }

    async fn update(
        &self,
        collection: &str,
        spec: UpdateSpec,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary> {
        (**self).update(collection, spec, session).await
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Expr,
        replacement: Document,
        upsert: bool,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary> {
        (**self)
            .replace_one(collection, filter, replacement, upsert, session)
            .await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        spec: FindAndModify,
        session: Option<SessionId>,
    ) -> OdmResult<Option<Document>> {
        (**self).find_one_and_update(collection, spec, session).await
    }

    async fn delete(
        &self,
        collection: &str,
        filter: Expr,
        multi: bool,
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        (**self).delete(collection, filter, multi, session).await
    }

    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary> {
        (**self).bulk_write(collection, models, session).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        stages: Vec<Stage>,
        session: Option<SessionId>,
    ) -> OdmResult<Vec<Document>> {
        (**self).aggregate(collection, stages, session).await
    }

    async fn aggregate_stream(
        &self,
        collection: &str,
        stages: Vec<Stage>,
        session: Option<SessionId>,
    ) -> OdmResult<BoxStream<'static, OdmResult<Document>>> {
        (**self).aggregate_stream(collection, stages, session).await
    }

    async fn create_index(&self, collection: &str, index: IndexModel) -> OdmResult<()> {
        (**self).create_index(collection, index).await
    }

    async fn drop_collection(&self, name: &str) -> OdmResult<()> {
        (**self).drop_collection(name).await
    }

    async fn list_collections(&self) -> OdmResult<Vec<String>> {
        (**self).list_collections().await
    }

    async fn start_transaction(&self) -> OdmResult<SessionId> {
        (**self).start_transaction().await
    }

    async fn commit_transaction(&self, session: SessionId) -> OdmResult<()> {
        (**self).commit_transaction(session).await
    }

    async fn abort_transaction(&self, session: SessionId) -> OdmResult<()> {
        (**self).abort_transaction(session).await
    }
}

/// Factory for backends that need asynchronous setup (connecting, pinging).
#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> OdmResult<Self::Backend>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_names_follow_key_order() {
        let index = IndexModel::new([
            ("parent_id".to_string(), IndexKind::Asc),
            ("child_id".to_string(), IndexKind::Desc),
        ]);
        assert_eq!(index.effective_name(), "parent_id_1_child_id_-1");
        assert_eq!(index.named("pair").effective_name(), "pair");
    }

    #[test]
    fn summaries_accumulate() {
        let mut total = WriteSummary { inserted: 1, ..Default::default() };
        total.absorb(WriteSummary { matched: 2, modified: 2, ..Default::default() });
        assert_eq!(total, WriteSummary { inserted: 1, matched: 2, modified: 2, upserted: 0, deleted: 0 });
    }
}
