use async_trait::async_trait;
use bson::{Bson, Document};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use mea::mutex::Mutex;
use mongodb::{
    Client, ClientSession, Collection as MongoCollection, IndexModel as MongoIndexModel, Namespace,
    options::{
        ClientOptions, DeleteManyModel, DeleteOneModel, IndexOptions, InsertOneModel,
        ReplaceOneModel, ReturnDocument, UpdateManyModel, UpdateOneModel, WriteModel as MongoWriteModel,
    },
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::debug;

use docweave_core::{
    backend::{
        FindAndModify, IndexKind, IndexModel, SessionId, StoreBackend, StoreBackendBuilder,
        UpdateSpec, WriteModel, WriteSummary,
    },
    error::{OdmError, OdmResult},
    filter::{Expr, Query, QueryVisitor, sort_document},
    pipeline::Stage,
};

use crate::query::{MongoQueryTranslator, render_pipeline};

type SessionHandle = Arc<Mutex<ClientSession>>;

/// Runs a driver action, attaching the transaction's session when one is given.
macro_rules! with_session {
    ($store:expr, $session:expr, $action:expr) => {{
        let action = $action;
        match $store.session_handle($session).await? {
            Some(handle) => {
                let mut session = handle.lock().await;
                action.session(&mut *session).await
            }
            None => action.await,
        }
        .map_err(OdmError::store)?
    }};
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// MongoDB implementation of [`StoreBackend`].
///
/// Clones share the client, which pools connections, and the table of open
/// sessions. [`tenant`](MongoDbStore::tenant) derives a store bound to
/// another database over the same client.
#[derive(Debug, Clone)]
pub struct MongoDbStore {
    client: Client,
    database: String,
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    next_session: Arc<AtomicU64>,
}

impl MongoDbStore {
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
            sessions: Arc::default(),
            next_session: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    /// A store over the same client targeting `database`.
    ///
    /// Sessions are per store; a transaction opened on one tenant is unknown
    /// to the others.
    pub fn tenant(&self, database: impl Into<String>) -> Self {
        Self::new(self.client.clone(), database)
    }

    fn collection(&self, name: &str) -> MongoCollection<Document> {
        self.client.database(&self.database).collection(name)
    }

    fn namespace(&self, collection: &str) -> Namespace {
        self.collection(collection).namespace()
    }

    async fn session_handle(&self, session: Option<SessionId>) -> OdmResult<Option<SessionHandle>> {
        let Some(id) = session else {
            return Ok(None);
        };
        self.sessions
            .lock()
            .await
            .get(&id)
            .cloned()
            .map(Some)
            .ok_or_else(|| OdmError::TransactionState(format!("no open transaction for session {}", id.0)))
    }

    fn write_model(&self, collection: &str, model: WriteModel) -> OdmResult<MongoWriteModel> {
        let namespace = self.namespace(collection);
        let filter = |expr: &Expr| MongoQueryTranslator.visit_expr(expr);
        Ok(match model {
            WriteModel::InsertOne(document) => InsertOneModel::builder()
                .namespace(namespace)
                .document(document)
                .build()
                .into(),
            WriteModel::UpdateOne { filter: expr, update, upsert } => UpdateOneModel::builder()
                .namespace(namespace)
                .filter(filter(&expr)?)
                .update(update.to_document())
                .upsert(upsert)
                .build()
                .into(),
            WriteModel::UpdateMany { filter: expr, update, upsert } => UpdateManyModel::builder()
                .namespace(namespace)
                .filter(filter(&expr)?)
                .update(update.to_document())
                .upsert(upsert)
                .build()
                .into(),
            WriteModel::ReplaceOne { filter: expr, replacement, upsert } => ReplaceOneModel::builder()
                .namespace(namespace)
                .filter(filter(&expr)?)
                .replacement(replacement)
                .upsert(upsert)
                .build()
                .into(),
            WriteModel::DeleteOne(expr) => DeleteOneModel::builder()
                .namespace(namespace)
                .filter(filter(&expr)?)
                .build()
                .into(),
            WriteModel::DeleteMany(expr) => DeleteManyModel::builder()
                .namespace(namespace)
                .filter(filter(&expr)?)
                .build()
                .into(),
        })
    }

    async fn shutdown(self) -> OdmResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        if documents.is_empty() {
            return Ok(0);
        }
        let target = self.collection(collection);
        let result = with_session!(self, session, target.insert_many(documents));
        Ok(result.inserted_ids.len() as u64)
    }

    async fn find(
        &self,
        collection: &str,
        query: Query,
        session: Option<SessionId>,
    ) -> OdmResult<Vec<Document>> {
        let target = self.collection(collection);
        let mut action = target.find(MongoQueryTranslator::translate(query.filter.as_ref())?);
        if !query.sort.is_empty() {
            action = action.sort(sort_document(&query.sort));
        }
        if let Some(skip) = query.skip {
            action = action.skip(skip);
        }
        if let Some(limit) = query.limit {
            action = action.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(projection) = &query.projection {
            action = action.projection(projection.to_document());
        }
        match self.session_handle(session).await? {
            Some(handle) => {
                let mut session = handle.lock().await;
                let mut cursor = action.session(&mut *session).await.map_err(OdmError::store)?;
                cursor
                    .stream(&mut *session)
                    .try_collect()
                    .await
                    .map_err(OdmError::store)
            }
            None => action
                .await
                .map_err(OdmError::store)?
                .try_collect()
                .await
                .map_err(OdmError::store),
        }
    }

    async fn count(
        &self,
        collection: &str,
        filter: Option<Expr>,
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        let filter = MongoQueryTranslator::translate(filter.as_ref())?;
        let target = self.collection(collection);
        Ok(with_session!(self, session, target.count_documents(filter)))
    }

    async fn update(
        &self,
        collection: &str,
        spec: UpdateSpec,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary> {
        let filter = MongoQueryTranslator.visit_expr(&spec.filter)?;
        let update = spec.update.to_document();
        let target = self.collection(collection);
        let result = if spec.multi {
            with_session!(self, session, target.update_many(filter, update).upsert(spec.upsert))
        } else {
            with_session!(self, session, target.update_one(filter, update).upsert(spec.upsert))
        };
        Ok(WriteSummary {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: u64::from(result.upserted_id.is_some()),
            ..Default::default()
        })
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Expr,
        replacement: Document,
        upsert: bool,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary> {
        let filter = MongoQueryTranslator.visit_expr(&filter)?;
        let target = self.collection(collection);
        let result = with_session!(self, session, target.replace_one(filter, replacement).upsert(upsert));
        Ok(WriteSummary {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: u64::from(result.upserted_id.is_some()),
            ..Default::default()
        })
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        spec: FindAndModify,
        session: Option<SessionId>,
    ) -> OdmResult<Option<Document>> {
        let filter = MongoQueryTranslator.visit_expr(&spec.filter)?;
        let target = self.collection(collection);
        let mut action = target
            .find_one_and_update(filter, spec.update.to_document())
            .upsert(spec.upsert)
            .return_document(ReturnDocument::After);
        if !spec.sort.is_empty() {
            action = action.sort(sort_document(&spec.sort));
        }
        if let Some(projection) = &spec.projection {
            action = action.projection(projection.to_document());
        }
        Ok(with_session!(self, session, action))
    }

    async fn delete(
        &self,
        collection: &str,
        filter: Expr,
        multi: bool,
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        let filter = MongoQueryTranslator.visit_expr(&filter)?;
        let target = self.collection(collection);
        let result = if multi {
            with_session!(self, session, target.delete_many(filter))
        } else {
            with_session!(self, session, target.delete_one(filter))
        };
        Ok(result.deleted_count)
    }

    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary> {
        if models.is_empty() {
            return Ok(WriteSummary::default());
        }
        let models = models
            .into_iter()
            .map(|model| self.write_model(collection, model))
            .collect::<OdmResult<Vec<_>>>()?;
        let result = with_session!(self, session, self.client.bulk_write(models));
        Ok(WriteSummary {
            inserted: to_u64(result.inserted_count),
            matched: to_u64(result.matched_count),
            modified: to_u64(result.modified_count),
            upserted: to_u64(result.upserted_count),
            deleted: to_u64(result.deleted_count),
        })
    }

    async fn aggregate(
        &self,
        collection: &str,
        stages: Vec<Stage>,
        session: Option<SessionId>,
    ) -> OdmResult<Vec<Document>> {
        let target = self.collection(collection);
        let action = target.aggregate(render_pipeline(&stages)?);
        match self.session_handle(session).await? {
            Some(handle) => {
                let mut session = handle.lock().await;
                let mut cursor = action.session(&mut *session).await.map_err(OdmError::store)?;
                cursor
                    .stream(&mut *session)
                    .try_collect()
                    .await
                    .map_err(OdmError::store)
            }
            None => action
                .await
                .map_err(OdmError::store)?
                .try_collect()
                .await
                .map_err(OdmError::store),
        }
    }

    /// Streams straight from the server cursor outside transactions; inside
    /// one the session is borrowed per batch, so results are collected first.
    async fn aggregate_stream(
        &self,
        collection: &str,
        stages: Vec<Stage>,
        session: Option<SessionId>,
    ) -> OdmResult<BoxStream<'static, OdmResult<Document>>> {
        if session.is_some() {
            let documents = self.aggregate(collection, stages, session).await?;
            return Ok(futures::stream::iter(documents.into_iter().map(Ok)).boxed());
        }
        let cursor = self
            .collection(collection)
            .aggregate(render_pipeline(&stages)?)
            .await
            .map_err(OdmError::store)?;
        Ok(cursor.map_err(OdmError::store).boxed())
    }

    async fn create_index(&self, collection: &str, index: IndexModel) -> OdmResult<()> {
        let mut keys = Document::new();
        for (field, kind) in &index.keys {
            let direction = match kind {
                IndexKind::Asc => Bson::Int32(1),
                IndexKind::Desc => Bson::Int32(-1),
                IndexKind::Text => Bson::String("text".into()),
            };
            keys.insert(field.clone(), direction);
        }
        let model = MongoIndexModel::builder()
            .keys(keys)
            .options(
                IndexOptions::builder()
                    .name(index.effective_name())
                    .unique(index.unique)
                    .build(),
            )
            .build();
        self.collection(collection)
            .create_index(model)
            .await
            .map_err(OdmError::store)?;

        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> OdmResult<()> {
        self.collection(name)
            .drop()
            .await
            .map_err(OdmError::store)?;

        Ok(())
    }

    async fn list_collections(&self) -> OdmResult<Vec<String>> {
        self.client
            .database(&self.database)
            .list_collection_names()
            .await
            .map_err(OdmError::store)
    }

    async fn start_transaction(&self) -> OdmResult<SessionId> {
        let mut session = self.client.start_session().await.map_err(OdmError::store)?;
        session.start_transaction().await.map_err(OdmError::store)?;
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        self.sessions.lock().await.insert(id, Arc::new(Mutex::new(session)));
        debug!(session = id.0, database = %self.database, "started transaction");
        Ok(id)
    }

    async fn commit_transaction(&self, session: SessionId) -> OdmResult<()> {
        let handle = self.take_session(session).await?;
        handle.lock().await.commit_transaction().await.map_err(OdmError::store)?;
        debug!(session = session.0, "committed transaction");
        Ok(())
    }

    async fn abort_transaction(&self, session: SessionId) -> OdmResult<()> {
        let handle = self.take_session(session).await?;
        handle.lock().await.abort_transaction().await.map_err(OdmError::store)?;
        debug!(session = session.0, "aborted transaction");
        Ok(())
    }

    async fn shutdown(self) -> OdmResult<()> {
        self.shutdown().await
    }
}

impl MongoDbStore {
    /// Removes a session from the table; it is closed once the last
    /// in-flight operation releases it.
    async fn take_session(&self, session: SessionId) -> OdmResult<SessionHandle> {
        self.sessions
            .lock()
            .await
            .remove(&session)
            .ok_or_else(|| OdmError::TransactionState(format!("no open transaction for session {}", session.0)))
    }
}

/// Connects a [`MongoDbStore`] from a connection string.
pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> OdmResult<Self::Backend> {
        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| OdmError::Initialization(e.to_string()))?,
            )
            .map_err(|e| OdmError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docweave_core::filter::Filter;

    // Clients connect lazily, so nothing below reaches a server.
    async fn offline_store() -> MongoDbStore {
        MongoDbStore::builder("mongodb://127.0.0.1:1", "docweave_test")
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_sessions_fail_before_any_round_trip() {
        let store = offline_store().await;
        let stale = Some(SessionId(99));

        let inserted = store.insert_many("books", vec![doc! { "title": "x" }], stale).await;
        assert!(matches!(inserted, Err(OdmError::TransactionState(_))));
        let counted = store.count("books", None, stale).await;
        assert!(matches!(counted, Err(OdmError::TransactionState(_))));
        let deleted = store.delete("books", Filter::eq("title", "x"), true, stale).await;
        assert!(matches!(deleted, Err(OdmError::TransactionState(_))));
        let committed = store.commit_transaction(SessionId(99)).await;
        assert!(matches!(committed, Err(OdmError::TransactionState(_))));
    }

    #[tokio::test]
    async fn empty_writes_short_circuit() {
        let store = offline_store().await;
        assert_eq!(store.insert_many("books", Vec::new(), None).await.unwrap(), 0);
        assert_eq!(store.bulk_write("books", Vec::new(), None).await.unwrap(), WriteSummary::default());
    }

    #[tokio::test]
    async fn tenants_share_the_client_but_not_sessions() {
        let store = offline_store().await;
        let tenant = store.tenant("other");
        assert_eq!(tenant.namespace("books").db, "other");
        assert_eq!(store.namespace("books").db, "docweave_test");
        assert!(matches!(
            tenant.abort_transaction(SessionId(1)).await,
            Err(OdmError::TransactionState(_))
        ));
    }
}
