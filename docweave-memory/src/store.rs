//! In-memory storage implementation of [`StoreBackend`].
//!
//! Collections are ordered vectors of BSON documents behind one async
//! read-write lock. Every write works on a clone of the target collection
//! and swaps it in only after the write and the unique-index check succeed,
//! so a failed write never leaves a partial modification behind.
//!
//! Transactions snapshot the committed collections when they start. Writes
//! inside the transaction go to the snapshot; commit applies the
//! document-level difference between the snapshot and its starting point to
//! the committed state, and abort drops the snapshot.

use async_trait::async_trait;
use bson::{Bson, Document};
use mea::rwlock::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};
use tracing::debug;

use docweave_core::{
    backend::{
        FindAndModify, IndexKind, IndexModel, SessionId, StoreBackend, StoreBackendBuilder,
        UpdateSpec, WriteModel, WriteSummary,
    },
    error::OdmResult,
    filter::{Expr, Query},
    pipeline::Stage,
    update::Update,
};

use crate::{
    aggregate::{Aggregator, project},
    error::{MemoryResult, MemoryStoreError},
    evaluator::{DocumentEvaluator, TextSearch, sort_documents, text_term, values_equal},
    paths::get_path,
    updater::{self, upsert_seed, with_id},
};

pub(crate) type Collections = BTreeMap<String, Collection>;

/// Documents of one collection, in insertion order, and its indexes.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Collection {
    pub(crate) documents: Vec<Document>,
    pub(crate) indexes: Vec<IndexModel>,
}

impl Collection {
    #[cfg(test)]
    pub(crate) fn with_documents(documents: Vec<Document>) -> Self {
        Self { documents, indexes: Vec::new() }
    }

    /// Paths covered by the collection's text indexes.
    pub(crate) fn text_fields(&self) -> Vec<String> {
        self.indexes
            .iter()
            .flat_map(|index| index.keys.iter())
            .filter(|(_, kind)| *kind == IndexKind::Text)
            .map(|(field, _)| field.clone())
            .collect()
    }

    fn matching(&self, filter: &Expr) -> MemoryResult<Vec<usize>> {
        let text_fields = self.text_fields();
        let mut positions = Vec::new();
        for (position, document) in self.documents.iter().enumerate() {
            if DocumentEvaluator::new(document, &text_fields).evaluate(filter)? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    fn first_match(&self, filter: &Expr) -> MemoryResult<Option<usize>> {
        let text_fields = self.text_fields();
        for (position, document) in self.documents.iter().enumerate() {
            if DocumentEvaluator::new(document, &text_fields).evaluate(filter)? {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    fn query(&self, query: &Query) -> MemoryResult<Vec<Document>> {
        let text_fields = self.text_fields();
        let mut documents =
            DocumentEvaluator::filter_documents(&self.documents, query.filter.as_ref(), &text_fields)?;
        if !query.sort.is_empty() {
            let text = query
                .filter
                .as_ref()
                .and_then(text_term)
                .map(|search| TextSearch::new(&search, &text_fields));
            sort_documents(&mut documents, &query.sort, text.as_ref());
        }
        let skip = query.skip.map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let limit = query.limit.map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
        Ok(documents
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| match &query.projection {
                Some(projection) => project(&document, projection),
                None => document,
            })
            .collect())
    }

    fn insert(&mut self, document: Document) {
        self.documents.push(with_id(document));
    }

    fn update(
        &mut self,
        name: &str,
        filter: &Expr,
        update: &Update,
        multi: bool,
        upsert: bool,
    ) -> MemoryResult<WriteSummary> {
        let targets = if multi {
            self.matching(filter)?
        } else {
            self.first_match(filter)?.into_iter().collect()
        };
        let mut summary = WriteSummary::default();
        for position in targets {
            summary.matched += 1;
            if updater::apply(&mut self.documents[position], update, name)? {
                summary.modified += 1;
            }
        }
        if summary.matched == 0 && upsert {
            self.documents.push(upsert_seed(filter, Some(update), name)?);
            summary.upserted = 1;
        }
        Ok(summary)
    }

    fn replace_one(
        &mut self,
        name: &str,
        filter: &Expr,
        replacement: Document,
        upsert: bool,
    ) -> MemoryResult<WriteSummary> {
        match self.first_match(filter)? {
            Some(position) => {
                let mut replaced = replacement;
                if let Some(id) = self.documents[position].get("_id").cloned() {
                    if replaced.get("_id").is_some_and(|new_id| !values_equal(new_id, &id)) {
                        return Err(MemoryStoreError::ImmutableId(name.to_string()));
                    }
                    replaced.insert("_id", id);
                }
                let replaced = with_id(replaced);
                let modified = replaced != self.documents[position];
                self.documents[position] = replaced;
                Ok(WriteSummary { matched: 1, modified: u64::from(modified), ..Default::default() })
            }
            None if upsert => {
                let mut document = replacement;
                if !document.contains_key("_id") {
                    if let Some(id) = upsert_seed(filter, None, name)?.get("_id") {
                        document.insert("_id", id.clone());
                    }
                }
                self.insert(document);
                Ok(WriteSummary { upserted: 1, ..Default::default() })
            }
            None => Ok(WriteSummary::default()),
        }
    }

    fn find_one_and_update(&mut self, name: &str, spec: &FindAndModify) -> MemoryResult<Option<Document>> {
        let positions = self.matching(&spec.filter)?;
        let target = if spec.sort.is_empty() {
            positions.first().copied()
        } else {
            let text_fields = self.text_fields();
            let text = text_term(&spec.filter).map(|search| TextSearch::new(&search, &text_fields));
            let mut candidates = positions.iter().map(|&p| self.documents[p].clone()).collect::<Vec<_>>();
            sort_documents(&mut candidates, &spec.sort, text.as_ref());
            candidates
                .first()
                .and_then(|first| positions.iter().copied().find(|&p| self.documents[p] == *first))
        };
        let updated = match target {
            Some(position) => {
                updater::apply(&mut self.documents[position], &spec.update, name)?;
                self.documents[position].clone()
            }
            None if spec.upsert => {
                let seed = upsert_seed(&spec.filter, Some(&spec.update), name)?;
                self.documents.push(seed.clone());
                seed
            }
            None => return Ok(None),
        };
        Ok(Some(match &spec.projection {
            Some(projection) => project(&updated, projection),
            None => updated,
        }))
    }

    fn delete(&mut self, filter: &Expr, multi: bool) -> MemoryResult<u64> {
        let targets = if multi {
            self.matching(filter)?
        } else {
            self.first_match(filter)?.into_iter().collect()
        };
        for &position in targets.iter().rev() {
            self.documents.remove(position);
        }
        Ok(targets.len() as u64)
    }

    fn apply_model(&mut self, name: &str, model: WriteModel) -> MemoryResult<WriteSummary> {
        match model {
            WriteModel::InsertOne(document) => {
                self.insert(document);
                Ok(WriteSummary { inserted: 1, ..Default::default() })
            }
            WriteModel::UpdateOne { filter, update, upsert } => self.update(name, &filter, &update, false, upsert),
            WriteModel::UpdateMany { filter, update, upsert } => self.update(name, &filter, &update, true, upsert),
            WriteModel::ReplaceOne { filter, replacement, upsert } => {
                self.replace_one(name, &filter, replacement, upsert)
            }
            WriteModel::DeleteOne(filter) => {
                Ok(WriteSummary { deleted: self.delete(&filter, false)?, ..Default::default() })
            }
            WriteModel::DeleteMany(filter) => {
                Ok(WriteSummary { deleted: self.delete(&filter, true)?, ..Default::default() })
            }
        }
    }

    /// Checks `_id` and every unique index. Missing fields count as null.
    fn check_unique(&self, name: &str) -> MemoryResult<()> {
        let id_index = IndexModel::new([("_id".to_string(), IndexKind::Asc)]).named("_id_").unique(true);
        for index in std::iter::once(&id_index).chain(self.indexes.iter().filter(|index| index.unique)) {
            let mut seen: Vec<Vec<&Bson>> = Vec::with_capacity(self.documents.len());
            for document in &self.documents {
                let key = index
                    .keys
                    .iter()
                    .map(|(field, _)| get_path(document, field).unwrap_or(&Bson::Null))
                    .collect::<Vec<_>>();
                let duplicate = seen
                    .iter()
                    .any(|other| other.iter().zip(&key).all(|(a, b)| values_equal(a, b)));
                if duplicate {
                    return Err(MemoryStoreError::DuplicateKey {
                        collection: name.to_string(),
                        index: index.effective_name(),
                        key: format!("{key:?}"),
                    });
                }
                seen.push(key);
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Session {
    /// Committed state when the transaction started.
    base: Collections,
    /// The transaction's view, including its own writes.
    work: Collections,
}

#[derive(Debug, Default)]
struct State {
    committed: Collections,
    sessions: HashMap<SessionId, Session>,
    next_session: u64,
}

impl State {
    fn collections(&self, session: Option<SessionId>) -> MemoryResult<&Collections> {
        match session {
            None => Ok(&self.committed),
            Some(id) => self
                .sessions
                .get(&id)
                .map(|session| &session.work)
                .ok_or(MemoryStoreError::UnknownSession(id.0)),
        }
    }

    fn collections_mut(&mut self, session: Option<SessionId>) -> MemoryResult<&mut Collections> {
        match session {
            None => Ok(&mut self.committed),
            Some(id) => self
                .sessions
                .get_mut(&id)
                .map(|session| &mut session.work)
                .ok_or(MemoryStoreError::UnknownSession(id.0)),
        }
    }
}

/// Applies a finished transaction's changes onto `committed`.
///
/// Documents are matched by `_id`; a document the transaction did not touch
/// keeps whatever the committed state holds, including concurrent writes.
fn merge(committed: &mut Collections, base: &Collections, work: &Collections) {
    let empty = Collection::default();
    let names = base.keys().chain(work.keys()).collect::<BTreeSet<_>>();
    for name in names {
        let Some(after) = work.get(name) else {
            committed.remove(name);
            continue;
        };
        let before = base.get(name).unwrap_or(&empty);
        if before == after {
            continue;
        }
        let target = committed.entry(name.clone()).or_default();
        for old in &before.documents {
            let id = old.get("_id");
            if !after.documents.iter().any(|document| document.get("_id") == id) {
                target.documents.retain(|document| document.get("_id") != id);
            }
        }
        for new in &after.documents {
            if before.documents.contains(new) {
                continue;
            }
            let id = new.get("_id");
            match target.documents.iter_mut().find(|document| document.get("_id") == id) {
                Some(slot) => *slot = new.clone(),
                None => target.documents.push(new.clone()),
            }
        }
        for index in &after.indexes {
            let name = index.effective_name();
            if !target.indexes.iter().any(|existing| existing.effective_name() == name) {
                target.indexes.push(index.clone());
            }
        }
    }
}

/// Thread-safe in-memory document store.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state;
/// clones share the same collections and transactions.
///
/// Queries scan every document of a collection. Indexes are kept only for
/// uniqueness checks and to know which fields a text search covers.
///
/// Every write clones the target collection, applies the change to the copy
/// and swaps it in only if all unique indexes still hold, so a failed write
/// leaves nothing behind. The uniqueness check compares each document's key
/// against every earlier one, making a write O(n²) in the collection size.
/// That suits tests and small development data sets, not large collections.
///
/// # Example
///
/// ```ignore
/// use docweave_memory::InMemoryStore;
/// use docweave_core::backend::StoreBackend;
/// use bson::doc;
///
/// let store = InMemoryStore::new();
/// store.insert_many("users", vec![doc! { "name": "Alice" }], None).await?;
/// assert_eq!(store.count("users", None, None).await?, 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder that can seed collections before first use.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    async fn read<T, F>(&self, session: Option<SessionId>, op: F) -> OdmResult<T>
    where
        F: FnOnce(&Collections) -> MemoryResult<T> + Send,
    {
        let state = self.state.read().await;
        Ok(op(state.collections(session)?)?)
    }

    /// Runs `op` on a copy of the collection and keeps the copy only if `op`
    /// and the unique-index check both succeed.
    async fn write<T, F>(&self, collection: &str, session: Option<SessionId>, op: F) -> OdmResult<T>
    where
        F: FnOnce(&mut Collection) -> MemoryResult<T> + Send,
    {
        let mut state = self.state.write().await;
        let collections = state.collections_mut(session)?;
        let existing = collections.get(collection);
        let created = existing.is_none();
        let mut working = existing.cloned().unwrap_or_default();
        let result = op(&mut working)?;
        working.check_unique(collection)?;
        if !created || !working.documents.is_empty() || !working.indexes.is_empty() {
            collections.insert(collection.to_string(), working);
        }
        Ok(result)
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        self.write(collection, session, |working| {
            let inserted = documents.len() as u64;
            documents.into_iter().for_each(|document| working.insert(document));
            Ok(inserted)
        })
        .await
    }

    async fn find(
        &self,
        collection: &str,
        query: Query,
        session: Option<SessionId>,
    ) -> OdmResult<Vec<Document>> {
        self.read(session, |collections| match collections.get(collection) {
            Some(found) => found.query(&query),
            None => Ok(Vec::new()),
        })
        .await
    }

    async fn count(
        &self,
        collection: &str,
        filter: Option<Expr>,
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        self.read(session, |collections| {
            let Some(found) = collections.get(collection) else {
                return Ok(0);
            };
            let count = match &filter {
                Some(filter) => found.matching(filter)?.len(),
                None => found.documents.len(),
            };
            Ok(count as u64)
        })
        .await
    }

    async fn update(
        &self,
        collection: &str,
        spec: UpdateSpec,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary> {
        self.write(collection, session, |working| {
            working.update(collection, &spec.filter, &spec.update, spec.multi, spec.upsert)
        })
        .await
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Expr,
        replacement: Document,
        upsert: bool,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary> {
        self.write(collection, session, |working| {
            working.replace_one(collection, &filter, replacement, upsert)
        })
        .await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        spec: FindAndModify,
        session: Option<SessionId>,
    ) -> OdmResult<Option<Document>> {
        self.write(collection, session, |working| working.find_one_and_update(collection, &spec))
            .await
    }

    async fn delete(
        &self,
        collection: &str,
        filter: Expr,
        multi: bool,
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        self.write(collection, session, |working| working.delete(&filter, multi)).await
    }

    async fn bulk_write(
        &self,
        collection: &str,
        models: Vec<WriteModel>,
        session: Option<SessionId>,
    ) -> OdmResult<WriteSummary> {
        self.write(collection, session, |working| {
            let mut summary = WriteSummary::default();
            for model in models {
                summary.absorb(working.apply_model(collection, model)?);
            }
            Ok(summary)
        })
        .await
    }

    async fn aggregate(
        &self,
        collection: &str,
        stages: Vec<Stage>,
        session: Option<SessionId>,
    ) -> OdmResult<Vec<Document>> {
        self.read(session, |collections| {
            let documents = collections
                .get(collection)
                .map(|found| found.documents.clone())
                .unwrap_or_default();
            Aggregator::new(collections, collection).run(documents, &stages)
        })
        .await
    }

    async fn create_index(&self, collection: &str, index: IndexModel) -> OdmResult<()> {
        self.write(collection, None, |working| {
            let name = index.effective_name();
            if working.indexes.iter().any(|existing| existing.effective_name() == name) {
                return Ok(());
            }
            working.indexes.push(index);
            working
                .check_unique(collection)
                .map_err(|_| MemoryStoreError::IndexBuild { collection: collection.to_string(), index: name })
        })
        .await
    }

    async fn drop_collection(&self, name: &str) -> OdmResult<()> {
        self.state.write().await.committed.remove(name);
        Ok(())
    }

    async fn list_collections(&self) -> OdmResult<Vec<String>> {
        Ok(self.state.read().await.committed.keys().cloned().collect())
    }

    async fn start_transaction(&self) -> OdmResult<SessionId> {
        let mut state = self.state.write().await;
        state.next_session += 1;
        let id = SessionId(state.next_session);
        let snapshot = state.committed.clone();
        state.sessions.insert(id, Session { base: snapshot.clone(), work: snapshot });
        debug!(session = id.0, "started in-memory transaction");
        Ok(id)
    }

    async fn commit_transaction(&self, session: SessionId) -> OdmResult<()> {
        let mut state = self.state.write().await;
        let Session { base, work } = state
            .sessions
            .remove(&session)
            .ok_or(MemoryStoreError::UnknownSession(session.0))?;
        let mut merged = state.committed.clone();
        merge(&mut merged, &base, &work);
        for (name, collection) in &merged {
            collection.check_unique(name)?;
        }
        state.committed = merged;
        debug!(session = session.0, "committed in-memory transaction");
        Ok(())
    }

    async fn abort_transaction(&self, session: SessionId) -> OdmResult<()> {
        self.state
            .write()
            .await
            .sessions
            .remove(&session)
            .ok_or(MemoryStoreError::UnknownSession(session.0))?;
        debug!(session = session.0, "aborted in-memory transaction");
        Ok(())
    }
}

/// Builder for [`InMemoryStore`] instances, optionally pre-populated.
///
/// ```ignore
/// use docweave_memory::InMemoryStore;
/// use docweave_core::backend::StoreBackendBuilder;
///
/// let store = InMemoryStore::builder()
///     .collection("authors", vec![doc! { "_id": 1, "name": "Ann" }])
///     .build()
///     .await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStoreBuilder {
    collections: Vec<(String, Vec<Document>)>,
}

impl InMemoryStoreBuilder {
    /// Seeds a collection; documents without `_id` get an ObjectId.
    pub fn collection(mut self, name: impl Into<String>, documents: Vec<Document>) -> Self {
        self.collections.push((name.into(), documents));
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    /// Builds the store.
    ///
    /// # Errors
    ///
    /// Fails when seeded documents repeat an `_id`.
    async fn build(self) -> OdmResult<Self::Backend> {
        let store = InMemoryStore::new();
        for (name, documents) in self.collections {
            store.insert_many(&name, documents, None).await?;
        }
        Ok(store)
    }
}
