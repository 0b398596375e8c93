//! The owning context: store handle, global filters, hooks and transactions.
//!
//! A [`Context`] is the entry point for every operation. It owns one backend
//! handle per logical tenant, the shared [`Schema`], the global filters merged
//! into every query it issues, the audit hooks run before every write, and at
//! most one open transaction.
//!
//! A context is safe to share between tasks for non-transactional work; each
//! call is an independent round trip. Transaction management is not meant to
//! be shared: while a transaction is open, every operation issued through the
//! context runs inside it.
//!
//! # Example
//!
//! ```ignore
//! let ctx = Context::builder(InMemoryStore::new())
//!     .schema(schema)
//!     .global_filter::<Author>(Filter::eq("deleted", false), FilterPosition::Prepend)
//!     .modified_by(ModifiedBy::new("42", "ada"))
//!     .build();
//!
//! let mut author = Author::new("Ursula");
//! ctx.save(&mut author).await?;
//!
//! ctx.start_transaction().await?;
//! ctx.delete::<Author>().match_id(author.id()).execute().await?;
//! ctx.commit_transaction().await?;
//! ```

use bson::Bson;
use dashmap::{DashMap, DashSet};
use mea::rwlock::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{IndexKind, IndexModel, SessionId, StoreBackend, WriteModel, WriteSummary},
    command::{
        DeleteCommand, FindCommand, PagedSearch, PipelineCommand, ReplaceCommand, UpdateAndGet,
        UpdateCommand, check_cancelled,
    },
    entity::{AnyEntity, Entity, EntityExt, ModifiedBy},
    error::{OdmError, OdmResult},
    filter::{Expr, Filter, FilterPosition, Query, Sort, conjunction},
    id::{EntityId, IdKind, SequenceGenerator},
    join,
    pipeline::Template,
    relation::Many,
    schema::Schema,
    update::Update,
};

/// Audit hooks invoked synchronously before writes.
///
/// Each hook runs exactly once per written entity or per queued update,
/// before serialization, after the context's built-in modified-by injection.
pub trait ContextHooks: Send + Sync {
    /// Called before an entity is inserted or replaced.
    fn before_save(&self, _entity: &mut dyn AnyEntity) {}

    /// Called before an update is sent, once per (filter, update) pair.
    fn before_update(&self, _type_name: &'static str, _update: &mut Update) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ContextHooks for NoHooks {}

/// Which entity types a global filter applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterScope {
    /// Exactly one entity type, by type name.
    Type(&'static str),
    /// Every entity type carrying the tag in the schema.
    Tag(String),
}

/// A predicate merged into every query a context issues for matching types.
#[derive(Debug, Clone)]
pub struct GlobalFilter {
    pub scope: FilterScope,
    pub expr: Expr,
    pub position: FilterPosition,
}

impl GlobalFilter {
    fn applies_to(&self, type_name: &str, tags: &[String]) -> bool {
        match &self.scope {
            FilterScope::Type(name) => *name == type_name,
            FilterScope::Tag(tag) => tags.iter().any(|t| t == tag),
        }
    }
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    backend: Arc<dyn StoreBackend>,
    schema: Arc<Schema>,
    global_filters: Vec<GlobalFilter>,
    hooks: Arc<dyn ContextHooks>,
    modified_by: Option<ModifiedBy>,
    sequence_seed: Option<i64>,
}

impl ContextBuilder {
    pub fn schema(mut self, schema: impl Into<Arc<Schema>>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Adds a global filter for one entity type.
    pub fn global_filter<E: Entity>(mut self, expr: Expr, position: FilterPosition) -> Self {
        self.global_filters.push(GlobalFilter {
            scope: FilterScope::Type(E::type_name()),
            expr,
            position,
        });
        self
    }

    /// Adds a global filter for every entity type tagged `tag`.
    pub fn global_filter_for_tag(
        mut self,
        tag: impl Into<String>,
        expr: Expr,
        position: FilterPosition,
    ) -> Self {
        self.global_filters.push(GlobalFilter { scope: FilterScope::Tag(tag.into()), expr, position });
        self
    }

    pub fn hooks(mut self, hooks: impl ContextHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Audit value copied into saved entities and set on updates.
    pub fn modified_by(mut self, modified_by: ModifiedBy) -> Self {
        self.modified_by = Some(modified_by);
        self
    }

    /// First value handed out by sequence generators, instead of the
    /// store's current maximum identifier plus one.
    pub fn sequence_seed(mut self, seed: i64) -> Self {
        self.sequence_seed = Some(seed);
        self
    }

    pub fn build(self) -> Context {
        Context {
            backend: self.backend,
            schema: self.schema,
            global_filters: self.global_filters,
            hooks: self.hooks,
            modified_by: self.modified_by,
            sequence_seed: self.sequence_seed,
            sequences: DashMap::new(),
            ensured_indexes: DashSet::new(),
            transaction: RwLock::new(None),
        }
    }
}

/// Owns a store handle, global filters, hooks and the transaction slot.
pub struct Context {
    backend: Arc<dyn StoreBackend>,
    schema: Arc<Schema>,
    global_filters: Vec<GlobalFilter>,
    hooks: Arc<dyn ContextHooks>,
    modified_by: Option<ModifiedBy>,
    sequence_seed: Option<i64>,
    sequences: DashMap<String, Arc<SequenceGenerator>>,
    ensured_indexes: DashSet<String>,
    transaction: RwLock<Option<SessionId>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend)
            .field("global_filters", &self.global_filters.len())
            .field("modified_by", &self.modified_by)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Starts building a context over `backend`.
    pub fn builder(backend: impl StoreBackend + 'static) -> ContextBuilder {
        ContextBuilder {
            backend: Arc::new(backend),
            schema: Arc::new(Schema::default()),
            global_filters: Vec::new(),
            hooks: Arc::new(NoHooks),
            modified_by: None,
            sequence_seed: None,
        }
    }

    /// A context over `backend` with an empty schema and no filters or hooks.
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self::builder(backend).build()
    }

    pub fn backend(&self) -> &dyn StoreBackend {
        self.backend.as_ref()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn modified_by(&self) -> Option<&ModifiedBy> {
        self.modified_by.as_ref()
    }

    /// Collection that stores `E`.
    pub fn collection_name<E: Entity>(&self) -> &str {
        self.schema.collection_of(E::type_name())
    }

    // ---------------------------------------------------------------- commands

    pub fn find<E: Entity>(&self) -> FindCommand<'_, E> {
        FindCommand::new(self)
    }

    pub fn update<E: Entity>(&self) -> UpdateCommand<'_, E> {
        UpdateCommand::new(self)
    }

    pub fn update_and_get<E: Entity>(&self) -> UpdateAndGet<'_, E> {
        UpdateAndGet::new(self)
    }

    pub fn replace<E: Entity>(&self) -> ReplaceCommand<'_, E> {
        ReplaceCommand::new(self)
    }

    pub fn delete<E: Entity>(&self) -> DeleteCommand<'_, E> {
        DeleteCommand::new(self)
    }

    pub fn paged_search<E: Entity>(&self) -> PagedSearch<'_, E> {
        PagedSearch::new(self)
    }

    /// A pipeline over `E`'s collection whose results decode as `R`.
    pub fn pipeline<E, R>(&self, template: Template) -> PipelineCommand<'_, E, R>
    where
        E: Entity,
        R: serde::de::DeserializeOwned + Send + 'static,
    {
        PipelineCommand::new(self, template)
    }

    /// Navigates the relation declared on `P` under `property`.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] if no such relation is declared, if
    /// it does not lead to `C`, or if `parent` has not been saved.
    pub fn many<P: Entity, C: Entity>(&self, parent: &P, property: &str) -> OdmResult<Many<'_, P, C>> {
        Many::bind(self, parent, property)
    }

    // ------------------------------------------------------------------ saving

    /// Inserts an unsaved entity or replaces a saved one.
    ///
    /// An unset identifier is generated exactly once, here, and written back
    /// into the entity. Modified-by injection and the before-save hook run
    /// before serialization.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Serialization`] if the entity's identifier is of a
    /// different kind than its type declares, and store errors unchanged.
    pub async fn save<E: Entity>(&self, entity: &mut E) -> OdmResult<WriteSummary> {
        self.save_inner(entity, None).await
    }

    /// Like [`save`](Self::save), but gives up without any effect if `token`
    /// is cancelled before the write round trip starts.
    pub async fn save_with_cancellation<E: Entity>(
        &self,
        entity: &mut E,
        token: &CancellationToken,
    ) -> OdmResult<WriteSummary> {
        self.save_inner(entity, Some(token)).await
    }

    async fn save_inner<E: Entity>(
        &self,
        entity: &mut E,
        token: Option<&CancellationToken>,
    ) -> OdmResult<WriteSummary> {
        check_cancelled(token)?;
        let collection = self.collection_name::<E>().to_string();
        let session = self.session().await;
        let (document, is_new) = self.prepare_save(entity, &collection).await?;
        check_cancelled(token)?;

        debug!(collection = %collection, id = %entity.id(), insert = is_new, "saving entity");
        if is_new {
            let inserted = self.backend.insert_many(&collection, vec![document], session).await?;
            Ok(WriteSummary { inserted, ..Default::default() })
        } else {
            self.backend
                .replace_one(&collection, Filter::id(entity.id()), document, true, session)
                .await
        }
    }

    /// Saves several entities of one type in a single bulk write.
    ///
    /// # Errors
    ///
    /// As for [`save`](Self::save). Identifiers generated before a failing
    /// bulk write stay assigned.
    pub async fn save_many<E: Entity>(&self, entities: &mut [E]) -> OdmResult<WriteSummary> {
        if entities.is_empty() {
            return Ok(WriteSummary::default());
        }
        let collection = self.collection_name::<E>().to_string();
        let session = self.session().await;
        let mut models = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            let (document, is_new) = self.prepare_save(entity, &collection).await?;
            models.push(if is_new {
                WriteModel::InsertOne(document)
            } else {
                WriteModel::ReplaceOne {
                    filter: Filter::id(entity.id()),
                    replacement: document,
                    upsert: true,
                }
            });
        }
        debug!(collection = %collection, count = models.len(), "saving entities in bulk");
        self.backend.bulk_write(&collection, models, session).await
    }

    /// Assigns an identifier if needed, runs audit injection and hooks, and
    /// serializes. Returns the document and whether it is an insert.
    pub(crate) async fn prepare_save<E: Entity>(
        &self,
        entity: &mut E,
        collection: &str,
    ) -> OdmResult<(bson::Document, bool)> {
        let is_new = entity.id().is_unset();
        if is_new {
            let id = self.generate_id::<E>(collection).await?;
            entity.assign_id(id);
        } else if entity.id().kind() != E::id_kind() {
            return Err(OdmError::serialization_of(
                E::type_name(),
                format!(
                    "identifier {} is a {} id but the type declares {}",
                    entity.id(),
                    entity.id().kind(),
                    E::id_kind()
                ),
            ));
        }
        self.apply_save_hooks(entity);
        Ok((entity.to_document()?, is_new))
    }

    pub(crate) fn apply_save_hooks<E: Entity>(&self, entity: &mut E) {
        if let Some(modified_by) = &self.modified_by {
            entity.set_modified_by(modified_by);
        }
        self.hooks.before_save(entity);
    }

    /// Runs audit injection and the before-update hook on one update.
    pub(crate) fn apply_update_hooks<E: Entity>(&self, update: &mut Update) -> OdmResult<()> {
        if let (Some(field), Some(modified_by)) = (E::modified_by_field(), &self.modified_by) {
            let value = bson::ser::serialize_to_bson(modified_by)
                .map_err(|e| OdmError::serialization::<ModifiedBy>(e))?;
            update.push_op(crate::update::UpdateOp::Set(field.to_string(), value));
        }
        self.hooks.before_update(E::type_name(), update);
        Ok(())
    }

    async fn generate_id<E: Entity>(&self, collection: &str) -> OdmResult<EntityId> {
        match E::id_kind() {
            IdKind::Sequence => {
                let generator = self.sequence_for(collection).await?;
                IdKind::Sequence.generate(Some(&generator))
            }
            kind => kind.generate(None),
        }
    }

    /// The collection's sequence generator, created and seeded on first use.
    ///
    /// Seeding reads the current maximum identifier once; concurrent first
    /// callers race harmlessly because seeding only ever raises the counter.
    async fn sequence_for(&self, collection: &str) -> OdmResult<Arc<SequenceGenerator>> {
        if let Some(generator) = self.sequences.get(collection) {
            return Ok(Arc::clone(generator.value()));
        }
        let floor = match self.sequence_seed {
            Some(seed) => seed,
            None => self.max_sequence_id(collection).await? + 1,
        };
        let generator = Arc::clone(
            self.sequences
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(SequenceGenerator::new(floor)))
                .value(),
        );
        generator.seed_at_least(floor);
        debug!(collection, next = generator.peek(), "sequence generator ready");
        Ok(generator)
    }

    async fn max_sequence_id(&self, collection: &str) -> OdmResult<i64> {
        let query = Query::builder()
            .filter(Filter::exists("_id"))
            .sort(Sort::desc("_id"))
            .limit(1)
            .build();
        let top = self.backend.find(collection, query, self.session().await).await?;
        Ok(match top.first().and_then(|doc| doc.get("_id")) {
            Some(Bson::Int64(n)) => *n,
            Some(Bson::Int32(n)) => i64::from(*n),
            _ => 0,
        })
    }

    // ----------------------------------------------------------------- filters

    /// Merges the global filters applying to `type_name` around `caller`.
    ///
    /// Prepended filters come first, then the caller's filter, then appended
    /// ones, each in registration order.
    pub(crate) fn scoped_filter(
        &self,
        type_name: &'static str,
        caller: Option<Expr>,
        ignore_global: bool,
    ) -> Option<Expr> {
        if ignore_global {
            return caller;
        }
        let tags = self.schema.tags_of(type_name);
        let applicable = self
            .global_filters
            .iter()
            .filter(|g| g.applies_to(type_name, tags))
            .collect::<Vec<_>>();
        let around = |position: FilterPosition| {
            applicable
                .iter()
                .filter(move |g| g.position == position)
                .map(|g| g.expr.clone())
                .collect::<Vec<_>>()
        };
        conjunction(
            around(FilterPosition::Prepend)
                .into_iter()
                .chain(caller)
                .chain(around(FilterPosition::Append)),
        )
    }

    // ----------------------------------------------------------------- indexes

    /// Creates an index on `E`'s collection.
    pub async fn create_index<E: Entity>(&self, index: IndexModel) -> OdmResult<()> {
        let collection = self.collection_name::<E>().to_string();
        debug!(collection = %collection, index = %index.effective_name(), "creating index");
        self.backend.create_index(&collection, index).await
    }

    /// Creates a full-text index over `fields` of `E`'s collection.
    ///
    /// For fuzzy search, index the hash facet of each fuzzy field
    /// (see [`FuzzyString::hash_path`](crate::fuzzy::FuzzyString::hash_path)).
    pub async fn create_text_index<E: Entity>(&self, fields: &[&str]) -> OdmResult<()> {
        let keys = fields.iter().map(|f| (f.to_string(), IndexKind::Text));
        self.create_index::<E>(IndexModel::new(keys)).await
    }

    /// Ensures the join collection's indexes once per context.
    pub(crate) async fn ensure_join_indexes(&self, join_collection: &str) -> OdmResult<()> {
        if self.ensured_indexes.contains(join_collection) {
            return Ok(());
        }
        for index in join::indexes() {
            self.backend.create_index(join_collection, index).await?;
        }
        self.ensured_indexes.insert(join_collection.to_string());
        Ok(())
    }

    // ------------------------------------------------------------ transactions

    /// The session of the open transaction, if any.
    pub(crate) async fn session(&self) -> Option<SessionId> {
        *self.transaction.read().await
    }

    pub async fn has_transaction(&self) -> bool {
        self.session().await.is_some()
    }

    /// Opens a session and begins a transaction on it.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::TransactionState`] if a transaction is already
    /// open; the open transaction is left untouched.
    pub async fn start_transaction(&self) -> OdmResult<()> {
        let mut slot = self.transaction.write().await;
        if let Some(open) = *slot {
            return Err(OdmError::TransactionState(format!(
                "a transaction is already active on this context (session {})",
                open.0
            )));
        }
        let session = self.backend.start_transaction().await?;
        *slot = Some(session);
        info!(session = session.0, "transaction started");
        Ok(())
    }

    /// Commits the open transaction.
    ///
    /// The context is free for a new transaction afterwards, even if the
    /// commit fails.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::TransactionState`] if no transaction is open.
    pub async fn commit_transaction(&self) -> OdmResult<()> {
        let session = self.take_session("commit").await?;
        self.backend.commit_transaction(session).await?;
        info!(session = session.0, "transaction committed");
        Ok(())
    }

    /// Aborts the open transaction, discarding its writes.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::TransactionState`] if no transaction is open.
    pub async fn abort_transaction(&self) -> OdmResult<()> {
        let session = self.take_session("abort").await?;
        self.backend.abort_transaction(session).await?;
        info!(session = session.0, "transaction aborted");
        Ok(())
    }

    async fn take_session(&self, action: &str) -> OdmResult<SessionId> {
        self.transaction.write().await.take().ok_or_else(|| {
            OdmError::TransactionState(format!("cannot {action}: no transaction is active"))
        })
    }

    // ----------------------------------------------------------------- cascade

    /// Removes every join record referencing one of `ids` of type `type_name`.
    ///
    /// Inside a transaction every deletion runs in it and the first failure
    /// is returned immediately. Otherwise the deletions run one after another,
    /// failures are logged and the remaining collections are still cleaned;
    /// the first failure is returned at the end.
    pub(crate) async fn cascade_join_records(
        &self,
        type_name: &'static str,
        ids: &[EntityId],
        session: Option<SessionId>,
    ) -> OdmResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut removed = 0;
        let mut first_error = None;
        for (join_collection, keys) in self.schema.join_positions(type_name) {
            let filter = Filter::or(keys.iter().map(|key| Filter::ids_at(*key, ids)));
            match self.backend.delete(join_collection, filter, true, session).await {
                Ok(count) => removed += count,
                Err(e) if session.is_some() => return Err(e),
                Err(e) => {
                    warn!(
                        join_collection,
                        error = %e,
                        "join record cleanup failed; orphaned records may remain"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}
