//! Typed references between entities.
//!
//! [`One`] is a single reference kept inside the referring document as the
//! target's identifier. [`Many`] is a descriptor over a join collection: it
//! never holds loaded entities, and every operation is an explicit round trip.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::{fmt, marker::PhantomData};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    backend::{UpdateSpec, WriteModel, WriteSummary},
    command::{Criteria, race},
    context::Context,
    entity::{Entity, EntityExt},
    error::{OdmError, OdmResult},
    filter::{Expr, Filter, Sort},
    id::EntityId,
    join::{self, JoinRecord},
    pipeline::Stage,
    update::Update,
};

/// A reference to exactly one entity of type `T`, stored as its identifier.
///
/// Nothing is loaded until [`to_entity`](Self::to_entity) is called.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct One<T> {
    id: EntityId,
    #[serde(skip)]
    _target: PhantomData<fn() -> T>,
}

impl<T: Entity> One<T> {
    /// References a saved entity.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] if `target` has not been saved.
    pub fn new(target: &T) -> OdmResult<Self> {
        if target.id().is_unset() {
            return Err(OdmError::validation(format!(
                "cannot reference an unsaved {}",
                T::type_name()
            )));
        }
        Ok(Self::from_id(target.id().clone()))
    }

    pub fn from_id(id: EntityId) -> Self {
        Self { id, _target: PhantomData }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Fetches the referenced entity. A dangling reference yields `None`.
    pub async fn to_entity(&self, ctx: &Context) -> OdmResult<Option<T>> {
        ctx.find::<T>().one_by_id(&self.id).await
    }
}

impl<T> Clone for One<T> {
    fn clone(&self) -> Self {
        Self { id: self.id.clone(), _target: PhantomData }
    }
}

impl<T> PartialEq for One<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> fmt::Debug for One<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("One").field(&self.id).finish()
    }
}

const RELATED: &str = "__related";

/// The children of one parent through a declared relation.
///
/// Obtained from [`Context::many`]. From the inverse endpoint of a
/// many-to-many relation the same join collection is used with the key
/// positions swapped.
pub struct Many<'a, P, C> {
    ctx: &'a Context,
    parent_id: EntityId,
    join_collection: String,
    self_key: &'static str,
    other_key: &'static str,
    _types: PhantomData<fn() -> (P, C)>,
}

impl<'a, P: Entity, C: Entity> Many<'a, P, C> {
    pub(crate) fn bind(ctx: &'a Context, parent: &P, property: &str) -> OdmResult<Self> {
        let Some((relation, side)) = ctx.schema().relation(P::type_name(), property) else {
            return Err(OdmError::validation(format!(
                "{} declares no relation named '{property}'",
                P::type_name()
            )));
        };
        let target = relation.other_type(side);
        if target != C::type_name() {
            return Err(OdmError::validation(format!(
                "relation {}.{property} leads to {target}, not {}",
                P::type_name(),
                C::type_name()
            )));
        }
        if parent.id().is_unset() {
            return Err(OdmError::validation(format!(
                "save the {} before navigating its relations",
                P::type_name()
            )));
        }
        let (self_key, other_key) = join::keys_for(side);
        Ok(Self {
            ctx,
            parent_id: parent.id().clone(),
            join_collection: relation.join_collection.clone(),
            self_key,
            other_key,
            _types: PhantomData,
        })
    }

    pub fn join_collection(&self) -> &str {
        &self.join_collection
    }

    fn pair_filter(&self, child: &EntityId) -> Expr {
        Filter::and([
            Filter::eq(self.self_key, self.parent_id.to_bson()),
            Filter::eq(self.other_key, child.to_bson()),
        ])
    }

    fn pair_update(&self, child: &EntityId) -> Update {
        Update::new()
            .set(self.self_key, self.parent_id.to_bson())
            .set(self.other_key, child.to_bson())
    }

    fn saved_id(child: &C) -> OdmResult<&EntityId> {
        if child.id().is_unset() {
            return Err(OdmError::validation(format!(
                "save the {} before relating it",
                C::type_name()
            )));
        }
        Ok(child.id())
    }

    /// Links `child` to the parent. Linking an already linked pair leaves a
    /// single join record.
    pub async fn add(&self, child: &C) -> OdmResult<WriteSummary> {
        let child_id = Self::saved_id(child)?;
        self.ctx.ensure_join_indexes(&self.join_collection).await?;
        let spec = UpdateSpec::one(self.pair_filter(child_id), self.pair_update(child_id)).upsert(true);
        debug!(join_collection = %self.join_collection, child = %child_id, "adding relation");
        let session = self.ctx.session().await;
        self.ctx.backend().update(&self.join_collection, spec, session).await
    }

    /// Links several children in one bulk write.
    pub async fn add_many(&self, children: &[C]) -> OdmResult<WriteSummary> {
        if children.is_empty() {
            return Ok(WriteSummary::default());
        }
        let mut models = Vec::with_capacity(children.len());
        for child in children {
            let child_id = Self::saved_id(child)?;
            models.push(WriteModel::UpdateOne {
                filter: self.pair_filter(child_id),
                update: self.pair_update(child_id),
                upsert: true,
            });
        }
        self.ctx.ensure_join_indexes(&self.join_collection).await?;
        debug!(join_collection = %self.join_collection, count = models.len(), "adding relations");
        let session = self.ctx.session().await;
        self.ctx.backend().bulk_write(&self.join_collection, models, session).await
    }

    /// Unlinks `child`. Unlinking a pair that is not linked does nothing.
    pub async fn remove(&self, child: &C) -> OdmResult<u64> {
        let session = self.ctx.session().await;
        self.ctx
            .backend()
            .delete(&self.join_collection, self.pair_filter(child.id()), false, session)
            .await
    }

    /// Unlinks several children in one round trip.
    pub async fn remove_many(&self, children: &[C]) -> OdmResult<u64> {
        if children.is_empty() {
            return Ok(0);
        }
        let filter = Filter::and([
            Filter::eq(self.self_key, self.parent_id.to_bson()),
            Filter::ids_at(self.other_key, children.iter().map(|child| child.id())),
        ]);
        let session = self.ctx.session().await;
        self.ctx.backend().delete(&self.join_collection, filter, true, session).await
    }

    /// A lazy query over the related entities.
    pub fn children(&self) -> ChildrenQuery<'_, 'a, P, C> {
        ChildrenQuery {
            many: self,
            criteria: Criteria::default(),
            sort: Vec::new(),
            skip: None,
            limit: None,
            token: None,
        }
    }

    /// Number of related entities, after global filters.
    pub async fn child_count(&self) -> OdmResult<u64> {
        self.children().count().await
    }

    /// The raw join records of this parent.
    pub async fn join_records(&self) -> OdmResult<Vec<JoinRecord>> {
        let query = crate::filter::Query::builder()
            .filter(Filter::eq(self.self_key, self.parent_id.to_bson()))
            .build();
        let session = self.ctx.session().await;
        self.ctx
            .backend()
            .find(&self.join_collection, query, session)
            .await?
            .into_iter()
            .map(crate::entity::decode)
            .collect()
    }
}

/// Related entities, materialized by one lookup aggregation over the join
/// collection and the target collection.
pub struct ChildrenQuery<'m, 'a, P, C> {
    many: &'m Many<'a, P, C>,
    criteria: Criteria,
    sort: Vec<Sort>,
    skip: Option<u64>,
    limit: Option<u64>,
    token: Option<CancellationToken>,
}

impl<P: Entity, C: Entity> ChildrenQuery<'_, '_, P, C> {
    /// Filters the related entities. Paths are relative to the child.
    pub fn matching(mut self, expr: Expr) -> Self {
        self.criteria.push(expr);
        self
    }

    pub fn match_raw(mut self, document: Document) -> Self {
        self.criteria.match_raw(document);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort.push(sort);
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

    pub fn ignore_global_filters(mut self) -> Self {
        self.criteria.ignore_global();
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    fn related_stages(&self) -> OdmResult<Vec<Stage>> {
        self.criteria.validate()?;
        let many = self.many;
        let mut stages = vec![
            Stage::Match(Filter::eq(many.self_key, many.parent_id.to_bson())),
            Stage::Lookup {
                from: many.ctx.collection_name::<C>().to_string(),
                local_field: many.other_key.to_string(),
                foreign_field: "_id".to_string(),
                as_field: RELATED.to_string(),
            },
            Stage::Unwind(RELATED.to_string()),
            Stage::ReplaceRoot(RELATED.to_string()),
        ];
        if let Some(filter) = self.criteria.resolve::<C>(many.ctx) {
            stages.push(Stage::Match(filter));
        }
        Ok(stages)
    }

    async fn aggregate(&self, stages: Vec<Stage>) -> OdmResult<Vec<Document>> {
        stages.iter().try_for_each(Stage::validate)?;
        let many = self.many;
        debug!(join_collection = %many.join_collection, "loading related entities");
        let session = many.ctx.session().await;
        race(
            self.token.as_ref(),
            many.ctx.backend().aggregate(&many.join_collection, stages, session),
        )
        .await
    }

    /// Loads the related entities.
    pub async fn execute(self) -> OdmResult<Vec<C>> {
        let mut stages = self.related_stages()?;
        if !self.sort.is_empty() {
            stages.push(Stage::Sort(self.sort.clone()));
        }
        if let Some(skip) = self.skip {
            stages.push(Stage::Skip(skip));
        }
        if let Some(limit) = self.limit {
            stages.push(Stage::Limit(limit));
        }
        self.aggregate(stages).await?.into_iter().map(C::from_document).collect()
    }

    /// Counts the related entities, ignoring sort, skip and limit.
    pub async fn count(self) -> OdmResult<u64> {
        let mut stages = self.related_stages()?;
        stages.push(Stage::Count("count".to_string()));
        let output = self.aggregate(stages).await?;
        Ok(match output.first().and_then(|doc| doc.get("count")) {
            Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or_default(),
            Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or_default(),
            _ => 0,
        })
    }
}
