//! Numbered, forward-only data migrations.
//!
//! A migration exposes one [`upgrade`](Migration::upgrade) step. The runner
//! applies pending migrations strictly in ascending number order and records
//! each one in the history collection only after it completes. A failing
//! migration stops the run; nothing already applied is rolled back and the
//! failing one is not recorded, so it runs again next time.
//!
//! # Example
//!
//! ```ignore
//! use docweave::migrate::{Migration, MigrationRef, Migrations, Migrator};
//!
//! struct AddAuthorIndex;
//!
//! #[async_trait::async_trait]
//! impl Migration for AddAuthorIndex {
//!     fn number(&self) -> u32 { 1 }
//!     fn name(&self) -> &'static str { "add author index" }
//!
//!     async fn upgrade(&self, ctx: &Context) -> OdmResult<()> {
//!         ctx.create_text_index::<Author>(&["name"]).await
//!     }
//! }
//!
//! struct AppMigrations;
//!
//! impl Migrations for AppMigrations {
//!     fn migrations() -> Vec<MigrationRef> {
//!         vec![Box::new(AddAuthorIndex)]
//!     }
//! }
//!
//! let applied = ctx.migrate::<AppMigrations>().await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, marker::PhantomData, time::Instant};
use tracing::info;

use crate::{
    context::Context,
    entity::decode,
    error::{OdmError, OdmResult},
    filter::{Query, Sort},
};

/// Collection holding one record per applied migration.
pub const HISTORY_COLLECTION: &str = "_migration_history";

/// A single migration step.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Position in the run order. Must be unique within a registry.
    fn number(&self) -> u32;

    fn name(&self) -> &'static str;

    /// Applies the migration.
    ///
    /// # Errors
    ///
    /// Any error halts the run and is reported wrapped in
    /// [`OdmError::Migration`].
    async fn upgrade(&self, ctx: &Context) -> OdmResult<()>;
}

pub type MigrationRef = Box<dyn Migration>;

/// Registry of every migration an application knows about.
pub trait Migrations: Send + Sync {
    fn migrations() -> Vec<MigrationRef>;
}

/// A row of the history collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub number: u32,
    pub name: String,
    pub time_taken_seconds: f64,
    pub applied_at: DateTime<Utc>,
}

/// Applies the migrations of registry `M`.
pub struct MigrationRunner<M: Migrations> {
    migrations: Vec<MigrationRef>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Migrations> Default for MigrationRunner<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Migrations> MigrationRunner<M> {
    pub fn new() -> Self {
        let mut migrations = M::migrations();
        migrations.sort_by_key(|migration| migration.number());
        Self { migrations, _marker: PhantomData }
    }

    /// History records, oldest number first.
    pub async fn applied(&self, ctx: &Context) -> OdmResult<Vec<MigrationRecord>> {
        let query = Query::builder().sort(Sort::asc("number")).build();
        let session = ctx.session().await;
        ctx.backend()
            .find(HISTORY_COLLECTION, query, session)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Migrations not yet recorded, in run order.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::Validation`] if two migrations share a number.
    pub async fn pending(&self, ctx: &Context) -> OdmResult<Vec<&MigrationRef>> {
        let applied = self.applied(ctx).await?.iter().map(|record| record.number).collect();
        plan(&self.migrations, &applied, None)
    }

    /// Applies every pending migration.
    pub async fn upgrade(&self, ctx: &Context) -> OdmResult<Vec<MigrationRecord>> {
        self.run(ctx, None).await
    }

    /// Applies pending migrations numbered up to and including `target`.
    pub async fn upgrade_to(&self, ctx: &Context, target: u32) -> OdmResult<Vec<MigrationRecord>> {
        self.run(ctx, Some(target)).await
    }

    async fn run(&self, ctx: &Context, target: Option<u32>) -> OdmResult<Vec<MigrationRecord>> {
        let applied = self.applied(ctx).await?.iter().map(|record| record.number).collect();
        let pending = plan(&self.migrations, &applied, target)?;
        if pending.is_empty() {
            info!("no pending migrations");
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(pending.len());
        for migration in pending {
            let (number, name) = (migration.number(), migration.name());
            info!(number, name, "applying migration");
            let started = Instant::now();
            migration.upgrade(ctx).await.map_err(|source| OdmError::Migration {
                number,
                name: name.to_string(),
                source: Box::new(source),
            })?;

            let record = MigrationRecord {
                number,
                name: name.to_string(),
                time_taken_seconds: started.elapsed().as_secs_f64(),
                applied_at: Utc::now(),
            };
            let document = bson::ser::serialize_to_document(&record)
                .map_err(OdmError::serialization::<MigrationRecord>)?;
            let session = ctx.session().await;
            ctx.backend().insert_many(HISTORY_COLLECTION, vec![document], session).await?;
            info!(number, name, seconds = record.time_taken_seconds, "migration applied");
            records.push(record);
        }
        Ok(records)
    }
}

/// Selects the migrations to run, in order.
fn plan<'m>(
    migrations: &'m [MigrationRef],
    applied: &BTreeSet<u32>,
    target: Option<u32>,
) -> OdmResult<Vec<&'m MigrationRef>> {
    let mut seen = BTreeSet::new();
    for migration in migrations {
        if !seen.insert(migration.number()) {
            return Err(OdmError::validation(format!(
                "migration number {} is used more than once",
                migration.number()
            )));
        }
    }
    let mut pending = migrations
        .iter()
        .filter(|migration| !applied.contains(&migration.number()))
        .filter(|migration| target.is_none_or(|target| migration.number() <= target))
        .collect::<Vec<_>>();
    pending.sort_by_key(|migration| migration.number());
    Ok(pending)
}

/// Runs migrations through a context.
#[async_trait]
pub trait Migrator: Send + Sync {
    /// Applies every pending migration of `M`, returning what was applied.
    async fn migrate<M: Migrations>(&self) -> OdmResult<Vec<MigrationRecord>>;

    /// Applies pending migrations of `M` up to and including `target`.
    async fn migrate_to<M: Migrations>(&self, target: u32) -> OdmResult<Vec<MigrationRecord>>;
}

#[async_trait]
impl Migrator for Context {
    async fn migrate<M: Migrations>(&self) -> OdmResult<Vec<MigrationRecord>> {
        MigrationRunner::<M>::new().upgrade(self).await
    }

    async fn migrate_to<M: Migrations>(&self, target: u32) -> OdmResult<Vec<MigrationRecord>> {
        MigrationRunner::<M>::new().upgrade_to(self, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Step(u32);

    #[async_trait]
    impl Migration for Step {
        fn number(&self) -> u32 {
            self.0
        }

        fn name(&self) -> &'static str {
            "step"
        }

        async fn upgrade(&self, _ctx: &Context) -> OdmResult<()> {
            Ok(())
        }
    }

    fn steps(numbers: &[u32]) -> Vec<MigrationRef> {
        numbers.iter().map(|n| Box::new(Step(*n)) as MigrationRef).collect()
    }

    fn numbers(pending: Vec<&MigrationRef>) -> Vec<u32> {
        pending.into_iter().map(|m| m.number()).collect()
    }

    #[test]
    fn pending_runs_ascending_and_skips_applied() {
        let migrations = steps(&[3, 1, 2, 5]);
        let applied = BTreeSet::from([1, 3]);
        assert_eq!(numbers(plan(&migrations, &applied, None).unwrap()), vec![2, 5]);
    }

    #[test]
    fn target_caps_the_run() {
        let migrations = steps(&[1, 2, 3]);
        let pending = plan(&migrations, &BTreeSet::new(), Some(2)).unwrap();
        assert_eq!(numbers(pending), vec![1, 2]);
    }

    #[test]
    fn duplicate_numbers_are_rejected() {
        let migrations = steps(&[1, 2, 2]);
        let err = plan(&migrations, &BTreeSet::new(), None).err().unwrap();
        assert!(err.is_validation());
    }
}
