mod common;

use bson::doc;
use common::{Author, Book, context};
use docweave::{
    migrate::{HISTORY_COLLECTION, MigrationRunner},
    prelude::*,
};

struct IndexTitles;

#[async_trait]
impl Migration for IndexTitles {
    fn number(&self) -> u32 {
        1
    }

    fn name(&self) -> &'static str {
        "index book titles"
    }

    async fn upgrade(&self, ctx: &Context) -> OdmResult<()> {
        ctx.create_index::<Book>(IndexModel::new([("title".to_string(), IndexKind::Asc)]).unique(true))
            .await
    }
}

struct ActivateAuthors;

#[async_trait]
impl Migration for ActivateAuthors {
    fn number(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "activate authors"
    }

    async fn upgrade(&self, ctx: &Context) -> OdmResult<()> {
        ctx.update::<Author>().match_all().set("active", true).execute().await?;
        Ok(())
    }
}

/// Fails until a `gates` document says otherwise.
struct Gated;

#[async_trait]
impl Migration for Gated {
    fn number(&self) -> u32 {
        3
    }

    fn name(&self) -> &'static str {
        "gated"
    }

    async fn upgrade(&self, ctx: &Context) -> OdmResult<()> {
        let open = ctx.backend().count("gates", None, None).await?;
        if open == 0 {
            return Err(OdmError::validation("gate closed"));
        }
        Ok(())
    }
}

struct Library;

impl Migrations for Library {
    fn migrations() -> Vec<MigrationRef> {
        // Registration order does not matter.
        vec![Box::new(ActivateAuthors), Box::new(IndexTitles)]
    }
}

struct GatedLibrary;

impl Migrations for GatedLibrary {
    fn migrations() -> Vec<MigrationRef> {
        vec![Box::new(IndexTitles), Box::new(Gated), Box::new(ActivateAuthors)]
    }
}

fn numbers(records: &[MigrationRecord]) -> Vec<u32> {
    records.iter().map(|record| record.number).collect()
}

#[tokio::test]
async fn pending_migrations_run_once_in_order() {
    let ctx = context();
    let mut author = Author::new("Dormant");
    author.active = false;
    ctx.save(&mut author).await.unwrap();

    let applied = ctx.migrate::<Library>().await.unwrap();
    assert_eq!(numbers(&applied), vec![1, 2]);
    assert_eq!(applied[0].name, "index book titles");
    assert!(applied.iter().all(|record| record.time_taken_seconds >= 0.0));

    let stored = ctx.find::<Author>().one_by_id(&author.id).await.unwrap().unwrap();
    assert!(stored.active);
    ctx.save(&mut Book::new("Unique", 1)).await.unwrap();
    assert!(ctx.save(&mut Book::new("Unique", 2)).await.is_err());

    assert!(ctx.migrate::<Library>().await.unwrap().is_empty());
    let history = MigrationRunner::<Library>::new().applied(&ctx).await.unwrap();
    assert_eq!(numbers(&history), vec![1, 2]);
}

#[tokio::test]
async fn targets_cap_the_run() {
    let ctx = context();
    let applied = ctx.migrate_to::<Library>(1).await.unwrap();
    assert_eq!(numbers(&applied), vec![1]);

    let runner = MigrationRunner::<Library>::new();
    let pending = runner.pending(&ctx).await.unwrap();
    assert_eq!(pending.iter().map(|m| m.number()).collect::<Vec<_>>(), vec![2]);

    assert_eq!(numbers(&runner.upgrade(&ctx).await.unwrap()), vec![2]);
    assert!(runner.pending(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn a_failing_migration_halts_and_reruns_later() {
    let ctx = context();

    match ctx.migrate::<GatedLibrary>().await {
        Err(OdmError::Migration { number, name, source }) => {
            assert_eq!((number, name.as_str()), (3, "gated"));
            assert!(source.is_validation());
        }
        other => panic!("unexpected result: {other:?}"),
    }
    let history = MigrationRunner::<GatedLibrary>::new().applied(&ctx).await.unwrap();
    assert_eq!(numbers(&history), vec![1, 2]);

    ctx.backend().insert_many("gates", vec![doc! { "open": true }], None).await.unwrap();
    let applied = ctx.migrate::<GatedLibrary>().await.unwrap();
    assert_eq!(numbers(&applied), vec![3]);

    let rows = ctx.backend().count(HISTORY_COLLECTION, None, None).await.unwrap();
    assert_eq!(rows, 3);
}
