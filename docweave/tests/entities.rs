mod common;

use bson::doc;
use common::{Author, Book, Reader, Recipe, context, schema};
use docweave::{
    memory::InMemoryStore,
    prelude::*,
};
use futures::future::join_all;
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

#[tokio::test]
async fn saved_entities_round_trip() {
    let ctx = context();
    let mut book = Book::new("Dune", 412);
    book.tags = vec!["classic".into(), "desert".into()];
    let summary = ctx.save(&mut book).await.unwrap();

    assert_eq!(summary.inserted, 1);
    assert!(!book.id.is_unset());
    assert_eq!(book.id.kind(), IdKind::ObjectId);
    let fetched = ctx.find::<Book>().one_by_id(&book.id).await.unwrap();
    assert_eq!(fetched, Some(book));
}

#[tokio::test]
async fn every_identifier_kind_is_generated() {
    let ctx = context();
    let mut author = Author::new("Le Guin");
    let mut reader = Reader::new("ged");
    let mut recipe = Recipe::new("Bread");
    ctx.save(&mut author).await.unwrap();
    ctx.save(&mut reader).await.unwrap();
    ctx.save(&mut recipe).await.unwrap();

    assert!(matches!(author.id, EntityId::Sequence(1)));
    assert!(matches!(reader.id, EntityId::Random(_)));
    assert!(matches!(&recipe.id, EntityId::String(s) if s.len() == 24));
    assert_eq!(ctx.find::<Reader>().one_by_id(&reader.id).await.unwrap(), Some(reader));
    assert_eq!(ctx.find::<Recipe>().one_by_id(&recipe.id).await.unwrap(), Some(recipe));
}

#[tokio::test]
async fn saving_again_replaces_instead_of_inserting() {
    let ctx = context();
    let mut author = Author::new("Banks");
    ctx.save(&mut author).await.unwrap();
    let first_id = author.id.clone();

    author.active = false;
    let summary = ctx.save(&mut author).await.unwrap();

    assert_eq!(author.id, first_id);
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.matched, 1);
    assert_eq!(ctx.find::<Author>().count().await.unwrap(), 1);
    let stored = ctx.find::<Author>().one_by_id(&first_id).await.unwrap().unwrap();
    assert!(!stored.active);
}

#[tokio::test]
async fn mismatched_identifier_kind_is_rejected() {
    let ctx = context();
    let mut book = Book::new("Wrong", 1);
    book.id = EntityId::Sequence(7);

    match ctx.save(&mut book).await {
        Err(OdmError::Serialization { type_name, .. }) => assert_eq!(type_name, "Book"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(ctx.find::<Book>().count().await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_saves_receive_distinct_sequence_ids() {
    let ctx = context();
    let saves = (0..64).map(|i| {
        let ctx = &ctx;
        async move {
            let mut author = Author::new(&format!("author {i}"));
            ctx.save(&mut author).await.unwrap();
            author.id
        }
    });
    let ids = join_all(saves).await;

    let distinct = ids.iter().collect::<HashSet<_>>();
    assert_eq!(distinct.len(), 64);
    assert_eq!(ctx.find::<Author>().count().await.unwrap(), 64);
}

#[tokio::test]
async fn sequences_continue_after_existing_documents() {
    let store = InMemoryStore::builder()
        .collection("authors", vec![doc! { "_id": 41_i64, "name": "Existing", "active": true }])
        .build()
        .await
        .unwrap();
    let ctx = Context::builder(store).schema(schema()).build();

    let mut author = Author::new("Next");
    ctx.save(&mut author).await.unwrap();
    assert_eq!(author.id, EntityId::Sequence(42));
}

#[tokio::test]
async fn configured_seed_starts_the_sequence() {
    let ctx = Context::builder(InMemoryStore::new())
        .schema(schema())
        .sequence_seed(1000)
        .build();
    let mut authors = vec![Author::new("a"), Author::new("b")];
    ctx.save_many(&mut authors).await.unwrap();

    let ids = authors.iter().map(|a| a.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids, vec![EntityId::Sequence(1000), EntityId::Sequence(1001)]);
}

#[tokio::test]
async fn save_many_mixes_inserts_and_replacements() {
    let ctx = context();
    let mut existing = Book::new("Old", 100);
    ctx.save(&mut existing).await.unwrap();
    existing.pages = 120;

    let mut books = vec![existing, Book::new("New", 50)];
    let summary = ctx.save_many(&mut books).await.unwrap();

    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.matched, 1);
    assert!(books.iter().all(|book| !book.id.is_unset()));
    let old = ctx.find::<Book>().one_by_id(&books[0].id).await.unwrap().unwrap();
    assert_eq!(old.pages, 120);
}

#[derive(Default)]
struct CountingHooks {
    saves: Arc<AtomicUsize>,
    updates: Arc<AtomicUsize>,
}

impl ContextHooks for CountingHooks {
    fn before_save(&self, entity: &mut dyn AnyEntity) {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if let Some(author) = entity.downcast_mut::<Author>() {
            author.name = author.name.to_uppercase();
        }
    }

    fn before_update(&self, _type_name: &'static str, update: &mut Update) {
        self.updates.fetch_add(1, Ordering::SeqCst);
        update.push_op(docweave::update::UpdateOp::Set("audited".into(), true.into()));
    }
}

#[tokio::test]
async fn hooks_and_audit_values_run_before_writes() {
    let hooks = CountingHooks::default();
    let saves = Arc::clone(&hooks.saves);
    let updates = Arc::clone(&hooks.updates);
    let ctx = Context::builder(InMemoryStore::new())
        .schema(schema())
        .hooks(hooks)
        .modified_by(ModifiedBy::new("7", "ada"))
        .build();

    let mut author = Author::new("quiet");
    ctx.save(&mut author).await.unwrap();
    assert_eq!(saves.load(Ordering::SeqCst), 1);
    assert_eq!(author.name, "QUIET");
    assert_eq!(author.modified_by, Some(ModifiedBy::new("7", "ada")));

    ctx.update::<Author>()
        .match_id(&author.id)
        .set("active", false)
        .execute()
        .await
        .unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    let raw = ctx
        .find::<Author>()
        .match_id(&author.id)
        .execute_as::<bson::Document>()
        .await
        .unwrap();
    assert!(raw[0].get_bool("audited").unwrap());
    assert_eq!(raw[0].get_document("modified_by").unwrap().get_str("user_name").unwrap(), "ada");
}
