mod common;

use common::{Author, Book, Recipe, context, schema};
use docweave::{memory::InMemoryStore, prelude::*};

#[tokio::test]
async fn committed_writes_become_visible() {
    let store = InMemoryStore::new();
    let ctx = Context::builder(store.clone()).schema(schema()).build();
    let outside = Context::builder(store).schema(schema()).build();
    ctx.start_transaction().await.unwrap();
    assert!(ctx.has_transaction().await);

    let mut book = Book::new("Kindred", 264);
    ctx.save(&mut book).await.unwrap();
    assert_eq!(ctx.find::<Book>().count().await.unwrap(), 1);

    assert_eq!(outside.find::<Book>().count().await.unwrap(), 0);

    ctx.commit_transaction().await.unwrap();
    assert!(!ctx.has_transaction().await);
    assert_eq!(outside.find::<Book>().one_by_id(&book.id).await.unwrap(), Some(book));
}

#[tokio::test]
async fn aborted_writes_are_discarded() {
    let ctx = context();
    let mut kept = Book::new("Kept", 10);
    ctx.save(&mut kept).await.unwrap();

    ctx.start_transaction().await.unwrap();
    ctx.save(&mut Book::new("Dropped", 20)).await.unwrap();
    ctx.delete::<Book>().match_id(&kept.id).execute().await.unwrap();
    assert_eq!(ctx.find::<Book>().count().await.unwrap(), 1);
    ctx.abort_transaction().await.unwrap();

    let remaining = ctx.find::<Book>().execute().await.unwrap();
    assert_eq!(remaining, vec![kept]);
}

#[tokio::test]
async fn transaction_state_is_enforced() {
    let ctx = context();
    assert!(matches!(ctx.commit_transaction().await, Err(OdmError::TransactionState(_))));
    assert!(matches!(ctx.abort_transaction().await, Err(OdmError::TransactionState(_))));

    ctx.start_transaction().await.unwrap();
    assert!(matches!(ctx.start_transaction().await, Err(OdmError::TransactionState(_))));
    assert!(ctx.has_transaction().await);

    ctx.commit_transaction().await.unwrap();
    ctx.start_transaction().await.unwrap();
    ctx.abort_transaction().await.unwrap();
}

#[tokio::test]
async fn relation_writes_join_the_transaction() {
    let ctx = context();
    let mut author = Author::new("Butler");
    let mut book = Book::new("Dawn", 248);
    ctx.save(&mut author).await.unwrap();
    ctx.save(&mut book).await.unwrap();

    ctx.start_transaction().await.unwrap();
    let books = ctx.many::<Author, Book>(&author, "books").unwrap();
    books.add(&book).await.unwrap();
    assert_eq!(books.child_count().await.unwrap(), 1);
    ctx.abort_transaction().await.unwrap();

    assert_eq!(books.child_count().await.unwrap(), 0);
}

#[tokio::test]
async fn cascades_inside_a_transaction_roll_back_with_it() {
    let ctx = context();
    let mut author = Author::new("Tolkien");
    let mut book = Book::new("The Hobbit", 310);
    ctx.save(&mut author).await.unwrap();
    ctx.save(&mut book).await.unwrap();
    let books = ctx.many::<Author, Book>(&author, "books").unwrap();
    books.add(&book).await.unwrap();

    ctx.start_transaction().await.unwrap();
    let summary = ctx.delete::<Book>().match_id(&book.id).execute().await.unwrap();
    assert_eq!((summary.deleted, summary.join_records_deleted), (1, 1));
    assert!(books.join_records().await.unwrap().is_empty());
    ctx.abort_transaction().await.unwrap();

    assert_eq!(ctx.find::<Book>().one_by_id(&book.id).await.unwrap(), Some(book.clone()));
    let records = books.join_records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].child_id, book.id);

    ctx.start_transaction().await.unwrap();
    ctx.delete::<Book>().match_id(&book.id).execute().await.unwrap();
    ctx.commit_transaction().await.unwrap();
    assert!(books.join_records().await.unwrap().is_empty());
}

fn filtered(position: FilterPosition) -> Context {
    Context::builder(InMemoryStore::new())
        .schema(schema())
        .global_filter::<Author>(Filter::eq("active", true), position)
        .global_filter_for_tag("soft_delete", Filter::eq("deleted", false), position)
        .build()
}

async fn seed(ctx: &Context) {
    let mut authors = vec![Author::new("Ann"), Author::new("Bea"), Author::new("Cid")];
    authors[1].active = false;
    ctx.save_many(&mut authors).await.unwrap();

    let mut recipes = vec![Recipe::new("Bread"), Recipe::new("Stew")];
    recipes[0].deleted = true;
    ctx.save_many(&mut recipes).await.unwrap();
}

fn names(authors: &[Author]) -> Vec<&str> {
    authors.iter().map(|a| a.name.as_str()).collect()
}

#[tokio::test]
async fn type_filters_apply_to_every_read() {
    let ctx = filtered(FilterPosition::Prepend);
    seed(&ctx).await;

    let found = ctx.find::<Author>().sort(Sort::asc("name")).execute().await.unwrap();
    assert_eq!(names(&found), vec!["Ann", "Cid"]);
    assert_eq!(ctx.find::<Author>().count().await.unwrap(), 2);
    let page = ctx.paged_search::<Author>().execute().await.unwrap();
    assert_eq!(page.total_count, 2);

    let everyone = ctx.find::<Author>().ignore_global_filters().count().await.unwrap();
    assert_eq!(everyone, 3);
}

#[tokio::test]
async fn tag_filters_apply_to_tagged_types() {
    let ctx = filtered(FilterPosition::Append);
    seed(&ctx).await;

    let recipes = ctx.find::<Recipe>().execute().await.unwrap();
    assert_eq!(recipes.len(), 1);
    assert_eq!(recipes[0].name.value, "Stew");
    assert_eq!(ctx.find::<Recipe>().ignore_global_filters().count().await.unwrap(), 2);
}

#[tokio::test]
async fn filter_position_does_not_change_results() {
    let prepended = filtered(FilterPosition::Prepend);
    let appended = filtered(FilterPosition::Append);
    seed(&prepended).await;
    seed(&appended).await;

    let mut results = Vec::new();
    for ctx in [&prepended, &appended] {
        let found = ctx
            .find::<Author>()
            .matching(Filter::starts_with("name", "A").or(Filter::starts_with("name", "B")))
            .sort(Sort::asc("name"))
            .execute()
            .await
            .unwrap();
        results.push(found);
    }
    let (first, second) = (&results[0], &results[1]);
    assert_eq!(names(first), vec!["Ann"]);
    assert_eq!(names(first), names(second));
}

#[tokio::test]
async fn global_filters_guard_writes() {
    let ctx = filtered(FilterPosition::Prepend);
    seed(&ctx).await;

    let summary = ctx.update::<Author>().match_all().set("name", "renamed").execute().await.unwrap();
    assert_eq!(summary.matched, 2);
    let summary = ctx.delete::<Author>().match_all().execute().await.unwrap();
    assert_eq!(summary.deleted, 2);

    let left = ctx.find::<Author>().ignore_global_filters().execute().await.unwrap();
    assert_eq!(names(&left), vec!["Bea"]);
}
