mod common;

use common::{Author, Book, Reader, context, titles};
use docweave::prelude::*;

async fn saved<E: Entity>(ctx: &Context, mut entity: E) -> E {
    ctx.save(&mut entity).await.unwrap();
    entity
}

#[tokio::test]
async fn linking_twice_keeps_one_join_record() {
    let ctx = context();
    let author = saved(&ctx, Author::new("Jemisin")).await;
    let book = saved(&ctx, Book::new("The Fifth Season", 468)).await;

    let books = ctx.many::<Author, Book>(&author, "books").unwrap();
    books.add(&book).await.unwrap();
    books.add(&book).await.unwrap();

    let records = books.join_records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].parent_id, author.id);
    assert_eq!(records[0].child_id, book.id);
    assert_eq!(books.child_count().await.unwrap(), 1);
}

#[tokio::test]
async fn children_are_loaded_through_the_join_collection() {
    let ctx = context();
    let author = saved(&ctx, Author::new("Pratchett")).await;
    let other = saved(&ctx, Author::new("Gaiman")).await;
    let mut shelf = vec![Book::new("Mort", 243), Book::new("Eric", 155), Book::new("Sourcery", 270)];
    ctx.save_many(&mut shelf).await.unwrap();
    let unrelated = saved(&ctx, Book::new("Coraline", 162)).await;

    ctx.many::<Author, Book>(&author, "books").unwrap().add_many(&shelf).await.unwrap();
    ctx.many::<Author, Book>(&other, "books").unwrap().add(&unrelated).await.unwrap();

    let books = ctx.many::<Author, Book>(&author, "books").unwrap();
    let all = books.children().sort(Sort::asc("title")).execute().await.unwrap();
    assert_eq!(titles(&all), vec!["Eric", "Mort", "Sourcery"]);

    let long = books
        .children()
        .matching(Filter::gt("pages", 200))
        .sort(Sort::desc("pages"))
        .limit(1)
        .execute()
        .await
        .unwrap();
    assert_eq!(titles(&long), vec!["Sourcery"]);
    assert_eq!(books.children().matching(Filter::gt("pages", 200)).count().await.unwrap(), 2);
    assert_eq!(books.children().sort(Sort::asc("title")).skip(2).execute().await.unwrap().len(), 1);
}

#[tokio::test]
async fn removing_links_leaves_entities_alone() {
    let ctx = context();
    let author = saved(&ctx, Author::new("Wolfe")).await;
    let mut shelf = vec![Book::new("Shadow", 300), Book::new("Claw", 310), Book::new("Sword", 320)];
    ctx.save_many(&mut shelf).await.unwrap();

    let books = ctx.many::<Author, Book>(&author, "books").unwrap();
    books.add_many(&shelf).await.unwrap();
    assert_eq!(books.remove(&shelf[0]).await.unwrap(), 1);
    assert_eq!(books.remove(&shelf[0]).await.unwrap(), 0);
    assert_eq!(books.remove_many(&shelf[1..]).await.unwrap(), 2);

    assert_eq!(books.child_count().await.unwrap(), 0);
    assert_eq!(ctx.find::<Book>().count().await.unwrap(), 3);
}

#[tokio::test]
async fn many_to_many_is_navigable_from_both_ends() {
    let ctx = context();
    let book = saved(&ctx, Book::new("Piranesi", 272)).await;
    let other = saved(&ctx, Book::new("Jonathan Strange", 782)).await;
    let ann = saved(&ctx, Reader::new("ann")).await;
    let bo = saved(&ctx, Reader::new("bo")).await;

    let readers = ctx.many::<Book, Reader>(&book, "readers").unwrap();
    readers.add_many(&[ann.clone(), bo.clone()]).await.unwrap();
    ctx.many::<Book, Reader>(&other, "readers").unwrap().add(&ann).await.unwrap();

    let read_by_ann = ctx.many::<Reader, Book>(&ann, "books_read").unwrap();
    assert_eq!(read_by_ann.join_collection(), readers.join_collection());
    let mut read = titles(&read_by_ann.children().execute().await.unwrap())
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
    read.sort();
    assert_eq!(read, vec!["Jonathan Strange", "Piranesi"]);

    let read_by_bo = ctx.many::<Reader, Book>(&bo, "books_read").unwrap();
    assert_eq!(read_by_bo.child_count().await.unwrap(), 1);

    read_by_bo.remove(&book).await.unwrap();
    assert_eq!(readers.child_count().await.unwrap(), 1);
}

#[tokio::test]
async fn undeclared_or_mistyped_relations_are_rejected() {
    let ctx = context();
    let author = saved(&ctx, Author::new("Mieville")).await;

    assert!(matches!(ctx.many::<Author, Book>(&author, "novels"), Err(e) if e.is_validation()));
    assert!(matches!(ctx.many::<Author, Reader>(&author, "books"), Err(e) if e.is_validation()));
    assert!(matches!(
        ctx.many::<Author, Book>(&Author::new("unsaved"), "books"),
        Err(e) if e.is_validation()
    ));

    let books = ctx.many::<Author, Book>(&author, "books").unwrap();
    assert!(books.add(&Book::new("unsaved", 1)).await.unwrap_err().is_validation());
}

#[tokio::test]
async fn deleting_an_entity_removes_its_join_records() {
    let ctx = context();
    let author = saved(&ctx, Author::new("Leckie")).await;
    let mut shelf = vec![Book::new("Ancillary Justice", 386), Book::new("Ancillary Sword", 356)];
    ctx.save_many(&mut shelf).await.unwrap();
    let reader = saved(&ctx, Reader::new("breq")).await;

    ctx.many::<Author, Book>(&author, "books").unwrap().add_many(&shelf).await.unwrap();
    for book in &shelf {
        ctx.many::<Book, Reader>(book, "readers").unwrap().add(&reader).await.unwrap();
    }

    let summary = ctx.delete::<Book>().match_id(&shelf[0].id).execute().await.unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.join_records_deleted, 2);

    let books = ctx.many::<Author, Book>(&author, "books").unwrap();
    assert_eq!(books.join_records().await.unwrap().len(), 1);
    let read = ctx.many::<Reader, Book>(&reader, "books_read").unwrap();
    assert_eq!(read.child_count().await.unwrap(), 1);

    let summary = ctx.delete::<Author>().match_id(&author.id).execute().await.unwrap();
    assert_eq!((summary.deleted, summary.join_records_deleted), (1, 1));
    assert_eq!(ctx.find::<Book>().count().await.unwrap(), 1);
}

#[tokio::test]
async fn single_references_resolve_lazily() {
    let ctx = context();
    let author = saved(&ctx, Author::new("Herbert")).await;
    let mut book = Book::new("Dune", 412);
    book.author = Some(One::new(&author).unwrap());
    ctx.save(&mut book).await.unwrap();

    let stored = ctx.find::<Book>().one_by_id(&book.id).await.unwrap().unwrap();
    let reference = stored.author.unwrap();
    assert_eq!(reference.id(), &author.id);
    assert_eq!(reference.to_entity(&ctx).await.unwrap(), Some(author.clone()));

    ctx.delete::<Author>().match_id(&author.id).execute().await.unwrap();
    assert_eq!(reference.to_entity(&ctx).await.unwrap(), None);
    assert!(One::new(&Author::new("unsaved")).is_err());
}
