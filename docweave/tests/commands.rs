mod common;

use common::{Author, Book, context, titles};
use docweave::prelude::*;
use futures::TryStreamExt;

async fn shelf(ctx: &Context) -> Vec<Book> {
    let mut books = vec![
        Book::new("Anathem", 937),
        Book::new("Bone", 1332),
        Book::new("Circe", 393),
        Book::new("Dune", 412),
        Book::new("Emma", 474),
    ];
    ctx.save_many(&mut books).await.unwrap();
    books
}

#[tokio::test]
async fn find_sorts_skips_and_limits() {
    let ctx = context();
    shelf(&ctx).await;

    let found = ctx
        .find::<Book>()
        .matching(Filter::gt("pages", 400))
        .sort(Sort::desc("pages"))
        .skip(1)
        .limit(2)
        .execute()
        .await
        .unwrap();
    assert_eq!(titles(&found), vec!["Anathem", "Emma"]);
    assert_eq!(ctx.find::<Book>().matching(Filter::gt("pages", 400)).count().await.unwrap(), 4);
}

#[derive(Debug, Deserialize)]
struct TitleOnly {
    title: String,
    pages: Option<i32>,
}

#[tokio::test]
async fn projections_decode_into_other_shapes() {
    let ctx = context();
    shelf(&ctx).await;

    let rows = ctx
        .find::<Book>()
        .matching(Filter::starts_with("title", "D"))
        .project(["title"])
        .execute_as::<TitleOnly>()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].title, "Dune");
    assert_eq!(rows[0].pages, None);
}

#[tokio::test]
async fn single_results_reject_ambiguity() {
    let ctx = context();
    let books = shelf(&ctx).await;

    let err = ctx
        .find::<Book>()
        .matching(Filter::lt("pages", 500))
        .execute_single()
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let only = ctx.find::<Book>().matching(Filter::eq("title", "Bone")).execute_single().await.unwrap();
    assert_eq!(only.map(|b| b.id), Some(books[1].id.clone()));
    let none = ctx.find::<Book>().matching(Filter::eq("title", "Zorba")).execute_single().await.unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn lookups_by_id_miss_quietly() {
    let ctx = context();
    let books = shelf(&ctx).await;

    let missing = EntityId::from(bson::oid::ObjectId::new());
    assert_eq!(ctx.find::<Book>().one_by_id(&missing).await.unwrap(), None);

    let some = ctx
        .find::<Book>()
        .many_by_ids([&books[0].id, &missing, &books[4].id])
        .await
        .unwrap();
    let mut found = titles(&some);
    found.sort_unstable();
    assert_eq!(found, vec!["Anathem", "Emma"]);
}

#[tokio::test]
async fn queued_updates_apply_independently() {
    let ctx = context();
    shelf(&ctx).await;

    let summary = ctx
        .update::<Book>()
        .matching(Filter::lt("pages", 420))
        .modify(Update::new().push("tags", "short"))
        .add_to_queue()
        .matching(Filter::eq("title", "Bone"))
        .modify(Update::new().inc("pages", 10).push("tags", "long"))
        .execute()
        .await
        .unwrap();
    assert_eq!(summary.matched, 3);
    assert_eq!(summary.modified, 3);

    let short = ctx.find::<Book>().matching(Filter::eq("tags", "short")).count().await.unwrap();
    assert_eq!(short, 2);
    let bone = ctx.find::<Book>().matching(Filter::eq("title", "Bone")).execute_first().await.unwrap().unwrap();
    assert_eq!((bone.pages, bone.tags), (1342, vec!["long".to_string()]));
}

#[tokio::test]
async fn updates_without_criteria_are_refused() {
    let ctx = context();
    shelf(&ctx).await;

    let err = ctx.update::<Book>().set("pages", 0).execute().await.unwrap_err();
    assert!(err.is_validation());
    let err = ctx.update::<Book>().matching(Filter::eq("title", "Dune")).execute().await.unwrap_err();
    assert!(err.is_validation());

    let summary = ctx.update::<Book>().match_all().set("pages", 1).execute().await.unwrap();
    assert_eq!(summary.matched, 5);
}

#[tokio::test]
async fn upserting_updates_insert_when_nothing_matches() {
    let ctx = context();
    let summary = ctx
        .update::<Book>()
        .matching(Filter::eq("title", "Beloved"))
        .set("pages", 324)
        .upsert()
        .execute()
        .await
        .unwrap();
    assert_eq!(summary.upserted, 1);

    let stored = ctx.find::<Book>().execute_single().await.unwrap().unwrap();
    assert_eq!((stored.title.as_str(), stored.pages), ("Beloved", 324));
}

#[tokio::test]
async fn update_and_get_returns_the_new_state() {
    let ctx = context();
    let mut author = Author::new("Okorafor");
    ctx.save(&mut author).await.unwrap();

    let updated = ctx
        .update_and_get::<Author>()
        .match_id(&author.id)
        .set("active", false)
        .execute()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.id, author.id);
    assert!(!updated.active);

    let missing = ctx
        .update_and_get::<Author>()
        .matching(Filter::eq("name", "Nobody"))
        .set("active", false)
        .execute()
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn replace_swaps_the_whole_document() {
    let ctx = context();
    let books = shelf(&ctx).await;

    let mut replacement = books[2].clone();
    replacement.title = "Circe (2nd ed.)".into();
    replacement.tags = vec!["myth".into()];
    let summary = ctx.replace::<Book>().with_entity(replacement.clone()).execute().await.unwrap();
    assert_eq!((summary.matched, summary.modified), (1, 1));

    let stored = ctx.find::<Book>().one_by_id(&books[2].id).await.unwrap();
    assert_eq!(stored, Some(replacement));

    let orphan = Book::new("Unsaved", 1);
    let err = ctx.replace::<Book>().with_entity(orphan).execute().await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn upserted_replacements_get_identifiers_of_the_declared_kind() {
    let ctx = context();
    let mut first = Author::new("Le Guin");
    ctx.save(&mut first).await.unwrap();

    let summary = ctx
        .replace::<Author>()
        .with_entity(Author::new("Tiptree"))
        .matching(Filter::eq("name", "Tiptree"))
        .upsert()
        .execute()
        .await
        .unwrap();
    assert_eq!(summary.upserted, 1);

    let mut stored = ctx
        .find::<Author>()
        .matching(Filter::eq("name", "Tiptree"))
        .execute_single()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id.kind(), IdKind::Sequence);
    assert_ne!(stored.id, first.id);

    stored.active = false;
    ctx.save(&mut stored).await.unwrap();
    let reloaded = ctx.find::<Author>().one_by_id(&stored.id).await.unwrap();
    assert_eq!(reloaded, Some(stored));
}

#[tokio::test]
async fn delete_requires_criteria_and_reports_counts() {
    let ctx = context();
    let books = shelf(&ctx).await;

    assert!(ctx.delete::<Book>().execute().await.unwrap_err().is_validation());

    let summary = ctx.delete::<Book>().match_ids([&books[0].id, &books[1].id]).execute().await.unwrap();
    assert_eq!(summary.deleted, 2);
    let summary = ctx.delete::<Book>().matching(Filter::lt("pages", 400)).execute().await.unwrap();
    assert_eq!(summary.deleted, 1);
    let summary = ctx.delete::<Book>().match_all().execute().await.unwrap();
    assert_eq!(summary.deleted, 2);
    assert_eq!(ctx.find::<Book>().count().await.unwrap(), 0);
}

#[derive(Debug, Deserialize, PartialEq)]
struct Summary {
    title: String,
}

#[tokio::test]
async fn pipeline_templates_substitute_tags() {
    let ctx = context();
    shelf(&ctx).await;

    let template = Template::new(
        r#"[
            { "$match": { "pages": { "$gte": <min_pages> } } },
            { "$sort": { <sort_field>: -1 } },
            { "$project": { "_id": 0, "title": 1 } }
        ]"#,
    )
    .tag("min_pages", 450)
    .unwrap()
    .raw_tag("sort_field", "\"title\"");

    let rows = ctx.pipeline::<Book, Summary>(template.clone()).execute().await.unwrap();
    let rows = rows.into_iter().map(|row| row.title).collect::<Vec<_>>();
    assert_eq!(rows, vec!["Emma", "Bone", "Anathem"]);

    let first = ctx.pipeline::<Book, Summary>(template.clone()).execute_first().await.unwrap();
    assert_eq!(first, Some(Summary { title: "Emma".into() }));
    assert!(ctx.pipeline::<Book, Summary>(template.clone()).execute_single().await.unwrap_err().is_validation());

    let streamed = ctx
        .pipeline::<Book, Summary>(template)
        .execute_cursor()
        .await
        .unwrap()
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert_eq!(streamed.len(), 3);
}

#[tokio::test]
async fn pipeline_tags_must_line_up() {
    let ctx = context();
    let missing = Template::new(r#"[{ "$limit": <n> }]"#);
    let err = ctx.pipeline::<Book, Summary>(missing).execute().await.unwrap_err();
    assert!(err.is_validation());

    let unknown = Template::new(r#"[{ "$limit": 1 }]"#).raw_tag("n", "1");
    let err = ctx.pipeline::<Book, Summary>(unknown).execute().await.unwrap_err();
    assert!(err.is_validation());
}
