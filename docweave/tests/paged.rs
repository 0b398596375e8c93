mod common;

use common::{Book, Recipe, context, titles};
use docweave::{command::PagedSearch, fuzzy::phonetic_hash, prelude::*};

async fn library(ctx: &Context) {
    let mut books = (1..=25).map(|n| Book::new(&format!("Volume {n:02}"), n * 10)).collect::<Vec<_>>();
    ctx.save_many(&mut books).await.unwrap();
}

fn by_pages(ctx: &Context) -> PagedSearch<'_, Book> {
    ctx.paged_search::<Book>().sort(Sort::asc("pages")).page_size(10)
}

#[tokio::test]
async fn pages_split_the_result_set() {
    let ctx = context();
    library(&ctx).await;

    let first = by_pages(&ctx).execute().await.unwrap();
    assert_eq!(first.total_count, 25);
    assert_eq!(first.page_count, 3);
    assert_eq!(first.items.len(), 10);
    assert_eq!((first.previous_page, first.next_page), (None, Some(2)));
    assert_eq!(first.items[0].title, "Volume 01");

    let last = by_pages(&ctx).page_number(3).execute().await.unwrap();
    assert_eq!(last.items.len(), 5);
    assert_eq!((last.previous_page, last.next_page), (Some(2), None));
    assert_eq!(titles(&last.items), vec!["Volume 21", "Volume 22", "Volume 23", "Volume 24", "Volume 25"]);

    let beyond = by_pages(&ctx).page_number(4).execute().await.unwrap();
    assert!(beyond.items.is_empty());
    assert_eq!(beyond.total_count, 25);
}

fn sagas(ctx: &Context, page_number: u64) -> PagedSearch<'_, Book> {
    ctx.paged_search::<Book>()
        .match_text("saga", Search::Full)
        .matching(Filter::eq("pages", 111))
        .sort(Sort::asc("title"))
        .page_size(10)
        .page_number(page_number)
}

#[tokio::test]
async fn text_and_filter_narrow_the_paged_set() {
    let ctx = context();
    ctx.create_text_index::<Book>(&["title"]).await.unwrap();
    let mut books = (1..=25)
        .map(|n| Book::new(&format!("Saga Volume {n:02}"), 111))
        .chain((1..=10).map(|n| Book::new(&format!("Saga Extra {n:02}"), 222)))
        .chain((1..=5).map(|n| Book::new(&format!("Almanac {n:02}"), 111)))
        .collect::<Vec<_>>();
    ctx.save_many(&mut books).await.unwrap();

    let first = sagas(&ctx, 1).execute().await.unwrap();
    assert_eq!((first.total_count, first.page_count), (25, 3));
    assert_eq!(first.items.len(), 10);

    let third = sagas(&ctx, 3).execute().await.unwrap();
    assert_eq!(third.items.len(), 5);
    assert!(third.items.iter().all(|book| book.pages == 111 && book.title.starts_with("Saga Volume")));
    assert_eq!(third.items[4].title, "Saga Volume 25");
}

#[tokio::test]
async fn far_out_pages_are_empty() {
    let ctx = context();
    library(&ctx).await;

    let page = by_pages(&ctx).page_number(u64::MAX).execute().await.unwrap();
    assert!(page.items.is_empty());
    assert_eq!((page.total_count, page.page_count), (25, 3));
    assert_eq!((page.next_page, page.previous_page), (None, Some(u64::MAX - 1)));
}

#[tokio::test]
async fn default_page_holds_twenty() {
    let ctx = context();
    library(&ctx).await;

    let page = ctx.paged_search::<Book>().execute().await.unwrap();
    assert_eq!(page.items.len(), 20);
    assert_eq!(page.page_count, 2);
}

#[tokio::test]
async fn empty_results_form_an_empty_page() {
    let ctx = context();
    library(&ctx).await;

    let page = ctx
        .paged_search::<Book>()
        .matching(Filter::gt("pages", 10_000))
        .execute()
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert_eq!((page.total_count, page.page_count, page.next_page), (0, 0, None));
}

#[tokio::test]
async fn invalid_page_parameters_are_rejected() {
    let ctx = context();
    assert!(ctx.paged_search::<Book>().page_size(0).execute().await.unwrap_err().is_validation());
    assert!(ctx.paged_search::<Book>().page_number(0).execute().await.unwrap_err().is_validation());
    assert!(ctx.paged_search::<Book>().sort_by_text_score().execute().await.unwrap_err().is_validation());
}

#[derive(Debug, Deserialize)]
struct Title {
    title: String,
}

#[tokio::test]
async fn paged_projections_decode_as_other_shapes() {
    let ctx = context();
    library(&ctx).await;

    let page = ctx
        .paged_search::<Book>()
        .matching(Filter::lte("pages", 30))
        .sort(Sort::desc("pages"))
        .project(["title"])
        .execute_as::<Title>()
        .await
        .unwrap();
    let titles = page.items.into_iter().map(|t| t.title).collect::<Vec<_>>();
    assert_eq!(titles, vec!["Volume 03", "Volume 02", "Volume 01"]);
    assert_eq!(page.total_count, 3);
}

#[test]
fn phonetic_hashes_ignore_accents() {
    assert_eq!(phonetic_hash("İstanbul"), "ASTN");
    assert_eq!(phonetic_hash("Istanbul"), "ASTN");
    assert_eq!(phonetic_hash("Crème Brûlée"), "KRM PRL");
    assert_eq!(FuzzyString::new("Crème Brûlée").normalized, "Creme Brulee");
}

async fn kitchen(ctx: &Context) {
    let hash_field = FuzzyString::hash_path("name");
    ctx.create_text_index::<Recipe>(&[hash_field.as_str()]).await.unwrap();
    let mut recipes = vec![
        Recipe::new("İstanbul Kebab"),
        Recipe::new("Crème Brûlée"),
        Recipe::new("Lemon Tart"),
        Recipe::new("Creme Caramel"),
    ];
    ctx.save_many(&mut recipes).await.unwrap();
}

#[tokio::test]
async fn fuzzy_search_matches_sound_alikes() {
    let ctx = context();
    kitchen(&ctx).await;

    let page = ctx
        .paged_search::<Recipe>()
        .match_text("istanbul", Search::Fuzzy)
        .execute()
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.items[0].name.value, "İstanbul Kebab");

    let page = ctx
        .paged_search::<Recipe>()
        .match_text("creme brulee", Search::Fuzzy)
        .sort_by_text_score()
        .execute()
        .await
        .unwrap();
    let names = page.items.iter().map(|r| r.name.value.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["Crème Brûlée", "Creme Caramel"]);
}

#[tokio::test]
async fn find_supports_fuzzy_terms_too() {
    let ctx = context();
    kitchen(&ctx).await;

    let found = ctx.find::<Recipe>().match_text("Lemmon", Search::Fuzzy).execute().await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name.value, "Lemon Tart");

    let exact = ctx.find::<Recipe>().match_text("Lemmon", Search::Full).count().await.unwrap();
    assert_eq!(exact, 0);
}
