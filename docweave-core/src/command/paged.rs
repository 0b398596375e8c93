//! Paged search: optional text stage, filter, sort and paging computed by a
//! single `$facet` aggregation, so items and totals come from one execution.

use bson::{Bson, Document};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    command::{Criteria, race},
    context::Context,
    entity::{Entity, EntityExt, decode},
    error::{OdmError, OdmResult},
    filter::{Expr, Filter, Projection, Search, Sort, conjunction},
    fuzzy::phonetic_hash,
    page::Page,
    pipeline::Stage,
};

const RESULTS: &str = "results";
const TOTAL: &str = "total";
const COUNT: &str = "count";

/// Builder for a paged search.
///
/// The page and the total count come from one aggregation: the matching
/// documents feed a `$facet` with one branch producing the page and one
/// counting every match, so both describe the same snapshot.
///
/// ```ignore
/// let page = ctx
///     .paged_search::<Person>()
///     .match_text("ada", Search::Fuzzy)
///     .sort(Sort::asc("name"))
///     .page_size(10)
///     .page_number(3)
///     .execute()
///     .await?;
/// ```
pub struct PagedSearch<'a, E> {
    ctx: &'a Context,
    text: Option<Expr>,
    criteria: Criteria,
    sort: Vec<Sort>,
    page_number: u64,
    page_size: u64,
    projection: Option<Projection>,
    token: Option<CancellationToken>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity> PagedSearch<'a, E> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            text: None,
            criteria: Criteria::default(),
            sort: Vec::new(),
            page_number: 1,
            page_size: 20,
            projection: None,
            token: None,
            _entity: PhantomData,
        }
    }

    /// Restricts the search to a text match. Fuzzy terms are hashed first.
    pub fn match_text(mut self, term: &str, search: Search) -> Self {
        let term = match search {
            Search::Full => term.to_string(),
            Search::Fuzzy => phonetic_hash(term),
        };
        self.text = Some(Filter::text(term));
        self
    }

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

    pub fn sort_by_text_score(mut self) -> Self {
        self.sort.push(Sort::TextScore);
        self
    }

    /// 1-based page to return. Defaults to the first page.
    pub fn page_number(mut self, page_number: u64) -> Self {
        self.page_number = page_number;
        self
    }

    /// Items per page. Defaults to 20.
    pub fn page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(Projection::include(fields));
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

    fn stages(&self) -> OdmResult<Vec<Stage>> {
        if self.page_size == 0 {
            return Err(OdmError::validation("page size must be at least 1"));
        }
        if self.page_number == 0 {
            return Err(OdmError::validation("page numbers start at 1"));
        }
        if self.sort.contains(&Sort::TextScore) && self.text.is_none() {
            return Err(OdmError::validation("sorting by text score requires a text match"));
        }
        self.criteria.validate()?;
        if let Some(text) = &self.text {
            text.validate()?;
        }

        let filter = conjunction(
            self.text.iter().cloned().chain(self.criteria.resolve::<E>(self.ctx)),
        );
        let mut page = Vec::new();
        if !self.sort.is_empty() {
            page.push(Stage::Sort(self.sort.clone()));
        }
        // Saturates so far-out pages are empty rather than an overflow.
        page.push(Stage::Skip((self.page_number - 1).saturating_mul(self.page_size)));
        page.push(Stage::Limit(self.page_size));
        if let Some(projection) = &self.projection {
            page.push(Stage::Project(projection.clone()));
        }

        let mut stages = Vec::with_capacity(2);
        if let Some(filter) = filter {
            stages.push(Stage::Match(filter));
        }
        stages.push(Stage::Facet(vec![
            (RESULTS.to_string(), page),
            (TOTAL.to_string(), vec![Stage::Count(COUNT.to_string())]),
        ]));
        stages.iter().try_for_each(Stage::validate)?;
        Ok(stages)
    }

    async fn run(&self) -> OdmResult<(Vec<Document>, u64)> {
        let stages = self.stages()?;
        let collection = self.ctx.collection_name::<E>();
        debug!(collection, page = self.page_number, size = self.page_size, "paged search");
        let session = self.ctx.session().await;
        let mut output = race(
            self.token.as_ref(),
            self.ctx.backend().aggregate(collection, stages, session),
        )
        .await?;
        let Some(facets) = output.pop() else {
            return Ok((Vec::new(), 0));
        };
        split_facets(facets)
    }

    pub async fn execute(self) -> OdmResult<Page<E>> {
        let (documents, total) = self.run().await?;
        let items = documents.into_iter().map(E::from_document).collect::<OdmResult<_>>()?;
        Ok(self.page(items, total))
    }

    /// Like [`execute`](Self::execute), decoding items as `R`.
    pub async fn execute_as<R: DeserializeOwned>(self) -> OdmResult<Page<R>> {
        let (documents, total) = self.run().await?;
        let items = documents.into_iter().map(decode).collect::<OdmResult<_>>()?;
        Ok(self.page(items, total))
    }

    fn page<T>(&self, items: Vec<T>, total: u64) -> Page<T> {
        Page::builder(items)
            .with_total_count(total)
            .with_page(self.page_number, self.page_size)
            .build()
    }
}

/// Pulls the page items and the total out of the facet output document.
fn split_facets(mut facets: Document) -> OdmResult<(Vec<Document>, u64)> {
    let items = match facets.remove(RESULTS) {
        Some(Bson::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Bson::Document(document) => Ok(document),
                other => Err(OdmError::serialization_of(
                    "Page",
                    format!("page item is not a document: {other:?}"),
                )),
            })
            .collect::<OdmResult<Vec<_>>>()?,
        _ => Vec::new(),
    };
    let total = match facets.get_array(TOTAL).ok().and_then(|counts| counts.first()) {
        Some(Bson::Document(count)) => match count.get(COUNT) {
            Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or_default(),
            Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or_default(),
            _ => 0,
        },
        _ => 0,
    };
    Ok((items, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn facet_output_is_split() {
        let facets = doc! {
            "results": [{ "_id": 1 }, { "_id": 2 }],
            "total": [{ "count": 25_i64 }],
        };
        let (items, total) = split_facets(facets).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(total, 25);
    }

    #[test]
    fn empty_total_branch_means_zero() {
        let (items, total) = split_facets(doc! { "results": [], "total": [] }).unwrap();
        assert!(items.is_empty());
        assert_eq!(total, 0);
    }
}
