//! Paged result type returned by paged searches.

use serde::{Deserialize, Serialize};

/// A single page of results.
///
/// `total_count` and `page_count` describe the whole result set at the moment
/// the page was computed; both come from the same execution as `items`.
///
/// # Example
///
/// ```ignore
/// use docweave::page::Page;
///
/// let page: Page<String> = Page::builder(vec!["item1".to_string()])
///     .with_total_count(21)
///     .with_page(3, 10)
///     .build();
///
/// assert_eq!(page.page_count, 3);
/// assert_eq!(page.next_page, None);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// The items contained in this page.
    pub items: Vec<T>,
    /// Number of matching items across all pages.
    pub total_count: u64,
    /// Number of pages of the requested size.
    pub page_count: u64,
    /// The next page number, if more pages exist.
    pub next_page: Option<u64>,
    /// The previous page number, if this is not the first page.
    pub previous_page: Option<u64>,
}

impl<T> Page<T> {
    /// Creates a new builder for constructing a page.
    pub fn builder(items: Vec<T>) -> PageBuilder<T> {
        PageBuilder::new(items)
    }

    /// Converts the items, keeping the paging metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total_count: self.total_count,
            page_count: self.page_count,
            next_page: self.next_page,
            previous_page: self.previous_page,
        }
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total_count: 0,
            page_count: 0,
            next_page: None,
            previous_page: None,
        }
    }
}

/// Number of pages needed for `total` items at `page_size` per page.
pub fn page_count(total: u64, page_size: u64) -> u64 {
    if page_size == 0 { 0 } else { total.div_ceil(page_size) }
}

/// Builder for constructing [`Page`] instances.
pub struct PageBuilder<T> {
    items: Vec<T>,
    total_count: u64,
    page: Option<(u64, u64)>,
}

impl<T> PageBuilder<T> {
    /// Creates a new builder with the given items.
    pub fn new(items: Vec<T>) -> Self {
        Self { items, total_count: 0, page: None }
    }

    /// Sets the total count of items across all pages.
    pub fn with_total_count(mut self, total_count: u64) -> Self {
        self.total_count = total_count;
        self
    }

    /// Sets the 1-based page number and the page size, from which page count
    /// and navigation are derived.
    pub fn with_page(mut self, page_number: u64, page_size: u64) -> Self {
        self.page = Some((page_number, page_size));
        self
    }

    /// Builds and returns the final [`Page`] instance.
    pub fn build(self) -> Page<T> {
        let (number, size) = self.page.unwrap_or((1, self.total_count));
        let pages = page_count(self.total_count, size);
        Page {
            items: self.items,
            total_count: self.total_count,
            page_count: pages,
            next_page: (number < pages).then_some(number + 1),
            previous_page: (number > 1).then(|| number - 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_round_up() {
        assert_eq!(page_count(25, 10), 3);
        assert_eq!(page_count(30, 10), 3);
        assert_eq!(page_count(0, 10), 0);
    }

    #[test]
    fn navigation_is_derived_from_position() {
        let page = Page::builder(vec![1, 2, 3, 4, 5]).with_total_count(25).with_page(3, 10).build();
        assert_eq!(page.page_count, 3);
        assert_eq!(page.next_page, None);
        assert_eq!(page.previous_page, Some(2));

        let first = Page::builder(vec![0; 10]).with_total_count(25).with_page(1, 10).build();
        assert_eq!(first.next_page, Some(2));
        assert_eq!(first.previous_page, None);
    }
}
