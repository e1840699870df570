//! Visible-list computation.
//!
//! Pure functions from a catalog plus the active filter parameters to an
//! ordered id list. The local and remote catalogs are filtered independently
//! with their own predicate set; results are never merged. Ordering is total
//! (sort key, then id), so repeated calls with unchanged input agree.

use crate::book::{Book, Catalog};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Unsorted,
    Title,
    Size,
    Date,
}

/// Which catalog a predicate set applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterParams {
    /// Local-vs-remote toggle; exclusive, never additive.
    pub local: bool,
    pub languages: Vec<String>,
    pub categories: Vec<String>,
    /// Tags a book must all carry (content-type filters like `_pictures:yes`).
    pub content_type_tags: Vec<String>,
    pub query: String,
    pub sort: SortKey,
    pub ascending: bool,
}

impl Default for FilterParams {
    fn default() -> Self {
        FilterParams {
            local: true,
            languages: Vec::new(),
            categories: Vec::new(),
            content_type_tags: Vec::new(),
            query: String::new(),
            sort: SortKey::Unsorted,
            ascending: true,
        }
    }
}

fn normalize(text: &str) -> String {
    text.nfc().collect::<String>().to_lowercase()
}

fn matches_filters(book: &Book, params: &FilterParams) -> bool {
    if !params.languages.is_empty()
        && !book.languages().any(|code| {
            params.languages.iter().any(|l| l == code)
        })
    {
        return false;
    }

    if !params.categories.is_empty() {
        match book.category() {
            Some(category) if params.categories.iter().any(|c| c == category) => {}
            _ => return false,
        }
    }

    if !params
        .content_type_tags
        .iter()
        .all(|tag| book.tags.iter().any(|t| t == tag))
    {
        return false;
    }

    if !params.query.is_empty() {
        let query = normalize(&params.query);
        if !normalize(&book.title).contains(&query)
            && !normalize(&book.description).contains(&query)
        {
            return false;
        }
    }

    true
}

fn in_scope(book: &Book, scope: FilterScope) -> bool {
    match scope {
        // Locally listable: a healthy file or a running download's
        // placeholder. Records that lost their file stay visible too, so the
        // breakage is noticeable rather than silently hidden.
        FilterScope::Local => book.path.is_some() || book.is_placeholder(),
        FilterScope::Remote => true,
    }
}

fn compare(a: &Book, b: &Book, sort: SortKey) -> Ordering {
    let by_key = match sort {
        SortKey::Unsorted => Ordering::Equal,
        SortKey::Title => normalize(&a.title).cmp(&normalize(&b.title)),
        SortKey::Size => a.size.cmp(&b.size),
        SortKey::Date => a.date.cmp(&b.date),
    };
    by_key.then_with(|| a.id.cmp(&b.id))
}

/// Compute the ordered visible id list for one catalog.
pub fn visible_ids(catalog: &Catalog, params: &FilterParams, scope: FilterScope) -> Vec<String> {
    let mut books: Vec<&Book> = catalog
        .books()
        .filter(|b| in_scope(b, scope))
        .filter(|b| matches_filters(b, params))
        .collect();

    books.sort_by(|a, b| compare(a, b, params.sort));
    if !params.ascending {
        books.reverse();
    }
    books.into_iter().map(|b| b.id.clone()).collect()
}
