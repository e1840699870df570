//! Book records and the catalog container.
//!
//! `Catalog` is shared by the persisted local library and the ephemeral
//! remote snapshot; only the surrounding types differ in how they obtain and
//! retain their entries. Keys are book ids, so iteration order is the id
//! order and stays stable across calls.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Book illustration: inline bytes (base64) or a URL to fetch them from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Favicon {
    Url(String),
    Data(String),
}

/// One content archive, identified by a stable opaque id.
///
/// A non-empty `download_id` marks the record as a placeholder owned by an
/// in-flight download; descriptive fields of a placeholder must be read from
/// the remote snapshot when available, never from the placeholder itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub description: String,
    /// ISO `yyyy-mm-dd`, as advertised by the source or derived from mtime.
    pub date: String,
    pub tags: Vec<String>,
    /// Comma-joined language codes.
    pub language: String,
    pub size: u64,
    /// Meaningful only while the book is locally present.
    pub path: Option<PathBuf>,
    /// Empty unless a download owns this record.
    pub download_id: String,
    /// Remote download URL; empty once the book is local.
    pub url: String,
    pub favicon: Option<Favicon>,
}

impl Book {
    pub fn is_placeholder(&self) -> bool {
        !self.download_id.is_empty()
    }

    pub fn path_is_valid(&self) -> bool {
        self.path.as_deref().is_some_and(Path::is_file)
    }

    /// Value of the `_category:` tag, if any.
    pub fn category(&self) -> Option<&str> {
        self.tags.iter().find_map(|t| t.strip_prefix("_category:"))
    }

    /// Yes/no flag tags of the form `_name:yes`.
    pub fn flag(&self, name: &str) -> Option<bool> {
        let prefix = format!("_{name}:");
        self.tags
            .iter()
            .find_map(|t| t.strip_prefix(&prefix))
            .map(|v| v == "yes")
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.language
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }

    /// Human-readable tags; underscore tags are internal and summarized.
    pub fn display_tags(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.flag("videos") == Some(true) {
            out.push("Videos".to_string());
        }
        if self.flag("pictures") == Some(true) {
            out.push("Pictures".to_string());
        }
        if self.flag("details") == Some(false) {
            out.push("Introduction only".to_string());
        }
        for tag in &self.tags {
            if !tag.starts_with('_') && !out.iter().any(|t| t == tag) {
                out.push(tag.clone());
            }
        }
        out
    }
}

/// Ordered book container keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    books: BTreeMap<String, Book>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_books(books: impl IntoIterator<Item = Book>) -> Self {
        let mut catalog = Self::new();
        for book in books {
            catalog.upsert(book);
        }
        catalog
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.books.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Book> {
        self.books.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Book> {
        self.books.get_mut(id)
    }

    pub fn upsert(&mut self, book: Book) {
        self.books.insert(book.id.clone(), book);
    }

    pub fn remove(&mut self, id: &str) -> Option<Book> {
        self.books.remove(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.books.keys()
    }

    pub fn books(&self) -> impl Iterator<Item = &Book> {
        self.books.values()
    }

    pub fn book_by_path(&self, path: &Path) -> Option<&Book> {
        self.books
            .values()
            .find(|b| b.path.as_deref() == Some(path))
    }

    /// Distinct language codes across all books, sorted.
    pub fn languages(&self) -> Vec<String> {
        let mut codes: Vec<String> = Vec::new();
        for book in self.books.values() {
            for code in book.languages() {
                if !codes.iter().any(|c| c == code) {
                    codes.push(code.to_string());
                }
            }
        }
        codes.sort();
        codes
    }

    /// Distinct `_category:` values across all books, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = Vec::new();
        for book in self.books.values() {
            if let Some(category) = book.category() {
                if !categories.iter().any(|c| c == category) {
                    categories.push(category.to_string());
                }
            }
        }
        categories.sort();
        categories
    }
}
