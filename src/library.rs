//! The local library: the persisted catalog of books known on this machine.
//!
//! This is the single source of truth for "does this id exist locally". The
//! remote snapshot is advisory and replaceable; download placeholders live
//! here so that an in-flight download is never an orphan.

use crate::book::{Book, Catalog};
use crate::error::CoreError;
use crate::storage;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Library {
    catalog: Catalog,
    storage_path: PathBuf,
}

impl Library {
    /// Open the library at `path`, loading whatever is persisted there.
    pub fn open(path: &Path) -> Self {
        Library {
            catalog: storage::load_catalog(path),
            storage_path: path.to_path_buf(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_books(path: &Path, books: Vec<Book>) -> Self {
        Library {
            catalog: Catalog::from_books(books),
            storage_path: path.to_path_buf(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn get(&self, id: &str) -> Option<&Book> {
        self.catalog.get(id)
    }

    pub fn book_file_path(&self, id: &str) -> Option<PathBuf> {
        self.catalog.get(id).and_then(|b| b.path.clone())
    }

    pub fn upsert(&mut self, book: Book) {
        self.catalog.upsert(book);
    }

    pub fn remove_book(&mut self, id: &str) -> Option<Book> {
        let removed = self.catalog.remove(id);
        if removed.is_some() {
            debug!(%id, "Removed book from the library");
        }
        removed
    }

    /// Persist the current catalog. Callers must not publish a change
    /// notification unless this returned `Ok`.
    pub fn save(&self) -> Result<(), CoreError> {
        storage::save_catalog(&self.storage_path, &self.catalog)
    }

    /// Cheap copy of the books for rollback around a save attempt.
    pub fn snapshot(&self) -> Catalog {
        self.catalog.clone()
    }

    pub fn restore(&mut self, snapshot: Catalog) {
        self.catalog = snapshot;
    }

    /// Insert a placeholder for a book whose bytes a download now owns.
    /// The path stays unset until the download reports where it writes.
    pub fn add_book_downloading(&mut self, book: &Book, download_id: &str) {
        let mut placeholder = book.clone();
        placeholder.download_id = download_id.to_string();
        placeholder.path = None;
        debug!(id = %placeholder.id, %download_id, "Added download placeholder");
        self.catalog.upsert(placeholder);
    }

    /// Refresh a placeholder's destination path while its download runs.
    pub fn update_download_path(&mut self, id: &str, path: &Path) {
        if let Some(book) = self.catalog.get_mut(id) {
            if !book.download_id.is_empty() && book.path.as_deref() != Some(path) {
                book.path = Some(path.to_path_buf());
            }
        }
    }

    /// Convert a placeholder into a locally available book.
    pub fn finish_download(&mut self, id: &str, path: &Path) -> Result<(), CoreError> {
        let book = self
            .catalog
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownBook(id.to_string()))?;
        book.path = Some(path.to_path_buf());
        book.download_id.clear();
        // The book is local now; keeping the url around would readvertise it.
        book.url.clear();
        debug!(%id, path = %path.display(), "Download placeholder became a local book");
        Ok(())
    }

    /// Disappearance handling: keep the record but drop the ownership mark.
    pub fn clear_download_id(&mut self, id: &str) -> bool {
        match self.catalog.get_mut(id) {
            Some(book) => {
                book.download_id.clear();
                true
            }
            None => {
                warn!(%id, "No book record for a disappeared download");
                false
            }
        }
    }

    /// True iff some in-flight download writes to `path`.
    pub fn is_being_downloaded(&self, path: &Path) -> bool {
        self.catalog
            .books()
            .any(|b| !b.download_id.is_empty() && b.path.as_deref() == Some(path))
    }

    /// File names of catalogued books that live directly in `dir`.
    pub fn archives_in_dir(&self, dir: &Path) -> BTreeSet<String> {
        self.catalog
            .books()
            .filter_map(|b| b.path.as_deref())
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name())
            .filter_map(|n| n.to_str())
            .map(|n| n.to_string())
            .collect()
    }
}
