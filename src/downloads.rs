//! Download bookkeeping and the download-engine boundary.
//!
//! The ledger is the only owner of per-download state; the library holds
//! nothing but the download-id back-reference. Transfer mechanics live behind
//! the `DownloadEngine` trait, which pushes its updates through a channel the
//! sync service hands it.

use crate::book::Book;
use crate::error::{CoreError, PrecheckError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Cancelled,
    Completed,
    Error,
}

impl DownloadStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DownloadStatus::Queued | DownloadStatus::Downloading | DownloadStatus::Paused
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub completed_bytes: u64,
    pub total_bytes: u64,
}

impl DownloadProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.completed_bytes as f64 * 100.0 / self.total_bytes as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadEntry {
    pub status: DownloadStatus,
    pub path: Option<PathBuf>,
    pub progress: DownloadProgress,
}

/// One status report from the engine about a single download.
#[derive(Debug, Clone)]
pub struct DownloadUpdate {
    pub book_id: String,
    pub status: DownloadStatus,
    pub path: Option<PathBuf>,
    pub progress: DownloadProgress,
}

/// Everything the engine can tell the sync service.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Updated(DownloadUpdate),
    /// The engine lost track of a download without completing it.
    Disappeared(String),
    /// A cancellation went through; partial files are ours to clean up.
    Cancelled(String),
    Error { summary: String, details: String },
}

/// In-flight downloads keyed by book id.
#[derive(Debug, Clone, Default)]
pub struct DownloadLedger {
    entries: BTreeMap<String, DownloadEntry>,
}

impl DownloadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, book_id: &str) -> Option<&DownloadEntry> {
        self.entries.get(book_id)
    }

    pub fn contains(&self, book_id: &str) -> bool {
        self.entries.contains_key(book_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert_queued(&mut self, book_id: &str) {
        self.entries.insert(
            book_id.to_string(),
            DownloadEntry {
                status: DownloadStatus::Queued,
                path: None,
                progress: DownloadProgress::default(),
            },
        );
    }

    /// Apply an engine report; returns the previous status if the entry was
    /// known (callers notify only on actual transitions).
    pub fn apply(&mut self, update: &DownloadUpdate) -> Option<DownloadStatus> {
        let entry = self.entries.get_mut(&update.book_id)?;
        let previous = entry.status;
        entry.status = update.status;
        entry.progress = update.progress;
        if update.path.is_some() {
            entry.path = update.path.clone();
        }
        Some(previous)
    }

    pub fn remove(&mut self, book_id: &str) -> Option<DownloadEntry> {
        self.entries.remove(book_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.status.is_active())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// The byte-transfer collaborator. The core issues commands and consumes the
/// event stream; it never moves bytes itself.
pub trait DownloadEngine: Send + Sync {
    /// Begin a transfer; returns the engine's download id.
    fn start(&self, book: &Book, dest_dir: &Path) -> Result<String, CoreError>;
    fn pause(&self, book_id: &str);
    fn resume(&self, book_id: &str);
    fn cancel(&self, book_id: &str);
    /// Where the engine reports its updates. Called once at service start.
    fn attach_events(&self, sink: Sender<EngineEvent>);
    /// Free bytes on the destination medium, when the engine can tell.
    fn free_disk_space(&self, dest_dir: &Path) -> Option<u64> {
        let _ = dest_dir;
        None
    }
}

impl<T: DownloadEngine> DownloadEngine for std::sync::Arc<T> {
    fn start(&self, book: &Book, dest_dir: &Path) -> Result<String, CoreError> {
        (**self).start(book, dest_dir)
    }

    fn pause(&self, book_id: &str) {
        (**self).pause(book_id)
    }

    fn resume(&self, book_id: &str) {
        (**self).resume(book_id)
    }

    fn cancel(&self, book_id: &str) {
        (**self).cancel(book_id)
    }

    fn attach_events(&self, sink: Sender<EngineEvent>) {
        (**self).attach_events(sink)
    }

    fn free_disk_space(&self, dest_dir: &Path) -> Option<u64> {
        (**self).free_disk_space(dest_dir)
    }
}

/// Synchronous checks before a download may create any state.
pub fn precheck_download(
    book: &Book,
    dest_dir: &Path,
    ledger: &DownloadLedger,
    free_space: Option<u64>,
) -> Result<(), PrecheckError> {
    if ledger.contains(&book.id) {
        return Err(PrecheckError::DuplicateDownload(book.id.clone()));
    }
    if !dest_dir.is_dir() {
        return Err(PrecheckError::InvalidDestination(dest_dir.to_path_buf()));
    }
    if let Some(available) = free_space {
        if book.size > available {
            return Err(PrecheckError::InsufficientSpace {
                dir: dest_dir.to_path_buf(),
                needed: book.size,
                available,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sized_book(id: &str, size: u64) -> Book {
        Book {
            id: id.to_string(),
            size,
            url: format!("http://example.org/{id}.zim"),
            ..Book::default()
        }
    }

    fn update(id: &str, status: DownloadStatus) -> DownloadUpdate {
        DownloadUpdate {
            book_id: id.to_string(),
            status,
            path: None,
            progress: DownloadProgress::default(),
        }
    }

    #[test]
    fn apply_reports_the_previous_status() {
        let mut ledger = DownloadLedger::new();
        ledger.insert_queued("x");

        let previous = ledger.apply(&update("x", DownloadStatus::Downloading));
        assert_eq!(previous, Some(DownloadStatus::Queued));
        assert_eq!(
            ledger.get("x").map(|e| e.status),
            Some(DownloadStatus::Downloading)
        );
    }

    #[test]
    fn apply_ignores_unknown_downloads() {
        let mut ledger = DownloadLedger::new();
        assert_eq!(ledger.apply(&update("ghost", DownloadStatus::Downloading)), None);
    }

    #[test]
    fn active_ids_exclude_terminal_statuses() {
        let mut ledger = DownloadLedger::new();
        ledger.insert_queued("a");
        ledger.insert_queued("b");
        ledger.apply(&update("b", DownloadStatus::Error));

        assert_eq!(ledger.active_ids(), ["a"]);
    }

    #[test]
    fn precheck_rejects_duplicates() {
        let dir = TempDir::new().expect("temp dir");
        let mut ledger = DownloadLedger::new();
        ledger.insert_queued("x");

        let err = precheck_download(&sized_book("x", 10), dir.path(), &ledger, None)
            .expect_err("duplicate must be refused");
        assert_eq!(err, PrecheckError::DuplicateDownload("x".to_string()));
    }

    #[test]
    fn precheck_rejects_a_missing_destination() {
        let ledger = DownloadLedger::new();
        let err = precheck_download(
            &sized_book("x", 10),
            Path::new("/definitely/not/a/dir"),
            &ledger,
            None,
        )
        .expect_err("bad destination must be refused");
        assert!(matches!(err, PrecheckError::InvalidDestination(_)));
    }

    #[test]
    fn precheck_rejects_insufficient_space_only_when_known() {
        let dir = TempDir::new().expect("temp dir");
        let ledger = DownloadLedger::new();
        let book = sized_book("x", 1000);

        assert!(precheck_download(&book, dir.path(), &ledger, None).is_ok());
        assert!(precheck_download(&book, dir.path(), &ledger, Some(2000)).is_ok());
        let err = precheck_download(&book, dir.path(), &ledger, Some(500))
            .expect_err("too little space must be refused");
        assert!(matches!(err, PrecheckError::InsufficientSpace { .. }));
    }
}
