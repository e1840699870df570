//! Lifecycle state resolution.
//!
//! A book's state is computed on every query from the three independently
//! mutating sources; nothing here is stored. The resolver has no side
//! effects and never fails: an id nobody knows is `Invalid`, not an error.

use crate::book::{Book, Catalog};
use crate::downloads::{DownloadLedger, DownloadStatus};
use std::fmt;

/// The single authoritative status describing how a book is currently
/// obtainable or usable. Exactly one applies to any id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    AvailableLocallyHealthy,
    MissingFile,
    /// Declared for future checksum validation; currently never produced.
    CorruptedFile,
    Downloading,
    DownloadPaused,
    AvailableOnline,
    MetadataOnly,
    Invalid,
}

impl fmt::Display for BookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BookState::AvailableLocallyHealthy => "available locally",
            BookState::MissingFile => "file missing",
            BookState::CorruptedFile => "file corrupted",
            BookState::Downloading => "downloading",
            BookState::DownloadPaused => "download paused",
            BookState::AvailableOnline => "available online",
            BookState::MetadataOnly => "metadata only",
            BookState::Invalid => "unknown",
        };
        write!(f, "{label}")
    }
}

fn state_of_local_book(book: &Book) -> BookState {
    if !book.path_is_valid() {
        return BookState::MissingFile;
    }
    BookState::AvailableLocallyHealthy
}

/// Resolve one authoritative state for `id`.
///
/// Priority: the download ledger wins, then the local library, then the
/// remote snapshot. A local record still carrying a download id (its ledger
/// entry not yet materialized, or gone mid-handover) counts as downloading.
pub fn resolve_book_state(
    id: &str,
    local: &Catalog,
    remote: &Catalog,
    ledger: &DownloadLedger,
) -> BookState {
    if let Some(entry) = ledger.get(id) {
        return if entry.status == DownloadStatus::Paused {
            BookState::DownloadPaused
        } else {
            BookState::Downloading
        };
    }

    if let Some(book) = local.get(id) {
        return if book.download_id.is_empty() {
            state_of_local_book(book)
        } else {
            BookState::Downloading
        };
    }

    if let Some(book) = remote.get(id) {
        return if book.url.is_empty() {
            BookState::MetadataOnly
        } else {
            BookState::AvailableOnline
        };
    }

    BookState::Invalid
}
