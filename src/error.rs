//! Typed errors crossing the engine boundary.
//!
//! Lookup failures on a single book id never surface here; they resolve to
//! `BookState::Invalid` or an absent value instead. What remains are the
//! failures a caller can actually act on: a bad ingestion, a download that
//! must not start, an unreachable catalog server, or a library file that
//! could not be written.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown book id {0}")]
    UnknownBook(String),

    #[error("book {id} is not openable: {reason}")]
    Unavailable { id: String, reason: String },

    #[error("could not ingest {}: {reason}", path.display())]
    Ingestion { path: PathBuf, reason: String },

    #[error(transparent)]
    Precheck(#[from] PrecheckError),

    #[error("{summary}")]
    Transport { summary: String, details: String },

    #[error("failed to persist the library to {}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CoreError {
    pub(crate) fn ingestion(path: &std::path::Path, reason: impl Into<String>) -> Self {
        CoreError::Ingestion {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(summary: impl Into<String>, details: impl Into<String>) -> Self {
        CoreError::Transport {
            summary: summary.into(),
            details: details.into(),
        }
    }
}

/// Raised synchronously by `download_book` before any ledger or catalog
/// entry is created, so a refused download leaves no state behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrecheckError {
    #[error("downloading is not available on this system")]
    DownloadsUnavailable,

    #[error("book {0} is already being downloaded")]
    DuplicateDownload(String),

    #[error("download directory {} is not usable", .0.display())]
    InvalidDestination(PathBuf),

    #[error(
        "not enough free space in {} ({needed} bytes needed, {available} available)",
        dir.display()
    )]
    InsufficientSpace {
        dir: PathBuf,
        needed: u64,
        available: u64,
    },
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
