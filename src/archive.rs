//! Archive probing.
//!
//! This module is intentionally small: it knows how to recognize a content
//! archive on disk, pull a stable identity out of its header, and build the
//! catalog record for it. Keeping it isolated makes it easy to grow later
//! (e.g., reading embedded metadata or validating checksums).

use crate::book::Book;
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

/// "ZIM\x04": the archive magic number, little-endian on disk.
const ARCHIVE_MAGIC: [u8; 4] = [0x5A, 0x49, 0x4D, 0x04];
const HEADER_LEN: usize = 80;
const UUID_OFFSET: usize = 8;

static STEM_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[_.]+").expect("static pattern"));

/// Read the archive header at `path` and build a catalog record from it.
///
/// The embedded UUID becomes the book id; archives written without one get a
/// content-derived fallback id so re-probing the same file stays stable.
pub fn probe(path: &Path) -> Result<Book, CoreError> {
    let mut file =
        File::open(path).map_err(|err| CoreError::ingestion(path, format!("cannot open: {err}")))?;

    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|_| CoreError::ingestion(path, "file is too short to be an archive"))?;

    if header[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
        return Err(CoreError::ingestion(path, "not a recognized archive"));
    }

    let mut uuid_bytes = [0u8; 16];
    uuid_bytes.copy_from_slice(&header[UUID_OFFSET..UUID_OFFSET + 16]);
    let uuid = Uuid::from_bytes(uuid_bytes);
    let id = if uuid.is_nil() {
        fallback_id(&header)
    } else {
        uuid.to_string()
    };

    let metadata = file
        .metadata()
        .map_err(|err| CoreError::ingestion(path, format!("cannot stat: {err}")))?;
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    let title = title_from_path(path);
    debug!(path = %path.display(), %id, title, "Probed archive");

    Ok(Book {
        id,
        title,
        date: iso_date(modified),
        size: metadata.len(),
        path: Some(path.to_path_buf()),
        ..Book::default()
    })
}

fn fallback_id(header: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(header);
    let digest = hasher.finalize();
    format!("sha256:{:x}", digest)
}

fn title_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled");
    STEM_SEPARATORS.replace_all(stem, " ").trim().to_string()
}

fn iso_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format("%Y-%m-%d").to_string()
}
