//! Library persistence and physical file removal.
//!
//! The library is stored as a rev-tagged TOML document so stale formats are
//! detected instead of misread. Writes go through a uniquely-named temp file
//! followed by a rename; a consumer reacting to a change notification never
//! observes a half-written library.

use crate::book::{Book, Catalog};
use crate::error::CoreError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const LIBRARY_FILE_REV: &str = "zimshelf-library-v1";

#[derive(Debug, Serialize, Deserialize)]
struct LibraryFile {
    rev: String,
    books: Vec<Book>,
}

/// Load the persisted catalog, falling back to an empty one when the file is
/// missing, unreadable, or carries an unknown revision.
pub fn load_catalog(path: &Path) -> Catalog {
    let contents = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(_) => {
            info!(path = %path.display(), "No library file yet; starting empty");
            return Catalog::new();
        }
    };
    match toml::from_str::<LibraryFile>(&contents) {
        Ok(file) if file.rev == LIBRARY_FILE_REV => {
            debug!(books = file.books.len(), "Loaded library");
            Catalog::from_books(file.books)
        }
        Ok(file) => {
            warn!(
                path = %path.display(),
                rev = %file.rev,
                "Library file has an unknown revision; starting empty"
            );
            Catalog::new()
        }
        Err(err) => {
            warn!(path = %path.display(), "Invalid library TOML; starting empty: {err}");
            Catalog::new()
        }
    }
}

/// Persist the catalog. The write is atomic: temp file, then rename.
pub fn save_catalog(path: &Path, catalog: &Catalog) -> Result<(), CoreError> {
    let persist = |source: io::Error| CoreError::Persistence {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(persist)?;
        }
    }

    let payload = LibraryFile {
        rev: LIBRARY_FILE_REV.to_string(),
        books: catalog.books().cloned().collect(),
    };
    let serialized = toml::to_string(&payload)
        .map_err(|err| persist(io::Error::other(err)))?;

    let temp_path = unique_temp_path(path);
    fs::write(&temp_path, serialized).map_err(persist)?;
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(persist(err));
    }
    debug!(path = %path.display(), books = catalog.len(), "Saved library");
    Ok(())
}

fn unique_temp_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nonce = SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut temp_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("library.toml")
        .to_string();
    temp_name.push_str(&format!(".tmp-{ts_nanos}-{nonce}"));
    path.with_file_name(temp_name)
}

/// Remove a book's files from disk: the archive itself plus any sibling
/// carrying the same name prefix (download control files and the like).
///
/// Refuses to run with an empty name stem; a bare `*` glob would erase
/// the whole directory.
pub fn erase_book_files(book_path: &Path, move_to_trash: bool) -> io::Result<usize> {
    let stem = book_path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("");
    if stem.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to erase files with an empty name pattern",
        ));
    }
    let Some(dir) = book_path.parent() else {
        return Ok(0);
    };

    let mut removed = 0usize;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(stem) {
            continue;
        }
        let target = entry.path();
        if move_to_trash {
            move_file_to_trash(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
        removed += 1;
    }
    info!(
        path = %book_path.display(),
        removed, move_to_trash,
        "Erased book files"
    );
    Ok(removed)
}

fn move_file_to_trash(path: &Path) -> io::Result<()> {
    let trash_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zimshelf")
        .join("trash");
    fs::create_dir_all(&trash_dir)?;
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let destination = trash_dir.join(name);
    if fs::rename(path, &destination).is_err() {
        // Rename fails across filesystems; fall back to copy + remove.
        fs::copy(path, &destination)?;
        fs::remove_file(path)?;
    }
    Ok(())
}
