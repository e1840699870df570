//! Directory reconciliation.
//!
//! Each watched directory keeps per-file bookkeeping so that files appearing
//! on disk are ingested exactly once, files still being written are retried
//! after a quiet period, and files rejected once are not retried until they
//! change. The transition function is pure; the reconciler applies it over a
//! directory snapshot and mutates the library accordingly.
//!
//! Failures stay per-file: a bad archive is recorded in its watch entry and
//! logged, and the rest of the batch proceeds.

use crate::archive;
use crate::library::Library;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Relationship of one observed file to the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    AddedToLibrary,
    BeingDownloadedByUs,
    CouldNotBeAdded,
    UnchangedKnownBad,
    /// A deferred recheck has been scheduled for this file.
    RecheckPending,
    /// The file changed again while a recheck was already scheduled; no
    /// second timer is needed.
    RecheckAlreadyPending,
    ProcessNow,
}

/// Per-file bookkeeping inside one watched directory.
#[derive(Debug, Clone)]
pub struct MonitoredFileInfo {
    /// Modification time recorded at the last ingestion attempt; `None`
    /// until the file has been judged once.
    pub last_modified: Option<SystemTime>,
    pub status: FileStatus,
    /// Supersession handle for deferred rechecks: a fired timer whose
    /// generation no longer matches is stale and ignored.
    pub recheck_generation: u64,
}

/// Decide what to do with an observed file.
///
/// In order: a file whose mtime has not moved since it was last judged is a
/// known-bad file and is left alone; a file that already has a recheck
/// scheduled needs no second timer; a file modified within the stability
/// window is still being written and gets a deferred recheck; anything else
/// is ready for ingestion.
pub fn evaluate(
    previous: Option<&MonitoredFileInfo>,
    observed_mtime: SystemTime,
    now: SystemTime,
    stability_window: Duration,
) -> FileStatus {
    if let Some(prev) = previous {
        if prev.last_modified == Some(observed_mtime) {
            return FileStatus::UnchangedKnownBad;
        }
        if prev.status == FileStatus::RecheckPending {
            return FileStatus::RecheckAlreadyPending;
        }
    }
    if observed_mtime + stability_window > now {
        FileStatus::RecheckPending
    } else {
        FileStatus::ProcessNow
    }
}

/// Watch entries for one directory, keyed by file name.
#[derive(Debug, Clone, Default)]
pub struct DirectoryWatchState {
    entries: HashMap<String, MonitoredFileInfo>,
}

impl DirectoryWatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file: &str) -> Option<&MonitoredFileInfo> {
        self.entries.get(file)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pre-register a file the library already owns (used when a directory
    /// first comes under watch).
    pub fn seed_added(&mut self, file: &str) {
        self.entries.insert(
            file.to_string(),
            MonitoredFileInfo {
                last_modified: None,
                status: FileStatus::AddedToLibrary,
                recheck_generation: 0,
            },
        );
    }

    pub fn remove(&mut self, file: &str) -> Option<MonitoredFileInfo> {
        self.entries.remove(file)
    }

    /// Files currently believed to be in the library.
    pub fn known_added(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|(_, info)| info.status == FileStatus::AddedToLibrary)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn record_attempt(&mut self, file: &str, status: FileStatus, mtime: SystemTime) {
        let entry = self
            .entries
            .entry(file.to_string())
            .or_insert(MonitoredFileInfo {
                last_modified: None,
                status,
                recheck_generation: 0,
            });
        entry.status = status;
        entry.last_modified = Some(mtime);
    }

    /// Mark a deferred recheck and hand out its generation.
    fn schedule_recheck(&mut self, file: &str) -> u64 {
        let entry = self
            .entries
            .entry(file.to_string())
            .or_insert(MonitoredFileInfo {
                last_modified: None,
                status: FileStatus::RecheckPending,
                recheck_generation: 0,
            });
        entry.status = FileStatus::RecheckPending;
        entry.recheck_generation += 1;
        entry.recheck_generation
    }

    /// Claim a fired recheck. Returns false for a stale generation or an
    /// entry no longer awaiting one.
    fn take_pending(&mut self, file: &str, generation: u64) -> bool {
        match self.entries.get_mut(file) {
            Some(entry)
                if entry.status == FileStatus::RecheckPending
                    && entry.recheck_generation == generation =>
            {
                entry.status = FileStatus::ProcessNow;
                true
            }
            _ => false,
        }
    }

    /// Drop bookkeeping for vanished files that never made it into the
    /// library; their entries have nothing left to reconcile against.
    fn prune_gone(&mut self, present: &BTreeSet<String>) {
        self.entries.retain(|name, info| {
            info.status == FileStatus::AddedToLibrary || present.contains(name)
        });
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub removed: usize,
    /// Files needing a deferred recheck, with the generation to honor.
    pub recheck: Vec<(String, u64)>,
}

impl ReconcileOutcome {
    /// True when the library changed and must be persisted and announced.
    pub fn mutated(&self) -> bool {
        self.added > 0 || self.removed > 0
    }
}

/// Snapshot the archive file names currently inside `dir`.
pub fn scan_archive_names(dir: &Path, suffixes: &[String]) -> io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let suffix_matches = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| suffixes.iter().any(|s| s == &e));
        if suffix_matches {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

/// Diff `dir` against its watch entries and apply the outcome to the
/// library. Books open in a consumer are left in place and retried on a
/// later pass. The caller persists and notifies iff the outcome mutated.
pub fn reconcile_dir(
    dir: &Path,
    suffixes: &[String],
    stability_window: Duration,
    now: SystemTime,
    library: &mut Library,
    state: &mut DirectoryWatchState,
    open_books: &HashSet<String>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let current = match scan_archive_names(dir, suffixes) {
        Ok(names) => names,
        Err(err) => {
            warn!(dir = %dir.display(), "Could not scan directory: {err}");
            return outcome;
        }
    };
    let known = state.known_added();

    for file in known.difference(&current) {
        let path = dir.join(file);
        debug!(path = %path.display(), "Monitored file disappeared");
        match library.catalog().book_by_path(&path).map(|b| b.id.clone()) {
            Some(id) if open_books.contains(&id) => {
                // Still open somewhere; keep the record and retry the
                // removal on a later pass.
                debug!(%id, "Book is open; deferring its removal");
            }
            Some(id) => {
                library.remove_book(&id);
                state.remove(file);
                outcome.removed += 1;
            }
            None => {
                // The record went away through the UI; just forget the file.
                state.remove(file);
            }
        }
    }
    state.prune_gone(&current);

    for file in current.difference(&known) {
        let path = dir.join(file);
        if library.is_being_downloaded(&path) {
            debug!(path = %path.display(), "File is owned by an active download; ignoring");
            continue;
        }
        let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(err) => {
                warn!(path = %path.display(), "Could not stat monitored file: {err}");
                continue;
            }
        };
        match evaluate(state.get(file), mtime, now, stability_window) {
            FileStatus::UnchangedKnownBad => {
                debug!(path = %path.display(), "Unchanged known-bad file; not retrying");
            }
            FileStatus::RecheckAlreadyPending => {
                debug!(path = %path.display(), "A recheck is already pending");
            }
            FileStatus::RecheckPending => {
                let generation = state.schedule_recheck(file);
                debug!(path = %path.display(), generation, "File still being written; deferring");
                outcome.recheck.push((file.clone(), generation));
            }
            FileStatus::ProcessNow => {
                if ingest(&path, file, mtime, library, state) {
                    outcome.added += 1;
                }
            }
            // evaluate never yields the remaining statuses
            _ => {}
        }
    }

    outcome
}

/// Handle a fired recheck timer for one file. Stale generations (a newer
/// schedule superseded this one) are ignored. A file still inside the
/// stability window is deferred again under a fresh generation.
pub fn process_recheck(
    dir: &Path,
    file: &str,
    generation: u64,
    stability_window: Duration,
    now: SystemTime,
    library: &mut Library,
    state: &mut DirectoryWatchState,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    if !state.take_pending(file, generation) {
        debug!(file, generation, "Stale or superseded recheck; ignoring");
        return outcome;
    }

    let path = dir.join(file);
    if !path.is_file() {
        state.remove(file);
        return outcome;
    }
    if library.is_being_downloaded(&path) {
        debug!(path = %path.display(), "File is owned by an active download; ignoring");
        return outcome;
    }
    let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
        Ok(mtime) => mtime,
        Err(err) => {
            warn!(path = %path.display(), "Could not stat monitored file: {err}");
            return outcome;
        }
    };
    match evaluate(state.get(file), mtime, now, stability_window) {
        FileStatus::RecheckPending => {
            let generation = state.schedule_recheck(file);
            debug!(path = %path.display(), generation, "File changed again; deferring once more");
            outcome.recheck.push((file.to_string(), generation));
        }
        FileStatus::ProcessNow => {
            if ingest(&path, file, mtime, library, state) {
                outcome.added += 1;
            }
        }
        FileStatus::UnchangedKnownBad => {
            debug!(path = %path.display(), "Unchanged known-bad file; not retrying");
        }
        _ => {}
    }

    outcome
}

fn ingest(
    path: &Path,
    file: &str,
    mtime: SystemTime,
    library: &mut Library,
    state: &mut DirectoryWatchState,
) -> bool {
    match archive::probe(path) {
        Ok(book) => {
            debug!(path = %path.display(), id = %book.id, "Adding archive to the library");
            library.upsert(book);
            state.record_attempt(file, FileStatus::AddedToLibrary, mtime);
            true
        }
        Err(err) => {
            warn!(path = %path.display(), "Archive could not be added: {err}");
            state.record_attempt(file, FileStatus::CouldNotBeAdded, mtime);
            false
        }
    }
}
