//! The sync service: single owner of the library, the remote snapshot, the
//! download ledger, and the per-directory watch state.
//!
//! Everything else either queries it or sends it commands. A dedicated event
//! thread dispatches directory changes, deferred rechecks, download-engine
//! reports, and fetched feed payloads; reconciliation and feed parsing run
//! on short-lived worker threads. One directory reconciles at a time (its
//! watch state is behind a mutex), while different directories may proceed
//! concurrently.
//!
//! Lock discipline: the remote snapshot has its own mutex and is replaced
//! wholesale, never mutated in place. When several locks are needed they are
//! taken in a fixed order (watch registry, directory state, library,
//! remote, ledger) and dropped before any notification goes out.

use crate::book::{Book, Catalog};
use crate::config::AppConfig;
use crate::downloads::{
    precheck_download, DownloadEngine, DownloadLedger, DownloadProgress, DownloadStatus,
    DownloadUpdate, EngineEvent,
};
use crate::error::{CoreError, PrecheckError};
use crate::filter::{visible_ids, FilterParams, FilterScope, SortKey};
use crate::library::Library;
use crate::lifecycle::{resolve_book_state, BookState};
use crate::monitor::{self, DirectoryWatchState};
use crate::remote::{self, CatalogQuery, CatalogTransport};
use crate::storage;
use anyhow::Context;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// What consumers hear from the service. A single `CatalogChanged` covers an
/// entire reconciliation batch; per-file notifications would thrash the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    CatalogChanged,
    PendingRequest(bool),
    LanguagesChanged,
    CategoriesChanged,
    Error { summary: String, details: String },
}

enum CoreEvent {
    DirectoryChanged(PathBuf),
    Recheck {
        dir: PathBuf,
        file: String,
        generation: u64,
    },
    Engine(EngineEvent),
    FeedFetched(Result<String, CoreError>),
    LanguagesFetched(Result<String, CoreError>),
    CategoriesFetched(Result<String, CoreError>),
    Shutdown,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    filters: Mutex<FilterParams>,
    library: Mutex<Library>,
    remote: Mutex<Catalog>,
    ledger: Mutex<DownloadLedger>,
    watch: Mutex<BTreeMap<PathBuf, Arc<Mutex<DirectoryWatchState>>>>,
    languages: Mutex<Vec<(String, String)>>,
    categories: Mutex<Vec<String>>,
    open_books: Mutex<HashSet<String>>,
    subscribers: Mutex<Vec<Sender<Notification>>>,
    transport: Box<dyn CatalogTransport>,
    engine: Option<Box<dyn DownloadEngine>>,
    download_dir: PathBuf,
    suffixes: Vec<String>,
    stability_window: Duration,
    recheck_delay: Duration,
    events: Sender<CoreEvent>,
    shutdown: AtomicBool,
}

impl Shared {
    fn publish(&self, note: Notification) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(note.clone()).is_ok());
    }

    fn publish_error(&self, err: CoreError) {
        let (summary, details) = match err {
            CoreError::Transport { summary, details } => (summary, details),
            other => (other.to_string(), String::new()),
        };
        warn!(%summary, %details, "Reporting error to consumers");
        self.publish(Notification::Error { summary, details });
    }

    fn watch_state(&self, dir: &Path) -> Option<Arc<Mutex<DirectoryWatchState>>> {
        lock(&self.watch).get(dir).cloned()
    }
}

pub struct SyncService {
    shared: Arc<Shared>,
    events: Sender<CoreEvent>,
    event_thread: Option<thread::JoinHandle<()>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl SyncService {
    /// Wire everything up and start the background threads. The engine is
    /// optional; without one, download requests fail their precheck.
    pub fn start(
        config: &AppConfig,
        transport: Box<dyn CatalogTransport>,
        engine: Option<Box<dyn DownloadEngine>>,
    ) -> anyhow::Result<SyncService> {
        let (events, event_rx) = mpsc::channel();

        let shared = Arc::new(Shared {
            filters: Mutex::new(FilterParams::default()),
            library: Mutex::new(Library::open(&config.library_path)),
            remote: Mutex::new(Catalog::new()),
            ledger: Mutex::new(DownloadLedger::new()),
            watch: Mutex::new(BTreeMap::new()),
            languages: Mutex::new(Vec::new()),
            categories: Mutex::new(Vec::new()),
            open_books: Mutex::new(HashSet::new()),
            subscribers: Mutex::new(Vec::new()),
            transport,
            engine,
            download_dir: config.download_dir.clone(),
            suffixes: config.sanitized_suffixes(),
            stability_window: Duration::from_millis(config.file_stability_window_ms),
            recheck_delay: Duration::from_millis(config.recheck_delay_ms),
            events: events.clone(),
            shutdown: AtomicBool::new(false),
        });

        if let Some(engine) = &shared.engine {
            let (engine_tx, engine_rx) = mpsc::channel::<EngineEvent>();
            engine.attach_events(engine_tx);
            let forward = events.clone();
            thread::spawn(move || {
                for event in engine_rx {
                    if forward.send(CoreEvent::Engine(event)).is_err() {
                        break;
                    }
                }
            });
        }

        let event_thread = thread::spawn({
            let shared = Arc::clone(&shared);
            move || run_event_loop(shared, event_rx)
        });

        let service = SyncService {
            shared,
            events,
            event_thread: Some(event_thread),
            watcher: Mutex::new(None),
        };
        service.init_watcher().context("Failed to start the filesystem watcher")?;
        if !config.monitored_directories.is_empty() {
            service.set_monitored_directories(
                config.monitored_directories.iter().cloned().collect(),
            );
        }
        info!(
            library = %config.library_path.display(),
            download_dir = %config.download_dir.display(),
            "Sync service started"
        );
        Ok(service)
    }

    fn init_watcher(&self) -> notify::Result<()> {
        let events = self.events.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let mut dirs = BTreeSet::new();
                    for path in &event.paths {
                        let dir = if path.is_dir() {
                            path.clone()
                        } else {
                            path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.clone())
                        };
                        dirs.insert(dir);
                    }
                    for dir in dirs {
                        let _ = events.send(CoreEvent::DirectoryChanged(dir));
                    }
                }
                Err(err) => warn!("Filesystem watcher error: {err}"),
            }
        })?;
        *lock(&self.watcher) = Some(watcher);
        Ok(())
    }

    /// Subscribe to change notifications. Every subscriber sees every
    /// notification published after this call.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    // ------------------------------------------------------------------
    // Filter parameters (each setter is a no-op on an identical value)
    // ------------------------------------------------------------------

    pub fn set_local(&self, local: bool) {
        {
            let mut filters = lock(&self.shared.filters);
            if filters.local == local {
                return;
            }
            filters.local = local;
        }
        self.update_catalog();
        self.refresh_languages();
        self.refresh_categories();
    }

    pub fn set_language_filter(&self, languages: Vec<String>) {
        let languages = normalized_list(languages);
        {
            let mut filters = lock(&self.shared.filters);
            if filters.languages == languages {
                return;
            }
            filters.languages = languages;
        }
        self.update_catalog();
    }

    pub fn set_category_filter(&self, categories: Vec<String>) {
        let categories = normalized_list(categories);
        {
            let mut filters = lock(&self.shared.filters);
            if filters.categories == categories {
                return;
            }
            filters.categories = categories;
        }
        self.update_catalog();
    }

    pub fn set_content_type_filter(&self, tags: Vec<String>) {
        let tags = normalized_list(tags);
        {
            let mut filters = lock(&self.shared.filters);
            if filters.content_type_tags == tags {
                return;
            }
            filters.content_type_tags = tags;
        }
        self.update_catalog();
    }

    pub fn set_search(&self, query: &str) {
        {
            let mut filters = lock(&self.shared.filters);
            if filters.query == query {
                return;
            }
            filters.query = query.to_string();
        }
        self.shared.publish(Notification::CatalogChanged);
    }

    pub fn set_sort(&self, sort: SortKey, ascending: bool) {
        {
            let mut filters = lock(&self.shared.filters);
            if filters.sort == sort && filters.ascending == ascending {
                return;
            }
            filters.sort = sort;
            filters.ascending = ascending;
        }
        self.shared.publish(Notification::CatalogChanged);
    }

    /// Replace the watched directory set. Files the library already owns in
    /// a directory are pre-registered so they are not re-ingested; every
    /// directory then gets an initial reconciliation.
    pub fn set_monitored_directories(&self, dirs: BTreeSet<PathBuf>) {
        {
            let registry = lock(&self.shared.watch);
            if registry.keys().cloned().collect::<BTreeSet<_>>() == dirs {
                return;
            }
        }

        let mut watcher = lock(&self.watcher);
        let mut registry = lock(&self.shared.watch);
        if let Some(watcher) = watcher.as_mut() {
            for old in registry.keys() {
                let _ = watcher.unwatch(old);
            }
        }
        registry.clear();

        let library = lock(&self.shared.library);
        for dir in dirs {
            if dir.as_os_str().is_empty() {
                continue;
            }
            let mut state = DirectoryWatchState::new();
            for file in library.archives_in_dir(&dir) {
                state.seed_added(&file);
            }
            registry.insert(dir.clone(), Arc::new(Mutex::new(state)));
            if let Some(watcher) = watcher.as_mut() {
                if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                    warn!(dir = %dir.display(), "Could not watch directory: {err}");
                }
            }
            let _ = self.events.send(CoreEvent::DirectoryChanged(dir));
        }
    }

    // ------------------------------------------------------------------
    // Remote catalog
    // ------------------------------------------------------------------

    /// Refresh the active catalog. In local mode there is nothing to fetch;
    /// in remote mode the fetch runs on a worker thread and the snapshot is
    /// swapped when its payload arrives.
    pub fn update_catalog(&self) {
        let (local, query) = {
            let filters = lock(&self.shared.filters);
            (
                filters.local,
                CatalogQuery {
                    languages: filters.languages.clone(),
                    categories: filters.categories.clone(),
                    tags: filters.content_type_tags.clone(),
                    query: filters.query.clone(),
                },
            )
        };
        if local {
            self.shared.publish(Notification::PendingRequest(false));
            self.shared.publish(Notification::CatalogChanged);
            return;
        }
        self.shared.publish(Notification::PendingRequest(true));
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            let result = shared.transport.fetch_catalog(&query);
            let _ = shared.events.send(CoreEvent::FeedFetched(result));
        });
    }

    pub fn refresh_languages(&self) {
        if lock(&self.shared.filters).local {
            let pairs: Vec<(String, String)> = {
                let library = lock(&self.shared.library);
                library
                    .catalog()
                    .languages()
                    .into_iter()
                    .map(|code| (code.clone(), code))
                    .collect()
            };
            *lock(&self.shared.languages) = pairs;
            self.shared.publish(Notification::LanguagesChanged);
            return;
        }
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            let result = shared.transport.fetch_languages();
            let _ = shared.events.send(CoreEvent::LanguagesFetched(result));
        });
    }

    pub fn refresh_categories(&self) {
        if lock(&self.shared.filters).local {
            let categories = {
                let library = lock(&self.shared.library);
                library.catalog().categories()
            };
            *lock(&self.shared.categories) = categories;
            self.shared.publish(Notification::CategoriesChanged);
            return;
        }
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            let result = shared.transport.fetch_categories();
            let _ = shared.events.send(CoreEvent::CategoriesFetched(result));
        });
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Start downloading a book. All prechecks run synchronously before any
    /// ledger or catalog entry exists, so a refusal leaves no orphan state.
    pub fn download_book(&self, id: &str) -> Result<(), CoreError> {
        let book = self
            .remote_or_local_book(id)
            .ok_or_else(|| CoreError::UnknownBook(id.to_string()))?;
        let engine = self
            .shared
            .engine
            .as_deref()
            .ok_or(PrecheckError::DownloadsUnavailable)?;
        let dest = self.shared.download_dir.clone();
        {
            let ledger = lock(&self.shared.ledger);
            precheck_download(&book, &dest, &ledger, engine.free_disk_space(&dest))?;
        }

        let download_id = engine.start(&book, &dest)?;
        {
            let mut library = lock(&self.shared.library);
            let before = library.snapshot();
            library.add_book_downloading(&book, &download_id);
            if let Err(err) = library.save() {
                library.restore(before);
                engine.cancel(id);
                return Err(err);
            }
        }
        lock(&self.shared.ledger).insert_queued(id);
        info!(%id, %download_id, "Download started");
        self.shared.publish(Notification::CatalogChanged);
        Ok(())
    }

    pub fn pause_download(&self, id: &str) {
        if let Some(engine) = &self.shared.engine {
            engine.pause(id);
        }
    }

    pub fn resume_download(&self, id: &str) {
        if let Some(engine) = &self.shared.engine {
            engine.resume(id);
        }
    }

    /// Ask the engine to cancel. Destructive cleanup (partial file and
    /// placeholder removal) happens when the engine confirms; callers are
    /// expected to have confirmed with the user before calling this.
    pub fn cancel_download(&self, id: &str) {
        if let Some(engine) = &self.shared.engine {
            engine.cancel(id);
        }
    }

    pub fn download_progress(&self, id: &str) -> Option<(DownloadStatus, DownloadProgress)> {
        lock(&self.shared.ledger)
            .get(id)
            .map(|entry| (entry.status, entry.progress))
    }

    // ------------------------------------------------------------------
    // Books
    // ------------------------------------------------------------------

    pub fn book_state(&self, id: &str) -> BookState {
        let library = lock(&self.shared.library);
        let remote = lock(&self.shared.remote);
        let ledger = lock(&self.shared.ledger);
        resolve_book_state(id, library.catalog(), &remote, &ledger)
    }

    /// Ordered ids for the active catalog under the active filters.
    pub fn visible_book_ids(&self) -> Vec<String> {
        let filters = lock(&self.shared.filters).clone();
        if filters.local {
            let library = lock(&self.shared.library);
            visible_ids(library.catalog(), &filters, FilterScope::Local)
        } else {
            let remote = lock(&self.shared.remote);
            visible_ids(&remote, &filters, FilterScope::Remote)
        }
    }

    /// Descriptive record for a book. A placeholder's description comes from
    /// the remote snapshot when available; its local copy exists for
    /// technical reasons only.
    pub fn book_info(&self, id: &str) -> Option<Book> {
        let local = lock(&self.shared.library).get(id).cloned();
        match local {
            Some(book) if !book.is_placeholder() => Some(book),
            placeholder => {
                let remote = lock(&self.shared.remote);
                remote.get(id).cloned().or(placeholder)
            }
        }
    }

    /// Verify a book can actually be opened and hand back its path. A local
    /// record whose file turns out unreadable is dropped from the library.
    pub fn open_book(&self, id: &str) -> Result<PathBuf, CoreError> {
        let state = self.book_state(id);
        if state != BookState::AvailableLocallyHealthy {
            return Err(CoreError::Unavailable {
                id: id.to_string(),
                reason: state.to_string(),
            });
        }
        let path = lock(&self.shared.library)
            .book_file_path(id)
            .ok_or_else(|| CoreError::UnknownBook(id.to_string()))?;

        if let Err(err) = crate::archive::probe(&path) {
            warn!(%id, path = %path.display(), "Book failed to open; dropping it: {err}");
            let mut library = lock(&self.shared.library);
            let before = library.snapshot();
            library.remove_book(id);
            if let Err(save_err) = library.save() {
                library.restore(before);
                drop(library);
                self.shared.publish_error(save_err);
            } else {
                drop(library);
                self.shared.publish(Notification::CatalogChanged);
            }
            return Err(err);
        }

        lock(&self.shared.open_books).insert(id.to_string());
        Ok(path)
    }

    pub fn note_book_opened(&self, id: &str) {
        lock(&self.shared.open_books).insert(id.to_string());
    }

    pub fn note_book_closed(&self, id: &str) {
        lock(&self.shared.open_books).remove(id);
    }

    /// Remove a book from this machine: its files (trashed or deleted), its
    /// record, and its watch entry. Destructive; callers are expected to
    /// have confirmed with the user.
    pub fn erase_book(&self, id: &str, move_to_trash: bool) -> Result<(), CoreError> {
        let path = {
            let library = lock(&self.shared.library);
            let book = library
                .get(id)
                .ok_or_else(|| CoreError::UnknownBook(id.to_string()))?;
            book.path.clone()
        };

        if let Some(path) = &path {
            if let Err(err) = storage::erase_book_files(path, move_to_trash) {
                warn!(path = %path.display(), "Could not erase book files: {err}");
            }
        }

        {
            let mut library = lock(&self.shared.library);
            let before = library.snapshot();
            library.remove_book(id);
            if let Err(err) = library.save() {
                library.restore(before);
                return Err(err);
            }
        }
        if let Some(path) = &path {
            self.forget_watch_entry(path);
        }
        lock(&self.shared.open_books).remove(id);
        info!(%id, "Book erased");
        self.shared.publish(Notification::CatalogChanged);
        Ok(())
    }

    pub fn languages(&self) -> Vec<(String, String)> {
        lock(&self.shared.languages).clone()
    }

    pub fn categories(&self) -> Vec<String> {
        lock(&self.shared.categories).clone()
    }

    pub fn filters(&self) -> FilterParams {
        lock(&self.shared.filters).clone()
    }

    /// Reconcile one monitored directory right now, synchronously. Returns
    /// the (added, removed) counts; (0, 0) for an unmonitored directory.
    pub fn reconcile_now(&self, dir: &Path) -> (usize, usize) {
        reconcile_directory(&self.shared, dir).unwrap_or((0, 0))
    }

    fn remote_or_local_book(&self, id: &str) -> Option<Book> {
        {
            let remote = lock(&self.shared.remote);
            if let Some(book) = remote.get(id) {
                return Some(book.clone());
            }
        }
        lock(&self.shared.library).get(id).cloned()
    }

    fn forget_watch_entry(&self, path: &Path) {
        let (Some(dir), Some(file)) = (
            path.parent(),
            path.file_name().and_then(|f| f.to_str()),
        ) else {
            return;
        };
        if let Some(state) = self.shared.watch_state(dir) {
            lock(&state).remove(file);
        }
    }

    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.events.send(CoreEvent::Shutdown);
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
        *lock(&self.watcher) = None;
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn normalized_list(values: Vec<String>) -> Vec<String> {
    let mut values: Vec<String> = values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    values.sort();
    values.dedup();
    values
}

fn run_event_loop(shared: Arc<Shared>, events: Receiver<CoreEvent>) {
    for event in events {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        match event {
            CoreEvent::Shutdown => break,
            CoreEvent::DirectoryChanged(dir) => {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    reconcile_directory(&shared, &dir);
                });
            }
            CoreEvent::Recheck {
                dir,
                file,
                generation,
            } => {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    run_recheck(&shared, &dir, &file, generation);
                });
            }
            CoreEvent::Engine(event) => handle_engine_event(&shared, event),
            CoreEvent::FeedFetched(result) => handle_feed(&shared, result),
            CoreEvent::LanguagesFetched(result) => handle_languages(&shared, result),
            CoreEvent::CategoriesFetched(result) => handle_categories(&shared, result),
        }
    }
    debug!("Event loop stopped");
}

/// One reconciliation pass over a monitored directory. Returns `None` when
/// the directory is not (or no longer) monitored.
fn reconcile_directory(shared: &Arc<Shared>, dir: &Path) -> Option<(usize, usize)> {
    let dir_state = shared.watch_state(dir)?;
    let mut state = lock(&dir_state);
    let open_books = lock(&shared.open_books).clone();
    let mut library = lock(&shared.library);

    let books_before = library.snapshot();
    let state_before = state.clone();
    let outcome = monitor::reconcile_dir(
        dir,
        &shared.suffixes,
        shared.stability_window,
        SystemTime::now(),
        &mut library,
        &mut state,
        &open_books,
    );

    let mut save_error = None;
    let mut mutated = outcome.mutated();
    if mutated {
        if let Err(err) = library.save() {
            library.restore(books_before);
            *state = state_before;
            mutated = false;
            save_error = Some(err);
        }
    }
    drop(library);
    drop(state);

    schedule_rechecks(shared, dir, &outcome.recheck);
    if let Some(err) = save_error {
        shared.publish_error(err);
        return Some((0, 0));
    }
    if mutated {
        debug!(
            dir = %dir.display(),
            added = outcome.added,
            removed = outcome.removed,
            "Directory reconciled"
        );
        shared.publish(Notification::CatalogChanged);
    }
    Some((outcome.added, outcome.removed))
}

fn run_recheck(shared: &Arc<Shared>, dir: &Path, file: &str, generation: u64) {
    let Some(dir_state) = shared.watch_state(dir) else {
        return;
    };
    let mut state = lock(&dir_state);
    let mut library = lock(&shared.library);

    let books_before = library.snapshot();
    let state_before = state.clone();
    let outcome = monitor::process_recheck(
        dir,
        file,
        generation,
        shared.stability_window,
        SystemTime::now(),
        &mut library,
        &mut state,
    );

    let mut save_error = None;
    let mut mutated = outcome.mutated();
    if mutated {
        if let Err(err) = library.save() {
            library.restore(books_before);
            *state = state_before;
            mutated = false;
            save_error = Some(err);
        }
    }
    drop(library);
    drop(state);

    schedule_rechecks(shared, dir, &outcome.recheck);
    if let Some(err) = save_error {
        shared.publish_error(err);
    } else if mutated {
        shared.publish(Notification::CatalogChanged);
    }
}

fn schedule_rechecks(shared: &Arc<Shared>, dir: &Path, rechecks: &[(String, u64)]) {
    for (file, generation) in rechecks {
        let shared = Arc::clone(shared);
        let dir = dir.to_path_buf();
        let file = file.clone();
        let generation = *generation;
        thread::spawn(move || {
            thread::sleep(shared.recheck_delay);
            if !shared.shutdown.load(Ordering::Acquire) {
                let _ = shared.events.send(CoreEvent::Recheck {
                    dir,
                    file,
                    generation,
                });
            }
        });
    }
}

fn handle_engine_event(shared: &Arc<Shared>, event: EngineEvent) {
    match event {
        EngineEvent::Updated(update) => {
            if update.status == DownloadStatus::Completed {
                complete_download(shared, &update);
                return;
            }
            let previous = lock(&shared.ledger).apply(&update);
            let Some(previous) = previous else {
                debug!(id = %update.book_id, "Ignoring update for an untracked download");
                return;
            };
            if let Some(path) = &update.path {
                lock(&shared.library).update_download_path(&update.book_id, path);
            }
            if previous != update.status {
                debug!(
                    id = %update.book_id,
                    from = ?previous,
                    to = ?update.status,
                    "Download status changed"
                );
                shared.publish(Notification::CatalogChanged);
            }
        }
        EngineEvent::Disappeared(id) => {
            if lock(&shared.ledger).remove(&id).is_none() {
                return;
            }
            let mut library = lock(&shared.library);
            if library.get(&id).is_none() {
                // The book went away with the download; nothing to clean.
                return;
            }
            let before = library.snapshot();
            library.clear_download_id(&id);
            if let Err(err) = library.save() {
                library.restore(before);
                drop(library);
                shared.publish_error(err);
                return;
            }
            drop(library);
            info!(%id, "Download disappeared; placeholder released");
            shared.publish(Notification::CatalogChanged);
        }
        EngineEvent::Cancelled(id) => cancelled_cleanup(shared, &id),
        EngineEvent::Error { summary, details } => {
            shared.publish(Notification::Error { summary, details });
        }
    }
}

fn complete_download(shared: &Arc<Shared>, update: &DownloadUpdate) {
    if lock(&shared.ledger).remove(&update.book_id).is_none() {
        return;
    }
    let Some(path) = update.path.clone() else {
        warn!(id = %update.book_id, "Completed download reported no path");
        return;
    };

    let mut library = lock(&shared.library);
    let before = library.snapshot();
    if let Err(err) = library.finish_download(&update.book_id, &path) {
        drop(library);
        warn!("Could not record a completed download: {err}");
        return;
    }
    if let Err(err) = library.save() {
        library.restore(before);
        drop(library);
        shared.publish_error(err);
        return;
    }
    drop(library);
    info!(id = %update.book_id, path = %path.display(), "Download completed");
    shared.publish(Notification::CatalogChanged);
}

fn cancelled_cleanup(shared: &Arc<Shared>, id: &str) {
    let tracked = lock(&shared.ledger).remove(id).is_some();

    let mut library = lock(&shared.library);
    let path = library.book_file_path(id);
    let before = library.snapshot();
    let removed = library.remove_book(id).is_some();
    if removed {
        if let Err(err) = library.save() {
            library.restore(before);
            drop(library);
            shared.publish_error(err);
            return;
        }
    }
    drop(library);

    if let Some(path) = &path {
        // Partial downloads are deleted outright, never trashed.
        if let Err(err) = storage::erase_book_files(path, false) {
            warn!(path = %path.display(), "Could not remove partial download files: {err}");
        }
        if let (Some(dir), Some(file)) = (path.parent(), path.file_name().and_then(|f| f.to_str()))
        {
            if let Some(state) = shared.watch_state(dir) {
                lock(&state).remove(file);
            }
        }
    }

    if tracked || removed {
        info!(%id, "Download cancelled and cleaned up");
        shared.publish(Notification::CatalogChanged);
    }
}

fn handle_feed(shared: &Arc<Shared>, result: Result<String, CoreError>) {
    match result {
        Ok(content) => {
            let shared = Arc::clone(shared);
            thread::spawn(move || match remote::parse_feed(&content) {
                Ok(catalog) => {
                    *lock(&shared.remote) = catalog;
                    shared.publish(Notification::CatalogChanged);
                    shared.publish(Notification::PendingRequest(false));
                }
                Err(err) => {
                    shared.publish_error(err);
                    shared.publish(Notification::PendingRequest(false));
                }
            });
        }
        Err(err) => {
            shared.publish_error(err);
            shared.publish(Notification::PendingRequest(false));
        }
    }
}

fn handle_languages(shared: &Arc<Shared>, result: Result<String, CoreError>) {
    match result.and_then(|content| remote::parse_languages(&content)) {
        Ok(languages) => {
            *lock(&shared.languages) = languages;
            shared.publish(Notification::LanguagesChanged);
        }
        Err(err) => shared.publish_error(err),
    }
}

fn handle_categories(shared: &Arc<Shared>, result: Result<String, CoreError>) {
    match result.and_then(|content| remote::parse_categories(&content)) {
        Ok(categories) => {
            *lock(&shared.categories) = categories;
            shared.publish(Notification::CategoriesChanged);
        }
        Err(err) => shared.publish_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::testutil::write_archive;
    use std::fs;
    use std::time::Instant;
    use tempfile::TempDir;

    struct StaticTransport {
        feed: String,
    }

    impl CatalogTransport for StaticTransport {
        fn fetch_catalog(&self, _query: &CatalogQuery) -> Result<String, CoreError> {
            Ok(self.feed.clone())
        }

        fn fetch_languages(&self) -> Result<String, CoreError> {
            Ok(r#"[{"code": "eng", "name": "English"}]"#.to_string())
        }

        fn fetch_categories(&self) -> Result<String, CoreError> {
            Ok(r#"["wikipedia"]"#.to_string())
        }

        fn source_url(&self) -> String {
            "http://test.invalid".to_string()
        }
    }

    #[derive(Default)]
    struct MockEngine {
        sink: Mutex<Option<Sender<EngineEvent>>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl MockEngine {
        fn emit(&self, event: EngineEvent) {
            let sink = lock(&self.sink);
            sink.as_ref()
                .expect("engine events attached")
                .send(event)
                .expect("event loop alive");
        }
    }

    impl DownloadEngine for MockEngine {
        fn start(&self, book: &Book, _dest_dir: &Path) -> Result<String, CoreError> {
            Ok(format!("dl-{}", book.id))
        }

        fn pause(&self, _book_id: &str) {}

        fn resume(&self, _book_id: &str) {}

        fn cancel(&self, book_id: &str) {
            lock(&self.cancelled).push(book_id.to_string());
        }

        fn attach_events(&self, sink: Sender<EngineEvent>) {
            *lock(&self.sink) = Some(sink);
        }
    }

    struct Fixture {
        // Dropped in declaration order: the service must stop before the
        // workspace directory disappears underneath its worker threads.
        service: SyncService,
        engine: Arc<MockEngine>,
        download_dir: PathBuf,
        monitored_dir: PathBuf,
        _workspace: TempDir,
    }

    fn fixture_with(feed: &str, stability_window_ms: u64, recheck_delay_ms: u64) -> Fixture {
        let workspace = TempDir::new().expect("temp dir");
        let download_dir = workspace.path().join("downloads");
        let monitored_dir = workspace.path().join("books");
        fs::create_dir_all(&download_dir).expect("create download dir");
        fs::create_dir_all(&monitored_dir).expect("create monitored dir");

        let config = AppConfig {
            library_path: workspace.path().join("library.toml"),
            download_dir: download_dir.clone(),
            file_stability_window_ms: stability_window_ms,
            recheck_delay_ms,
            ..AppConfig::default()
        };
        let engine = Arc::new(MockEngine::default());
        let service = SyncService::start(
            &config,
            Box::new(StaticTransport {
                feed: feed.to_string(),
            }),
            Some(Box::new(Arc::clone(&engine))),
        )
        .expect("service starts");

        Fixture {
            service,
            engine,
            download_dir,
            monitored_dir,
            _workspace: workspace,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(r#"{"books": []}"#, 0, 10)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("condition not reached within the deadline");
    }

    fn drain(rx: &Receiver<Notification>) -> Vec<Notification> {
        rx.try_iter().collect()
    }

    const FEED: &str = r#"{
        "books": [
            {"id": "wiki", "title": "Wikipedia", "size": 100,
             "url": "http://test.invalid/wiki.zim", "language": "eng"},
            {"id": "bird", "title": "Birds", "size": 50,
             "url": "http://test.invalid/bird.zim"}
        ]
    }"#;

    #[test]
    fn unknown_book_everywhere_resolves_invalid() {
        let fx = fixture();
        assert_eq!(fx.service.book_state("ghost"), BookState::Invalid);
    }

    #[test]
    fn downloading_creates_a_placeholder_backing_the_ledger_entry() {
        let fx = fixture_with(FEED, 0, 10);
        fx.service.set_local(false);
        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);

        fx.service.download_book("wiki").expect("download starts");

        assert_eq!(fx.service.book_state("wiki"), BookState::Downloading);
        let placeholder = lock(&fx.service.shared.library)
            .get("wiki")
            .cloned()
            .expect("placeholder exists");
        assert_eq!(placeholder.download_id, "dl-wiki");
        assert!(placeholder.is_placeholder());
        assert!(fx.service.download_progress("wiki").is_some());
    }

    #[test]
    fn duplicate_download_is_refused_before_any_state_changes() {
        let fx = fixture_with(FEED, 0, 10);
        fx.service.set_local(false);
        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);
        fx.service.download_book("wiki").expect("first download starts");

        let err = fx.service.download_book("wiki").expect_err("duplicate refused");
        assert!(matches!(
            err,
            CoreError::Precheck(PrecheckError::DuplicateDownload(_))
        ));
    }

    #[test]
    fn downloads_are_unavailable_without_an_engine() {
        let workspace = TempDir::new().expect("temp dir");
        let config = AppConfig {
            library_path: workspace.path().join("library.toml"),
            download_dir: workspace.path().to_path_buf(),
            ..AppConfig::default()
        };
        let service = SyncService::start(
            &config,
            Box::new(StaticTransport {
                feed: FEED.to_string(),
            }),
            None,
        )
        .expect("service starts");
        service.set_local(false);
        wait_until(|| service.book_state("wiki") == BookState::AvailableOnline);

        let err = service.download_book("wiki").expect_err("no engine");
        assert!(matches!(
            err,
            CoreError::Precheck(PrecheckError::DownloadsUnavailable)
        ));
    }

    #[test]
    fn paused_download_wins_over_the_placeholder() {
        let fx = fixture_with(FEED, 0, 10);
        fx.service.set_local(false);
        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);
        fx.service.download_book("wiki").expect("download starts");

        fx.engine.emit(EngineEvent::Updated(DownloadUpdate {
            book_id: "wiki".to_string(),
            status: DownloadStatus::Paused,
            path: Some(fx.download_dir.join("wiki.zim")),
            progress: DownloadProgress::default(),
        }));

        wait_until(|| fx.service.book_state("wiki") == BookState::DownloadPaused);
    }

    #[test]
    fn completed_download_converts_the_placeholder() {
        let fx = fixture_with(FEED, 0, 10);
        fx.service.set_local(false);
        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);
        fx.service.download_book("wiki").expect("download starts");

        let path = fx.download_dir.join("wiki.zim");
        write_archive(&path, 9);
        fx.engine.emit(EngineEvent::Updated(DownloadUpdate {
            book_id: "wiki".to_string(),
            status: DownloadStatus::Completed,
            path: Some(path.clone()),
            progress: DownloadProgress {
                completed_bytes: 100,
                total_bytes: 100,
            },
        }));

        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableLocallyHealthy);
        assert!(fx.service.download_progress("wiki").is_none(), "ledger entry gone");
        let book = fx.service.book_info("wiki").expect("book exists");
        assert!(book.download_id.is_empty());
        assert!(book.url.is_empty());
        assert_eq!(book.path, Some(path));
    }

    #[test]
    fn disappeared_download_releases_the_placeholder_without_localizing_it() {
        let fx = fixture_with(FEED, 0, 10);
        fx.service.set_local(false);
        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);
        fx.service.download_book("wiki").expect("download starts");

        fx.engine.emit(EngineEvent::Disappeared("wiki".to_string()));

        wait_until(|| fx.service.book_state("wiki") == BookState::MissingFile);
        let record = lock(&fx.service.shared.library)
            .get("wiki")
            .cloned()
            .expect("record kept");
        assert!(record.download_id.is_empty());
        assert!(record.path.is_none());
    }

    #[test]
    fn cancelled_download_removes_partial_files_and_the_placeholder() {
        let fx = fixture_with(FEED, 0, 10);
        fx.service.set_local(false);
        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);
        fx.service.download_book("wiki").expect("download starts");

        let path = fx.download_dir.join("wiki.zim");
        fs::write(&path, b"partial").expect("write partial file");
        fs::write(fx.download_dir.join("wiki.zim.part"), b"meta").expect("write control file");
        fx.engine.emit(EngineEvent::Updated(DownloadUpdate {
            book_id: "wiki".to_string(),
            status: DownloadStatus::Downloading,
            path: Some(path.clone()),
            progress: DownloadProgress::default(),
        }));
        wait_until(|| {
            lock(&fx.service.shared.library)
                .get("wiki")
                .is_some_and(|b| b.path.is_some())
        });

        fx.engine.emit(EngineEvent::Cancelled("wiki".to_string()));

        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);
        assert!(!path.exists());
        assert!(!fx.download_dir.join("wiki.zim.part").exists());
        assert!(fx.service.download_progress("wiki").is_none());
    }

    #[test]
    fn engine_errors_reach_subscribers() {
        let fx = fixture();
        let rx = fx.service.subscribe();

        fx.engine.emit(EngineEvent::Error {
            summary: "mirror unreachable".to_string(),
            details: "connection refused".to_string(),
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Notification::Error { summary, .. }) => {
                    assert_eq!(summary, "mirror unreachable");
                    break;
                }
                Ok(_) => continue,
                Err(_) if Instant::now() < deadline => continue,
                Err(err) => panic!("no error notification: {err}"),
            }
        }
    }

    #[test]
    fn identical_search_is_set_once_and_notified_once() {
        let fx = fixture();
        let rx = fx.service.subscribe();

        fx.service.set_search("maps");
        fx.service.set_search("maps");

        let notes = drain(&rx);
        assert_eq!(notes, vec![Notification::CatalogChanged]);
    }

    #[test]
    fn identical_sort_is_notified_once() {
        let fx = fixture();
        let rx = fx.service.subscribe();

        fx.service.set_sort(SortKey::Title, false);
        fx.service.set_sort(SortKey::Title, false);

        let notes = drain(&rx);
        assert_eq!(notes, vec![Notification::CatalogChanged]);
    }

    #[test]
    fn remote_toggle_fetches_and_swaps_the_snapshot() {
        let fx = fixture_with(FEED, 0, 10);
        let rx = fx.service.subscribe();

        fx.service.set_local(false);

        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);
        wait_until(|| fx.service.book_state("bird") == BookState::AvailableOnline);
        // The busy indicator clears once the snapshot is in place.
        wait_until(|| {
            drain(&rx)
                .iter()
                .any(|n| *n == Notification::PendingRequest(false))
        });
        assert_eq!(fx.service.visible_book_ids(), ["bird", "wiki"]);
    }

    #[test]
    fn visible_ids_follow_the_sort_parameters() {
        let fx = fixture_with(FEED, 0, 10);
        fx.service.set_local(false);
        wait_until(|| fx.service.visible_book_ids().len() == 2);

        fx.service.set_sort(SortKey::Size, true);
        assert_eq!(fx.service.visible_book_ids(), ["bird", "wiki"]);

        fx.service.set_sort(SortKey::Size, false);
        assert_eq!(fx.service.visible_book_ids(), ["wiki", "bird"]);
    }

    #[test]
    fn placeholder_info_is_answered_from_the_remote_snapshot() {
        let fx = fixture_with(FEED, 0, 10);
        fx.service.set_local(false);
        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);
        fx.service.download_book("wiki").expect("download starts");

        let info = fx.service.book_info("wiki").expect("info available");
        assert_eq!(info.title, "Wikipedia");
        assert!(info.download_id.is_empty(), "remote copy, not the placeholder");
    }

    #[test]
    fn monitored_directory_ingests_existing_archives() {
        let fx = fixture();
        let id = write_archive(&fx.monitored_dir.join("atlas.zim"), 5);

        fx.service
            .set_monitored_directories([fx.monitored_dir.clone()].into_iter().collect());

        wait_until(|| fx.service.book_state(&id) == BookState::AvailableLocallyHealthy);
    }

    #[test]
    fn deleting_an_archive_drops_its_book() {
        let fx = fixture();
        let path = fx.monitored_dir.join("atlas.zim");
        let id = write_archive(&path, 5);
        fx.service
            .set_monitored_directories([fx.monitored_dir.clone()].into_iter().collect());
        wait_until(|| fx.service.book_state(&id) == BookState::AvailableLocallyHealthy);

        fs::remove_file(&path).expect("delete archive");
        fx.service.reconcile_now(&fx.monitored_dir);

        wait_until(|| fx.service.book_state(&id) == BookState::Invalid);
    }

    #[test]
    fn setting_the_same_directories_again_is_a_no_op() {
        let fx = fixture();
        let dirs: BTreeSet<PathBuf> = [fx.monitored_dir.clone()].into_iter().collect();
        fx.service.set_monitored_directories(dirs.clone());
        wait_until(|| fx.service.reconcile_now(&fx.monitored_dir) == (0, 0));
        let rx = fx.service.subscribe();

        fx.service.set_monitored_directories(dirs);

        thread::sleep(Duration::from_millis(100));
        assert!(drain(&rx).is_empty(), "no rescan, no notifications");
    }

    #[test]
    fn hot_file_is_ingested_after_the_quiet_period_via_its_recheck() {
        let fx = fixture_with(r#"{"books": []}"#, 150, 150);
        fx.service
            .set_monitored_directories([fx.monitored_dir.clone()].into_iter().collect());
        wait_until(|| fx.service.reconcile_now(&fx.monitored_dir) == (0, 0));

        // Freshly written: inside the stability window, so the first pass
        // defers and the scheduled recheck must finish the job.
        let id = write_archive(&fx.monitored_dir.join("fresh.zim"), 6);
        fx.service.reconcile_now(&fx.monitored_dir);

        wait_until(|| fx.service.book_state(&id) == BookState::AvailableLocallyHealthy);
    }

    #[test]
    fn erase_book_removes_files_record_and_watch_entry() {
        let fx = fixture();
        let path = fx.monitored_dir.join("atlas.zim");
        let id = write_archive(&path, 5);
        fx.service
            .set_monitored_directories([fx.monitored_dir.clone()].into_iter().collect());
        wait_until(|| fx.service.book_state(&id) == BookState::AvailableLocallyHealthy);

        fx.service.erase_book(&id, false).expect("erase succeeds");

        assert!(!path.exists());
        assert_eq!(fx.service.book_state(&id), BookState::Invalid);
        // A follow-up pass finds nothing to do.
        assert_eq!(fx.service.reconcile_now(&fx.monitored_dir), (0, 0));
    }

    #[test]
    fn open_book_requires_a_healthy_local_copy() {
        let fx = fixture_with(FEED, 0, 10);
        fx.service.set_local(false);
        wait_until(|| fx.service.book_state("wiki") == BookState::AvailableOnline);

        let err = fx.service.open_book("wiki").expect_err("remote book cannot open");
        assert!(matches!(err, CoreError::Unavailable { .. }));

        let id = write_archive(&fx.monitored_dir.join("atlas.zim"), 5);
        fx.service
            .set_monitored_directories([fx.monitored_dir.clone()].into_iter().collect());
        wait_until(|| fx.service.book_state(&id) == BookState::AvailableLocallyHealthy);

        let path = fx.service.open_book(&id).expect("local book opens");
        assert!(path.ends_with("atlas.zim"));
    }

    #[test]
    fn failed_save_leaves_no_download_state_behind() {
        let workspace = TempDir::new().expect("temp dir");
        let download_dir = workspace.path().join("downloads");
        fs::create_dir_all(&download_dir).expect("create download dir");
        // The library's parent "directory" is a plain file, so saving fails.
        let blocker = workspace.path().join("blocker");
        fs::write(&blocker, b"in the way").expect("write blocker");

        let config = AppConfig {
            library_path: blocker.join("library.toml"),
            download_dir,
            ..AppConfig::default()
        };
        let engine = Arc::new(MockEngine::default());
        let service = SyncService::start(
            &config,
            Box::new(StaticTransport {
                feed: FEED.to_string(),
            }),
            Some(Box::new(Arc::clone(&engine))),
        )
        .expect("service starts");
        service.set_local(false);
        wait_until(|| service.book_state("wiki") == BookState::AvailableOnline);

        let err = service.download_book("wiki").expect_err("save must fail");

        assert!(matches!(err, CoreError::Persistence { .. }));
        assert!(service.download_progress("wiki").is_none(), "no ledger entry");
        assert_eq!(service.book_state("wiki"), BookState::AvailableOnline);
        assert_eq!(lock(&engine.cancelled).as_slice(), ["wiki"]);
    }
}
