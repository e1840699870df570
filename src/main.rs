//! Entry point for the headless library service.
//!
//! Responsibilities here are intentionally minimal:
//! - Load user configuration from `conf/config.toml`.
//! - Wire the catalog transport and start the sync service.
//! - Log notifications until Ctrl-C.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};
use zimshelf::config::load_config;
use zimshelf::remote::HttpTransport;
use zimshelf::sync::{Notification, SyncService};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn main() {
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let config = load_config(Path::new("conf/config.toml"));
    set_log_level(reload_handle, config.log_level.as_filter_str());
    info!(
        library = %config.library_path.display(),
        catalog = %config.catalog_url,
        directories = config.monitored_directories.len(),
        level = %config.log_level,
        "Starting the library service"
    );

    let transport =
        HttpTransport::new(&config.catalog_url).context("Failed to set up the catalog client")?;
    let mut service = SyncService::start(&config, Box::new(transport), None)
        .context("Failed to start the sync service")?;
    let notifications = service.subscribe();
    service.update_catalog();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::Release);
        })
        .context("Failed to install the Ctrl-C handler")?;
    }

    while running.load(Ordering::Acquire) {
        match notifications.recv_timeout(Duration::from_millis(500)) {
            Ok(Notification::CatalogChanged) => {
                info!(visible = service.visible_book_ids().len(), "Catalog changed")
            }
            Ok(Notification::PendingRequest(pending)) => {
                info!(pending, "Catalog request state")
            }
            Ok(Notification::LanguagesChanged) => {
                info!(count = service.languages().len(), "Languages updated")
            }
            Ok(Notification::CategoriesChanged) => {
                info!(count = service.categories().len(), "Categories updated")
            }
            Ok(Notification::Error { summary, details }) => {
                warn!(%summary, %details, "Service error")
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("Shutting down");
    service.shutdown();
    Ok(())
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter_layer),
        )
        .init();
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = handle.modify(|filter| *filter = parsed.clone()) {
        warn!(%level, "Failed to update log level from config: {err}");
    } else {
        info!(%level, "Applied log level from config");
    }
}
