//! Configuration loading.
//!
//! All user-tunable settings are centralized here and loaded from
//! `conf/config.toml` if present. Any missing or invalid entries fall back to
//! sensible defaults so the service can still start.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// High-level app configuration; deserializable from TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_library_path")]
    pub library_path: PathBuf,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub monitored_directories: Vec<PathBuf>,
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default)]
    pub move_to_trash: bool,
    #[serde(default = "default_archive_suffixes")]
    pub archive_suffixes: Vec<String>,
    /// A file is considered stable once it has stayed unchanged this long.
    #[serde(default = "default_file_stability_window_ms")]
    pub file_stability_window_ms: u64,
    /// Delay before an unstable file is re-examined.
    #[serde(default = "default_recheck_delay_ms")]
    pub recheck_delay_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            library_path: default_library_path(),
            download_dir: default_download_dir(),
            monitored_directories: Vec::new(),
            catalog_url: default_catalog_url(),
            move_to_trash: false,
            archive_suffixes: default_archive_suffixes(),
            file_stability_window_ms: default_file_stability_window_ms(),
            recheck_delay_ms: default_recheck_delay_ms(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Suffixes normalized to bare lowercase extensions; empty entries and
    /// leading dots are tolerated in the config file.
    pub fn sanitized_suffixes(&self) -> Vec<String> {
        let mut out = Vec::new();
        for suffix in &self.archive_suffixes {
            let normalized = suffix.trim().trim_start_matches('.').to_ascii_lowercase();
            if !normalized.is_empty() && !out.iter().any(|s| s == &normalized) {
                out.push(normalized);
            }
        }
        if out.is_empty() {
            default_archive_suffixes()
        } else {
            out
        }
    }
}

/// Load configuration from the given path, falling back to defaults on error.
pub fn load_config(path: &Path) -> AppConfig {
    let contents = match fs::read_to_string(path) {
        Ok(data) => {
            info!(path = %path.display(), "Loaded base config");
            data
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                "Falling back to default config: {err}"
            );
            return AppConfig::default();
        }
    };

    match toml::from_str::<AppConfig>(&contents) {
        Ok(cfg) => {
            debug!("Parsed configuration from disk");
            cfg
        }
        Err(err) => {
            warn!(path = %path.display(), "Invalid config TOML: {err}");
            AppConfig::default()
        }
    }
}

fn default_library_path() -> PathBuf {
    PathBuf::from("conf/library.toml")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_catalog_url() -> String {
    "http://127.0.0.1:8181".to_string()
}

fn default_archive_suffixes() -> Vec<String> {
    vec!["zim".to_string()]
}

fn default_file_stability_window_ms() -> u64 {
    1000
}

fn default_recheck_delay_ms() -> u64 {
    1000
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
