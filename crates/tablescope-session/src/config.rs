use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

/// Environment flag enabling debug-level SQL logging (`1`, `true`, `yes`, `on`).
pub const SQL_LOG_ENV: &str = "TABLESCOPE_SQL_LOG";

/// `log` target used for executed SQL.
pub const SQL_LOG_TARGET: &str = "tablescope::sql";

/// Per-session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rows per cached page (default: 500).
    pub page_size: u64,
    /// Pages kept in memory before LRU eviction (default: 20).
    pub max_cached_pages: usize,
    /// Rows read into the preview table (default: 1000).
    pub preview_rows: u64,
    /// A column with at most this many distinct values is treated as
    /// categorical by the profiler and column summaries (default: 15).
    pub categorical_threshold: u64,
    /// Equal-width bins for histograms (default: 20).
    pub histogram_bins: u32,
    /// Values returned by top-N queries (default: 10).
    pub top_values_limit: u64,
    /// Name of the materialized table (default: `data`).
    pub table_name: String,
    /// Name of the connection-local preview table (default: `preview`).
    pub preview_table_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            max_cached_pages: 20,
            preview_rows: 1000,
            categorical_threshold: 15,
            histogram_bins: 20,
            top_values_limit: 10,
            table_name: "data".to_string(),
            preview_table_name: "preview".to_string(),
        }
    }
}

impl SessionConfig {
    pub(crate) fn normalized(mut self) -> Self {
        self.page_size = self.page_size.max(1);
        self.max_cached_pages = self.max_cached_pages.max(1);
        self.histogram_bins = self.histogram_bins.max(1);
        self
    }
}

/// Settings applied to every engine connection on open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads; defaults to the number of logical cores.
    pub threads: Option<usize>,
    /// Spill directory; defaults to `<user cache dir>/spill`.
    pub temp_directory: Option<PathBuf>,
    /// Fixed memory limit for the engine. When unset, the session joins its
    /// [`MemoryBudget`] on open and the limit follows the budget's share.
    ///
    /// [`MemoryBudget`]: crate::MemoryBudget
    pub memory_limit_bytes: Option<u64>,
    /// Log every executed statement under [`SQL_LOG_TARGET`].
    pub sql_log: bool,
}

impl EngineConfig {
    /// Defaults, with `sql_log` taken from [`SQL_LOG_ENV`].
    pub fn from_env() -> Self {
        Self {
            sql_log: std::env::var(SQL_LOG_ENV)
                .map(|value| flag_enabled(&value))
                .unwrap_or(false),
            ..Self::default()
        }
    }

    pub(crate) fn resolved_threads(&self) -> usize {
        self.threads
            .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
            .unwrap_or(1)
            .max(1)
    }

    pub(crate) fn resolved_temp_directory(&self) -> Option<PathBuf> {
        self.temp_directory.clone().or_else(default_temp_directory)
    }
}

fn flag_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_temp_directory() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("dev", "tablescope", "tablescope")?;
    Some(dirs.cache_dir().join("spill"))
}
