//! # Config - Harvester Settings
//!
//! All settings come from environment variables with defaults:
//!
//! ```text
//! HARVEST_STORE_DIR     directory of entity logs          (default: "output")
//! HARVEST_LOG_DIR       directory of session diagnostics  (default: "logs")
//! HARVEST_LOG_LEVEL     tracing filter                    (default: "info")
//! HARVEST_META_LOG      name of the metadata log          (default: "product_meta_data")
//! HARVEST_GAP_POLICY    skip | append-newer | reconcile   (default: "skip")
//! HARVEST_MAX_ATTEMPTS  fetch attempts per entity         (default: 5)
//! HARVEST_COOLDOWN_MS   base backoff between attempts     (default: 4000)
//! HARVEST_BASE_PAGES    pages requested for a new entity  (default: 20)
//! HARVEST_PAGE_SIZE     records per fetched page          (default: 50)
//! HARVEST_SYNC          fsync every write                 (default: "false")
//! ```
//!
//! A variable that is set but cannot be parsed is an error; it is never
//! silently replaced by the default.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_STORE_DIR: &str = "output";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_META_LOG: &str = "product_meta_data";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_COOLDOWN_MS: u64 = 4000;
pub const DEFAULT_BASE_PAGES: usize = 20;
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Errors produced while reading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// What to do with a batch when the stored resume marker does not occur in
/// it (the gap between the log and the batch is wider than one batch, or the
/// log ends after the batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GapPolicy {
    /// Warn and drop the batch.
    #[default]
    Skip,
    /// Append only the records strictly newer than the stored last record.
    AppendNewer,
    /// Merge the stored log with the batch, order by timestamp, drop exact
    /// duplicates and overwrite the log.
    Reconcile,
}

impl FromStr for GapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(GapPolicy::Skip),
            "append-newer" | "append_newer" => Ok(GapPolicy::AppendNewer),
            "reconcile" => Ok(GapPolicy::Reconcile),
            other => Err(format!(
                "unknown gap policy '{other}' (expected skip, append-newer or reconcile)"
            )),
        }
    }
}

impl fmt::Display for GapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GapPolicy::Skip => "skip",
            GapPolicy::AppendNewer => "append-newer",
            GapPolicy::Reconcile => "reconcile",
        })
    }
}

/// Retry settings for fetching one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Wait after the n-th failed attempt is `cooldown * n`.
    pub cooldown: Duration,
}

impl RetryPolicy {
    /// Wait before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.cooldown.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
        }
    }
}

/// Sizing of fetch windows.
///
/// A source returns `page_size` records per page. A never-seen entity gets
/// `base_pages` pages; an entity that already has `n` stored records gets
/// `base_pages + n / page_size`, so a resumed session scrolls past what is
/// already stored instead of stopping short of new history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePlan {
    pub base_pages: usize,
    pub page_size: usize,
}

impl PagePlan {
    /// Number of pages to request for an entity with `stored` rows.
    pub fn pages_for(&self, stored: usize) -> usize {
        self.base_pages + stored / self.page_size.max(1)
    }
}

impl Default for PagePlan {
    fn default() -> Self {
        Self {
            base_pages: DEFAULT_BASE_PAGES,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Complete harvester configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestConfig {
    pub store_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub meta_log: String,
    pub gap_policy: GapPolicy,
    pub retry: RetryPolicy,
    pub pages: PagePlan,
    /// If `true`, every store write is followed by `fsync`.
    pub sync: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            meta_log: DEFAULT_META_LOG.to_string(),
            gap_policy: GapPolicy::default(),
            retry: RetryPolicy::default(),
            pages: PagePlan::default(),
            sync: false,
        }
    }
}

impl HarvestConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of a
    /// variable or `None` if it is unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let max_attempts: u32 = parsed(&lookup, "HARVEST_MAX_ATTEMPTS", defaults.retry.max_attempts)?;
        let cooldown_ms: u64 = parsed(&lookup, "HARVEST_COOLDOWN_MS", DEFAULT_COOLDOWN_MS)?;
        let page_size: usize = parsed(&lookup, "HARVEST_PAGE_SIZE", defaults.pages.page_size)?;

        if max_attempts == 0 {
            return Err(invalid("HARVEST_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if page_size == 0 {
            return Err(invalid("HARVEST_PAGE_SIZE", "0", "must be at least 1"));
        }

        Ok(Self {
            store_dir: PathBuf::from(text("HARVEST_STORE_DIR", DEFAULT_STORE_DIR)),
            log_dir: PathBuf::from(text("HARVEST_LOG_DIR", DEFAULT_LOG_DIR)),
            log_level: text("HARVEST_LOG_LEVEL", DEFAULT_LOG_LEVEL),
            meta_log: text("HARVEST_META_LOG", DEFAULT_META_LOG),
            gap_policy: parsed(&lookup, "HARVEST_GAP_POLICY", defaults.gap_policy)?,
            retry: RetryPolicy {
                max_attempts,
                cooldown: Duration::from_millis(cooldown_ms),
            },
            pages: PagePlan {
                base_pages: parsed(&lookup, "HARVEST_BASE_PAGES", defaults.pages.base_pages)?,
                page_size,
            },
            sync: parsed(&lookup, "HARVEST_SYNC", defaults.sync)?,
        })
    }
}

fn parsed<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &value, &e.to_string())),
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
