//! Diagnostics sink for a harvest session.
//!
//! Events go to stderr and to a per-session file
//! `<log_dir>/harvest_<UTC timestamp>.log`. `RUST_LOG` overrides the
//! configured level, e.g. `RUST_LOG=engine=debug,store=debug`.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber and returns the session log file path.
///
/// Call once, at startup.
pub fn init_logging(level: &str, log_dir: &Path) -> Result<PathBuf> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
    let path = log_dir.join(session_log_name());
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false);
    let file_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install log subscriber")?;

    tracing::info!(log_level = %level, log_file = %path.display(), "logging initialized");
    Ok(path)
}

/// Installs a stderr-only subscriber, for when the session log file
/// cannot be opened.
pub fn init_stderr_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init()
        .context("failed to install log subscriber")
}

fn session_log_name() -> String {
    format!("harvest_{}.log", Utc::now().format("%Y%m%dT%H%M%SZ"))
}
