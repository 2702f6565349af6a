//! Repair pass: removes exact-duplicate rows from every log in the store.
//!
//! Duplicates appear when a session crashes after a batch was appended but
//! before the source moved on, and the next session is handed the same rows
//! again without a usable resume marker. The pass keeps the first copy of
//! each row, preserves the relative order of the survivors, and never
//! touches the header.
//!
//! A log is rewritten only if it actually shrinks, so running the pass twice
//! in a row modifies nothing the second time. Logs with rows that cannot be
//! parsed (short rows, unterminated quotes) are reported and left alone.

use std::collections::HashSet;

use anyhow::{Context, Result};
use codec::split_fields;
use store::{FlatStore, RawLog, StoreError};
use tracing::{info, warn};

/// Summary of one repair pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Number of logs inspected.
    pub scanned: usize,
    /// Logs that were rewritten, in name order.
    pub repaired: Vec<String>,
    /// Logs excluded from repair because they could not be parsed, with the
    /// reason.
    pub skipped: Vec<(String, String)>,
    /// Total duplicate rows removed across all logs.
    pub duplicates_removed: usize,
}

impl RepairReport {
    /// Number of logs that were modified.
    #[must_use]
    pub fn files_changed(&self) -> usize {
        self.repaired.len()
    }
}

/// Result of checking a single log.
#[derive(Debug, PartialEq, Eq)]
enum LogRepair {
    Clean,
    Repaired { removed: usize },
    Malformed { reason: String },
}

/// Runs the repair pass over every log in `store`.
///
/// # Errors
///
/// I/O errors abort the pass. Unparsable logs do not; they are listed in
/// [`RepairReport::skipped`].
pub fn repair_store(store: &FlatStore) -> Result<RepairReport> {
    let mut report = RepairReport::default();

    let logs = store
        .list_logs()
        .with_context(|| format!("failed to list logs in {}", store.dir().display()))?;

    for name in logs {
        report.scanned += 1;
        match repair_log(store, &name) {
            Ok(LogRepair::Clean) => {}
            Ok(LogRepair::Repaired { removed }) => {
                info!(log = %name, removed, "removed duplicate rows");
                report.duplicates_removed += removed;
                report.repaired.push(name);
            }
            Ok(LogRepair::Malformed { reason }) => {
                warn!(log = %name, %reason, "log is malformed, excluded from repair");
                report.skipped.push((name, reason));
            }
            Err(e) if e.is_corrupt() => {
                warn!(log = %name, error = %e, "log is unreadable, excluded from repair");
                report.skipped.push((name, e.to_string()));
            }
            Err(e) => return Err(e).with_context(|| format!("failed to repair log {name}")),
        }
    }

    info!(
        scanned = report.scanned,
        repaired = report.files_changed(),
        skipped = report.skipped.len(),
        duplicates = report.duplicates_removed,
        "repair pass finished"
    );
    Ok(report)
}

fn repair_log(store: &FlatStore, name: &str) -> Result<LogRepair, StoreError> {
    let Some(raw) = store.read_raw(name)? else {
        return Ok(LogRepair::Clean);
    };

    if let Some(reason) = find_malformed(&raw) {
        return Ok(LogRepair::Malformed { reason });
    }

    let (rows, removed) = dedup_rows(raw.rows);
    if removed == 0 {
        return Ok(LogRepair::Clean);
    }

    store.overwrite_raw(
        name,
        &RawLog {
            header: raw.header,
            rows,
        },
    )?;
    Ok(LogRepair::Repaired { removed })
}

/// Keeps the first occurrence of each row, in original order. Returns the
/// surviving rows and how many were dropped.
pub fn dedup_rows(rows: Vec<String>) -> (Vec<String>, usize) {
    let before = rows.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<String> = rows
        .into_iter()
        .filter(|row| seen.insert(row.clone()))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Returns a description of the first row whose field count differs from
/// the header's, or that cannot be split into fields.
fn find_malformed(raw: &RawLog) -> Option<String> {
    let columns = match split_fields(&raw.header) {
        Ok(fields) => fields.len(),
        Err(e) => return Some(format!("header: {e}")),
    };
    for (i, row) in raw.rows.iter().enumerate() {
        match split_fields(row) {
            Ok(fields) if fields.len() == columns => {}
            Ok(fields) => {
                return Some(format!(
                    "record {}: expected {columns} fields, found {}",
                    i + 1,
                    fields.len()
                ))
            }
            Err(e) => return Some(format!("record {}: {e}", i + 1)),
        }
    }
    None
}
