//! Queries over the stored history: which products still need collecting,
//! whose history is too short, and which traded most in a window.
//!
//! Logs that cannot be parsed are skipped with a warning so one bad file
//! does not hide the answer for the rest of the store.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use codec::{ProductMeta, TradeRecord};
use store::FlatStore;
use tracing::warn;

/// Trade count for one entity within a time window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub entity: String,
    pub volume: usize,
}

/// Product ids listed in the metadata log that have no entity log yet.
///
/// Ids are returned in metadata order, each once.
pub fn unscraped_by_metadata(store: &FlatStore, meta_log: &str) -> Result<Vec<String>> {
    let meta = match store.read_all::<ProductMeta>(meta_log) {
        Ok(meta) => meta,
        Err(e) if e.is_corrupt() => {
            warn!(log = meta_log, error = %e, "skipping unreadable metadata log");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read metadata log {meta_log}"));
        }
    };
    let stored = store.list_logs()?;

    let mut seen = BTreeSet::new();
    Ok(meta
        .into_iter()
        .map(|m| m.product_id)
        .filter(|id| !stored.contains(id))
        .filter(|id| seen.insert(id.clone()))
        .collect())
}

/// Entities whose earliest stored record is after `base`, i.e. whose
/// history does not reach back to `base`. Empty logs are included.
pub fn missing_history_before(store: &FlatStore, base: DateTime<Utc>) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for entity in store.list_entities()? {
        let Some(records) = read_entity(store, &entity)? else {
            continue;
        };
        match records.first() {
            Some(first) if first.date_created.instant() <= base => {}
            _ => missing.push(entity),
        }
    }
    Ok(missing)
}

/// Number of trades per entity with `start <= timestamp < end`, highest
/// volume first (ties by id), truncated to `top` entries if given.
/// Entities without trades in the window are omitted.
pub fn trading_volume(
    store: &FlatStore,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    top: Option<usize>,
) -> Result<Vec<Volume>> {
    anyhow::ensure!(start <= end, "window start {start} is after end {end}");

    let mut volumes = Vec::new();
    for entity in store.list_entities()? {
        let Some(records) = read_entity(store, &entity)? else {
            continue;
        };
        let volume = records
            .iter()
            .filter(|r| {
                let t = r.date_created.instant();
                start <= t && t < end
            })
            .count();
        if volume > 0 {
            volumes.push(Volume { entity, volume });
        }
    }

    volumes.sort_by(|a, b| b.volume.cmp(&a.volume).then_with(|| a.entity.cmp(&b.entity)));
    if let Some(top) = top {
        volumes.truncate(top);
    }
    Ok(volumes)
}

/// Reads an entity log, returning `None` (with a warning) if it is corrupt.
fn read_entity(store: &FlatStore, entity: &str) -> Result<Option<Vec<TradeRecord>>> {
    match store.read_all::<TradeRecord>(entity) {
        Ok(records) => Ok(Some(records)),
        Err(e) if e.is_corrupt() => {
            warn!(entity, error = %e, "skipping unreadable log");
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read log of {entity}")),
    }
}
