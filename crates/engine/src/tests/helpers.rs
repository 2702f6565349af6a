use std::fs;
use std::path::Path;

use chrono::{Duration, TimeZone, Utc};
use codec::{Row, Timestamp, TradeRecord};
use store::FlatStore;

use crate::{GapPolicy, MergeEngine};

pub const META_LOG: &str = "product_meta_data";

/// Timestamp `sec` seconds after 2025-01-01T00:00:00Z.
pub fn ts(sec: i64) -> Timestamp {
    let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    Timestamp::from_instant(base + Duration::seconds(sec))
}

pub fn trade_with_price(entity: &str, sec: i64, price: u64) -> TradeRecord {
    TradeRecord {
        product_id: entity.to_string(),
        price,
        option: "270".to_string(),
        date_created: ts(sec),
        is_immediate_delivery_item: sec % 2 == 0,
    }
}

/// A trade whose price is derived from its second, so distinct seconds give
/// distinct rows.
pub fn trade(entity: &str, sec: i64) -> TradeRecord {
    trade_with_price(entity, sec, 100_000 + sec as u64)
}

pub fn batch(entity: &str, secs: &[i64]) -> Vec<TradeRecord> {
    secs.iter().map(|&s| trade(entity, s)).collect()
}

pub fn engine(dir: &Path) -> MergeEngine {
    engine_with(dir, GapPolicy::Skip)
}

pub fn engine_with(dir: &Path, policy: GapPolicy) -> MergeEngine {
    MergeEngine::new(FlatStore::open(dir).unwrap(), policy, META_LOG)
}

/// Seconds (relative to the helper epoch) of every stored record, in order.
pub fn stored_secs(engine: &MergeEngine, entity: &str) -> Vec<i64> {
    let base = ts(0).instant();
    engine
        .store()
        .read_all::<TradeRecord>(entity)
        .unwrap()
        .iter()
        .map(|r| (r.date_created.instant() - base).num_seconds())
        .collect()
}

/// Writes a log file verbatim: header plus the given raw rows.
pub fn write_raw_log(dir: &Path, name: &str, rows: &[&str]) {
    let mut text = TradeRecord::header();
    text.push('\n');
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    fs::write(dir.join(format!("{name}.csv")), text).unwrap();
}
