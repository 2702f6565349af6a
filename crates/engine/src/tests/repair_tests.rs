use super::helpers::*;
use crate::repair::dedup_rows;
use crate::*;
use anyhow::Result;
use codec::{ProductMeta, Row, TradeRecord};
use std::fs;
use store::FlatStore;
use tempfile::tempdir;

const ROW_A: &str = "5,100,opt,2025-01-01T00:00:00Z,true";
const ROW_B: &str = "5,110,opt,2025-01-01T00:00:01Z,false";
const ROW_C: &str = "5,120,opt,2025-01-01T00:00:02Z,true";

fn data_rows(dir: &std::path::Path, name: &str) -> Vec<String> {
    fs::read_to_string(dir.join(format!("{name}.csv")))
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

// --------------------- dedup_rows ---------------------

#[test]
fn dedup_keeps_first_occurrence_in_order() {
    let rows = ["b", "a", "b", "c", "a"].map(String::from).to_vec();
    let (kept, removed) = dedup_rows(rows);
    assert_eq!(kept, vec!["b", "a", "c"]);
    assert_eq!(removed, 2);
}

#[test]
fn dedup_of_distinct_rows_is_identity() {
    let rows = ["x", "y"].map(String::from).to_vec();
    let (kept, removed) = dedup_rows(rows.clone());
    assert_eq!(kept, rows);
    assert_eq!(removed, 0);
}

// --------------------- repair_store ---------------------

#[test]
fn duplicate_row_is_removed_from_log() -> Result<()> {
    let dir = tempdir()?;
    write_raw_log(dir.path(), "5", &[ROW_A, ROW_A]);
    let store = FlatStore::open(dir.path())?;

    let report = repair_store(&store)?;
    assert_eq!(report.files_changed(), 1);
    assert_eq!(report.duplicates_removed, 1);
    assert_eq!(report.repaired, vec!["5".to_string()]);
    assert_eq!(data_rows(dir.path(), "5"), vec![ROW_A]);

    let header = fs::read_to_string(store.log_path("5"))?;
    assert!(header.starts_with(&TradeRecord::header()));
    Ok(())
}

#[test]
fn second_pass_changes_nothing() -> Result<()> {
    let dir = tempdir()?;
    write_raw_log(dir.path(), "5", &[ROW_A, ROW_B, ROW_A, ROW_C, ROW_B]);
    let store = FlatStore::open(dir.path())?;

    let first = repair_store(&store)?;
    assert_eq!(first.duplicates_removed, 2);
    let after_first = fs::read(store.log_path("5"))?;

    let second = repair_store(&store)?;
    assert_eq!(second.files_changed(), 0);
    assert_eq!(second.duplicates_removed, 0);
    assert_eq!(fs::read(store.log_path("5"))?, after_first);
    Ok(())
}

#[test]
fn survivors_keep_relative_order() -> Result<()> {
    let dir = tempdir()?;
    write_raw_log(dir.path(), "5", &[ROW_C, ROW_A, ROW_C, ROW_B, ROW_A]);
    let store = FlatStore::open(dir.path())?;

    repair_store(&store)?;
    assert_eq!(data_rows(dir.path(), "5"), vec![ROW_C, ROW_A, ROW_B]);
    Ok(())
}

#[test]
fn clean_logs_are_not_rewritten() -> Result<()> {
    let dir = tempdir()?;
    write_raw_log(dir.path(), "5", &[ROW_A, ROW_B]);
    let store = FlatStore::open(dir.path())?;
    let before = fs::metadata(store.log_path("5"))?.modified()?;

    let report = repair_store(&store)?;
    assert_eq!(report.scanned, 1);
    assert_eq!(report.files_changed(), 0);
    assert_eq!(fs::metadata(store.log_path("5"))?.modified()?, before);
    Ok(())
}

#[test]
fn short_row_excludes_log_from_repair() -> Result<()> {
    let dir = tempdir()?;
    write_raw_log(dir.path(), "5", &[ROW_A, ROW_A, "5,100"]);
    write_raw_log(dir.path(), "6", &[ROW_B, ROW_B]);
    let store = FlatStore::open(dir.path())?;
    let before = fs::read(store.log_path("5"))?;

    let report = repair_store(&store)?;
    assert_eq!(report.scanned, 2);
    assert_eq!(report.repaired, vec!["6".to_string()]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "5");
    assert!(report.skipped[0].1.contains("record 3"));
    assert_eq!(fs::read(store.log_path("5"))?, before);
    Ok(())
}

#[test]
fn unterminated_quote_excludes_log_from_repair() -> Result<()> {
    let dir = tempdir()?;
    write_raw_log(dir.path(), "5", &[ROW_A, ROW_A, "5,100,\"opt,2025-01-01T00:00:00Z,true"]);
    let store = FlatStore::open(dir.path())?;
    let before = fs::read(store.log_path("5"))?;

    let report = repair_store(&store)?;
    assert_eq!(report.files_changed(), 0);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(fs::read(store.log_path("5"))?, before);
    Ok(())
}

#[test]
fn quoted_rows_are_compared_as_stored() -> Result<()> {
    let dir = tempdir()?;
    let quoted = "5,100,\"a,b\",2025-01-01T00:00:00Z,true";
    write_raw_log(dir.path(), "5", &[quoted, quoted]);
    let store = FlatStore::open(dir.path())?;

    repair_store(&store)?;
    let records = store.read_all::<TradeRecord>("5")?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].option, "a,b");
    Ok(())
}

#[test]
fn metadata_log_is_repaired_too() -> Result<()> {
    let dir = tempdir()?;
    let row = "7,Runner,129000,Acme";
    fs::write(
        dir.path().join(format!("{META_LOG}.csv")),
        format!("{}\n{row}\n{row}\n", ProductMeta::header()),
    )?;
    let mut engine = engine(dir.path());

    let report = engine.repair()?;
    assert_eq!(report.repaired, vec![META_LOG.to_string()]);
    assert_eq!(engine.read_meta()?.len(), 1);

    // The repaired log still resumes correctly.
    let meta = ProductMeta {
        product_id: "7".into(),
        name: "Runner".into(),
        original_price: 129_000,
        brand: "Acme".into(),
    };
    assert!(!engine.record_meta(&meta)?);
    Ok(())
}

#[test]
fn repair_of_empty_store_is_a_noop() -> Result<()> {
    let dir = tempdir()?;
    let store = FlatStore::open(dir.path())?;
    let report = repair_store(&store)?;
    assert_eq!(report, RepairReport::default());
    Ok(())
}

#[test]
fn merge_resumes_after_repair() -> Result<()> {
    let dir = tempdir()?;
    let mut engine = engine(dir.path());
    engine.ingest("5", &batch("5", &[1, 2, 3]))?;

    // Simulate a crash that re-appended the tail.
    engine.store().append("5", &batch("5", &[2, 3]))?;
    assert_eq!(stored_secs(&engine, "5"), vec![1, 2, 3, 2, 3]);

    let report = engine.repair()?;
    assert_eq!(report.duplicates_removed, 2);
    assert_eq!(stored_secs(&engine, "5"), vec![1, 2, 3]);

    engine.ingest("5", &batch("5", &[3, 4]))?;
    assert_eq!(stored_secs(&engine, "5"), vec![1, 2, 3, 4]);
    Ok(())
}
