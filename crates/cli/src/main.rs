//! # CLI - Harvest Shell
//!
//! A REPL-style command-line interface over a harvest store. Reads commands
//! from stdin, runs them against the store, and prints results to stdout.
//! Diagnostics go to stderr and to a per-session log file. Designed for
//! both interactive use and scripted maintenance (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! REPAIR                      Remove duplicate rows from every log
//! LIST                        List stored entities
//! LAST id                     Print the last stored record of an entity
//! COUNT id                    Number of stored records of an entity
//! PAGES id                    Pages the next fetch of an entity would request
//! IMPORT id file.csv          Merge a file of trades into an entity's log
//! COLLECT feed_dir            Run a collection session over a feed directory
//! UNSCRAPED                   Products in the metadata log with no history
//! MISSING instant             Entities whose history starts after instant
//! VOLUME start end [top]      Trades per entity in [start, end)
//! EXIT / QUIT                 Shut down
//! ```
//!
//! ## Configuration
//!
//! Environment variables, see the `config` crate:
//!
//! ```text
//! HARVEST_STORE_DIR   HARVEST_LOG_DIR      HARVEST_LOG_LEVEL   HARVEST_META_LOG
//! HARVEST_GAP_POLICY  HARVEST_MAX_ATTEMPTS HARVEST_COOLDOWN_MS HARVEST_BASE_PAGES
//! HARVEST_PAGE_SIZE   HARVEST_SYNC
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! harvest started (store=output, gap_policy=skip, entities=0)
//! > IMPORT 5 trades.csv
//! OK appended 3 (AppendedAll { appended: 3 })
//! > LAST 5
//! 5,129000,270,2025-01-01T00:00:02Z,true
//! > EXIT
//! bye
//! ```

mod feed;
mod logging;

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use codec::{Row, Timestamp, TradeRecord};
use config::HarvestConfig;
use engine::coverage::{missing_history_before, trading_volume, unscraped_by_metadata};
use engine::{BatchOutcome, Session};

use crate::feed::{read_rows, DirFetcher};

fn main() -> Result<()> {
    let config = HarvestConfig::from_env().context("invalid configuration")?;
    let log_file = match logging::init_logging(&config.log_level, &config.log_dir) {
        Ok(path) => Some(path),
        Err(e) => {
            eprintln!("warning: session log unavailable, logging to stderr only: {e:#}");
            logging::init_stderr_logging(&config.log_level)?;
            None
        }
    };

    let mut session = Session::from_config(&config)?;
    let entities = session.engine().store().list_entities()?.len();

    tracing::info!(
        store = %config.store_dir.display(),
        gap_policy = %config.gap_policy,
        log_file = ?log_file,
        "harvest shell started"
    );
    println!(
        "harvest started (store={}, gap_policy={}, entities={})",
        config.store_dir.display(),
        config.gap_policy,
        entities
    );
    println!("Commands: REPAIR | LIST | LAST id | COUNT id | PAGES id | IMPORT id file");
    println!("          COLLECT dir | UNSCRAPED | MISSING instant | VOLUME start end [top] | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            let args: Vec<&str> = parts.collect();
            match cmd.to_uppercase().as_str() {
                "REPAIR" => match session.engine().repair() {
                    Ok(r) => println!(
                        "OK (scanned={}, repaired={}, duplicates={}, skipped={})",
                        r.scanned,
                        r.files_changed(),
                        r.duplicates_removed,
                        r.skipped.len()
                    ),
                    Err(e) => println!("ERR repair failed: {e:#}"),
                },
                "LIST" => match session.engine().store().list_entities() {
                    Ok(ids) if ids.is_empty() => println!("(empty)"),
                    Ok(ids) => {
                        for id in &ids {
                            println!("{id}");
                        }
                        println!("({} entities)", ids.len());
                    }
                    Err(e) => println!("ERR list failed: {e}"),
                },
                "LAST" => match args.as_slice() {
                    [id] => match session.engine().store().read_last::<TradeRecord>(id) {
                        Ok(Some(record)) => println!("{}", record.encode()),
                        Ok(None) => println!("(nil)"),
                        Err(e) => println!("ERR read failed: {e}"),
                    },
                    _ => println!("ERR usage: LAST id"),
                },
                "COUNT" => match args.as_slice() {
                    [id] => match session.engine().store().read_count(id) {
                        Ok(n) => println!("{n}"),
                        Err(e) => println!("ERR read failed: {e}"),
                    },
                    _ => println!("ERR usage: COUNT id"),
                },
                "PAGES" => match args.as_slice() {
                    [id] => match session.engine().store().read_count(id) {
                        Ok(n) => println!("{}", config.pages.pages_for(n)),
                        Err(e) => println!("ERR read failed: {e}"),
                    },
                    _ => println!("ERR usage: PAGES id"),
                },
                "IMPORT" => match args.as_slice() {
                    [id, file] => match import(&mut session, id, Path::new(file)) {
                        Ok(outcome) => print_outcome(&outcome),
                        Err(e) => println!("ERR import failed: {e:#}"),
                    },
                    _ => println!("ERR usage: IMPORT id file.csv"),
                },
                "COLLECT" => match args.as_slice() {
                    [dir] => {
                        if let Err(e) = collect(&mut session, &config, Path::new(dir)) {
                            println!("ERR collect failed: {e:#}");
                        }
                    }
                    _ => println!("ERR usage: COLLECT feed_dir"),
                },
                "UNSCRAPED" => {
                    let engine = session.engine();
                    match unscraped_by_metadata(engine.store(), engine.meta_log()) {
                        Ok(ids) => print_ids(&ids),
                        Err(e) => println!("ERR query failed: {e:#}"),
                    }
                }
                "MISSING" => match args.as_slice() {
                    [instant] => match instant.parse::<Timestamp>() {
                        Ok(base) => {
                            match missing_history_before(session.engine().store(), base.instant()) {
                                Ok(ids) => print_ids(&ids),
                                Err(e) => println!("ERR query failed: {e:#}"),
                            }
                        }
                        Err(e) => println!("ERR {e}"),
                    },
                    _ => println!("ERR usage: MISSING instant"),
                },
                "VOLUME" => match volume(&session, &args) {
                    Ok(()) => {}
                    Err(e) => println!("ERR {e:#}"),
                },
                "EXIT" | "QUIT" => {
                    println!("bye");
                    break;
                }
                other => {
                    println!("unknown command: {}", other);
                }
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    Ok(())
}

fn import(session: &mut Session, id: &str, file: &Path) -> Result<BatchOutcome> {
    let records = read_rows::<TradeRecord>(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    session.engine_mut().ingest(id, &records)
}

fn collect(session: &mut Session, config: &HarvestConfig, dir: &Path) -> Result<()> {
    let mut fetcher = DirFetcher::open(dir, config.pages.page_size)?;
    let entities = fetcher.entities()?;
    let report = session.run(&entities, &mut fetcher)?;

    println!(
        "OK (succeeded={}, failed={}, records={}, repaired={})",
        report.succeeded.len(),
        report.failed.len(),
        report.records_appended,
        report.repair.files_changed()
    );
    for id in &report.failed {
        println!("failed: {id}");
    }
    if let Some(t) = report.timing() {
        println!(
            "timing: min={:?} max={:?} mean={:?} median={:?}",
            t.min, t.max, t.mean, t.median
        );
    }
    Ok(())
}

fn volume(session: &Session, args: &[&str]) -> Result<()> {
    let (start, end, top) = match args {
        [start, end] => (start, end, None),
        [start, end, top] => (start, end, Some(top.parse::<usize>().context("invalid top")?)),
        _ => anyhow::bail!("usage: VOLUME start end [top]"),
    };
    let start: Timestamp = start.parse()?;
    let end: Timestamp = end.parse()?;

    let volumes = trading_volume(session.engine().store(), start.instant(), end.instant(), top)?;
    if volumes.is_empty() {
        println!("(empty)");
    }
    for v in &volumes {
        println!("{} {}", v.entity, v.volume);
    }
    Ok(())
}

fn print_outcome(outcome: &BatchOutcome) {
    match outcome {
        BatchOutcome::Rejected { reason } => println!("ERR rejected: {reason}"),
        BatchOutcome::CorruptLog { dropped } => {
            println!("ERR log is corrupt, dropped {dropped} records")
        }
        other => println!("OK appended {} ({other:?})", other.appended()),
    }
}

fn print_ids(ids: &[String]) {
    if ids.is_empty() {
        println!("(empty)");
        return;
    }
    for id in ids {
        println!("{id}");
    }
    println!("({} entities)", ids.len());
}
