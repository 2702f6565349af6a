use super::helpers::*;
use crate::*;
use anyhow::Result;
use codec::{ProductMeta, TradeRecord};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

/// What a scripted fetch attempt does.
enum Step {
    /// Push these batches (entity, seconds) and succeed.
    Succeed(Vec<(&'static str, Vec<i64>)>),
    /// Push these batches, then fail transiently.
    Transient(Vec<(&'static str, Vec<i64>)>),
    /// Push these batches, then fail permanently.
    Permanent(Vec<(&'static str, Vec<i64>)>),
}

/// Replays a fixed script per entity and records every request it saw.
#[derive(Default)]
struct ScriptedFetcher {
    steps: HashMap<String, VecDeque<Step>>,
    meta: HashMap<String, ProductMeta>,
    requests: Vec<FetchRequest>,
    meta_calls: usize,
}

impl ScriptedFetcher {
    fn script(mut self, entity: &str, steps: Vec<Step>) -> Self {
        self.steps.insert(entity.to_string(), steps.into());
        self
    }

    fn with_meta(mut self, entity: &str) -> Self {
        self.meta.insert(
            entity.to_string(),
            ProductMeta {
                product_id: entity.to_string(),
                name: format!("Product {entity}"),
                original_price: 99_000,
                brand: "Acme".to_string(),
            },
        );
        self
    }
}

fn push_all(queue: &mut BatchQueue, batches: Vec<(&'static str, Vec<i64>)>) {
    for (entity, secs) in batches {
        queue.push(entity, batch(entity, &secs));
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch_meta(&mut self, entity: &str) -> Result<Option<ProductMeta>, FetchError> {
        self.meta_calls += 1;
        Ok(self.meta.get(entity).cloned())
    }

    fn fetch(&mut self, request: &FetchRequest, queue: &mut BatchQueue) -> Result<(), FetchError> {
        self.requests.push(request.clone());
        let step = self
            .steps
            .get_mut(&request.entity)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed(Vec::new()));
        match step {
            Step::Succeed(b) => {
                push_all(queue, b);
                Ok(())
            }
            Step::Transient(b) => {
                push_all(queue, b);
                Err(FetchError::Transient("timed out".into()))
            }
            Step::Permanent(b) => {
                push_all(queue, b);
                Err(FetchError::Permanent("not found".into()))
            }
        }
    }
}

fn retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        cooldown: Duration::from_millis(100),
    }
}

fn pages() -> PagePlan {
    PagePlan {
        base_pages: 20,
        page_size: 50,
    }
}

/// Session whose sleeper records waits instead of sleeping.
fn session(dir: &std::path::Path, max_attempts: u32) -> (Session, Arc<Mutex<Vec<Duration>>>) {
    let waits = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&waits);
    let session = Session::new(engine(dir), retry(max_attempts), pages())
        .with_sleeper(move |d| recorded.lock().unwrap().push(d));
    (session, waits)
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// --------------------- Happy path ---------------------

#[test]
fn collects_every_entity_in_order() -> Result<()> {
    let dir = tempdir()?;
    let (mut session, waits) = session(dir.path(), 3);
    let mut fetcher = ScriptedFetcher::default()
        .script("1", vec![Step::Succeed(vec![("1", vec![1, 2]), ("1", vec![2, 3])])])
        .script("2", vec![Step::Succeed(vec![("2", vec![5])])]);

    let report = session.run(&ids(&["1", "2"]), &mut fetcher)?;

    assert_eq!(report.succeeded, ids(&["1", "2"]));
    assert!(report.failed.is_empty());
    assert_eq!(report.records_appended, 4);
    assert_eq!(report.durations.len(), 2);
    assert_eq!(report.timing().map(|t| t.count), Some(2));
    assert!(waits.lock().unwrap().is_empty());

    let engine = session.engine();
    assert_eq!(stored_secs(engine, "1"), vec![1, 2, 3]);
    assert_eq!(stored_secs(engine, "2"), vec![5]);
    Ok(())
}

#[test]
fn second_session_resumes_without_duplicates() -> Result<()> {
    let dir = tempdir()?;
    {
        let (mut session, _) = session(dir.path(), 1);
        let mut fetcher =
            ScriptedFetcher::default().script("1", vec![Step::Succeed(vec![("1", vec![1, 2, 3])])]);
        session.run(&ids(&["1"]), &mut fetcher)?;
    }

    let (mut session, _) = session(dir.path(), 1);
    let mut fetcher =
        ScriptedFetcher::default().script("1", vec![Step::Succeed(vec![("1", vec![2, 3, 4, 5])])]);
    let report = session.run(&ids(&["1"]), &mut fetcher)?;

    assert_eq!(report.records_appended, 2);
    assert_eq!(stored_secs(session.engine(), "1"), vec![1, 2, 3, 4, 5]);
    Ok(())
}

// --------------------- Retry ---------------------

#[test]
fn transient_failure_backs_off_linearly_then_succeeds() -> Result<()> {
    let dir = tempdir()?;
    let (mut session, waits) = session(dir.path(), 5);
    let mut fetcher = ScriptedFetcher::default().script(
        "1",
        vec![
            Step::Transient(vec![]),
            Step::Transient(vec![]),
            Step::Succeed(vec![("1", vec![1])]),
        ],
    );

    let report = session.run(&ids(&["1"]), &mut fetcher)?;

    assert_eq!(report.succeeded, ids(&["1"]));
    assert_eq!(
        *waits.lock().unwrap(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
    let attempts: Vec<u32> = fetcher.requests.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn exhausted_retries_mark_entity_failed_and_continue() -> Result<()> {
    let dir = tempdir()?;
    let (mut session, waits) = session(dir.path(), 3);
    let mut fetcher = ScriptedFetcher::default()
        .script(
            "1",
            vec![
                Step::Transient(vec![]),
                Step::Transient(vec![]),
                Step::Transient(vec![]),
            ],
        )
        .script("2", vec![Step::Succeed(vec![("2", vec![1])])]);

    let report = session.run(&ids(&["1", "2"]), &mut fetcher)?;

    assert_eq!(report.failed, ids(&["1"]));
    assert_eq!(report.succeeded, ids(&["2"]));
    // No wait after the final attempt.
    assert_eq!(waits.lock().unwrap().len(), 2);
    assert_eq!(
        fetcher.requests.iter().filter(|r| r.entity == "1").count(),
        3
    );
    Ok(())
}

#[test]
fn permanent_failure_is_not_retried() -> Result<()> {
    let dir = tempdir()?;
    let (mut session, waits) = session(dir.path(), 5);
    let mut fetcher =
        ScriptedFetcher::default().script("1", vec![Step::Permanent(vec![])]);

    let report = session.run(&ids(&["1"]), &mut fetcher)?;

    assert_eq!(report.failed, ids(&["1"]));
    assert_eq!(fetcher.requests.len(), 1);
    assert!(waits.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn unreadable_log_marks_entity_failed_and_continues() -> Result<()> {
    let dir = tempdir()?;
    write_raw_log(
        dir.path(),
        "1",
        &["1,100,\"Air, Max,2025-01-01T00:00:00Z,true"],
    );
    let (mut session, _) = session(dir.path(), 3);
    let mut fetcher =
        ScriptedFetcher::default().script("2", vec![Step::Succeed(vec![("2", vec![1])])]);

    let report = session.run(&ids(&["1", "2"]), &mut fetcher)?;

    assert_eq!(report.failed, ids(&["1"]));
    assert_eq!(report.succeeded, ids(&["2"]));
    assert_eq!(report.repair.skipped.len(), 1);
    // The corrupt entity is never fetched.
    assert!(fetcher.requests.iter().all(|r| r.entity == "2"));
    assert_eq!(stored_secs(session.engine(), "2"), vec![1]);
    Ok(())
}

#[test]
fn batches_before_a_failure_are_kept() -> Result<()> {
    let dir = tempdir()?;
    let (mut session, _) = session(dir.path(), 2);
    let mut fetcher = ScriptedFetcher::default().script(
        "1",
        vec![
            Step::Transient(vec![("1", vec![1, 2])]),
            Step::Succeed(vec![("1", vec![1, 2, 3])]),
        ],
    );

    let report = session.run(&ids(&["1"]), &mut fetcher)?;

    assert_eq!(report.records_appended, 3);
    assert_eq!(stored_secs(session.engine(), "1"), vec![1, 2, 3]);
    Ok(())
}

#[test]
fn partial_batches_survive_a_permanent_failure() -> Result<()> {
    let dir = tempdir()?;
    let (mut session, _) = session(dir.path(), 2);
    let mut fetcher =
        ScriptedFetcher::default().script("1", vec![Step::Permanent(vec![("1", vec![1, 2])])]);

    let report = session.run(&ids(&["1"]), &mut fetcher)?;
    assert_eq!(report.failed, ids(&["1"]));
    assert_eq!(stored_secs(session.engine(), "1"), vec![1, 2]);
    Ok(())
}

// --------------------- Interleaving and sizing ---------------------

#[test]
fn interleaved_batches_for_other_entities_are_merged() -> Result<()> {
    let dir = tempdir()?;
    let (mut session, _) = session(dir.path(), 1);
    let mut fetcher = ScriptedFetcher::default().script(
        "1",
        vec![Step::Succeed(vec![
            ("1", vec![1, 2]),
            ("2", vec![10, 11]),
            ("1", vec![2, 3]),
            ("2", vec![11, 12]),
        ])],
    );

    session.run(&ids(&["1"]), &mut fetcher)?;

    assert_eq!(stored_secs(session.engine(), "1"), vec![1, 2, 3]);
    assert_eq!(stored_secs(session.engine(), "2"), vec![10, 11, 12]);
    Ok(())
}

#[test]
fn page_count_grows_with_stored_rows() -> Result<()> {
    let dir = tempdir()?;
    let secs: Vec<i64> = (0..120).collect();
    engine(dir.path()).ingest("1", &batch("1", &secs))?;

    let (mut session, _) = session(dir.path(), 1);
    let mut fetcher = ScriptedFetcher::default();
    session.run(&ids(&["1", "2"]), &mut fetcher)?;

    let pages: Vec<(String, usize)> = fetcher
        .requests
        .iter()
        .map(|r| (r.entity.clone(), r.pages))
        .collect();
    assert_eq!(pages, vec![("1".to_string(), 22), ("2".to_string(), 20)]);
    Ok(())
}

// --------------------- Repair and metadata ---------------------

#[test]
fn repair_runs_before_collection() -> Result<()> {
    let dir = tempdir()?;
    let row = "1,100,270,2025-01-01T00:00:00Z,true";
    write_raw_log(dir.path(), "1", &[row, row]);

    let (mut session, _) = session(dir.path(), 1);
    let mut fetcher = ScriptedFetcher::default();
    let report = session.run(&ids(&[]), &mut fetcher)?;

    assert_eq!(report.repair.files_changed(), 1);
    assert_eq!(session.engine().store().read_count("1")?, 1);
    Ok(())
}

#[test]
fn metadata_is_recorded_per_visit() -> Result<()> {
    let dir = tempdir()?;
    for _ in 0..2 {
        let (mut session, _) = session(dir.path(), 1);
        let mut fetcher = ScriptedFetcher::default().with_meta("1").with_meta("2");
        session.run(&ids(&["1", "2"]), &mut fetcher)?;
        assert_eq!(fetcher.meta_calls, 2);
    }

    let meta: Vec<String> = engine(dir.path())
        .read_meta()?
        .into_iter()
        .map(|m| m.product_id)
        .collect();
    // Second run starts at "1" while the log ends at "2", so "1" is
    // recorded again; "2" then follows "1" and is recorded again too.
    assert_eq!(meta, ids(&["1", "2", "1", "2"]));
    Ok(())
}

#[test]
fn interrupted_product_metadata_is_not_repeated() -> Result<()> {
    let dir = tempdir()?;
    {
        let (mut session, _) = session(dir.path(), 1);
        let mut fetcher = ScriptedFetcher::default()
            .with_meta("1")
            .script("1", vec![Step::Permanent(vec![])]);
        session.run(&ids(&["1"]), &mut fetcher)?;
    }

    let (mut session, _) = session(dir.path(), 1);
    let mut fetcher = ScriptedFetcher::default()
        .with_meta("1")
        .script("1", vec![Step::Succeed(vec![("1", vec![1])])]);
    session.run(&ids(&["1"]), &mut fetcher)?;

    assert_eq!(session.engine().read_meta()?.len(), 1);
    assert_eq!(
        session.engine().store().read_all::<TradeRecord>("1")?.len(),
        1
    );
    Ok(())
}

#[test]
fn into_engine_exposes_collected_records() -> Result<()> {
    let dir = tempdir()?;
    let (mut session, _) = session(dir.path(), 1);
    let mut fetcher =
        ScriptedFetcher::default().script("1", vec![Step::Succeed(vec![("1", vec![1, 2])])]);
    session.run(&ids(&["1"]), &mut fetcher)?;

    let engine = session.into_engine();
    assert_eq!(engine.collected("1").len(), 2);
    Ok(())
}
