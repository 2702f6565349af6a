//! Collection session: repair once, then fetch and merge each entity.
//!
//! The session is the only place that talks to the [`Fetcher`]. Per entity:
//!
//! 1. Fetch metadata (optional) and record it.
//! 2. Size the fetch window from the number of stored rows.
//! 3. Fetch. Whatever batches arrived are drained into the merge engine,
//!    even if the attempt then failed.
//! 4. On a transient failure wait `cooldown * attempt` and retry, up to the
//!    attempt limit. A permanent failure or exhausted retries mark the
//!    entity failed and the session moves on.
//!
//! Store I/O errors end the session: losing a write silently is worse than
//! stopping.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use codec::ProductMeta;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    BatchQueue, HarvestConfig, MergeEngine, PagePlan, RepairReport, RetryPolicy, TimingSummary,
};

/// A failed fetch attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Worth retrying after a pause (timeouts, rate limits, dropped
    /// connections).
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Retrying will not help (unknown entity, bad credentials).
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

/// Parameters of one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub entity: String,
    /// Number of pages to request.
    pub pages: usize,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Source of event batches. Its transport is not the engine's concern.
pub trait Fetcher {
    /// Returns metadata for `entity`, if the source provides any.
    fn fetch_meta(&mut self, _entity: &str) -> Result<Option<ProductMeta>, FetchError> {
        Ok(None)
    }

    /// Fetches history for `request.entity`, pushing each batch into `queue`
    /// as it arrives. Batches must be ascending by timestamp; batches for
    /// other entities may be pushed too.
    fn fetch(&mut self, request: &FetchRequest, queue: &mut BatchQueue) -> Result<(), FetchError>;
}

/// Operational summary of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Result of the repair pass run at session start.
    pub repair: RepairReport,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// New rows written during the session, all entities.
    pub records_appended: usize,
    /// Time spent per entity, in processing order.
    pub durations: Vec<Duration>,
    /// Wall time of the whole session.
    pub elapsed: Duration,
}

impl SessionReport {
    /// Min/max/mean/median of the per-entity durations.
    pub fn timing(&self) -> Option<TimingSummary> {
        TimingSummary::from_samples(&self.durations)
    }

    /// Emits the report through the diagnostics log.
    pub fn log(&self) {
        info!(
            entities = self.succeeded.len() + self.failed.len(),
            succeeded = self.succeeded.len(),
            failed = self.failed.len(),
            records = self.records_appended,
            repaired_files = self.repair.files_changed(),
            elapsed_ms = self.elapsed.as_millis() as u64,
            "collection finished"
        );
        if let Some(t) = self.timing() {
            info!(
                min_ms = t.min.as_millis() as u64,
                max_ms = t.max.as_millis() as u64,
                mean_ms = t.mean.as_millis() as u64,
                median_ms = t.median.as_millis() as u64,
                "per-entity timing"
            );
        }
        if !self.failed.is_empty() {
            warn!(failed = ?self.failed, "entities not collected");
        }
    }
}

type Sleeper = Box<dyn FnMut(Duration) + Send>;

/// Drives a [`Fetcher`] over a list of entities.
pub struct Session {
    engine: MergeEngine,
    retry: RetryPolicy,
    pages: PagePlan,
    sleeper: Sleeper,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.engine)
            .field("retry", &self.retry)
            .field("pages", &self.pages)
            .finish()
    }
}

impl Session {
    pub fn new(engine: MergeEngine, retry: RetryPolicy, pages: PagePlan) -> Self {
        Self {
            engine,
            retry,
            pages,
            sleeper: Box::new(std::thread::sleep),
        }
    }

    /// Opens the store described by `config` and builds a session over it.
    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        Ok(Self::new(
            MergeEngine::from_config(config)?,
            config.retry,
            config.pages,
        ))
    }

    /// Replaces the function used to wait between attempts.
    #[must_use]
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: FnMut(Duration) + Send + 'static,
    {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut MergeEngine {
        &mut self.engine
    }

    /// Consumes the session, returning its engine.
    pub fn into_engine(self) -> MergeEngine {
        self.engine
    }

    /// Repairs the store, then collects every entity in `entities` in order.
    ///
    /// # Errors
    ///
    /// Returns an error only for store failures. Fetch failures are recorded
    /// in [`SessionReport::failed`].
    pub fn run<F: Fetcher>(&mut self, entities: &[String], fetcher: &mut F) -> Result<SessionReport> {
        let started = Instant::now();
        let mut report = SessionReport {
            repair: self.engine.repair()?,
            ..SessionReport::default()
        };
        let mut queue = BatchQueue::new();

        info!(entities = entities.len(), "collection started");
        for (i, entity) in entities.iter().enumerate() {
            let entity_started = Instant::now();
            info!(entity = %entity, progress = %format!("{}/{}", i + 1, entities.len()), "collecting");

            let collected = self.collect_entity(entity, fetcher, &mut queue, &mut report)?;
            let elapsed = entity_started.elapsed();
            report.durations.push(elapsed);

            if collected {
                info!(
                    entity = %entity,
                    records = self.engine.collected(entity).len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "entity collected"
                );
                report.succeeded.push(entity.clone());
            } else {
                report.failed.push(entity.clone());
            }
        }

        report.elapsed = started.elapsed();
        report.log();
        Ok(report)
    }

    /// Collects one entity. Returns `Ok(false)` if fetching failed for good.
    fn collect_entity<F: Fetcher>(
        &mut self,
        entity: &str,
        fetcher: &mut F,
        queue: &mut BatchQueue,
        report: &mut SessionReport,
    ) -> Result<bool> {
        match fetcher.fetch_meta(entity) {
            Ok(Some(meta)) => {
                if !self.engine.record_meta(&meta)? {
                    info!(entity, "metadata already recorded, resuming");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(entity, error = %e, "metadata fetch failed"),
        }

        let stored = match self.engine.store().read_count(entity) {
            Ok(n) => n,
            Err(e) if e.is_corrupt() => {
                warn!(entity, error = %e, "log is unreadable, skipping entity");
                return Ok(false);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to count rows of {entity}"));
            }
        };
        let pages = self.pages.pages_for(stored);

        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let request = FetchRequest {
                entity: entity.to_string(),
                pages,
                attempt,
            };
            let result = fetcher.fetch(&request, queue);

            for (_, outcome) in queue.drain_into(&mut self.engine)? {
                report.records_appended += outcome.appended();
            }

            match result {
                Ok(()) => return Ok(true),
                Err(FetchError::Permanent(reason)) => {
                    error!(entity, %reason, attempt, "fetch failed permanently");
                    return Ok(false);
                }
                Err(FetchError::Transient(reason)) if attempt == max_attempts => {
                    error!(entity, %reason, attempts = attempt, "fetch failed, retries exhausted");
                    return Ok(false);
                }
                Err(FetchError::Transient(reason)) => {
                    let wait = self.retry.backoff(attempt);
                    warn!(
                        entity,
                        %reason,
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "fetch failed, backing off"
                    );
                    (self.sleeper)(wait);
                }
            }
        }
        Ok(false)
    }
}
