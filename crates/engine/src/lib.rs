//! # Engine - Incremental Collection and Merge
//!
//! Ties the [`store`] and [`codec`] crates together into a harvester that
//! can be stopped and restarted at any point without re-storing records.
//!
//! ## Architecture
//!
//! ```text
//! Fetcher (external)
//!   |  batches, possibly interleaved across entities
//!   v
//! ┌───────────────────────────────────────────────┐
//! │                   ENGINE                      │
//! │                                               │
//! │ session.rs → repair pass (once, at start)     │
//! │            → per entity: fetch with retry     │
//! │                  |                            │
//! │                  v                            │
//! │ queue.rs   → per-entity FIFO of batches       │
//! │                  |                            │
//! │                  v                            │
//! │ merge.rs   → read last → classify → slice     │
//! │                  |   (locator.rs)             │
//! │                  v                            │
//! │            FlatStore::append (novel suffix)   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                              |
//! |----------------|------------------------------------------------------|
//! | [`lib.rs`]     | `MergeEngine` struct, constructor, accessors         |
//! | [`locator`]    | Binary search for the resume marker in a batch       |
//! | [`merge`]      | `ingest()`: classify a batch and append what is new  |
//! | [`repair`]     | Store-wide exact-duplicate removal                   |
//! | [`meta`]       | Product metadata log                                 |
//! | [`queue`]      | Per-entity batch queue preserving arrival order      |
//! | [`session`]    | Fetch loop with retry/backoff and the final report   |
//! | [`stats`]      | Min/max/mean/median of per-entity durations          |
//! | [`coverage`]   | Queries over the stored history                      |
//!
//! ## Duplicate safety
//!
//! Appends only ever add records strictly newer than the stored resume
//! marker, so a correct run never duplicates. A crash between fetching and
//! appending can still leave overlapping rows behind if the source
//! re-delivers; the repair pass at the start of the next session collapses
//! them. Repair is the recovery mechanism, not transactions.
pub mod coverage;
pub mod locator;
mod merge;
mod meta;
mod queue;
pub mod repair;
mod session;
pub mod stats;

use std::collections::BTreeMap;

use codec::TradeRecord;
use store::FlatStore;

pub use config::{GapPolicy, HarvestConfig, PagePlan, RetryPolicy};
pub use merge::BatchOutcome;
pub use queue::BatchQueue;
pub use repair::{repair_store, RepairReport};
pub use session::{FetchError, FetchRequest, Fetcher, Session, SessionReport};
pub use stats::TimingSummary;

/// Applies fetched batches to the store without duplicating stored records.
///
/// The engine owns no per-entity file handles; every batch re-reads the
/// entity's last stored record, so the engine stays correct even if the log
/// is changed between batches (for example by a repair pass).
pub struct MergeEngine {
    pub(crate) store: FlatStore,
    /// Policy for batches that do not contain the resume marker.
    pub(crate) gap_policy: GapPolicy,
    /// Name of the aggregate metadata log.
    pub(crate) meta_log: String,
    /// Records appended during this session, per entity, in append order.
    pub(crate) collected: BTreeMap<String, Vec<TradeRecord>>,
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("store_dir", &self.store.dir())
            .field("gap_policy", &self.gap_policy)
            .field("meta_log", &self.meta_log)
            .field("entities_collected", &self.collected.len())
            .field("records_collected", &self.total_collected())
            .finish()
    }
}

impl MergeEngine {
    /// Creates an engine over `store`.
    ///
    /// `meta_log` is registered with the store as an aggregate so it is not
    /// mistaken for an entity.
    pub fn new(store: FlatStore, gap_policy: GapPolicy, meta_log: impl Into<String>) -> Self {
        let meta_log = meta_log.into();
        Self {
            store: store.with_aggregate(meta_log.clone()),
            gap_policy,
            meta_log,
            collected: BTreeMap::new(),
        }
    }

    /// Opens the store described by `config` and builds an engine over it.
    pub fn from_config(config: &HarvestConfig) -> anyhow::Result<Self> {
        let store = FlatStore::open(&config.store_dir)?.with_sync(config.sync);
        Ok(Self::new(store, config.gap_policy, config.meta_log.clone()))
    }

    /// The underlying store.
    pub fn store(&self) -> &FlatStore {
        &self.store
    }

    /// Current gap policy.
    #[must_use]
    pub fn gap_policy(&self) -> GapPolicy {
        self.gap_policy
    }

    /// Changes the gap policy. Useful for tests or one-off reconciliation.
    pub fn set_gap_policy(&mut self, policy: GapPolicy) {
        self.gap_policy = policy;
    }

    /// Name of the metadata log.
    pub fn meta_log(&self) -> &str {
        &self.meta_log
    }

    /// Records appended for `entity` during this session.
    pub fn collected(&self, entity: &str) -> &[TradeRecord] {
        self.collected.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total records appended during this session, all entities.
    #[must_use]
    pub fn total_collected(&self) -> usize {
        self.collected.values().map(Vec::len).sum()
    }

    /// Runs the repair pass over the whole store.
    pub fn repair(&self) -> anyhow::Result<RepairReport> {
        repair_store(&self.store)
    }
}

#[cfg(test)]
mod tests;
