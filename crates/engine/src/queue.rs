//! Per-entity batch queue.
//!
//! A source may deliver batches for several entities interleaved (responses
//! arrive in whatever order the network completes them). The queue keeps
//! one FIFO per entity, so batches for the same entity are merged strictly
//! in arrival order while different entities stay independent.

use std::collections::{BTreeMap, VecDeque};

use anyhow::Result;
use codec::TradeRecord;

use crate::{BatchOutcome, MergeEngine};

#[derive(Debug, Default)]
pub struct BatchQueue {
    pending: BTreeMap<String, VecDeque<Vec<TradeRecord>>>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a batch for `entity` behind any batches already waiting.
    pub fn push(&mut self, entity: impl Into<String>, batch: Vec<TradeRecord>) {
        self.pending.entry(entity.into()).or_default().push_back(batch);
    }

    /// Number of batches waiting, all entities.
    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.values().all(VecDeque::is_empty)
    }

    /// Number of batches waiting for `entity`.
    pub fn pending_for(&self, entity: &str) -> usize {
        self.pending.get(entity).map(VecDeque::len).unwrap_or(0)
    }

    /// Merges every queued batch into `engine`, one entity at a time and
    /// each entity's batches in arrival order.
    ///
    /// A batch is removed from the queue only after it has been applied, so
    /// if the engine returns an error the failed batch and everything behind
    /// it stay queued.
    pub fn drain_into(&mut self, engine: &mut MergeEngine) -> Result<Vec<(String, BatchOutcome)>> {
        let mut outcomes = Vec::new();
        for (entity, batches) in self.pending.iter_mut() {
            while let Some(batch) = batches.front() {
                let outcome = engine.ingest(entity, batch)?;
                batches.pop_front();
                outcomes.push((entity.clone(), outcome));
            }
        }
        self.pending.retain(|_, batches| !batches.is_empty());
        Ok(outcomes)
    }
}
