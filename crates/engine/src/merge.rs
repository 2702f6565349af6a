//! Merge path: `ingest()` and the gap policies.
//!
//! Each batch goes through the same steps:
//!
//! 1. Empty batch -> nothing to do.
//! 2. Read the entity's last stored record (the resume marker).
//! 3. No stored record, or marker older than the batch's first record ->
//!    the whole batch is new.
//! 4. Otherwise find the marker in the batch and append only what follows
//!    it (skipping every record that ties with the marker).
//! 5. Marker not in the batch -> apply the configured [`GapPolicy`].

use std::collections::HashSet;

use anyhow::{Context, Result};
use codec::{Row, TradeRecord};
use tracing::{debug, info, warn};

use crate::{locator, GapPolicy, MergeEngine};

/// What [`MergeEngine::ingest`] did with one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch had no records.
    Empty,
    /// Nothing stored overlapped; every record was appended.
    AppendedAll { appended: usize },
    /// The resume marker was found; the records after it were appended.
    AppendedSuffix { skipped: usize, appended: usize },
    /// The resume marker was the batch's last timestamp; nothing was new.
    AlreadyCovered { skipped: usize },
    /// The resume marker was not in the batch and the batch was dropped.
    GapSkipped { dropped: usize },
    /// The resume marker was not in the batch; records newer than it were
    /// appended and the rest dropped.
    GapAppendedNewer { dropped: usize, appended: usize },
    /// The resume marker was not in the batch; the log was rewritten as the
    /// ordered, duplicate-free union of the stored rows and the batch.
    Reconciled { added: usize, total: usize },
    /// The batch violated an input contract and was dropped.
    Rejected { reason: String },
    /// The entity's log could not be parsed, so the batch was dropped rather
    /// than risk duplicating or misordering rows.
    CorruptLog { dropped: usize },
}

impl BatchOutcome {
    /// Number of records that became new rows in the log.
    #[must_use]
    pub fn appended(&self) -> usize {
        match self {
            BatchOutcome::AppendedAll { appended }
            | BatchOutcome::AppendedSuffix { appended, .. }
            | BatchOutcome::GapAppendedNewer { appended, .. } => *appended,
            BatchOutcome::Reconciled { added, .. } => *added,
            _ => 0,
        }
    }
}

impl MergeEngine {
    /// Applies one fetched batch for `entity`.
    ///
    /// `batch` must be ascending by timestamp and every record must belong
    /// to `entity`; otherwise the batch is dropped and reported as
    /// [`BatchOutcome::Rejected`].
    ///
    /// # Errors
    ///
    /// Store I/O errors are returned, never swallowed. An unparsable log is
    /// not an error: the batch is dropped with a warning.
    pub fn ingest(&mut self, entity: &str, batch: &[TradeRecord]) -> Result<BatchOutcome> {
        if batch.is_empty() {
            return Ok(BatchOutcome::Empty);
        }
        if let Some(reason) = check_batch(entity, batch) {
            warn!(entity, %reason, "rejecting batch");
            return Ok(BatchOutcome::Rejected { reason });
        }

        let last = match self.store.read_last::<TradeRecord>(entity) {
            Ok(last) => last,
            Err(e) if e.is_corrupt() => {
                warn!(entity, error = %e, dropped = batch.len(), "log is corrupt, dropping batch");
                return Ok(BatchOutcome::CorruptLog {
                    dropped: batch.len(),
                });
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read last record of {entity}"))
            }
        };

        let Some(last) = last else {
            info!(entity, count = batch.len(), "new entity, storing full batch");
            self.append(entity, batch)?;
            return Ok(BatchOutcome::AppendedAll {
                appended: batch.len(),
            });
        };

        let marker = &last.date_created;
        if *marker < batch[0].date_created {
            info!(entity, count = batch.len(), "no overlap, storing full batch");
            self.append(entity, batch)?;
            return Ok(BatchOutcome::AppendedAll {
                appended: batch.len(),
            });
        }

        match locator::novel_start(batch, marker) {
            Some(start) if start == batch.len() => {
                debug!(entity, %marker, "batch already stored");
                Ok(BatchOutcome::AlreadyCovered { skipped: start })
            }
            Some(start) => {
                let suffix = &batch[start..];
                info!(
                    entity,
                    from = %suffix[0].date_created,
                    count = suffix.len(),
                    skipped = start,
                    "resuming after stored marker"
                );
                self.append(entity, suffix)?;
                Ok(BatchOutcome::AppendedSuffix {
                    skipped: start,
                    appended: suffix.len(),
                })
            }
            None => self.resolve_gap(entity, batch, &last),
        }
    }

    /// Handles a batch that overlaps the log's time range but does not
    /// contain the resume marker.
    fn resolve_gap(
        &mut self,
        entity: &str,
        batch: &[TradeRecord],
        last: &TradeRecord,
    ) -> Result<BatchOutcome> {
        let marker = &last.date_created;
        match self.gap_policy {
            GapPolicy::Skip => {
                warn!(
                    entity,
                    %marker,
                    batch_first = %batch[0].date_created,
                    batch_last = %batch[batch.len() - 1].date_created,
                    "resume marker not in batch, skipping"
                );
                Ok(BatchOutcome::GapSkipped {
                    dropped: batch.len(),
                })
            }
            GapPolicy::AppendNewer => {
                let start = locator::first_newer(batch, marker);
                let newer = &batch[start..];
                warn!(
                    entity,
                    %marker,
                    appended = newer.len(),
                    dropped = start,
                    "resume marker not in batch, appending newer records only"
                );
                self.append(entity, newer)?;
                Ok(BatchOutcome::GapAppendedNewer {
                    dropped: start,
                    appended: newer.len(),
                })
            }
            GapPolicy::Reconcile => self.reconcile(entity, batch),
        }
    }

    /// Rewrites the log as the stable, timestamp-ordered union of the stored
    /// rows and `batch`, keeping the first copy of each exact row.
    fn reconcile(&mut self, entity: &str, batch: &[TradeRecord]) -> Result<BatchOutcome> {
        let stored = match self.store.read_all::<TradeRecord>(entity) {
            Ok(rows) => rows,
            Err(e) if e.is_corrupt() => {
                warn!(entity, error = %e, "log is corrupt, not reconciling");
                return Ok(BatchOutcome::CorruptLog {
                    dropped: batch.len(),
                });
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read log of {entity}")),
        };

        let mut seen: HashSet<String> = stored.iter().map(Row::encode).collect();
        let mut added = Vec::new();
        for record in batch {
            if seen.insert(record.encode()) {
                added.push(record.clone());
            }
        }

        let mut merged = stored;
        merged.extend(added.iter().cloned());
        // Stable: rows with equal timestamps keep their stored-then-fetched order.
        merged.sort_by(|a, b| a.date_created.cmp(&b.date_created));
        let mut kept = HashSet::with_capacity(merged.len());
        merged.retain(|r| kept.insert(r.encode()));

        self.store
            .overwrite(entity, &merged)
            .with_context(|| format!("failed to rewrite log of {entity}"))?;

        warn!(
            entity,
            added = added.len(),
            total = merged.len(),
            "resume marker not in batch, log reconciled"
        );
        let outcome = BatchOutcome::Reconciled {
            added: added.len(),
            total: merged.len(),
        };
        self.collected
            .entry(entity.to_string())
            .or_default()
            .extend(added);
        Ok(outcome)
    }

    fn append(&mut self, entity: &str, records: &[TradeRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.store
            .append(entity, records)
            .with_context(|| format!("failed to append {} records to {entity}", records.len()))?;
        self.collected
            .entry(entity.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }
}

/// Returns a reason if `batch` cannot be merged for `entity`.
fn check_batch(entity: &str, batch: &[TradeRecord]) -> Option<String> {
    if let Some(other) = batch.iter().find(|r| r.product_id != entity) {
        return Some(format!(
            "record for product {} in batch for {entity}",
            other.product_id
        ));
    }
    if let Some(i) = batch
        .windows(2)
        .position(|w| w[1].date_created < w[0].date_created)
    {
        return Some(format!(
            "batch is not ascending: {} follows {} at index {}",
            batch[i + 1].date_created,
            batch[i].date_created,
            i + 1
        ));
    }
    None
}
