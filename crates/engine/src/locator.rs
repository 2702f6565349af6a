//! Resume-point lookup inside a fetched batch.
//!
//! A batch is ascending by timestamp. The resume marker is the timestamp of
//! the last stored record. Both lookups below are binary searches over the
//! parsed instants (never the timestamp text) and run in O(log n).

use codec::{Timestamp, TradeRecord};

/// Returns the index of a record whose timestamp equals `target`, or `None`
/// if no record in `batch` has that timestamp.
///
/// When several records share `target`, any one of their indices may be
/// returned.
pub fn locate(batch: &[TradeRecord], target: &Timestamp) -> Option<usize> {
    batch
        .binary_search_by(|r| r.date_created.cmp(target))
        .ok()
}

/// Returns the index of the first record that is not yet stored, given that
/// the stored log ends at `target`.
///
/// Every record with a timestamp `<= target` is treated as stored, including
/// all records that tie with `target`, so no duplicate can survive a tie.
/// Returns `None` if `target` does not occur in `batch` at all; the caller
/// then has no reliable overlap information. `Some(batch.len())` means the
/// batch is fully covered.
pub fn novel_start(batch: &[TradeRecord], target: &Timestamp) -> Option<usize> {
    let found = locate(batch, target)?;
    Some(found + batch[found..].partition_point(|r| r.date_created <= *target))
}

/// Returns the index of the first record strictly newer than `target`.
///
/// Unlike [`novel_start`] this does not require `target` to be present.
pub fn first_newer(batch: &[TradeRecord], target: &Timestamp) -> usize {
    batch.partition_point(|r| r.date_created <= *target)
}
