//! Product metadata log.
//!
//! Metadata rows go to one aggregate log. A product is recorded once per
//! visit; when a resumed session lands on the product it was processing
//! when it stopped, the last row already names it and nothing is written.

use anyhow::{Context, Result};
use codec::ProductMeta;
use tracing::{debug, warn};

use crate::MergeEngine;

impl MergeEngine {
    /// Records `meta` in the metadata log.
    ///
    /// Returns `false` if the last metadata row already describes the same
    /// product (nothing written), `true` if a row was appended.
    pub fn record_meta(&mut self, meta: &ProductMeta) -> Result<bool> {
        anyhow::ensure!(!meta.product_id.is_empty(), "product id must not be empty");

        let last = match self.store.read_last::<ProductMeta>(&self.meta_log) {
            Ok(last) => last,
            Err(e) if e.is_corrupt() => {
                warn!(log = %self.meta_log, error = %e, "metadata log tail is unreadable");
                None
            }
            Err(e) => return Err(e).context("failed to read metadata log"),
        };

        if last.is_some_and(|m| m.product_id == meta.product_id) {
            debug!(entity = %meta.product_id, "metadata already recorded");
            return Ok(false);
        }

        self.store
            .append(&self.meta_log, std::slice::from_ref(meta))
            .context("failed to append to metadata log")?;
        debug!(entity = %meta.product_id, name = %meta.name, brand = %meta.brand, "recorded metadata");
        Ok(true)
    }

    /// Every row of the metadata log, in file order.
    pub fn read_meta(&self) -> Result<Vec<ProductMeta>> {
        self.store
            .read_all::<ProductMeta>(&self.meta_log)
            .context("failed to read metadata log")
    }
}
