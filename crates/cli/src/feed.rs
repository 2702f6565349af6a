//! Directory-backed [`Fetcher`].
//!
//! A feed directory holds one `<id>.csv` per entity (trade rows under the
//! usual header, any order) and optionally `meta.csv` with product
//! metadata. A fetch serves the most recent `pages * page_size` trades,
//! oldest first, as one batch per page.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use codec::{split_records, ProductMeta, Row, TradeRecord};
use engine::{BatchQueue, FetchError, FetchRequest, Fetcher};
use tracing::debug;

const META_FILE: &str = "meta";
const FEED_EXTENSION: &str = "csv";

#[derive(Debug)]
pub struct DirFetcher {
    dir: PathBuf,
    page_size: usize,
    meta: HashMap<String, ProductMeta>,
}

impl DirFetcher {
    /// Opens the feed at `dir`, loading `meta.csv` if present.
    pub fn open<P: AsRef<Path>>(dir: P, page_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        anyhow::ensure!(dir.is_dir(), "feed dir {} does not exist", dir.display());
        anyhow::ensure!(page_size > 0, "page size must be at least 1");

        let meta_path = feed_path(&dir, META_FILE);
        let meta = if meta_path.is_file() {
            read_rows::<ProductMeta>(&meta_path)?
                .into_iter()
                .map(|m| (m.product_id.clone(), m))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            dir,
            page_size,
            meta,
        })
    }

    /// Entity ids with a feed file, sorted.
    pub fn entities(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list feed dir {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().map(|e| e != FEED_EXTENSION).unwrap_or(true) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if stem != META_FILE => ids.push(stem.to_string()),
                _ => {}
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl Fetcher for DirFetcher {
    fn fetch_meta(&mut self, entity: &str) -> Result<Option<ProductMeta>, FetchError> {
        Ok(self.meta.get(entity).cloned())
    }

    fn fetch(&mut self, request: &FetchRequest, queue: &mut BatchQueue) -> Result<(), FetchError> {
        let path = feed_path(&self.dir, &request.entity);
        let mut trades = match read_rows::<TradeRecord>(&path) {
            Ok(trades) => trades,
            Err(e) => {
                return Err(match e.downcast_ref::<io::Error>().map(io::Error::kind) {
                    Some(io::ErrorKind::NotFound) => {
                        FetchError::Permanent(format!("no feed for {}", request.entity))
                    }
                    Some(io::ErrorKind::InvalidData) | None => FetchError::Permanent(format!("{e:#}")),
                    Some(_) => FetchError::Transient(format!("{e:#}")),
                })
            }
        };

        trades.sort_by(|a, b| a.date_created.cmp(&b.date_created));
        let window = request.pages.saturating_mul(self.page_size);
        let recent = &trades[trades.len().saturating_sub(window)..];

        for page in recent.chunks(self.page_size) {
            queue.push(request.entity.clone(), page.to_vec());
        }
        debug!(
            entity = %request.entity,
            pages = request.pages,
            served = recent.len(),
            available = trades.len(),
            "served feed"
        );
        Ok(())
    }
}

/// Reads every row of a CSV file written with the log header for `R`.
pub fn read_rows<R: Row>(path: &Path) -> Result<Vec<R>> {
    let text = fs::read_to_string(path)?;
    let records = split_records(&text).with_context(|| format!("in {}", path.display()))?;

    let Some((header, rows)) = records.split_first() else {
        return Ok(Vec::new());
    };
    anyhow::ensure!(
        *header == R::header(),
        "{} has header {header:?}, expected {:?}",
        path.display(),
        R::header()
    );
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            R::decode(row).with_context(|| format!("{} record {}", path.display(), i + 1))
        })
        .collect()
}

fn feed_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{FEED_EXTENSION}"))
}
