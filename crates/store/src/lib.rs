//! # Store - Append-Only Flat Logs
//!
//! One delimited text file per entity under a single directory:
//!
//! ```text
//! output/
//!   1234.csv                 <- entity log, header + one row per trade
//!   5678.csv
//!   product_meta_data.csv    <- aggregate log (registered, not an entity)
//! ```
//!
//! ## Write discipline
//!
//! - [`FlatStore::append`] only ever adds rows at the end. The header is
//!   written when the file is created. Existing rows are never reordered.
//! - [`FlatStore::overwrite`] replaces a whole log: the new content goes to
//!   `<name>.csv.tmp`, is fsynced, then renamed over the old file, so a reader
//!   sees either the old log or the new one. Leftover `.tmp` files from an
//!   interrupted overwrite are removed by [`FlatStore::open`].
//!
//! The store holds no per-entity state, so appends to different entities
//! never interfere. Serializing appends to the *same* entity is the caller's
//! job.
//!
//! ## Failure model
//!
//! A missing log is a normal state (`None` / `0`), not an error. I/O errors
//! are returned to the caller unchanged; the store never retries.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use codec::{split_fields, split_records, CodecError, Row};
use thiserror::Error;
use tracing::{debug, warn};

/// Extension of every log file.
pub const LOG_EXTENSION: &str = "csv";

/// Suffix used for in-progress overwrites.
const TMP_SUFFIX: &str = "csv.tmp";

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record in the log could not be parsed.
    #[error("corrupt log {} at record {record}", path.display())]
    Corrupt {
        path: PathBuf,
        /// Record number, header = 0.
        record: usize,
        #[source]
        source: CodecError,
    },

    /// The log's header does not match the record type being read.
    #[error("log {} has header {found:?}, expected {expected:?}", path.display())]
    HeaderMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// The log is not valid UTF-8.
    #[error("log {} is not valid utf-8", path.display())]
    NotUtf8 { path: PathBuf },

    /// The log name cannot be used as a file name.
    #[error("invalid log name {0:?}")]
    InvalidName(String),
}

impl StoreError {
    /// Returns `true` if the error describes unreadable log content rather
    /// than an I/O failure.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupt { .. } | StoreError::HeaderMismatch { .. } | StoreError::NotUtf8 { .. }
        )
    }
}

/// The untyped content of one log: the header and each raw data record, in
/// file order, exactly as stored (minus line terminators).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub header: String,
    pub rows: Vec<String>,
}

/// A directory of append-only entity logs.
#[derive(Debug, Clone)]
pub struct FlatStore {
    dir: PathBuf,
    /// If `true`, appends and overwrites are followed by `fsync`.
    sync: bool,
    /// Log names that hold aggregates rather than one entity's history.
    aggregates: BTreeSet<String>,
}

impl FlatStore {
    /// Opens the store at `dir`, creating the directory if needed and
    /// removing leftover temp files from interrupted overwrites.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            sync: false,
            aggregates: BTreeSet::new(),
        };
        store.cleanup_tmp_files();
        Ok(store)
    }

    /// Enables or disables `fsync` after every write.
    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Registers an aggregate log so that [`list_entities`](Self::list_entities)
    /// does not report it.
    #[must_use]
    pub fn with_aggregate(mut self, name: impl Into<String>) -> Self {
        self.aggregates.insert(name.into());
        self
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `name`.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{LOG_EXTENSION}"))
    }

    /// Returns `true` if a log file exists for `name`.
    pub fn exists(&self, name: &str) -> bool {
        self.log_path(name).is_file()
    }

    /// Reads the raw header and records of a log.
    ///
    /// Returns `Ok(None)` if the file does not exist or holds no records at
    /// all. Rows are not validated beyond record splitting.
    pub fn read_raw(&self, name: &str) -> Result<Option<RawLog>, StoreError> {
        let path = self.checked_path(name)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let text = String::from_utf8(bytes).map_err(|_| StoreError::NotUtf8 { path: path.clone() })?;
        let records = split_records(&text).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            record: match source {
                CodecError::UnterminatedQuote { record } => record,
                _ => 0,
            },
            source,
        })?;

        let mut iter = records.into_iter();
        let Some(header) = iter.next() else {
            return Ok(None);
        };
        Ok(Some(RawLog {
            header: header.to_string(),
            rows: iter.map(str::to_string).collect(),
        }))
    }

    /// Returns the most recently appended record, or `None` if the log does
    /// not exist or has no data rows.
    pub fn read_last<R: Row>(&self, name: &str) -> Result<Option<R>, StoreError> {
        let Some(raw) = self.read_raw(name)? else {
            return Ok(None);
        };
        self.check_header::<R>(name, &raw.header)?;
        match raw.rows.last() {
            Some(row) => R::decode(row)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    path: self.log_path(name),
                    record: raw.rows.len(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Number of data rows (header excluded); `0` if the log does not exist.
    pub fn read_count(&self, name: &str) -> Result<usize, StoreError> {
        Ok(self.read_raw(name)?.map(|raw| raw.rows.len()).unwrap_or(0))
    }

    /// Reads and decodes every row of a log, in file order.
    pub fn read_all<R: Row>(&self, name: &str) -> Result<Vec<R>, StoreError> {
        let Some(raw) = self.read_raw(name)? else {
            return Ok(Vec::new());
        };
        self.check_header::<R>(name, &raw.header)?;
        raw.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                R::decode(row).map_err(|source| StoreError::Corrupt {
                    path: self.log_path(name),
                    record: i + 1,
                    source,
                })
            })
            .collect()
    }

    /// Appends `records` to the log in the given order.
    ///
    /// The header row is written first if the log does not exist yet (or is
    /// empty). Appending an empty slice is a no-op and does not create the
    /// file. If the existing file does not end in a line break (a torn
    /// write), one is added first so the new rows start on their own line.
    pub fn append<R: Row>(&self, name: &str, records: &[R]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let path = self.checked_path(name)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut buf = String::with_capacity(records.len() * 64);
        if len == 0 {
            buf.push_str(&R::header());
            buf.push('\n');
        } else if !ends_with_newline(&mut file)? {
            warn!(log = %path.display(), "log did not end with a line break, repairing tail");
            buf.push('\n');
        }
        for record in records {
            buf.push_str(&record.encode());
            buf.push('\n');
        }

        // Single write call for the whole batch
        file.write_all(buf.as_bytes())?;
        file.flush()?;
        if self.sync {
            file.sync_all()?;
        }

        debug!(log = %name, rows = records.len(), "appended rows");
        Ok(())
    }

    /// Replaces the whole log with a header and `records`.
    pub fn overwrite<R: Row>(&self, name: &str, records: &[R]) -> Result<(), StoreError> {
        let raw = RawLog {
            header: R::header(),
            rows: records.iter().map(Row::encode).collect(),
        };
        self.overwrite_raw(name, &raw)
    }

    /// Replaces the whole log with the given raw header and rows.
    ///
    /// Writes to `<name>.csv.tmp`, fsyncs, then renames over the log. If the
    /// rename fails (Windows can refuse to replace a file that is still
    /// open elsewhere), falls back to truncating and rewriting in place.
    pub fn overwrite_raw(&self, name: &str, log: &RawLog) -> Result<(), StoreError> {
        let path = self.checked_path(name)?;
        let tmp_path = path.with_extension(TMP_SUFFIX);

        let mut content = String::with_capacity(log.header.len() + log.rows.len() * 64);
        content.push_str(&log.header);
        content.push('\n');
        for row in &log.rows {
            content.push_str(row);
            content.push('\n');
        }

        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(content.as_bytes())?;
            f.flush()?;
            f.sync_all()?;
        }

        if let Err(e) = fs::rename(&tmp_path, &path) {
            warn!(log = %path.display(), error = %e, "atomic rename failed, rewriting in place");
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            f.write_all(content.as_bytes())?;
            f.flush()?;
            f.sync_all()?;
            let _ = fs::remove_file(&tmp_path);
        }

        debug!(log = %name, rows = log.rows.len(), "overwrote log");
        Ok(())
    }

    /// Names of every log in the store, aggregates included.
    pub fn list_logs(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map(|e| e != LOG_EXTENSION).unwrap_or(true) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.insert(stem.to_string());
            }
        }
        Ok(names)
    }

    /// Ids of every entity with a log. Registered aggregates are excluded.
    pub fn list_entities(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut names = self.list_logs()?;
        names.retain(|n| !self.aggregates.contains(n));
        Ok(names)
    }

    fn checked_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.log_path(name))
    }

    fn check_header<R: Row>(&self, name: &str, header: &str) -> Result<(), StoreError> {
        let matches = split_fields(header)
            .map(|fields| fields.iter().map(String::as_str).eq(R::COLUMNS.iter().copied()))
            .unwrap_or(false);
        if matches {
            Ok(())
        } else {
            Err(StoreError::HeaderMismatch {
                path: self.log_path(name),
                expected: R::header(),
                found: header.to_string(),
            })
        }
    }

    /// Removes leftover `.csv.tmp` files from interrupted overwrites.
    fn cleanup_tmp_files(&self) {
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let p = entry.path();
                if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                    if name.ends_with(&format!(".{TMP_SUFFIX}")) {
                        debug!(file = %name, "removing leftover temp file");
                        let _ = fs::remove_file(&p);
                    }
                }
            }
        }
    }
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
