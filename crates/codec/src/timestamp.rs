use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

use crate::CodecError;

/// An ISO-8601 instant that remembers the exact text it was parsed from.
///
/// Comparisons use the parsed UTC instant, never the text, so
/// `2025-01-01T09:00:00+09:00` and `2025-01-01T00:00:00Z` are equal. The
/// original text is what gets written back to disk, which keeps re-encoded
/// rows byte-identical to the rows they were read from.
#[derive(Debug, Clone)]
pub struct Timestamp {
    raw: String,
    instant: DateTime<Utc>,
}

impl Timestamp {
    /// Parses an RFC 3339 timestamp. A date-time without an offset is taken
    /// to be UTC.
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let trimmed = raw.trim();
        let instant = match DateTime::parse_from_rfc3339(trimmed) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(rfc_err) => NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc())
                .map_err(|_| CodecError::InvalidField {
                    column: "date_created",
                    value: raw.to_string(),
                    reason: rfc_err.to_string(),
                })?,
        };
        Ok(Self {
            raw: trimmed.to_string(),
            instant,
        })
    }

    /// Builds a timestamp from an instant, rendered as `...Z` with as many
    /// fractional digits as needed.
    pub fn from_instant(instant: DateTime<Utc>) -> Self {
        Self {
            raw: instant.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            instant,
        }
    }

    /// The text this timestamp was parsed from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed instant.
    pub fn instant(&self) -> DateTime<Utc> {
        self.instant
    }

    /// Milliseconds since the Unix epoch.
    pub fn millis(&self) -> i64 {
        self.instant.timestamp_millis()
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.instant == other.instant
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instant.cmp(&other.instant)
    }
}

impl Hash for Timestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instant.hash(state);
    }
}

impl FromStr for Timestamp {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
