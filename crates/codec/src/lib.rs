//! # Codec - Delimited Row Encoding
//!
//! Converts typed records to and from the comma-delimited rows stored in each
//! entity log. Every log starts with one header row naming the columns, then
//! one row per record.
//!
//! ## Quoting
//!
//! A field is wrapped in double quotes when it contains the delimiter, a
//! double quote, CR or LF. Embedded double quotes are doubled:
//!
//! ```text
//! product_id,name,original_price,brand
//! 42,"Air Force 1 ""07"", White",139000,nike
//! ```
//!
//! Decoding accepts quoted and bare fields alike. A bare field may contain a
//! literal `"` (older logs were written that way) but a quoted field must be
//! closed before the next delimiter.
//!
//! ## Records vs. lines
//!
//! Because quoted fields may span lines, a log's text is split into raw
//! records with [`split_records`], which only breaks on line endings outside
//! quotes. The raw record text is what the repair pass compares for exact
//! duplicates, so encoding must be byte-stable: decoding a row and encoding
//! it again yields the same text for anything this crate wrote.

mod record;
mod timestamp;

use std::borrow::Cow;

use thiserror::Error;

pub use record::{ProductMeta, TradeRecord};
pub use timestamp::Timestamp;

/// Field delimiter used in every log.
pub const DELIMITER: char = ',';

const QUOTE: char = '"';

/// Errors produced while encoding or decoding rows.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A quoted field was still open when the input ended.
    #[error("unterminated quoted field in record {record}")]
    UnterminatedQuote {
        /// Zero-based record number within the input.
        record: usize,
    },

    /// A quoted field in a single record was never closed.
    #[error("unterminated quoted field {field}")]
    UnterminatedField {
        /// Zero-based field position.
        field: usize,
    },

    /// A closing quote was followed by something other than a delimiter.
    #[error("unexpected character after closing quote in field {field}")]
    StrayQuote {
        /// Zero-based field position.
        field: usize,
    },

    /// The row has a different number of fields than the header.
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    /// A field could not be converted to its typed value.
    #[error("invalid value {value:?} for column {column}: {reason}")]
    InvalidField {
        column: &'static str,
        value: String,
        reason: String,
    },
}

/// A record type with a fixed column layout.
///
/// `COLUMNS` is the header row, in storage order. `to_fields` and
/// `from_fields` must agree with it position by position.
pub trait Row: Sized {
    /// Column names in storage order.
    const COLUMNS: &'static [&'static str];

    /// Returns the field values in column order (unescaped).
    fn to_fields(&self) -> Vec<String>;

    /// Builds a record from unescaped field values in column order.
    ///
    /// Callers guarantee `fields.len() == Self::COLUMNS.len()`.
    fn from_fields(fields: &[String]) -> Result<Self, CodecError>;

    /// Encodes the record as one row (without line terminator).
    fn encode(&self) -> String {
        encode_row(&self.to_fields())
    }

    /// Decodes one raw record produced by [`split_records`].
    fn decode(record: &str) -> Result<Self, CodecError> {
        let fields = split_fields(record)?;
        if fields.len() != Self::COLUMNS.len() {
            return Err(CodecError::FieldCount {
                expected: Self::COLUMNS.len(),
                found: fields.len(),
            });
        }
        Self::from_fields(&fields)
    }

    /// The header row for logs of this record type.
    fn header() -> String {
        encode_row(Self::COLUMNS)
    }
}

/// Escapes a single field, quoting only when required.
pub fn encode_field(value: &str) -> Cow<'_, str> {
    let needs_quotes = value
        .chars()
        .any(|c| c == DELIMITER || c == QUOTE || c == '\r' || c == '\n');
    if !needs_quotes {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push(QUOTE);
    for c in value.chars() {
        if c == QUOTE {
            out.push(QUOTE);
        }
        out.push(c);
    }
    out.push(QUOTE);
    Cow::Owned(out)
}

/// Joins already-unescaped field values into one encoded row.
pub fn encode_row<S: AsRef<str>>(fields: &[S]) -> String {
    let mut row = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            row.push(DELIMITER);
        }
        row.push_str(&encode_field(field.as_ref()));
    }
    row
}

/// Splits one raw record into unescaped field values.
pub fn split_fields(record: &str) -> Result<Vec<String>, CodecError> {
    let mut fields = Vec::new();
    let mut chars = record.chars().peekable();

    loop {
        let mut field = String::new();

        if chars.peek() == Some(&QUOTE) {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == QUOTE {
                    if chars.peek() == Some(&QUOTE) {
                        chars.next();
                        field.push(QUOTE);
                    } else {
                        closed = true;
                        break;
                    }
                } else {
                    field.push(c);
                }
            }
            if !closed {
                return Err(CodecError::UnterminatedField {
                    field: fields.len(),
                });
            }
            match chars.peek() {
                None | Some(&DELIMITER) => {}
                Some(_) => {
                    return Err(CodecError::StrayQuote {
                        field: fields.len(),
                    })
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == DELIMITER {
                    break;
                }
                field.push(c);
                chars.next();
            }
        }

        fields.push(field);

        match chars.next() {
            Some(DELIMITER) => continue,
            _ => break,
        }
    }

    Ok(fields)
}

/// Splits the full text of a log into raw records.
///
/// Breaks on `\n` (and `\r\n`) outside quoted fields. A quote opens a
/// quoted field only as the first character of a field, the same rule
/// [`split_fields`] applies, so a bare field with a literal `"` does not
/// swallow the following lines. Blank records are skipped. The returned
/// slices borrow from `text` and keep the original bytes of each record,
/// minus the line terminator.
pub fn split_records(text: &str) -> Result<Vec<&str>, CodecError> {
    let mut records = Vec::new();
    let mut chars = text.char_indices().peekable();
    let mut in_quotes = false;
    let mut field_start = true;
    let mut start = 0;

    while let Some((i, c)) = chars.next() {
        if in_quotes {
            if c == QUOTE {
                // "" inside a quoted field is an escaped quote.
                if matches!(chars.peek(), Some(&(_, QUOTE))) {
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            continue;
        }
        match c {
            QUOTE if field_start => {
                in_quotes = true;
                field_start = false;
            }
            DELIMITER => field_start = true,
            '\n' => {
                push_record(&mut records, &text[start..i]);
                start = i + 1;
                field_start = true;
            }
            _ => field_start = false,
        }
    }

    if in_quotes {
        return Err(CodecError::UnterminatedQuote {
            record: records.len(),
        });
    }
    push_record(&mut records, &text[start..]);

    Ok(records)
}

fn push_record<'a>(records: &mut Vec<&'a str>, raw: &'a str) {
    let raw = raw.strip_suffix('\r').unwrap_or(raw);
    if !raw.is_empty() {
        records.push(raw);
    }
}
