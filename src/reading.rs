//! Glove sensor readings.
//!
//! A reading is one datagram from the glove: twelve comma-separated values
//! covering two 6-axis IMUs (accelerometer then gyroscope, unit 1 then unit 2).
//! Values are never parsed as numbers; the bridge only checks the field count
//! and forwards the line as received.

use std::fmt;
use thiserror::Error;

/// Number of fields in one reading.
pub const FIELD_COUNT: usize = 12;

/// Field delimiter on the wire and in the record file.
pub const DELIMITER: char = ',';

/// Column names of the record file, in wire order, followed by the capture time.
pub const RECORD_HEADER: [&str; FIELD_COUNT + 1] = [
    "ax1",
    "ay1",
    "az1",
    "gx1",
    "gy1",
    "gz1",
    "ax2",
    "ay2",
    "az2",
    "gx2",
    "gy2",
    "gz2",
    "timestamp",
];

/// Why a datagram was not accepted as a reading.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadingError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("expected 12 fields, found {found}")]
    FieldCount { found: usize },
}

/// One validated sensor sample, kept in its raw line form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    raw: String,
}

impl Reading {
    /// Validate a text line. Surrounding whitespace is trimmed first.
    pub fn parse(line: &str) -> Result<Self, ReadingError> {
        let line = line.trim();
        let found = line.split(DELIMITER).count();
        if found != FIELD_COUNT {
            return Err(ReadingError::FieldCount { found });
        }
        Ok(Self {
            raw: line.to_string(),
        })
    }

    /// Validate a datagram payload.
    pub fn from_datagram(payload: &[u8]) -> Result<Self, ReadingError> {
        let text = std::str::from_utf8(payload).map_err(|_| ReadingError::NotUtf8)?;
        Self::parse(text)
    }

    /// The line exactly as forwarded to clients.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The twelve field values in wire order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.raw.split(DELIMITER)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
