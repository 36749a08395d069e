use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamp format used on the wire (OBR observation date-time).
pub const COMPACT_FORMAT: &str = "%Y%m%d%H%M%S";

/// Timestamp format used in the history CSV and the on-disk snapshot.
pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized timestamp format: {0}")]
pub struct TimestampError(pub String);

/// Parses a test timestamp, accepting both formats seen upstream.
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, TimestampError> {
    NaiveDateTime::parse_from_str(value, COMPACT_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, CANONICAL_FORMAT))
        .map_err(|_| TimestampError(value.to_string()))
}

/// A single creatinine measurement. `(mrn, date)` is the primary key;
/// results are never updated or deleted once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub mrn: String,
    pub date: NaiveDateTime,
    pub result: f64,
}
