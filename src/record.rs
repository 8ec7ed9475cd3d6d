//! # Log Records
//!
//! The canonical unit flowing through the gateway: one tag read by one
//! source (scanner) at one instant.
//!
//! ## Identifier Rules
//!
//! - `source_id`: 1-32 characters of `[A-Za-z0-9_-]`
//! - `tag_id`: 8-32 hex characters, stored uppercase
//!
//! ## Timestamp Formats
//!
//! - ISO form `YYYY-MM-DD HH:MM:SS` (CSV rows, upload payload)
//! - `ts14` form `YYYYMMDDHHMMSS` (spool file names)

use chrono::{Datelike, NaiveDateTime};
use serde::Serialize;

/// Maximum length of a source identifier
pub const MAX_SOURCE_ID_LEN: usize = 32;

/// Minimum length of a tag identifier
pub const MIN_TAG_ID_LEN: usize = 8;

/// Maximum length of a tag identifier
pub const MAX_TAG_ID_LEN: usize = 32;

/// Civil time format used in CSV rows and upload payloads
pub const ISO_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Compact 14-digit format used in spool file names
pub const TS14_FORMAT: &str = "%Y%m%d%H%M%S";

/// Year reported by clocks that have no trustworthy time
pub const UNSET_EPOCH_YEAR: i32 = 1970;

/// A single tag read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Logical source (scanner) that produced the read
    pub source_id: String,

    /// Uppercase hex tag identifier
    pub tag_id: String,

    /// Local civil time, second resolution
    pub timestamp: NaiveDateTime,

    /// Whether the cloud endpoint confirmed the record
    pub delivered: bool,

    /// Last upload diagnostic (`NET_ERR`, `HTTP_500`, ...), empty on success
    pub last_error: String,
}

/// Composite key used to match CSV rows and in-memory entries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub source_id: String,
    pub tag_id: String,
    pub timestamp: String,
}

impl LogRecord {
    /// Creates an undelivered record.
    pub fn new(source_id: impl Into<String>, tag_id: impl Into<String>, timestamp: NaiveDateTime) -> Self {
        Self {
            source_id: source_id.into(),
            tag_id: tag_id.into(),
            timestamp,
            delivered: false,
            last_error: String::new(),
        }
    }

    /// Timestamp as `YYYYMMDDHHMMSS`
    pub fn ts14(&self) -> String {
        self.timestamp.format(TS14_FORMAT).to_string()
    }

    /// Timestamp as `YYYY-MM-DD HH:MM:SS`
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.format(ISO_FORMAT).to_string()
    }

    /// Composite `(source_id, tag_id, timestamp)` key
    pub fn key(&self) -> RecordKey {
        RecordKey {
            source_id: self.source_id.clone(),
            tag_id: self.tag_id.clone(),
            timestamp: self.timestamp_iso(),
        }
    }

    /// True when the timestamp came from the uptime fallback.
    pub fn is_out_of_epoch(&self) -> bool {
        self.timestamp.year() == UNSET_EPOCH_YEAR
    }
}

/// Returns true if `source_id` is 1-32 chars of `[A-Za-z0-9_-]`.
pub fn is_valid_source_id(source_id: &str) -> bool {
    !source_id.is_empty()
        && source_id.len() <= MAX_SOURCE_ID_LEN
        && source_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Uppercases a tag id, or returns `None` if it is not 8-32 hex chars.
///
/// # Examples
///
/// ```
/// use field_gateway::record::normalize_tag_id;
///
/// assert_eq!(normalize_tag_id("0a1b2c3d").as_deref(), Some("0A1B2C3D"));
/// assert_eq!(normalize_tag_id("0A1B2C3"), None);
/// ```
pub fn normalize_tag_id(tag_id: &str) -> Option<String> {
    if tag_id.len() < MIN_TAG_ID_LEN || tag_id.len() > MAX_TAG_ID_LEN {
        return None;
    }
    if !tag_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(tag_id.to_ascii_uppercase())
}

/// Parses a `YYYYMMDDHHMMSS` string.
pub fn parse_ts14(ts14: &str) -> Option<NaiveDateTime> {
    if ts14.len() != 14 || !ts14.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(ts14, TS14_FORMAT).ok()
}

/// Parses a `YYYY-MM-DD HH:MM:SS` string.
pub fn parse_iso(iso: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(iso.trim(), ISO_FORMAT).ok()
}
