//! # Spool File Names
//!
//! In file-per-record mode the file name *is* the record:
//!
//! ```text
//! LOG.<tag_id>.<ts14>.<source_id>[.<collision_index>]
//! ```
//!
//! `ts14` is `YYYYMMDDHHMMSS`. Same-second collisions get a numeric suffix
//! starting at 2. Names that do not decode are foreign files and are left
//! alone by the spool.

use chrono::NaiveDateTime;
use std::path::PathBuf;

use crate::record::{parse_ts14, LogRecord};

/// File name prefix for spooled records
pub const SPOOL_PREFIX: &str = "LOG.";

/// First collision suffix tried
pub const FIRST_COLLISION_INDEX: u32 = 2;

/// Last collision suffix tried (exclusive upper bound is 1000)
pub const LAST_COLLISION_INDEX: u32 = 999;

/// A decoded spool file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolEntry {
    /// Bare file name inside the spool directory
    pub file_name: String,
    /// Full path of the backing file
    pub path: PathBuf,
    pub tag_id: String,
    pub ts14: String,
    pub source_id: String,
    pub timestamp: NaiveDateTime,
    /// Collision suffix, if any
    pub collision_index: Option<u32>,
}

impl SpoolEntry {
    /// Rebuilds the record carried by this file name.
    pub fn to_record(&self) -> LogRecord {
        LogRecord::new(self.source_id.clone(), self.tag_id.clone(), self.timestamp)
    }
}

/// Encodes the base file name (no collision suffix) for a record.
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use field_gateway::record::LogRecord;
/// use field_gateway::storage::spool_name::encode_name;
///
/// let ts = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_opt(7, 5, 3).unwrap();
/// let record = LogRecord::new("S1", "0A1B2C3D", ts);
/// assert_eq!(encode_name(&record), "LOG.0A1B2C3D.20240309070503.S1");
/// ```
pub fn encode_name(record: &LogRecord) -> String {
    format!(
        "{}{}.{}.{}",
        SPOOL_PREFIX,
        record.tag_id,
        record.ts14(),
        record.source_id
    )
}

/// Appends a collision suffix to a base name.
pub fn with_collision_index(base: &str, index: u32) -> String {
    format!("{}.{}", base, index)
}

/// Decodes a bare file name, returning `None` for foreign or corrupt names.
///
/// # Arguments
///
/// * `file_name` - Name inside the spool directory
/// * `path` - Full path to attach to the entry
pub fn decode_name(file_name: &str, path: PathBuf) -> Option<SpoolEntry> {
    let rest = file_name.strip_prefix(SPOOL_PREFIX)?;
    let mut parts = rest.split('.');

    let tag_id = parts.next()?;
    let ts14 = parts.next()?;
    let source_id = parts.next()?;
    let collision_index = match parts.next() {
        None => None,
        Some(n) => Some(n.parse::<u32>().ok()?),
    };
    if parts.next().is_some() {
        return None;
    }

    if tag_id.is_empty() || source_id.is_empty() {
        return None;
    }
    let timestamp = parse_ts14(ts14)?;

    Some(SpoolEntry {
        file_name: file_name.to_string(),
        path,
        tag_id: tag_id.to_string(),
        ts14: ts14.to_string(),
        source_id: source_id.to_string(),
        timestamp,
        collision_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record() -> LogRecord {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 3)
            .unwrap();
        LogRecord::new("scanner_01", "DEADBEEF00", ts)
    }

    #[test]
    fn test_encode_then_decode() {
        let record = record();
        let name = encode_name(&record);
        assert_eq!(name, "LOG.DEADBEEF00.20240309070503.scanner_01");

        let entry = decode_name(&name, PathBuf::from("/spool").join(&name)).unwrap();
        assert_eq!(entry.tag_id, record.tag_id);
        assert_eq!(entry.source_id, record.source_id);
        assert_eq!(entry.ts14, record.ts14());
        assert_eq!(entry.collision_index, None);
        assert_eq!(entry.to_record(), record);
    }

    #[test]
    fn test_decode_collision_suffix() {
        let name = with_collision_index(&encode_name(&record()), 2);
        assert_eq!(name, "LOG.DEADBEEF00.20240309070503.scanner_01.2");

        let entry = decode_name(&name, PathBuf::from(&name)).unwrap();
        assert_eq!(entry.source_id, "scanner_01");
        assert_eq!(entry.collision_index, Some(2));
    }

    #[test]
    fn test_decode_rejects_foreign_names() {
        for name in [
            "notes.txt",
            "LOG.",
            "LOG.DEADBEEF",
            "LOG.DEADBEEF.20240309070503",
            "LOG..20240309070503.S1",
            "LOG.DEADBEEF.20240309070503.",
            "LOG.DEADBEEF.2024030907050.S1",
            "LOG.DEADBEEF.2024030907050x.S1",
            "LOG.DEADBEEF.20240309070503.S1.x",
            "LOG.DEADBEEF.20240309070503.S1.2.3",
            "log.DEADBEEF.20240309070503.S1",
        ] {
            assert!(decode_name(name, PathBuf::from(name)).is_none(), "{} should not decode", name);
        }
    }
}
