//! # Upload Debug Snapshot
//!
//! What happened in the last upload cycle. Overwritten every cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Cycle aborted because free memory was below the floor
pub const CODE_LOW_RESOURCES: i32 = -1;

/// Cycle aborted because the spool could not be read
pub const CODE_STORAGE_READ_FAILED: i32 = -2;

/// Nothing was pending
pub const CODE_NOTHING_TO_UPLOAD: i32 = 204;

/// Why an upload attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transport failure, no status available
    Net,
    /// Request completed with a non-2xx status
    Http(u16),
}

impl FailureKind {
    /// True for 401 and 403
    pub fn is_auth(&self) -> bool {
        matches!(self, FailureKind::Http(401) | FailureKind::Http(403))
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Net => write!(f, "NET_ERR"),
            FailureKind::Http(code) => write!(f, "HTTP_{}", code),
        }
    }
}

/// Last-cycle observability record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadDebugSnapshot {
    /// When the cycle finished; `None` before the first cycle
    pub at: Option<DateTime<Utc>>,
    /// HTTP status, or one of the negative `CODE_*` values
    pub code: i32,
    pub success: bool,
    /// `NET_ERR`, `HTTP_<code>`, `low_resources`, `storage_read_failed`, or empty
    pub error: String,
    pub bytes_sent: usize,
    pub response_size: usize,
    pub endpoint: String,
    pub source_id: String,
    pub items: usize,
}

impl UploadDebugSnapshot {
    pub fn low_resources(endpoint: &str) -> Self {
        Self {
            at: Some(Utc::now()),
            code: CODE_LOW_RESOURCES,
            success: false,
            error: "low_resources".to_string(),
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    pub fn storage_read_failed(endpoint: &str) -> Self {
        Self {
            at: Some(Utc::now()),
            code: CODE_STORAGE_READ_FAILED,
            success: false,
            error: "storage_read_failed".to_string(),
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    pub fn nothing_to_upload(endpoint: &str) -> Self {
        Self {
            at: Some(Utc::now()),
            code: CODE_NOTHING_TO_UPLOAD,
            success: true,
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }
}
