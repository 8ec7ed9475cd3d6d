//! # Durable Storage
//!
//! Record persistence on the shared storage device. Four interchangeable
//! backends sit behind the [`DurableSpool`] trait:
//!
//! - [`FileSpool`]: one empty file per undelivered record (default)
//! - [`CsvSpool`]: legacy append-only CSV read through a persisted cursor
//! - [`CsvRepo`]: legacy CSV treated as a flag-per-row repository
//! - [`MemoryLog`]: volatile fallback when no medium is mounted
//!
//! Every filesystem transaction runs under the one [`StorageLock`].

pub mod csv;
pub mod cursor;
pub mod lock;
pub mod memory;
pub mod spool;
pub mod spool_name;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::record::LogRecord;

pub use csv::{CsvRepo, CsvSpool};
pub use lock::{StorageGuard, StorageLock};
pub use memory::MemoryLog;
pub use spool::FileSpool;
pub use spool_name::SpoolEntry;

/// Which durability encoding is active
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpoolMode {
    /// File-per-record spool directory
    FileSpool { dir: PathBuf },
    /// Legacy CSV consumed through an upload cursor
    Csv { path: PathBuf },
    /// Legacy CSV with per-row delivered flags
    CsvRepo { path: PathBuf },
    /// In-memory ring, lost on restart
    Memory,
}

impl SpoolMode {
    /// Short name used in logs and configuration
    pub fn kind(&self) -> &'static str {
        match self {
            SpoolMode::FileSpool { .. } => "file_spool",
            SpoolMode::Csv { .. } => "csv",
            SpoolMode::CsvRepo { .. } => "csv_repo",
            SpoolMode::Memory => "memory",
        }
    }
}

/// Limits for one batch selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    /// Records to return at most (treated as at least 1)
    pub max_items: usize,
    /// Candidate entries to examine at most
    pub scan_limit: usize,
}

/// How a batch is settled against the backend that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// Spool files to delete on delivery
    Files(Vec<SpoolEntry>),
    /// Cursor position covering the consumed rows
    Cursor { offset: u64, lines: u32 },
    /// Records are matched back by their composite key
    Keys,
}

/// Undelivered records from exactly one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub source_id: String,
    pub records: Vec<LogRecord>,
    pub receipt: Receipt,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Durable record store consumed by ingestion and upload
///
/// Implementations acquire the [`StorageLock`] themselves; callers must not
/// hold a guard when calling in.
#[async_trait]
pub trait DurableSpool: Send + Sync {
    /// Human-readable backend description for logs
    fn describe(&self) -> String;

    /// Persists one record.
    async fn write(&self, record: &LogRecord) -> Result<()>;

    /// Selects the next per-source batch, or `None` if nothing is pending.
    async fn list_undelivered(&self, request: BatchRequest) -> Result<Option<Batch>>;

    /// Records confirmed delivery of a batch.
    async fn mark_delivered(&self, batch: &Batch) -> Result<()>;

    /// Records a failed upload of a batch.
    async fn mark_failed(&self, batch: &Batch, reason: &str) -> Result<()>;

    /// Forgets any persisted read position. No-op for cursorless backends.
    async fn reset_cursor(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds the backend for `mode`.
///
/// # Arguments
///
/// * `mode` - Selected encoding
/// * `lock` - Shared storage bus lock
/// * `memory` - Ring used when `mode` is [`SpoolMode::Memory`]
pub fn open_spool(mode: &SpoolMode, lock: StorageLock, memory: &MemoryLog) -> Arc<dyn DurableSpool> {
    match mode {
        SpoolMode::FileSpool { dir } => Arc::new(FileSpool::new(dir.clone(), lock)),
        SpoolMode::Csv { path } => Arc::new(CsvSpool::new(path.clone(), lock)),
        SpoolMode::CsvRepo { path } => Arc::new(CsvRepo::new(path.clone(), lock)),
        SpoolMode::Memory => Arc::new(memory.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_spool_per_mode() {
        let tmp = TempDir::new().unwrap();
        let lock = StorageLock::new();
        let memory = MemoryLog::new(4);

        let modes = [
            SpoolMode::FileSpool {
                dir: tmp.path().join("spool"),
            },
            SpoolMode::Csv {
                path: tmp.path().join("csv").join("logs.csv"),
            },
            SpoolMode::CsvRepo {
                path: tmp.path().join("repo").join("logs.csv"),
            },
            SpoolMode::Memory,
        ];

        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let request = BatchRequest {
            max_items: 5,
            scan_limit: 40,
        };

        for mode in &modes {
            let spool = open_spool(mode, lock.clone(), &memory);
            assert!(spool.describe().starts_with(match mode.kind() {
                "file_spool" => "spool:",
                "csv" => "csv:",
                "csv_repo" => "csv-repo:",
                _ => "memory:",
            }));

            spool.write(&LogRecord::new("S1", "0A1B2C3D", ts)).await.unwrap();
            let batch = spool.list_undelivered(request).await.unwrap().unwrap();
            assert_eq!(batch.source_id, "S1");
            assert_eq!(batch.len(), 1);

            spool.mark_delivered(&batch).await.unwrap();
            assert!(
                spool.list_undelivered(request).await.unwrap().is_none(),
                "{} still has pending records",
                mode.kind()
            );
        }
    }
}
