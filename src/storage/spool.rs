//! # File Spool
//!
//! File-per-record durable queue. One empty file per undelivered record,
//! named by [`spool_name`](super::spool_name). A record that still exists as
//! a file is undelivered; deleting the file is the delivery point.
//!
//! All directory and file operations run under the shared
//! [`StorageLock`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tracing::{debug, info, warn};

use super::lock::StorageLock;
use super::spool_name::{
    decode_name, encode_name, with_collision_index, SpoolEntry, FIRST_COLLISION_INDEX,
    LAST_COLLISION_INDEX,
};
use super::{Batch, BatchRequest, DurableSpool, Receipt};
use crate::error::{GatewayError, Result};
use crate::record::LogRecord;

/// Directory entries processed between cooperative yields
const YIELD_EVERY: usize = 32;

/// Spool entries grouped by source, each group sorted by `(timestamp, tag_id)`
pub type GroupedEntries = BTreeMap<String, Vec<SpoolEntry>>;

/// Result of [`FileSpool::clear`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    /// Number of files deleted from the spool directory
    pub removed: usize,
    /// Sum of the deleted files' sizes
    pub bytes_freed: u64,
    /// Whether a cursor side-file was found and deleted
    pub cursor_deleted: bool,
}

/// File-per-record spool rooted at one directory
#[derive(Debug, Clone)]
pub struct FileSpool {
    dir: PathBuf,
    lock: StorageLock,
}

impl FileSpool {
    /// Creates a spool handle. The directory is created lazily on first write.
    pub fn new(dir: impl Into<PathBuf>, lock: StorageLock) -> Self {
        Self {
            dir: dir.into(),
            lock,
        }
    }

    /// Spool directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists one record as a new file.
    ///
    /// Same-second collisions are resolved by probing `.2` through `.999`.
    /// A successful create is the durability point; existing files are never
    /// rewritten.
    ///
    /// # Returns
    ///
    /// * `Result<PathBuf>` - Path of the created file
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created, every collision
    /// slot is taken, or the create itself fails.
    pub async fn write_record(&self, record: &LogRecord) -> Result<PathBuf> {
        let _guard = self.lock.acquire().await;

        fs::create_dir_all(&self.dir).await?;

        let base = encode_name(record);
        let candidates = std::iter::once(base.clone()).chain(
            (FIRST_COLLISION_INDEX..=LAST_COLLISION_INDEX).map(|n| with_collision_index(&base, n)),
        );

        for name in candidates {
            let path = self.dir.join(&name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    file.sync_all().await?;
                    debug!("Spooled {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(GatewayError::Storage(format!(
                        "Spool create failed for {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Err(GatewayError::Storage(format!(
            "No free collision slot for {} in {}",
            base,
            self.dir.display()
        )))
    }

    /// Scans the directory once and groups undelivered entries by source.
    ///
    /// Names that fail to decode are skipped (never deleted). At most
    /// `max_total` directory entries are visited, foreign ones included.
    pub async fn list_grouped(&self, max_total: usize) -> Result<GroupedEntries> {
        let (entries, _) = self.scan(max_total).await?;

        let mut groups = GroupedEntries::new();
        for entry in entries {
            groups.entry(entry.source_id.clone()).or_default().push(entry);
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.tag_id.cmp(&b.tag_id))
                    .then_with(|| a.collision_index.cmp(&b.collision_index))
            });
        }
        Ok(groups)
    }

    /// Lists up to `limit` entries newest first, for diagnostics.
    ///
    /// Ordering: timestamp descending, then source ascending, then tag
    /// ascending. Scans at most `limit × 8` files.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<SpoolEntry>> {
        let (mut entries, _) = self.scan(limit.saturating_mul(8)).await?;
        entries.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.source_id.cmp(&b.source_id))
                .then_with(|| a.tag_id.cmp(&b.tag_id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    /// Removes the backing file of each entry.
    ///
    /// Returns false if any deletion failed. Already-deleted entries stay
    /// deleted.
    pub async fn delete(&self, entries: &[SpoolEntry]) -> bool {
        let _guard = self.lock.acquire().await;

        let mut all_ok = true;
        for entry in entries {
            if let Err(e) = fs::remove_file(&entry.path).await {
                warn!("Failed to delete {}: {}", entry.path.display(), e);
                all_ok = false;
            }
        }
        all_ok
    }

    /// Deletes every file in the spool and the optional cursor side-file.
    ///
    /// The directory is recreated afterwards so the spool stays usable.
    pub async fn clear(&self, cursor_path: Option<&Path>) -> Result<ClearReport> {
        let _guard = self.lock.acquire().await;
        let mut report = ClearReport::default();

        match fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => {
                let mut dir = fs::read_dir(&self.dir).await?;
                while let Some(entry) = dir.next_entry().await? {
                    let meta = entry.metadata().await?;
                    if meta.is_dir() {
                        continue;
                    }
                    match fs::remove_file(entry.path()).await {
                        Ok(()) => {
                            report.removed += 1;
                            report.bytes_freed += meta.len();
                        }
                        Err(e) => warn!("Failed to clear {}: {}", entry.path().display(), e),
                    }
                }
            }
            Ok(_) => {
                warn!("{} is not a directory; replacing it", self.dir.display());
                fs::remove_file(&self.dir).await?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.dir).await?;

        if let Some(cursor) = cursor_path {
            report.cursor_deleted = fs::remove_file(cursor).await.is_ok();
        }

        info!(
            "Cleared spool {} ({} files, {} bytes)",
            self.dir.display(),
            report.removed,
            report.bytes_freed
        );
        Ok(report)
    }

    /// Visits at most `max_total` directory entries, foreign ones included.
    ///
    /// Returns the decoded entries and the number of entries visited.
    async fn scan(&self, max_total: usize) -> Result<(Vec<SpoolEntry>, usize)> {
        let _guard = self.lock.acquire().await;

        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        let mut seen = 0usize;
        while seen < max_total {
            let Some(item) = dir.next_entry().await? else {
                break;
            };

            seen += 1;
            if seen % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }

            if !item.file_type().await?.is_file() {
                continue;
            }
            let file_name = item.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            match decode_name(name, item.path()) {
                Some(entry) => entries.push(entry),
                None => debug!("Skipping foreign spool file {}", name),
            }
        }
        Ok((entries, seen))
    }
}

#[async_trait]
impl DurableSpool for FileSpool {
    fn describe(&self) -> String {
        format!("spool:{}", self.dir.display())
    }

    async fn write(&self, record: &LogRecord) -> Result<()> {
        self.write_record(record).await.map(|_| ())
    }

    async fn list_undelivered(&self, request: BatchRequest) -> Result<Option<Batch>> {
        let groups = self.list_grouped(request.scan_limit).await?;

        let Some((source_id, mut entries)) = groups.into_iter().find(|(_, g)| !g.is_empty()) else {
            return Ok(None);
        };
        entries.truncate(request.max_items.max(1));

        let records = entries.iter().map(SpoolEntry::to_record).collect();
        Ok(Some(Batch {
            source_id,
            records,
            receipt: Receipt::Files(entries),
        }))
    }

    async fn mark_delivered(&self, batch: &Batch) -> Result<()> {
        let Receipt::Files(entries) = &batch.receipt else {
            return Err(GatewayError::Storage(
                "file spool cannot settle a non-file receipt".to_string(),
            ));
        };
        if self.delete(entries).await {
            Ok(())
        } else {
            Err(GatewayError::Storage(format!(
                "partial delete of {} spooled records",
                entries.len()
            )))
        }
    }

    async fn mark_failed(&self, batch: &Batch, reason: &str) -> Result<()> {
        // Files stay in place and are picked up again next cycle.
        debug!(
            "Leaving {} spooled records for {} after {}",
            batch.records.len(),
            batch.source_id,
            reason
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::TempDir;

    fn ts(sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(12, 0, sec)
            .unwrap()
    }

    fn spool(dir: &TempDir) -> FileSpool {
        FileSpool::new(dir.path().join("spool"), StorageLock::new())
    }

    #[tokio::test]
    async fn test_write_creates_encoded_file() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);

        let path = spool
            .write_record(&LogRecord::new("S1", "0A1B2C3D", ts(1)))
            .await
            .unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "LOG.0A1B2C3D.20240309120001.S1"
        );
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_same_second_collisions_get_suffixes() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);
        let record = LogRecord::new("S1", "0A1B2C3D", ts(1));

        let first = spool.write_record(&record).await.unwrap();
        let second = spool.write_record(&record).await.unwrap();
        let third = spool.write_record(&record).await.unwrap();

        assert!(first.to_str().unwrap().ends_with(".S1"));
        assert!(second.to_str().unwrap().ends_with(".S1.2"));
        assert!(third.to_str().unwrap().ends_with(".S1.3"));

        let groups = spool.list_grouped(100).await.unwrap();
        assert_eq!(groups["S1"].len(), 3);
    }

    #[tokio::test]
    async fn test_list_grouped_sorts_and_skips_foreign() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);

        spool.write_record(&LogRecord::new("S2", "BBBBBBBB", ts(5))).await.unwrap();
        spool.write_record(&LogRecord::new("S1", "CCCCCCCC", ts(3))).await.unwrap();
        spool.write_record(&LogRecord::new("S1", "AAAAAAAA", ts(3))).await.unwrap();
        spool.write_record(&LogRecord::new("S1", "FFFFFFFF", ts(1))).await.unwrap();
        std::fs::write(spool.dir().join("README.txt"), "hello").unwrap();
        std::fs::write(spool.dir().join("LOG.bad"), "").unwrap();

        let groups = spool.list_grouped(100).await.unwrap();
        assert_eq!(groups.len(), 2);

        let s1: Vec<_> = groups["S1"].iter().map(|e| e.tag_id.as_str()).collect();
        assert_eq!(s1, vec!["FFFFFFFF", "AAAAAAAA", "CCCCCCCC"]);
        assert_eq!(groups["S2"].len(), 1);

        // Foreign files are not deleted
        assert!(spool.dir().join("README.txt").exists());
        assert!(spool.dir().join("LOG.bad").exists());
    }

    #[tokio::test]
    async fn test_list_grouped_caps_total() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);
        for sec in 0..10 {
            spool.write_record(&LogRecord::new("S1", "0A1B2C3D", ts(sec))).await.unwrap();
        }

        let groups = spool.list_grouped(4).await.unwrap();
        assert_eq!(groups.values().map(Vec::len).sum::<usize>(), 4);
    }

    #[tokio::test]
    async fn test_scan_cap_counts_foreign_files() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);
        spool.write_record(&LogRecord::new("S1", "0A1B2C3D", ts(1))).await.unwrap();
        for n in 0..20 {
            std::fs::write(spool.dir().join(format!("notes-{}.txt", n)), "x").unwrap();
        }

        let (entries, visited) = spool.scan(5).await.unwrap();
        assert_eq!(visited, 5);
        assert!(entries.len() <= 1);

        let groups = spool.list_grouped(5).await.unwrap();
        assert!(groups.values().map(Vec::len).sum::<usize>() <= 1);

        let (entries, visited) = spool.scan(100).await.unwrap();
        assert_eq!(visited, 21);
        assert_eq!(entries.len(), 1);
        assert_eq!(spool.list_grouped(100).await.unwrap()["S1"].len(), 1);
    }

    #[tokio::test]
    async fn test_list_grouped_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);
        assert!(spool.list_grouped(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_reports_partial_failure() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);
        spool.write_record(&LogRecord::new("S1", "0A1B2C3D", ts(1))).await.unwrap();
        spool.write_record(&LogRecord::new("S1", "0A1B2C3E", ts(2))).await.unwrap();

        let mut entries = spool.list_grouped(10).await.unwrap().remove("S1").unwrap();
        std::fs::remove_file(&entries[1].path).unwrap();

        assert!(!spool.delete(&entries).await);
        assert!(!entries[0].path.exists());

        entries.truncate(0);
        assert!(spool.delete(&entries).await);
    }

    #[tokio::test]
    async fn test_list_undelivered_picks_one_source() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);
        for sec in 0..5 {
            spool.write_record(&LogRecord::new("S2", "0A1B2C3D", ts(sec))).await.unwrap();
        }
        spool.write_record(&LogRecord::new("S1", "0A1B2C3D", ts(9))).await.unwrap();
        spool.write_record(&LogRecord::new("S1", "0A1B2C3E", ts(8))).await.unwrap();

        let batch = spool
            .list_undelivered(BatchRequest { max_items: 10, scan_limit: 80 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.source_id, "S1");
        assert_eq!(batch.records.len(), 2);
        assert!(batch.records.iter().all(|r| r.source_id == "S1"));
        assert_eq!(batch.records[0].tag_id, "0A1B2C3E");

        spool.mark_delivered(&batch).await.unwrap();

        let next = spool
            .list_undelivered(BatchRequest { max_items: 3, scan_limit: 80 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.source_id, "S2");
        assert_eq!(next.records.len(), 3);
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_files() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);
        spool.write_record(&LogRecord::new("S1", "0A1B2C3D", ts(1))).await.unwrap();

        let request = BatchRequest { max_items: 10, scan_limit: 80 };
        let batch = spool.list_undelivered(request).await.unwrap().unwrap();
        spool.mark_failed(&batch, "HTTP_500").await.unwrap();

        let again = spool.list_undelivered(request).await.unwrap().unwrap();
        assert_eq!(again.records, batch.records);
    }

    #[tokio::test]
    async fn test_list_recent_newest_first() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);
        spool.write_record(&LogRecord::new("S2", "0A1B2C3D", ts(1))).await.unwrap();
        spool.write_record(&LogRecord::new("S1", "0A1B2C3D", ts(7))).await.unwrap();
        spool.write_record(&LogRecord::new("S2", "0A1B2C3D", ts(7))).await.unwrap();

        let recent = spool.list_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!((recent[0].source_id.as_str(), recent[0].ts14.as_str()), ("S1", "20240309120007"));
        assert_eq!((recent[1].source_id.as_str(), recent[1].ts14.as_str()), ("S2", "20240309120007"));
    }

    #[tokio::test]
    async fn test_clear_removes_files_and_cursor() {
        let tmp = TempDir::new().unwrap();
        let spool = spool(&tmp);
        spool.write_record(&LogRecord::new("S1", "0A1B2C3D", ts(1))).await.unwrap();
        std::fs::write(spool.dir().join("junk"), "1234").unwrap();
        let cursor = tmp.path().join("upload.cursor");
        std::fs::write(&cursor, r#"{"offset":10,"line":1}"#).unwrap();

        let report = spool.clear(Some(&cursor)).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.bytes_freed, 4);
        assert!(report.cursor_deleted);
        assert!(spool.dir().is_dir());
        assert!(!cursor.exists());
        assert!(spool.list_grouped(10).await.unwrap().is_empty());
    }
}
