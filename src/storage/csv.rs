//! # Legacy CSV Log
//!
//! Append-only CSV used by already-deployed gateways. Rows are
//!
//! ```text
//! source_id,tag_id,timestamp,delivered_flag,message
//! ```
//!
//! with literal commas and no escaping. Older files carry 3-field
//! (`source,tag,timestamp`) and 4-field (`+delivered`) rows, which parse
//! under relaxed rules.
//!
//! Two ways of consuming the file coexist:
//!
//! - [`CsvSpool`]: sequential reader with a persisted [`UploadCursor`];
//!   delivery advances the cursor, and the consumed prefix is compacted away
//!   once it grows large.
//! - [`CsvRepo`]: repository view that scans for undelivered rows and flips
//!   their flag by rewriting the whole file.
//!
//! Row updates are always full-file rewrites to a temp file followed by a
//! rename over the original.

use async_trait::async_trait;
use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::cursor::{self, cursor_path_for, UploadCursor};
use super::lock::StorageLock;
use super::{Batch, BatchRequest, DurableSpool, Receipt};
use crate::error::{GatewayError, Result};
use crate::record::{parse_iso, LogRecord, RecordKey};

/// Header written at the top of new and compacted files
pub const CSV_HEADER: &str = "scanner,rfid,timestamp,code,message";

/// Any first line starting with this is treated as a header
const HEADER_PREFIX: &str = "scanner,rfid,timestamp";

/// Compaction requires the cursor to have advanced at least this far
pub const COMPACT_MIN_ADVANCE_BYTES: u64 = 256 * 1024;

/// ...and to sit at or past this share of the file
pub const COMPACT_MIN_ADVANCE_PCT: u64 = 60;

/// Lines read between cooperative yields
const YIELD_EVERY: usize = 64;

/// One parsed CSV row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvRow {
    pub source_id: String,
    pub tag_id: String,
    /// Raw timestamp text as stored
    pub timestamp: String,
    pub delivered: bool,
    pub message: String,
}

impl CsvRow {
    /// Parses a 3, 4, or 5 field row. Returns `None` for shorter rows.
    ///
    /// A fifth field swallows any further commas.
    ///
    /// # Examples
    ///
    /// ```
    /// use field_gateway::storage::csv::CsvRow;
    ///
    /// let row = CsvRow::parse("S1,0A1B2C3D,2024-03-09 12:00:00").unwrap();
    /// assert!(!row.delivered);
    /// assert!(CsvRow::parse("S1,0A1B2C3D").is_none());
    /// ```
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.splitn(5, ',').collect();
        if fields.len() < 3 {
            return None;
        }

        Some(Self {
            source_id: fields[0].to_string(),
            tag_id: fields[1].to_string(),
            timestamp: fields[2].to_string(),
            delivered: fields.get(3).map(|f| parse_flag(f)).unwrap_or(false),
            message: fields.get(4).map(|f| f.to_string()).unwrap_or_default(),
        })
    }

    /// Builds a row from a record.
    pub fn from_record(record: &LogRecord) -> Self {
        Self {
            source_id: record.source_id.clone(),
            tag_id: record.tag_id.clone(),
            timestamp: record.timestamp_iso(),
            delivered: record.delivered,
            message: record.last_error.clone(),
        }
    }

    /// Converts to a record, or `None` if the timestamp does not parse.
    pub fn to_record(&self) -> Option<LogRecord> {
        let timestamp = parse_iso(&self.timestamp)?;
        Some(LogRecord {
            source_id: self.source_id.clone(),
            tag_id: self.tag_id.clone(),
            timestamp,
            delivered: self.delivered,
            last_error: self.message.clone(),
        })
    }

    /// Composite match key
    pub fn key(&self) -> RecordKey {
        RecordKey {
            source_id: self.source_id.clone(),
            tag_id: self.tag_id.clone(),
            timestamp: self.timestamp.trim().to_string(),
        }
    }

    /// Serializes as a newline-terminated 5-field row.
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{}\n",
            sanitize_field(&self.source_id),
            sanitize_field(&self.tag_id),
            sanitize_field(&self.timestamp),
            if self.delivered { 1 } else { 0 },
            sanitize_field(&self.message)
        )
    }
}

/// Replaces characters the row format cannot represent with spaces.
pub fn sanitize_field(value: &str) -> String {
    value.replace([',', '\r', '\n'], " ")
}

fn parse_flag(field: &str) -> bool {
    field.trim().parse::<i64>().map(|v| v != 0).unwrap_or(false)
}

fn is_header(line: &str) -> bool {
    line.starts_with(HEADER_PREFIX)
}

/// True once the consumed prefix is worth rewriting away.
pub fn should_compact(offset: u64, file_size: u64) -> bool {
    offset >= COMPACT_MIN_ADVANCE_BYTES
        && file_size > 0
        && offset.saturating_mul(100) / file_size >= COMPACT_MIN_ADVANCE_PCT
}

/// A line returned by the cursor reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvLine {
    /// Line text without the terminator
    pub text: String,
    /// Byte offset just past this line's terminator
    pub end_offset: u64,
}

/// Result of [`CsvLog::read_next_batch`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvReadBatch {
    pub lines: Vec<CsvLine>,
    /// Offset to persist if every returned line is consumed
    pub new_offset: u64,
    /// True if the stored offset was past EOF and reading restarted at zero
    pub cursor_reset: bool,
}

/// How a rewrite changes matching rows
#[derive(Debug, Clone, Copy)]
enum RowUpdate<'a> {
    Sent,
    Failed(&'a str),
}

/// Handle to one CSV log file on the shared storage bus
#[derive(Debug, Clone)]
pub struct CsvLog {
    path: PathBuf,
    lock: StorageLock,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>, lock: StorageLock) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    /// Path of the CSV file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the file with a header if it does not exist.
    pub async fn ensure_ready(&self) -> Result<()> {
        let _guard = self.lock.acquire().await;
        self.create_if_missing().await
    }

    /// Appends one record as a 5-field row.
    pub async fn append(&self, record: &LogRecord) -> Result<()> {
        let _guard = self.lock.acquire().await;
        self.create_if_missing().await?;

        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.write_all(CsvRow::from_record(record).to_line().as_bytes())
            .await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Reads up to `want` non-empty lines starting at the cursor.
    ///
    /// Resets to offset zero if the cursor lies past EOF. Skips a header
    /// line only when reading from byte zero. A final line without a
    /// terminator is returned as-is.
    pub async fn read_next_batch(&self, want: usize, cursor: UploadCursor) -> Result<CsvReadBatch> {
        let _guard = self.lock.acquire().await;

        let file = File::open(&self.path).await?;
        let size = file.metadata().await?.len();
        let clamped = cursor.clamp_to(size);
        let cursor_reset = clamped != cursor;
        if cursor_reset {
            warn!(
                "Cursor offset {} past end of {} ({} bytes); restarting at 0",
                cursor.byte_offset,
                self.path.display(),
                size
            );
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(clamped.byte_offset)).await?;
        let mut position = clamped.byte_offset;

        let mut batch = CsvReadBatch {
            cursor_reset,
            ..CsvReadBatch::default()
        };
        let mut buf = Vec::new();
        let mut at_start = position == 0;
        let mut iterations = 0usize;

        while batch.lines.len() < want {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                break;
            }
            position += n as u64;

            iterations += 1;
            if iterations % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }

            let text = String::from_utf8_lossy(&buf)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            if std::mem::take(&mut at_start) && is_header(&text) {
                continue;
            }
            if text.is_empty() {
                continue;
            }
            batch.lines.push(CsvLine {
                text,
                end_offset: position,
            });
        }

        batch.new_offset = position;
        Ok(batch)
    }

    /// Returns up to `max` rows from the start of the file.
    pub async fn list_all(&self, max: usize) -> Result<Vec<CsvRow>> {
        self.scan_rows(max, |_| true).await
    }

    /// Returns up to `limit` rows whose delivered flag is clear.
    pub async fn list_unsent(&self, limit: usize) -> Result<Vec<CsvRow>> {
        self.scan_rows(limit, |row| !row.delivered).await
    }

    /// Flags matching rows delivered and clears their message.
    ///
    /// # Returns
    ///
    /// * `Result<usize>` - Number of rows changed
    pub async fn mark_sent(&self, records: &[LogRecord]) -> Result<usize> {
        self.rewrite_rows(&keys_of(records), 0, RowUpdate::Sent).await
    }

    /// Attaches `message` to matching rows and keeps them undelivered.
    pub async fn mark_failed(&self, records: &[LogRecord], message: &str) -> Result<usize> {
        self.rewrite_rows(&keys_of(records), 0, RowUpdate::Failed(message))
            .await
    }

    async fn create_if_missing(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(mut file) => {
                file.write_all(format!("{}\n", CSV_HEADER).as_bytes()).await?;
                file.sync_all().await?;
                info!("Created CSV log {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan_rows<F>(&self, max: usize, keep: F) -> Result<Vec<CsvRow>>
    where
        F: Fn(&CsvRow) -> bool,
    {
        let _guard = self.lock.acquire().await;

        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut rows = Vec::new();
        let mut first = true;
        while rows.len() < max {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            if std::mem::take(&mut first) && is_header(&line) {
                continue;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(row) = CsvRow::parse(line) {
                if keep(&row) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    /// Rewrites the file, updating rows that start at or after `from_offset`
    /// and match one of `keys`. Every other line is copied byte-for-byte.
    async fn rewrite_rows(
        &self,
        keys: &HashSet<RecordKey>,
        from_offset: u64,
        update: RowUpdate<'_>,
    ) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let _guard = self.lock.acquire().await;

        let original = fs::read(&self.path).await?;
        let mut out = Vec::with_capacity(original.len() + keys.len() * 16);
        let mut offset = 0u64;
        let mut changed = 0usize;

        for (index, raw) in original.split_inclusive(|b| *b == b'\n').enumerate() {
            let start = offset;
            offset += raw.len() as u64;

            let text = String::from_utf8_lossy(raw);
            let line = text.trim();
            let row = if start < from_offset || line.is_empty() || (index == 0 && is_header(line)) {
                None
            } else {
                CsvRow::parse(line)
            };

            match row {
                Some(mut row) if keys.contains(&row.key()) => {
                    match update {
                        RowUpdate::Sent => {
                            row.delivered = true;
                            row.message.clear();
                        }
                        RowUpdate::Failed(message) => {
                            row.delivered = false;
                            row.message = message.to_string();
                        }
                    }
                    out.extend_from_slice(row.to_line().as_bytes());
                    changed += 1;
                }
                _ => out.extend_from_slice(raw),
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&out).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).await?;

        debug!("Rewrote {} ({} rows changed)", self.path.display(), changed);
        Ok(changed)
    }
}

fn keys_of(records: &[LogRecord]) -> HashSet<RecordKey> {
    records.iter().map(LogRecord::key).collect()
}

/// Cursor-driven CSV reader
///
/// Holds the cursor in memory once loaded; the side-file is the durable copy.
#[derive(Debug)]
pub struct CsvSpool {
    log: CsvLog,
    cursor_path: PathBuf,
    cursor: Mutex<Option<UploadCursor>>,
}

impl CsvSpool {
    /// Creates a reader for `path`, with the cursor stored next to it.
    pub fn new(path: impl Into<PathBuf>, lock: StorageLock) -> Self {
        let log = CsvLog::new(path, lock);
        let cursor_path = cursor_path_for(log.path());
        Self {
            log,
            cursor_path,
            cursor: Mutex::new(None),
        }
    }

    /// Underlying CSV file
    pub fn log(&self) -> &CsvLog {
        &self.log
    }

    /// Cursor side-file path
    pub fn cursor_path(&self) -> &Path {
        &self.cursor_path
    }

    /// Current cursor, loading it from disk on first use.
    pub async fn cursor(&self) -> Result<UploadCursor> {
        if let Some(cursor) = self.cached_cursor() {
            return Ok(cursor);
        }
        let loaded = {
            let _guard = self.log.lock.acquire().await;
            cursor::load(&self.cursor_path).await?
        };
        self.set_cached_cursor(loaded);
        Ok(loaded)
    }

    /// Persists a new cursor position.
    pub async fn persist_cursor(&self, byte_offset: u64, line_count: u32) -> Result<()> {
        let cursor = UploadCursor::new(byte_offset, line_count);
        {
            let _guard = self.log.lock.acquire().await;
            cursor::persist(&self.cursor_path, cursor).await?;
        }
        self.set_cached_cursor(cursor);
        Ok(())
    }

    /// Rewrites the file to its unconsumed tail when the cursor has passed
    /// the high-water mark (≥256KB and ≥60% of the file).
    ///
    /// # Returns
    ///
    /// * `Result<bool>` - true if the file was compacted
    pub async fn compact_if_needed(&self) -> Result<bool> {
        let cursor = self.cursor().await?;

        let _guard = self.log.lock.acquire().await;
        let path = self.log.path();

        let mut source = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let size = source.metadata().await?.len();
        if cursor.clamp_to(size) != cursor {
            warn!(
                "Cursor at {} is past the end of {} ({} bytes); not compacting",
                cursor.byte_offset,
                path.display(),
                size
            );
            return Ok(false);
        }
        if !should_compact(cursor.byte_offset, size) {
            return Ok(false);
        }

        let tmp_path = path.with_extension("new");
        let mut compacted = File::create(&tmp_path).await?;
        compacted
            .write_all(format!("{}\n", CSV_HEADER).as_bytes())
            .await?;
        source.seek(SeekFrom::Start(cursor.byte_offset)).await?;
        let kept = tokio::io::copy(&mut source, &mut compacted).await?;
        compacted.sync_all().await?;
        drop(compacted);
        drop(source);

        if let Err(e) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        let zero = UploadCursor::default();
        cursor::persist(&self.cursor_path, zero).await?;
        self.set_cached_cursor(zero);

        info!(
            "Compacted {} (dropped {} consumed bytes, kept {})",
            path.display(),
            cursor.byte_offset,
            kept
        );
        Ok(true)
    }

    fn cached_cursor(&self) -> Option<UploadCursor> {
        self.cursor.lock().ok().and_then(|c| *c)
    }

    fn set_cached_cursor(&self, cursor: UploadCursor) {
        if let Ok(mut slot) = self.cursor.lock() {
            *slot = Some(cursor);
        }
    }
}

#[async_trait]
impl DurableSpool for CsvSpool {
    fn describe(&self) -> String {
        format!("csv:{}", self.log.path().display())
    }

    async fn write(&self, record: &LogRecord) -> Result<()> {
        self.log.append(record).await
    }

    async fn list_undelivered(&self, request: BatchRequest) -> Result<Option<Batch>> {
        let want = request.max_items.max(1);

        loop {
            let mut cursor = self.cursor().await?;
            let read = match self.log.read_next_batch(want, cursor).await {
                Ok(read) => read,
                Err(GatewayError::Io(e)) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            if read.cursor_reset {
                cursor = UploadCursor::default();
                self.set_cached_cursor(cursor);
            }

            let mut source_id: Option<String> = None;
            let mut records = Vec::new();
            let mut consumed_offset = cursor.byte_offset;
            let mut consumed_lines = 0u32;

            for line in &read.lines {
                let Some(row) = CsvRow::parse(&line.text) else {
                    warn!("Skipping malformed CSV row: {}", line.text);
                    consumed_offset = line.end_offset;
                    consumed_lines += 1;
                    continue;
                };
                if let Some(source) = &source_id {
                    if *source != row.source_id {
                        break;
                    }
                }
                consumed_offset = line.end_offset;
                consumed_lines += 1;

                if row.delivered {
                    continue;
                }
                let Some(record) = row.to_record() else {
                    warn!("Skipping CSV row with bad timestamp: {}", line.text);
                    continue;
                };
                source_id.get_or_insert_with(|| record.source_id.clone());
                records.push(record);
            }

            if let Some(source_id) = source_id {
                return Ok(Some(Batch {
                    source_id,
                    records,
                    receipt: Receipt::Cursor {
                        offset: consumed_offset,
                        lines: consumed_lines,
                    },
                }));
            }

            if consumed_lines == 0 {
                return Ok(None);
            }
            // Only skippable rows were read; step past them and keep looking.
            self.persist_cursor(consumed_offset, cursor.line_count + consumed_lines)
                .await?;
        }
    }

    async fn mark_delivered(&self, batch: &Batch) -> Result<()> {
        let Receipt::Cursor { offset, lines } = batch.receipt else {
            return Err(GatewayError::Storage(
                "csv spool cannot settle a non-cursor receipt".to_string(),
            ));
        };
        let cursor = self.cursor().await?;
        self.persist_cursor(offset, cursor.line_count.saturating_add(lines))
            .await?;
        debug!("Cursor advanced to offset={} line={}", offset, cursor.line_count + lines);

        if let Err(e) = self.compact_if_needed().await {
            warn!("Compaction of {} failed: {}", self.log.path().display(), e);
        }
        Ok(())
    }

    async fn mark_failed(&self, batch: &Batch, reason: &str) -> Result<()> {
        let cursor = self.cursor().await?;
        self.log
            .rewrite_rows(&keys_of(&batch.records), cursor.byte_offset, RowUpdate::Failed(reason))
            .await
            .map(|_| ())
    }

    async fn reset_cursor(&self) -> Result<()> {
        {
            let _guard = self.log.lock.acquire().await;
            cursor::remove(&self.cursor_path).await?;
        }
        self.set_cached_cursor(UploadCursor::default());
        info!("Upload cursor reset for {}", self.log.path().display());
        Ok(())
    }
}

/// Repository view over the CSV log: delivered flags live in the rows.
#[derive(Debug, Clone)]
pub struct CsvRepo {
    log: CsvLog,
}

impl CsvRepo {
    pub fn new(path: impl Into<PathBuf>, lock: StorageLock) -> Self {
        Self {
            log: CsvLog::new(path, lock),
        }
    }

    /// Underlying CSV file
    pub fn log(&self) -> &CsvLog {
        &self.log
    }
}

#[async_trait]
impl DurableSpool for CsvRepo {
    fn describe(&self) -> String {
        format!("csv-repo:{}", self.log.path().display())
    }

    async fn write(&self, record: &LogRecord) -> Result<()> {
        self.log.append(record).await
    }

    async fn list_undelivered(&self, request: BatchRequest) -> Result<Option<Batch>> {
        let rows = self.log.list_unsent(request.scan_limit).await?;

        let mut records = rows.iter().filter_map(CsvRow::to_record);
        let Some(first) = records.next() else {
            return Ok(None);
        };
        let source_id = first.source_id.clone();
        let batch: Vec<LogRecord> = std::iter::once(first)
            .chain(records.filter(|r| r.source_id == source_id))
            .take(request.max_items.max(1))
            .collect();

        Ok(Some(Batch {
            source_id,
            records: batch,
            receipt: Receipt::Keys,
        }))
    }

    async fn mark_delivered(&self, batch: &Batch) -> Result<()> {
        self.log.mark_sent(&batch.records).await.map(|_| ())
    }

    async fn mark_failed(&self, batch: &Batch, reason: &str) -> Result<()> {
        self.log.mark_failed(&batch.records, reason).await.map(|_| ())
    }
}
