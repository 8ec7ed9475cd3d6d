//! # In-Memory Log
//!
//! Bounded ring of recent records. Serves two roles: a diagnostic view of
//! the latest reads independent of the storage device, and the `memory`
//! spool mode used when no storage medium is available.
//!
//! Nothing here survives a restart. When full, the oldest record is evicted
//! whether or not it was delivered.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::{Batch, BatchRequest, DurableSpool, Receipt};
use crate::error::{GatewayError, Result};
use crate::record::{LogRecord, RecordKey};

/// Bounded record ring, cheap to clone
#[derive(Debug, Clone)]
pub struct MemoryLog {
    inner: Arc<Mutex<VecDeque<LogRecord>>>,
    capacity: usize,
}

impl MemoryLog {
    /// Creates a ring holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a record, evicting the oldest when full.
    pub fn push(&self, record: LogRecord) -> Result<()> {
        let mut records = self.records()?;
        if records.len() == self.capacity {
            if let Some(evicted) = records.pop_front() {
                debug!(
                    "Memory log full; evicted {} from {}",
                    evicted.tag_id, evicted.source_id
                );
            }
        }
        records.push_back(record);
        Ok(())
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogRecord> {
        self.records()
            .map(|r| r.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Up to `limit` undelivered records, oldest first.
    pub fn list_unsent(&self, limit: usize) -> Vec<LogRecord> {
        self.records()
            .map(|r| r.iter().filter(|rec| !rec.delivered).take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Flags matching records delivered and clears their diagnostic.
    pub fn mark_sent(&self, records: &[LogRecord]) -> Result<usize> {
        self.update(records, |rec| {
            rec.delivered = true;
            rec.last_error.clear();
        })
    }

    /// Attaches `message` to matching records, leaving them undelivered.
    pub fn mark_failed(&self, records: &[LogRecord], message: &str) -> Result<usize> {
        self.update(records, |rec| {
            rec.delivered = false;
            rec.last_error = message.to_string();
        })
    }

    fn update<F>(&self, records: &[LogRecord], apply: F) -> Result<usize>
    where
        F: Fn(&mut LogRecord),
    {
        let keys: HashSet<RecordKey> = records.iter().map(LogRecord::key).collect();
        let mut stored = self.records()?;
        let mut changed = 0;
        for rec in stored.iter_mut().filter(|rec| keys.contains(&rec.key())) {
            apply(rec);
            changed += 1;
        }
        Ok(changed)
    }

    fn records(&self) -> Result<MutexGuard<'_, VecDeque<LogRecord>>> {
        self.inner
            .lock()
            .map_err(|_| GatewayError::Storage("memory log poisoned".to_string()))
    }
}

#[async_trait]
impl DurableSpool for MemoryLog {
    fn describe(&self) -> String {
        format!("memory:{}", self.capacity)
    }

    async fn write(&self, record: &LogRecord) -> Result<()> {
        self.push(record.clone())
    }

    async fn list_undelivered(&self, request: BatchRequest) -> Result<Option<Batch>> {
        let unsent = self.list_unsent(request.scan_limit);
        let Some(source_id) = unsent.first().map(|r| r.source_id.clone()) else {
            return Ok(None);
        };
        let records = unsent
            .into_iter()
            .filter(|r| r.source_id == source_id)
            .take(request.max_items.max(1))
            .collect();

        Ok(Some(Batch {
            source_id,
            records,
            receipt: Receipt::Keys,
        }))
    }

    async fn mark_delivered(&self, batch: &Batch) -> Result<()> {
        self.mark_sent(&batch.records).map(|_| ())
    }

    async fn mark_failed(&self, batch: &Batch, reason: &str) -> Result<()> {
        MemoryLog::mark_failed(self, &batch.records, reason).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(source: &str, tag: &str, sec: u32) -> LogRecord {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(8, 0, sec)
            .unwrap();
        LogRecord::new(source, tag, ts)
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let log = MemoryLog::new(2);
        log.push(record("S1", "AAAAAAAA", 1)).unwrap();
        log.push(record("S1", "BBBBBBBB", 2)).unwrap();
        log.push(record("S1", "CCCCCCCC", 3)).unwrap();

        assert_eq!(log.len(), 2);
        let recent: Vec<_> = log.recent(10).into_iter().map(|r| r.tag_id).collect();
        assert_eq!(recent, vec!["CCCCCCCC", "BBBBBBBB"]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let log = MemoryLog::new(0);
        assert_eq!(log.capacity(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_mark_sent_and_failed() {
        let log = MemoryLog::new(8);
        let a = record("S1", "AAAAAAAA", 1);
        let b = record("S1", "BBBBBBBB", 2);
        log.push(a.clone()).unwrap();
        log.push(b.clone()).unwrap();

        assert_eq!(log.mark_failed(&[a.clone(), b.clone()], "NET_ERR").unwrap(), 2);
        assert_eq!(log.mark_sent(&[a]).unwrap(), 1);

        let unsent = log.list_unsent(10);
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].tag_id, "BBBBBBBB");
        assert_eq!(unsent[0].last_error, "NET_ERR");
    }

    #[tokio::test]
    async fn test_memory_spool_batches_one_source() {
        let log = MemoryLog::new(8);
        log.write(&record("S2", "AAAAAAAA", 1)).await.unwrap();
        log.write(&record("S1", "BBBBBBBB", 2)).await.unwrap();
        log.write(&record("S2", "CCCCCCCC", 3)).await.unwrap();

        let request = BatchRequest {
            max_items: 10,
            scan_limit: 80,
        };
        let batch = log.list_undelivered(request).await.unwrap().unwrap();
        assert_eq!(batch.source_id, "S2");
        assert_eq!(batch.records.len(), 2);

        log.mark_delivered(&batch).await.unwrap();
        let next = log.list_undelivered(request).await.unwrap().unwrap();
        assert_eq!(next.source_id, "S1");

        log.mark_delivered(&next).await.unwrap();
        assert!(log.list_undelivered(request).await.unwrap().is_none());
    }
}
