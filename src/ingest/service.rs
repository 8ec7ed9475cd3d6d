//! # Ingestion Service
//!
//! Decouples the radio receive path from storage writes through a bounded
//! queue:
//!
//! ```text
//! radio ──on_packet──▶ IngestHandle ──try_send──▶ [queue] ──▶ IngestionService ──▶ DurableSpool
//! ```
//!
//! The producer side never blocks. Invalid payloads and payloads arriving
//! while the queue is full are logged and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::clock::Timestamper;
use super::packet::{validate_packet, ValidPacket};
use crate::radio::{PacketSink, RadioPort};
use crate::record::LogRecord;
use crate::storage::{DurableSpool, MemoryLog};

/// Queue and loop tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// Outstanding packets before new ones are dropped
    pub queue_capacity: usize,
    /// Packets processed per loop iteration at most
    pub drain_per_iteration: usize,
    /// Sleep between loop iterations
    pub poll_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            drain_per_iteration: 4,
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dropped_invalid: AtomicU64,
    dropped_full: AtomicU64,
    spooled: AtomicU64,
    spool_failed: AtomicU64,
}

/// Point-in-time copy of the ingestion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub dropped_invalid: u64,
    pub dropped_full: u64,
    pub spooled: u64,
    pub spool_failed: u64,
}

/// Shared view of the ingestion counters
#[derive(Debug, Clone, Default)]
pub struct IngestCounters {
    inner: Arc<Counters>,
}

impl IngestCounters {
    pub fn snapshot(&self) -> IngestStats {
        let c = &self.inner;
        IngestStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            dropped_invalid: c.dropped_invalid.load(Ordering::Relaxed),
            dropped_full: c.dropped_full.load(Ordering::Relaxed),
            spooled: c.spooled.load(Ordering::Relaxed),
            spool_failed: c.spool_failed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Producer side: validates payloads and queues them without blocking
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<ValidPacket>,
    counters: IngestCounters,
}

impl PacketSink for IngestHandle {
    fn on_packet(&self, payload: &[u8]) {
        let packet = match validate_packet(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    "Ignored invalid payload {:?}: {}",
                    String::from_utf8_lossy(payload),
                    e
                );
                IngestCounters::bump(&self.counters.inner.dropped_invalid);
                return;
            }
        };

        match self.tx.try_send(packet) {
            Ok(()) => IngestCounters::bump(&self.counters.inner.accepted),
            Err(TrySendError::Full(packet)) => {
                warn!(
                    "Ingest queue full; dropping {} from {}",
                    packet.tag_id, packet.source_id
                );
                IngestCounters::bump(&self.counters.inner.dropped_full);
            }
            Err(TrySendError::Closed(packet)) => {
                warn!(
                    "Ingest queue closed; dropping {} from {}",
                    packet.tag_id, packet.source_id
                );
                IngestCounters::bump(&self.counters.inner.dropped_full);
            }
        }
    }
}

/// Consumer side: stamps queued packets and writes them to the spool
pub struct IngestionService {
    rx: mpsc::Receiver<ValidPacket>,
    spool: Arc<dyn DurableSpool>,
    recent: Option<MemoryLog>,
    timestamper: Timestamper,
    counters: IngestCounters,
    config: IngestConfig,
}

impl std::fmt::Debug for IngestionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionService")
            .field("spool", &self.spool.describe())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IngestionService {
    /// Creates the service and the producer handle feeding it.
    ///
    /// # Arguments
    ///
    /// * `config` - Queue capacity and loop pacing
    /// * `spool` - Where accepted records are written
    /// * `timestamper` - Clock selection for new records
    pub fn new(
        config: IngestConfig,
        spool: Arc<dyn DurableSpool>,
        timestamper: Timestamper,
    ) -> (Self, IngestHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = IngestCounters::default();
        let handle = IngestHandle {
            tx,
            counters: counters.clone(),
        };
        let service = Self {
            rx,
            spool,
            recent: None,
            timestamper,
            counters,
            config,
        };
        (service, handle)
    }

    /// Also keeps every accepted record in a diagnostic ring.
    pub fn with_recent(mut self, recent: MemoryLog) -> Self {
        self.recent = Some(recent);
        self
    }

    pub fn counters(&self) -> IngestCounters {
        self.counters.clone()
    }

    /// Processes up to `drain_per_iteration` queued packets without waiting.
    ///
    /// # Returns
    ///
    /// * `usize` - Packets taken off the queue
    pub async fn process_pending(&mut self) -> usize {
        let mut taken = 0;
        while taken < self.config.drain_per_iteration {
            let Ok(packet) = self.rx.try_recv() else {
                break;
            };
            taken += 1;
            self.store(packet).await;
        }
        taken
    }

    /// Drives the radio and drains the queue until the task is aborted.
    pub async fn run(mut self, mut radio: Box<dyn RadioPort>) {
        info!("Ingestion loop started (spool: {})", self.spool.describe());
        loop {
            if let Err(e) = radio.poll_once().await {
                debug!("Radio poll failed: {}", e);
            }
            self.process_pending().await;
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn store(&mut self, packet: ValidPacket) {
        let (timestamp, source) = self.timestamper.now();
        let record = LogRecord::new(packet.source_id, packet.tag_id, timestamp);
        info!(
            "RX source={} tag={} ts={} (src={})",
            record.source_id,
            record.tag_id,
            record.timestamp_iso(),
            source
        );

        if let Some(recent) = &self.recent {
            if let Err(e) = recent.push(record.clone()) {
                debug!("Recent-record ring unavailable: {}", e);
            }
        }

        match self.spool.write(&record).await {
            Ok(()) => IngestCounters::bump(&self.counters.inner.spooled),
            Err(e) => {
                warn!(
                    "Spool write failed for {} from {}: {}",
                    record.tag_id, record.source_id, e
                );
                IngestCounters::bump(&self.counters.inner.spool_failed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BatchRequest, FileSpool, StorageLock};
    use tempfile::TempDir;
    use tokio_test::{assert_ready_eq, task};

    fn memory_service(capacity: usize) -> (IngestionService, IngestHandle, MemoryLog) {
        let log = MemoryLog::new(64);
        let config = IngestConfig {
            queue_capacity: capacity,
            ..IngestConfig::default()
        };
        let (service, handle) = IngestionService::new(config, Arc::new(log.clone()), Timestamper::default());
        (service, handle, log)
    }

    #[test]
    fn test_default_config() {
        let config = IngestConfig::default();
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.drain_per_iteration, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_invalid_payloads_are_dropped() {
        let (mut service, handle, log) = memory_service(16);
        handle.on_packet(b"garbage");
        handle.on_packet(b"S1,XYZ");

        assert_eq!(service.process_pending().await, 0);
        assert!(log.is_empty());
        let stats = service.counters().snapshot();
        assert_eq!(stats.dropped_invalid, 2);
        assert_eq!(stats.accepted, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (mut service, handle, _log) = memory_service(2);
        handle.on_packet(b"S1,AAAAAAAA");
        handle.on_packet(b"S1,BBBBBBBB");
        handle.on_packet(b"S1,CCCCCCCC");

        let stats = service.counters().snapshot();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.dropped_full, 1);

        assert_eq!(service.process_pending().await, 2);
        handle.on_packet(b"S1,DDDDDDDD");
        assert_eq!(service.counters().snapshot().accepted, 3);
    }

    #[tokio::test]
    async fn test_drain_is_bounded_per_iteration() {
        let (mut service, handle, log) = memory_service(16);
        for tag in ["AAAAAAAA", "BBBBBBBB", "CCCCCCCC", "DDDDDDDD", "EEEEEEEE", "FFFFFFFF"] {
            handle.on_packet(format!("S1,{}", tag).as_bytes());
        }

        assert_eq!(service.process_pending().await, 4);
        assert_eq!(log.len(), 4);
        assert_eq!(service.process_pending().await, 2);
        assert_eq!(service.process_pending().await, 0);
        assert_eq!(service.counters().snapshot().spooled, 6);
    }

    #[tokio::test]
    async fn test_empty_queue_never_waits() {
        let (mut service, _handle, _log) = memory_service(4);
        let mut pending = task::spawn(service.process_pending());
        assert_ready_eq!(pending.poll(), 0);
    }

    #[tokio::test]
    async fn test_records_reach_file_spool_and_recent_ring() {
        let tmp = TempDir::new().unwrap();
        let spool = Arc::new(FileSpool::new(tmp.path().join("spool"), StorageLock::new()));
        let recent = MemoryLog::new(8);
        let (service, handle) =
            IngestionService::new(IngestConfig::default(), spool.clone(), Timestamper::default());
        let mut service = service.with_recent(recent.clone());

        handle.on_packet(b"S1,0a1b2c3d");
        assert_eq!(service.process_pending().await, 1);

        let batch = spool
            .list_undelivered(BatchRequest {
                max_items: 10,
                scan_limit: 80,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.source_id, "S1");
        assert_eq!(batch.records[0].tag_id, "0A1B2C3D");
        assert_eq!(recent.recent(1)[0].tag_id, "0A1B2C3D");
    }

    #[tokio::test]
    async fn test_spool_failure_is_counted() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let spool = Arc::new(FileSpool::new(blocker.join("spool"), StorageLock::new()));
        let (mut service, handle) =
            IngestionService::new(IngestConfig::default(), spool, Timestamper::default());

        handle.on_packet(b"S1,0A1B2C3D");
        assert_eq!(service.process_pending().await, 1);
        let stats = service.counters().snapshot();
        assert_eq!(stats.spooled, 0);
        assert_eq!(stats.spool_failed, 1);
    }
}
