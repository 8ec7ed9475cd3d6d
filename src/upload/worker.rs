//! # Upload Worker
//!
//! Long-lived loop that moves spooled records to the cloud endpoint.
//!
//! ```text
//! Disabled ─enable─▶ Warmup ─▶ Waiting ─due─▶ Listing ─▶ Uploading ─┬─ok──▶ Cleanup ─▶ Waiting
//!    ▲                                                              └─err─▶ Backoff ─▶ Waiting
//!    └──────────── 401/403, or 5 consecutive failed cycles ◀───────────────────┘
//! ```
//!
//! One cycle uploads one batch from exactly one source. After any failure,
//! batches shrink to a single record until a cycle succeeds. A tripped
//! worker stays disabled until it is explicitly re-enabled.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::link::{LinkMonitor, ResourceProbe};
use super::net::{NetClient, NetResponse};
use super::payload::{build_body, credential_for};
use super::snapshot::{FailureKind, UploadDebugSnapshot};
use crate::storage::{open_spool, BatchRequest, DurableSpool, MemoryLog, SpoolMode, StorageLock};

/// Interval must be strictly above this
pub const MIN_INTERVAL: Duration = Duration::from_millis(1000);

/// Consecutive failed cycles that disable the worker
pub const MAX_CONSECUTIVE_FAILURES: u16 = 5;

/// Spool candidates examined per batch slot
pub const SCAN_FACTOR: usize = 8;

/// Grace period armed by [`UploaderWorker::start`]
pub const DEFAULT_WARMUP: Duration = Duration::from_millis(1500);

/// Sleep while disabled or unconfigured
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Longest single sleep while waiting for the next due time
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Longest single sleep during warmup
const WARMUP_SLICE: Duration = Duration::from_millis(100);

/// Worker settings, replaced wholesale by [`UploaderWorker::configure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub endpoint: String,
    pub interval: Duration,
    pub batch_size: usize,
    /// Extra attempts per batch after the first
    pub retry_count: u8,
    pub retry_delay: Duration,
    pub mode: SpoolMode,
    /// Cycles are skipped below this much free memory
    pub min_free_bytes: u64,
    /// Delay before retrying a cycle skipped for low memory
    pub low_resource_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            interval: Duration::from_millis(15_000),
            batch_size: 50,
            retry_count: 0,
            retry_delay: Duration::from_millis(2000),
            mode: SpoolMode::FileSpool {
                dir: "spool".into(),
            },
            min_free_bytes: 25_000,
            low_resource_delay: Duration::from_millis(2000),
        }
    }
}

impl UploadConfig {
    /// Endpoint set and interval above the floor
    pub fn is_runnable(&self) -> bool {
        !self.endpoint.trim().is_empty() && self.interval > MIN_INTERVAL
    }
}

/// Where the worker is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Disabled,
    Warmup,
    Waiting,
    Listing,
    Uploading,
    Cleanup,
    Backoff,
}

/// Why a cycle did no network work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NotConfigured,
    LinkDown,
    LowResources,
}

/// Result of one upload cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    /// Nothing pending
    Empty,
    /// The spool could not be read
    StorageError,
    Delivered { source_id: String, items: usize },
    Failed { kind: FailureKind, tripped: bool },
}

/// Why [`UploaderWorker::start`] refused to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("missing_endpoint")]
    MissingEndpoint,
    #[error("invalid_endpoint")]
    InvalidEndpoint,
    #[error("endpoint_localhost")]
    EndpointLocalhost,
    #[error("interval_too_low")]
    IntervalTooLow,
    #[error("link_down")]
    LinkDown,
}

/// Can the worker run with the current configuration?
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub valid: bool,
    /// Reason code when not valid
    pub reason: Option<String>,
}

/// Collaborators the worker needs
#[derive(Clone)]
pub struct WorkerDeps {
    pub net: Arc<dyn NetClient>,
    pub link: Arc<dyn LinkMonitor>,
    pub resources: Arc<dyn ResourceProbe>,
    pub lock: StorageLock,
    /// Backing ring for [`SpoolMode::Memory`]
    pub memory: MemoryLog,
}

struct Shared {
    config: RwLock<UploadConfig>,
    enabled: AtomicBool,
    warmup_until: Mutex<Option<Instant>>,
    failures: AtomicU16,
    cursor_reset: AtomicBool,
    debug: Mutex<UploadDebugSnapshot>,
    state: Mutex<WorkerState>,
    task: Mutex<Option<JoinHandle<()>>>,
    spool: Mutex<Option<(SpoolMode, Arc<dyn DurableSpool>)>>,
    deps: WorkerDeps,
}

/// Handle to the upload worker; clones share one worker
#[derive(Clone)]
pub struct UploaderWorker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for UploaderWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploaderWorker")
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .field("failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}

impl UploaderWorker {
    /// Creates a disabled worker. Nothing runs until [`start`](Self::start)
    /// or [`ensure_running`](Self::ensure_running).
    pub fn new(config: UploadConfig, deps: WorkerDeps) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                enabled: AtomicBool::new(false),
                warmup_until: Mutex::new(None),
                failures: AtomicU16::new(0),
                cursor_reset: AtomicBool::new(false),
                debug: Mutex::new(UploadDebugSnapshot::default()),
                state: Mutex::new(WorkerState::Disabled),
                task: Mutex::new(None),
                spool: Mutex::new(None),
                deps,
            }),
        }
    }

    /// Replaces the configuration. Takes effect at the next cycle.
    pub fn configure(&self, config: UploadConfig) {
        info!(
            "Upload config: endpoint={} interval={:?} batch={} retries={} mode={}",
            config.endpoint,
            config.interval,
            config.batch_size,
            config.retry_count,
            config.mode.kind()
        );
        if let Ok(mut current) = self.shared.config.write() {
            *current = config;
        }
    }

    /// Current configuration
    pub fn config(&self) -> UploadConfig {
        self.shared
            .config
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.shared.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!("Uploader {}", if enabled { "enabled" } else { "disabled" });
        }
        if !enabled {
            self.set_state(WorkerState::Disabled);
        } else if self.state() == WorkerState::Disabled {
            self.set_state(WorkerState::Waiting);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Defers the next cycle by `grace`.
    pub fn arm_warmup(&self, grace: Duration) {
        if let Ok(mut until) = self.shared.warmup_until.lock() {
            *until = Some(Instant::now() + grace);
        }
    }

    /// Spawns the worker loop unless it is already running.
    pub fn ensure_running(&self) {
        let Ok(mut task) = self.shared.task.lock() else {
            error!("Uploader task slot poisoned");
            return;
        };
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let worker = self.clone();
        *task = Some(tokio::spawn(async move { worker.run().await }));
        debug!("Uploader task spawned");
    }

    /// Stops the worker loop. An in-flight attempt is abandoned.
    pub fn shutdown(&self) {
        if let Ok(mut task) = self.shared.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    /// Last-cycle observability record
    pub fn debug_snapshot(&self) -> UploadDebugSnapshot {
        self.shared
            .debug
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn state(&self) -> WorkerState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(WorkerState::Disabled)
    }

    pub fn consecutive_failures(&self) -> u16 {
        self.shared.failures.load(Ordering::SeqCst)
    }

    /// Forgets the CSV upload cursor at the start of the next loop iteration.
    pub fn request_cursor_reset(&self) {
        self.shared.cursor_reset.store(true, Ordering::SeqCst);
    }

    /// Checks whether the current configuration can run.
    pub fn readiness(&self) -> Readiness {
        match self.check_ready() {
            Ok(()) => Readiness {
                valid: true,
                reason: None,
            },
            Err(reason) => Readiness {
                valid: false,
                reason: Some(reason.to_string()),
            },
        }
    }

    /// Validates, enables, arms the warmup, and ensures the loop runs.
    ///
    /// # Errors
    ///
    /// Returns the first failed readiness check; the worker is left untouched.
    pub fn start(&self) -> Result<(), StartError> {
        if let Err(reason) = self.check_ready() {
            warn!("Uploader not started: {}", reason);
            return Err(reason);
        }
        self.set_enabled(true);
        self.arm_warmup(DEFAULT_WARMUP);
        self.set_state(WorkerState::Warmup);
        self.ensure_running();
        Ok(())
    }

    /// Runs one upload cycle now, ignoring the schedule.
    ///
    /// Preconditions (enabled, configured, link up, memory) are still checked.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if !self.is_enabled() {
            return CycleOutcome::Skipped(SkipReason::Disabled);
        }
        let config = self.config();
        if !config.is_runnable() {
            return CycleOutcome::Skipped(SkipReason::NotConfigured);
        }
        if !self.shared.deps.link.is_connected() {
            return CycleOutcome::Skipped(SkipReason::LinkDown);
        }
        if let Some(available) = self.shared.deps.resources.available_bytes() {
            if available < config.min_free_bytes {
                warn!(
                    "Skipping upload: {} bytes free (need {})",
                    available, config.min_free_bytes
                );
                self.record(UploadDebugSnapshot::low_resources(&config.endpoint));
                return CycleOutcome::Skipped(SkipReason::LowResources);
            }
        }

        self.set_state(WorkerState::Listing);
        let spool = self.spool_for(&config.mode);
        let failures = self.consecutive_failures();
        let batch_size = config.batch_size.max(1);
        let request = BatchRequest {
            max_items: if failures > 0 { 1 } else { batch_size },
            scan_limit: batch_size.saturating_mul(SCAN_FACTOR),
        };

        let batch = match spool.list_undelivered(request).await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                debug!("Nothing to upload from {}", spool.describe());
                self.record(UploadDebugSnapshot::nothing_to_upload(&config.endpoint));
                self.set_state(WorkerState::Waiting);
                return CycleOutcome::Empty;
            }
            Err(e) => {
                warn!("Reading {} failed: {}", spool.describe(), e);
                self.record(UploadDebugSnapshot::storage_read_failed(&config.endpoint));
                self.set_state(WorkerState::Waiting);
                return CycleOutcome::StorageError;
            }
        };

        let body = match build_body(&batch.records) {
            Ok(body) => body,
            Err(e) => {
                warn!("Building upload body failed: {}", e);
                self.record(UploadDebugSnapshot::storage_read_failed(&config.endpoint));
                self.set_state(WorkerState::Waiting);
                return CycleOutcome::StorageError;
            }
        };
        let credential = credential_for(&batch.source_id);

        info!(
            "Uploading {} records for source={} (attempts={})",
            batch.len(),
            batch.source_id,
            u32::from(config.retry_count) + 1
        );
        self.set_state(WorkerState::Uploading);

        let mut response: Option<NetResponse> = None;
        let mut failure: Option<FailureKind> = None;
        for attempt in 0..=config.retry_count {
            match self
                .shared
                .deps
                .net
                .post_json(&config.endpoint, &body, credential)
                .await
            {
                Ok(resp) if resp.is_success() => {
                    failure = None;
                    response = Some(resp);
                    break;
                }
                Ok(resp) => {
                    warn!("Attempt {} got HTTP {}", u32::from(attempt) + 1, resp.status);
                    let kind = FailureKind::Http(resp.status);
                    failure = Some(kind);
                    response = Some(resp);
                    if kind.is_auth() {
                        // Auth rejections end the cycle.
                        break;
                    }
                }
                Err(e) => {
                    warn!("Attempt {} failed: {}", u32::from(attempt) + 1, e);
                    failure = Some(FailureKind::Net);
                    response = None;
                }
            }
            if attempt < config.retry_count {
                tokio::time::sleep(config.retry_delay).await;
            }
        }

        self.record(UploadDebugSnapshot {
            at: Some(chrono::Utc::now()),
            code: response.as_ref().map(|r| r.status as i32).unwrap_or(0),
            success: failure.is_none(),
            error: failure.map(|k| k.to_string()).unwrap_or_default(),
            bytes_sent: body.len(),
            response_size: response.as_ref().map(|r| r.body.len()).unwrap_or(0),
            endpoint: config.endpoint.clone(),
            source_id: batch.source_id.clone(),
            items: batch.len(),
        });

        match failure {
            None => {
                self.shared.failures.store(0, Ordering::SeqCst);
                self.set_state(WorkerState::Cleanup);
                if let Err(e) = spool.mark_delivered(&batch).await {
                    warn!(
                        "Cleanup after upload of {} records failed (still delivered): {}",
                        batch.len(),
                        e
                    );
                }
                info!("Uploaded {} records for source={}", batch.len(), batch.source_id);
                self.set_state(WorkerState::Waiting);
                CycleOutcome::Delivered {
                    source_id: batch.source_id,
                    items: batch.records.len(),
                }
            }
            Some(kind) => {
                self.set_state(WorkerState::Backoff);
                if let Err(e) = spool.mark_failed(&batch, &kind.to_string()).await {
                    warn!("Recording upload failure failed: {}", e);
                }
                let failures = self.shared.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                warn!(
                    "Upload failed: {} (consecutive failures: {})",
                    kind, failures
                );

                let tripped = kind.is_auth() || failures >= MAX_CONSECUTIVE_FAILURES;
                if tripped {
                    error!(
                        "Disabling uploader ({}, consecutive failures: {})",
                        kind, failures
                    );
                    self.set_enabled(false);
                } else {
                    self.set_state(WorkerState::Waiting);
                }
                CycleOutcome::Failed { kind, tripped }
            }
        }
    }

    async fn run(self) {
        info!("Uploader loop started");
        let mut next_due: Option<Instant> = None;
        let mut was_connected = false;

        loop {
            if let Some(remaining) = self.warmup_remaining() {
                self.set_state(WorkerState::Warmup);
                tokio::time::sleep(remaining.min(WARMUP_SLICE)).await;
                continue;
            }

            if self.shared.cursor_reset.swap(false, Ordering::SeqCst) {
                let spool = self.spool_for(&self.config().mode);
                if let Err(e) = spool.reset_cursor().await {
                    warn!("Cursor reset failed: {}", e);
                }
            }

            let config = self.config();
            if !self.is_enabled() || !config.is_runnable() {
                if self.is_enabled() {
                    self.set_state(WorkerState::Waiting);
                }
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }

            let connected = self.shared.deps.link.is_connected();
            if connected && !was_connected {
                debug!("Link up; upload due now");
                next_due = None;
            }
            was_connected = connected;

            let now = Instant::now();
            let due = *next_due.get_or_insert(now);
            if now < due {
                self.set_state(WorkerState::Waiting);
                tokio::time::sleep((due - now).min(WAIT_SLICE)).await;
                continue;
            }
            if !connected {
                self.set_state(WorkerState::Waiting);
                tokio::time::sleep(WAIT_SLICE).await;
                continue;
            }

            let outcome = self.run_cycle().await;
            let delay = match outcome {
                CycleOutcome::Skipped(SkipReason::LowResources) => config.low_resource_delay,
                _ => config.interval,
            };
            next_due = Some(Instant::now() + delay);
        }
    }

    fn warmup_remaining(&self) -> Option<Duration> {
        let mut until = self.shared.warmup_until.lock().ok()?;
        let deadline = (*until)?;
        let now = Instant::now();
        if now < deadline {
            Some(deadline - now)
        } else {
            *until = None;
            None
        }
    }

    fn check_ready(&self) -> Result<(), StartError> {
        let config = self.config();
        let endpoint = config.endpoint.trim();
        if endpoint.is_empty() {
            return Err(StartError::MissingEndpoint);
        }
        let url = reqwest::Url::parse(endpoint).map_err(|_| StartError::InvalidEndpoint)?;
        if is_local_host(url.host_str().unwrap_or_default()) {
            return Err(StartError::EndpointLocalhost);
        }
        if config.interval <= MIN_INTERVAL {
            return Err(StartError::IntervalTooLow);
        }
        if !self.shared.deps.link.is_connected() {
            return Err(StartError::LinkDown);
        }
        Ok(())
    }

    /// Backend for `mode`, reused across cycles so cursor state is kept.
    fn spool_for(&self, mode: &SpoolMode) -> Arc<dyn DurableSpool> {
        let deps = &self.shared.deps;
        let Ok(mut cached) = self.shared.spool.lock() else {
            return open_spool(mode, deps.lock.clone(), &deps.memory);
        };
        match cached.as_ref() {
            Some((cached_mode, spool)) if cached_mode == mode => spool.clone(),
            _ => {
                let spool = open_spool(mode, deps.lock.clone(), &deps.memory);
                debug!("Uploader reading from {}", spool.describe());
                *cached = Some((mode.clone(), spool.clone()));
                spool
            }
        }
    }

    fn record(&self, snapshot: UploadDebugSnapshot) {
        if let Ok(mut debug) = self.shared.debug.lock() {
            *debug = snapshot;
        }
    }

    fn set_state(&self, state: WorkerState) {
        if let Ok(mut current) = self.shared.state.lock() {
            *current = state;
        }
    }
}

fn is_local_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host == "::1"
        || host == "0.0.0.0"
        || host.starts_with("127.")
}
