//! # Field Gateway
//!
//! Collect tag reads from LoRa field scanners and deliver them to the cloud.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Load configuration (first argument, or `config/default.toml`)
//!    - Set up logging to stdout and optionally a daily-rolling file
//!    - Open the storage backend and the radio bridge
//!
//! 2. **Running**
//!    - Ingestion task: poll the radio, validate, timestamp, spool
//!    - Upload worker: deliver spooled records per source
//!
//! 3. **Graceful Shutdown**
//!    - Ctrl+C stops both tasks; spooled records survive for the next start

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use field_gateway::config::{Config, LoggingConfig};
use field_gateway::ingest::{IngestionService, Timestamper};
use field_gateway::radio::{RadioPort, SerialRadio};
use field_gateway::storage::{open_spool, MemoryLog, SpoolMode, StorageLock};
use field_gateway::upload::{
    AlwaysOnline, HttpNetClient, MemInfoProbe, UploaderWorker, WorkerDeps,
};

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::from_toml("").context("building default configuration")?
    };

    let _log_guard = init_logging(&config.logging)?;

    info!("Field Gateway v{} starting...", env!("CARGO_PKG_VERSION"));
    if !config_path.exists() {
        warn!("{} not found; using defaults", config_path.display());
    }

    let lock = StorageLock::new();
    let memory = MemoryLog::new(config.storage.memory_capacity);
    let mode = config.spool_mode();
    let spool = open_spool(&mode, lock.clone(), &memory);
    info!("Storage backend: {}", spool.describe());

    let (mut ingest, handle) =
        IngestionService::new(config.ingest_config(), spool, Timestamper::default());
    if mode != SpoolMode::Memory {
        ingest = ingest.with_recent(memory.clone());
    }
    let counters = ingest.counters();

    let mut radio = SerialRadio::new(
        config.radio_paths(),
        config.radio.baud_rate,
        config.read_timeout(),
    );
    let ingest_task = match radio.begin().await {
        Ok(()) => {
            radio.on_packet(Arc::new(handle));
            Some(tokio::spawn(ingest.run(Box::new(radio))))
        }
        Err(e) if config.radio.optional => {
            warn!("Radio unavailable, continuing without ingestion: {}", e);
            None
        }
        Err(e) => return Err(e).context("opening radio bridge"),
    };

    let net = HttpNetClient::new().context("building HTTP client")?;
    let worker = UploaderWorker::new(
        config.upload_config(),
        WorkerDeps {
            net: Arc::new(net),
            link: Arc::new(AlwaysOnline),
            resources: Arc::new(MemInfoProbe::default()),
            lock,
            memory,
        },
    );

    if config.upload.enabled {
        match worker.start() {
            Ok(()) => {
                worker.arm_warmup(std::time::Duration::from_millis(config.upload.warmup_ms));
                info!("Uploader started");
            }
            Err(reason) => error!("Uploader not started: {}", reason),
        }
    } else {
        info!("Uploader disabled in configuration");
    }
    worker.ensure_running();

    info!("Press Ctrl+C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Waiting for Ctrl+C failed: {}", e);
    }

    info!("Received Ctrl+C, shutting down...");
    worker.shutdown();
    if let Some(task) = ingest_task {
        task.abort();
    }

    let stats = counters.snapshot();
    info!(
        "Ingest totals: accepted={} spooled={} invalid={} queue_full={} spool_failed={}",
        stats.accepted, stats.spooled, stats.dropped_invalid, stats.dropped_full, stats.spool_failed
    );
    let last = worker.debug_snapshot();
    info!(
        "Last upload: code={} success={} items={} error={}",
        last.code, last.success, last.items, last.error
    );

    Ok(())
}

/// Sets up stdout logging plus an optional daily-rolling log file.
///
/// `RUST_LOG` overrides the configured level. The returned guard flushes the
/// file writer on drop and must live until exit.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log level")?;

    let stdout = tracing_subscriber::fmt::layer();

    if !logging.file_enabled {
        tracing_subscriber::registry().with(filter).with(stdout).init();
        return Ok(None);
    }

    std::fs::create_dir_all(&logging.log_dir)
        .with_context(|| format!("creating log dir {}", logging.log_dir))?;
    let appender = tracing_appender::rolling::daily(&logging.log_dir, &logging.file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .init();
    Ok(Some(guard))
}
