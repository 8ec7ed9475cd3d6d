//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::ingest::IngestConfig;
use crate::storage::SpoolMode;
use crate::upload::UploadConfig;

/// Baud rates the LoRa bridge firmware can be set to
pub const SUPPORTED_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Accepted `[logging] level` values
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Radio bridge serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RadioConfig {
    /// Device path; empty probes the default list
    #[serde(default)]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Keep running without a radio (upload only)
    #[serde(default = "default_radio_optional")]
    pub optional: bool,
}

/// Spool encoding selection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    FileSpool,
    Csv,
    CsvRepo,
    Memory,
}

/// Durable storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_mode")]
    pub mode: StorageKind,

    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,

    #[serde(default = "default_csv_path")]
    pub csv_path: String,

    /// Capacity of the in-memory ring of recent records
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

/// Ingestion queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IngestSection {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_drain_per_iteration")]
    pub drain_per_iteration: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Upload worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploadSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub retry_count: u8,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,

    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    #[serde(default = "default_low_resource_delay_ms")]
    pub low_resource_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub file_enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_baud_rate() -> u32 { 115200 }
fn default_read_timeout_ms() -> u64 { 50 }
fn default_radio_optional() -> bool { true }

fn default_storage_mode() -> StorageKind { StorageKind::FileSpool }
fn default_spool_dir() -> String { "./spool".to_string() }
fn default_csv_path() -> String { "./logs.csv".to_string() }
fn default_memory_capacity() -> usize { 50 }

fn default_queue_capacity() -> usize { 16 }
fn default_drain_per_iteration() -> usize { 4 }
fn default_poll_interval_ms() -> u64 { 10 }

fn default_interval_ms() -> u64 { 15000 }
fn default_batch_size() -> usize { 50 }
fn default_retry_delay_ms() -> u64 { 2000 }
fn default_warmup_ms() -> u64 { 1500 }
fn default_min_free_bytes() -> u64 { 25000 }
fn default_low_resource_delay_ms() -> u64 { 2000 }

fn default_log_level() -> String { "info".to_string() }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_file_prefix() -> String { "field-gateway.log".to_string() }

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            optional: default_radio_optional(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: default_storage_mode(),
            spool_dir: default_spool_dir(),
            csv_path: default_csv_path(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drain_per_iteration: default_drain_per_iteration(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
            retry_count: 0,
            retry_delay_ms: default_retry_delay_ms(),
            warmup_ms: default_warmup_ms(),
            min_free_bytes: default_min_free_bytes(),
            low_resource_delay_ms: default_low_resource_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_enabled: false,
            log_dir: default_log_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> GatewayError {
    GatewayError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use field_gateway::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Endpoint reachability is not checked here; the worker reports it
    /// through its readiness check instead.
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_BAUD_RATES.contains(&self.radio.baud_rate) {
            return Err(invalid(format!(
                "baud_rate must be one of: {:?}",
                SUPPORTED_BAUD_RATES
            )));
        }

        if self.radio.read_timeout_ms == 0 || self.radio.read_timeout_ms > 10000 {
            return Err(invalid("read_timeout_ms must be between 1 and 10000"));
        }

        match self.storage.mode {
            StorageKind::FileSpool if self.storage.spool_dir.is_empty() => {
                return Err(invalid("spool_dir cannot be empty in file_spool mode"));
            }
            StorageKind::Csv | StorageKind::CsvRepo if self.storage.csv_path.is_empty() => {
                return Err(invalid("csv_path cannot be empty in csv modes"));
            }
            _ => {}
        }

        if self.storage.memory_capacity == 0 {
            return Err(invalid("memory_capacity must be greater than 0"));
        }

        if self.ingest.queue_capacity == 0 || self.ingest.queue_capacity > 1024 {
            return Err(invalid("queue_capacity must be between 1 and 1024"));
        }

        if self.ingest.drain_per_iteration == 0 {
            return Err(invalid("drain_per_iteration must be greater than 0"));
        }

        if self.ingest.poll_interval_ms == 0 || self.ingest.poll_interval_ms > 1000 {
            return Err(invalid("poll_interval_ms must be between 1 and 1000"));
        }

        if self.upload.batch_size == 0 || self.upload.batch_size > 500 {
            return Err(invalid("batch_size must be between 1 and 500"));
        }

        if self.upload.enabled
            && !self.upload.endpoint.trim().is_empty()
            && self.upload.interval_ms <= 1000
        {
            return Err(invalid("interval_ms must be greater than 1000 when uploading"));
        }

        if self.upload.interval_ms > 86_400_000 {
            return Err(invalid("interval_ms must be at most one day"));
        }

        if self.upload.retry_delay_ms > 60000 {
            return Err(invalid("retry_delay_ms must be at most 60000"));
        }

        if self.upload.warmup_ms > 60000 {
            return Err(invalid("warmup_ms must be at most 60000"));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(invalid(format!("level must be one of: {:?}", LOG_LEVELS)));
        }

        if self.logging.file_enabled && self.logging.log_dir.is_empty() {
            return Err(invalid("log_dir cannot be empty when file logging is enabled"));
        }

        Ok(())
    }

    /// Spool backend selected by `[storage]`
    pub fn spool_mode(&self) -> SpoolMode {
        match self.storage.mode {
            StorageKind::FileSpool => SpoolMode::FileSpool {
                dir: PathBuf::from(&self.storage.spool_dir),
            },
            StorageKind::Csv => SpoolMode::Csv {
                path: PathBuf::from(&self.storage.csv_path),
            },
            StorageKind::CsvRepo => SpoolMode::CsvRepo {
                path: PathBuf::from(&self.storage.csv_path),
            },
            StorageKind::Memory => SpoolMode::Memory,
        }
    }

    /// Ingestion queue settings
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            queue_capacity: self.ingest.queue_capacity,
            drain_per_iteration: self.ingest.drain_per_iteration,
            poll_interval: Duration::from_millis(self.ingest.poll_interval_ms),
        }
    }

    /// Upload worker settings
    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            endpoint: self.upload.endpoint.trim().to_string(),
            interval: Duration::from_millis(self.upload.interval_ms),
            batch_size: self.upload.batch_size,
            retry_count: self.upload.retry_count,
            retry_delay: Duration::from_millis(self.upload.retry_delay_ms),
            mode: self.spool_mode(),
            min_free_bytes: self.upload.min_free_bytes,
            low_resource_delay: Duration::from_millis(self.upload.low_resource_delay_ms),
        }
    }

    /// Serial read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.radio.read_timeout_ms)
    }

    /// Explicit device path list; empty lets the radio probe its defaults
    pub fn radio_paths(&self) -> Vec<String> {
        if self.radio.port.is_empty() {
            Vec::new()
        } else {
            vec![self.radio.port.clone()]
        }
    }
}
