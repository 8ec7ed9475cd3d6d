//! # Link and Resource Probes
//!
//! Preconditions the upload worker checks before each cycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Reports whether the uplink network is connected
#[cfg_attr(test, mockall::automock)]
pub trait LinkMonitor: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Link state set by whatever manages the network connection
#[derive(Debug, Clone, Default)]
pub struct SharedLinkState {
    connected: Arc<AtomicBool>,
}

impl SharedLinkState {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(connected)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

impl LinkMonitor for SharedLinkState {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Link that is always up (wired hosts)
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl LinkMonitor for AlwaysOnline {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Reports free memory available to the process
#[cfg_attr(test, mockall::automock)]
pub trait ResourceProbe: Send + Sync {
    /// Available bytes, or `None` if unknown (the guard then passes).
    fn available_bytes(&self) -> Option<u64>;
}

/// Reads `MemAvailable` from `/proc/meminfo`
#[derive(Debug, Clone)]
pub struct MemInfoProbe {
    path: PathBuf,
}

impl Default for MemInfoProbe {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl MemInfoProbe {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResourceProbe for MemInfoProbe {
    fn available_bytes(&self) -> Option<u64> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => parse_mem_available(&text),
            Err(e) => {
                debug!("Cannot read {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

/// Extracts `MemAvailable` in bytes from meminfo text.
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kb = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok()?;
        Some(kb * 1024)
    })
}
