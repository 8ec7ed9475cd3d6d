//! # Storage Lock
//!
//! Single mutual-exclusion domain over the shared storage bus and the
//! filesystem driver behind it.
//!
//! Every multi-step filesystem transaction (probe-then-create,
//! read-modify-rename, scan) holds one [`StorageGuard`] for its full
//! duration. The lock is released when the guard drops, so every exit path
//! of a transaction (including `?` on an I/O error) gives it back.
//!
//! Acquisition is **not** reentrant: a task that already holds a guard and
//! calls [`StorageLock::acquire`] again will wait forever. Structure each
//! logical operation to acquire exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Waits longer than this are reported at debug level.
const CONTENTION_LOG_THRESHOLD: Duration = Duration::from_millis(250);

/// Shared storage bus lock
///
/// Cheap to clone; all clones guard the same bus.
#[derive(Debug, Clone, Default)]
pub struct StorageLock {
    inner: Arc<LockInner>,
}

#[derive(Debug, Default)]
struct LockInner {
    bus: Mutex<()>,
    acquisitions: AtomicU64,
    contended: AtomicU64,
}

/// Exclusive ownership of the storage bus, released on drop
#[derive(Debug)]
pub struct StorageGuard<'a> {
    _bus: MutexGuard<'a, ()>,
}

impl StorageLock {
    /// Creates a new, unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks the calling task until the bus is exclusively owned.
    ///
    /// Cannot fail. Operations performed while holding the guard may fail
    /// without affecting the lock.
    pub async fn acquire(&self) -> StorageGuard<'_> {
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);

        if let Ok(bus) = self.inner.bus.try_lock() {
            return StorageGuard { _bus: bus };
        }

        self.inner.contended.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let bus = self.inner.bus.lock().await;
        let waited = started.elapsed();
        if waited >= CONTENTION_LOG_THRESHOLD {
            debug!("Storage lock acquired after {:?} wait", waited);
        }
        StorageGuard { _bus: bus }
    }

    /// Total number of acquisitions so far
    pub fn acquisitions(&self) -> u64 {
        self.inner.acquisitions.load(Ordering::Relaxed)
    }

    /// Number of acquisitions that had to wait for another holder
    pub fn contended(&self) -> u64 {
        self.inner.contended.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let lock = StorageLock::new();
        {
            let _guard = lock.acquire().await;
        }
        let _again = lock.acquire().await;
        assert_eq!(lock.acquisitions(), 2);
        assert_eq!(lock.contended(), 0);
    }

    #[tokio::test]
    async fn test_guard_released_on_error_path() {
        async fn failing_transaction(lock: &StorageLock) -> std::io::Result<()> {
            let _guard = lock.acquire().await;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "bus glitch"))
        }

        let lock = StorageLock::new();
        assert!(failing_transaction(&lock).await.is_err());

        // Must not deadlock
        let result = tokio::time::timeout(Duration::from_secs(1), lock.acquire()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_mutual_exclusion_across_tasks() {
        let lock = StorageLock::new();
        let inside = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                tokio::task::yield_now().await;
                inside.store(false, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(lock.acquisitions(), 8);
    }

    #[tokio::test]
    async fn test_contended_acquisition_is_counted() {
        let lock = StorageLock::new();
        let guard = lock.acquire().await;

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
            })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        waiter.await.unwrap();

        assert_eq!(lock.contended(), 1);
    }
}
