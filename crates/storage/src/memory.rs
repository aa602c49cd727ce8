//! In-memory storage backend implementation.
//!
//! This module provides [`MemoryBackend`], an in-memory implementation of
//! [`StorageBackend`] and [`ConditionalWrite`] suitable for tests,
//! development, and single-node deployments.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **TTL support**: Expired keys read as absent immediately; a background task removes them
//! - **Atomic conditional insert**: The presence check and the write happen under one write lock
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - State is local to one process, so it gives no protection across replicas
//! - TTL cleanup runs every second, so physical removal is not precise

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::{ConditionalWrite, StorageBackend},
    error::{StorageError, StorageResult},
};

/// Interval between background sweeps of expired keys.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// A stored value and its absolute expiry.
#[derive(Clone, Debug)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type Store = Arc<RwLock<BTreeMap<Vec<u8>, Entry>>>;

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        // Sending is a best-effort signal; the receiver may already be gone.
        let _ = self.shutdown_tx.send(());
    }
}

/// In-memory storage backend using [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data store.
///
/// # Shutdown
///
/// The background TTL cleanup task stops automatically when all clones of
/// the `MemoryBackend` are dropped (via the internal `ShutdownGuard`).
/// You can also call [`shutdown`](Self::shutdown) to stop the task explicitly.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Store,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryBackend {
    /// Creates a new in-memory storage backend.
    ///
    /// This also spawns a background task that periodically removes expired
    /// keys. The task stops automatically when all clones of the backend are
    /// dropped.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let data: Store = Arc::new(RwLock::new(BTreeMap::new()));

        // The task only holds the data handle, never the guard, so dropping
        // the last backend clone closes the channel.
        tokio::spawn(cleanup_expired_keys(Arc::clone(&data), shutdown_rx));

        Self { data, shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }) }
    }

    /// Explicitly signals the background TTL cleanup task to stop.
    ///
    /// This is optional. Use it when you need deterministic shutdown timing
    /// (e.g., in tests).
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Returns the number of physically stored keys, including expired keys
    /// the cleanup task has not removed yet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if no keys are physically stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task to clean up expired keys.
///
/// Runs every [`CLEANUP_INTERVAL`] and exits when the shutdown signal is
/// received or the sender is dropped.
async fn cleanup_expired_keys(data: Store, mut shutdown_rx: watch::Receiver<()>) {
    loop {
        select! {
            _ = sleep(CLEANUP_INTERVAL) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }

        let now = Instant::now();
        let removed = {
            let mut guard = data.write();
            let before = guard.len();
            guard.retain(|_, entry| entry.is_live(now));
            before - guard.len()
        };

        if removed > 0 {
            tracing::trace!(removed, "memory backend swept expired keys");
        }
    }
}

fn expiry_from(ttl: Duration) -> StorageResult<Instant> {
    Instant::now()
        .checked_add(ttl)
        .ok_or_else(|| StorageError::internal(format!("ttl {ttl:?} overflows the clock")))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let now = Instant::now();
        let data = self.data.read();
        Ok(data.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value.clone()))
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        let expires_at = expiry_from(ttl)?;
        self.data.write().insert(key, Entry { value: Bytes::from(value), expires_at });
        Ok(())
    }
}

#[async_trait]
impl ConditionalWrite for MemoryBackend {
    async fn insert_if_absent_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        let expires_at = expiry_from(ttl)?;

        // Check and write under a single write lock.
        let mut data = self.data.write();
        let now = Instant::now();
        if data.get(&key).is_some_and(|entry| entry.is_live(now)) {
            return Err(StorageError::Conflict);
        }

        data.insert(key, Entry { value: Bytes::from(value), expires_at });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use tokio::task::JoinSet;

    use super::*;

    #[tokio::test]
    async fn test_basic_operations() {
        let backend = MemoryBackend::new();

        backend
            .set_with_ttl(b"key1".to_vec(), b"value1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(backend.get(b"key1").await.unwrap(), Some(Bytes::from("value1")));
        assert_eq!(backend.get(b"key2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl() {
        let backend = MemoryBackend::new();

        backend
            .set_with_ttl(b"temp".to_vec(), b"value".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();

        // Should exist immediately
        assert!(backend.get(b"temp").await.unwrap().is_some());

        // Wait for expiry
        sleep(Duration::from_millis(100)).await;

        // Reads as absent before the sweep runs
        assert_eq!(backend.get(b"temp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_if_absent_conflict() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);

        backend.insert_if_absent_with_ttl(b"nonce".to_vec(), b"1".to_vec(), ttl).await.unwrap();

        let result = backend.insert_if_absent_with_ttl(b"nonce".to_vec(), b"2".to_vec(), ttl).await;
        assert!(matches!(result, Err(StorageError::Conflict)));

        // The original value is untouched
        assert_eq!(backend.get(b"nonce").await.unwrap(), Some(Bytes::from("1")));
    }

    #[tokio::test]
    async fn test_insert_if_absent_after_expiry() {
        let backend = MemoryBackend::new();

        backend
            .insert_if_absent_with_ttl(b"nonce".to_vec(), b"1".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        sleep(Duration::from_millis(60)).await;

        // Expired keys are logically absent
        backend
            .insert_if_absent_with_ttl(b"nonce".to_vec(), b"2".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(backend.get(b"nonce").await.unwrap(), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_concurrent_insert_if_absent_single_winner() {
        let backend = MemoryBackend::new();
        let mut set = JoinSet::new();

        for i in 0..32u8 {
            let backend = backend.clone();
            set.spawn(async move {
                backend
                    .insert_if_absent_with_ttl(b"race".to_vec(), vec![i], Duration::from_secs(60))
                    .await
                    .is_ok()
            });
        }

        let mut winners = 0;
        while let Some(result) = set.join_next().await {
            if result.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one conditional insert must win");
    }

    #[tokio::test]
    async fn test_clone_shares_data() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();

        backend.set_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(clone.get(b"k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_cleanup_task_removes_expired_keys() {
        let backend = MemoryBackend::new();
        backend.set_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_millis(10)).await.unwrap();
        assert_eq!(backend.len(), 1);

        sleep(CLEANUP_INTERVAL + Duration::from_millis(200)).await;
        assert!(backend.is_empty(), "sweep should physically remove expired keys");
    }

    #[tokio::test]
    async fn test_shutdown_stops_cleanup_task() {
        let backend = MemoryBackend::new();
        backend.set_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_millis(10)).await.unwrap();

        backend.shutdown();
        sleep(CLEANUP_INTERVAL + Duration::from_millis(200)).await;

        // Still physically present, but logically expired
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.shutdown();
        backend.shutdown();

        backend
            .set_with_ttl(b"key".to_vec(), b"value".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(backend.get(b"key").await.unwrap(), Some(Bytes::from("value")));
    }
}
