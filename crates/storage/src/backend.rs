//! Storage backend trait definitions.
//!
//! Replay protection runs on very different stores depending on where the
//! verifier is deployed: a process-local map, a transactional database, an
//! edge key-value store with eventual consistency. This module captures the
//! two capability levels those stores offer:
//!
//! - [`StorageBackend`]: plain reads and TTL writes. Concurrent writers may race.
//! - [`ConditionalWrite`]: additionally offers an atomic insert-if-absent with TTL. This is the
//!   only capability that closes the read-then-write race.
//!
//! Keys and values are bytes; callers decide on encoding.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// Abstract key-value storage with TTL support.
///
/// Backends are expected to be thread-safe (`Send + Sync`) and support
/// concurrent operations.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`set_with_ttl`](StorageBackend::set_with_ttl) | Store with automatic expiration |
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use bytes::Bytes;
/// use reqsig_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set_with_ttl(b"key".to_vec(), b"value".to_vec(), Duration::from_secs(60)).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// Keys whose TTL has elapsed are reported as absent even if the backend
    /// has not physically removed them yet.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))` if the key exists and has not expired
    /// - `Ok(None)` if the key doesn't exist
    /// - `Err(...)` on storage errors
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair that expires after `ttl`.
    ///
    /// If the key already exists, its value and TTL are overwritten.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;
}

/// Storage that can perform an atomic conditional insert.
///
/// Implementations must guarantee that for any number of concurrent calls
/// with the same key, exactly one succeeds while the key is live. This is an
/// external guarantee: it has to come from the store itself (a transactional
/// database, a single-writer actor, a lock held across the check and the
/// write) and cannot be recovered by callers.
#[async_trait]
pub trait ConditionalWrite: StorageBackend {
    /// Inserts `key` with `value` and `ttl` only if the key is absent or expired.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict) if a live value is already
    ///   stored under `key`. The existing value is left untouched.
    /// - Any other [`StorageError`](crate::StorageError) on backend failure.
    #[must_use = "conditional writes may conflict and errors must be handled"]
    async fn insert_if_absent_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()>;
}
