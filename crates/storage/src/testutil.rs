//! Shared test utilities for storage backend testing.
//!
//! This module provides a fault-injecting backend wrapper and assertion
//! helpers for [`StorageResult`] values. It is feature-gated behind
//! `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! reqsig-storage = { path = "../storage", features = ["testutil"] }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    backend::{ConditionalWrite, StorageBackend},
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"` encoded as UTF-8 bytes.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// A backend wrapper that fails every operation with a configurable error.
///
/// While no failure is armed, calls pass through to an inner
/// [`MemoryBackend`]. Each call is counted so tests can assert how many
/// round trips a caller made.
#[derive(Clone)]
pub struct FailingBackend {
    inner: MemoryBackend,
    failure: Arc<Mutex<Option<StorageError>>>,
    calls: Arc<AtomicUsize>,
}

impl FailingBackend {
    /// Creates a wrapper with no failure armed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            failure: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a wrapper that fails every call with `error`.
    #[must_use]
    pub fn failing_with(error: StorageError) -> Self {
        let backend = Self::new();
        backend.fail_with(error);
        backend
    }

    /// Arms `error` for all subsequent calls.
    pub fn fail_with(&self, error: StorageError) {
        *self.failure.lock() = Some(error);
    }

    /// Disarms the failure; calls pass through again.
    pub fn heal(&self) {
        *self.failure.lock() = None;
    }

    /// Number of storage calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for FailingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.check()?;
        self.inner.set_with_ttl(key, value, ttl).await
    }
}

#[async_trait]
impl ConditionalWrite for FailingBackend {
    async fn insert_if_absent_with_ttl(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.check()?;
        self.inner.insert_if_absent_with_ttl(key, value, ttl).await
    }
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use reqsig_storage::{StorageError, StorageResult, assert_conflict};
///
/// let result: StorageResult<()> = Err(StorageError::Conflict);
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict)),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}
