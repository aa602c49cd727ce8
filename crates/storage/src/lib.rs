//! Storage backend abstraction for reqsig replay protection.
//!
//! This crate provides the [`StorageBackend`] and [`ConditionalWrite`]
//! traits that replay guards in `reqsig-authn` build on, plus an in-memory
//! implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 RequestVerifier (reqsig-authn)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │     AtomicReplayGuard      │      EventualReplayGuard       │
//! │   (insert-if-absent)       │      (read-then-write)         │
//! ├────────────────────────────┴────────────────────────────────┤
//! │                     reqsig-storage                           │
//! │          StorageBackend  ⊂  ConditionalWrite                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │ MemoryBackend │ your database / edge KV adapter              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use reqsig_storage::{ConditionalWrite, MemoryBackend, StorageError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!     let ttl = Duration::from_secs(300);
//!
//!     // First sighting wins
//!     backend.insert_if_absent_with_ttl(b"nonce:abc".to_vec(), b"1".to_vec(), ttl).await?;
//!
//!     // Any later attempt while the key is live conflicts
//!     let second = backend.insert_if_absent_with_ttl(b"nonce:abc".to_vec(), b"1".to_vec(), ttl).await;
//!     assert!(matches!(second, Err(StorageError::Conflict)));
//!
//!     Ok(())
//! }
//! ```
//!
//! # Implementing a Backend
//!
//! 1. Implement [`StorageBackend`]
//! 2. Implement [`ConditionalWrite`] only if the store can check and write atomically
//! 3. Map backend-specific errors to [`StorageError`]
//!
//! See the [`memory`] module source for a reference implementation.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with a fault-injecting backend and assertion
//!   macros. Enable this in `[dev-dependencies]` for integration tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

// Re-export primary types at crate root for convenience
pub use backend::{ConditionalWrite, StorageBackend};
pub use error::{BoxError, StorageError, StorageResult};
pub use memory::MemoryBackend;
