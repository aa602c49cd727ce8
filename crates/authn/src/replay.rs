//! Nonce replay protection.
//!
//! A [`ReplayGuard`] answers one question: has this `(issuer, keyid, nonce)`
//! been presented before within its replay window? Recording happens as part
//! of the same call, so a `false` answer means the nonce is now consumed.
//!
//! # Choosing a guard
//!
//! | Guard | Consistency | Scope |
//! |-------|-------------|-------|
//! | [`AtomicReplayGuard`] | strong (insert-if-absent) | shared backend |
//! | [`EventualReplayGuard`] | read-then-write, racy | shared backend |
//! | [`InMemoryReplayGuard`] | strong | single process |
//! | [`DisabledReplayGuard`] | none | testing only |
//!
//! # Failure behavior
//!
//! Every guard fails closed: a backend error is reported as a replay and
//! logged at ERROR level.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use fail::fail_point;
use moka::future::Cache;
use reqsig_storage::{ConditionalWrite, StorageBackend, StorageError};
use sha2::{Digest, Sha256};

use crate::{
    clock::{Clock, SystemClock},
    issuer::Issuer,
};

/// Upper bound on how long a nonce is remembered.
pub const MAX_REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// Default capacity of [`InMemoryReplayGuard`].
pub const DEFAULT_REPLAY_CAPACITY: u64 = 100_000;

/// One nonce presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayContext {
    /// Derived issuer.
    pub issuer: Issuer,
    /// Signature key id.
    pub keyid: String,
    /// The nonce.
    pub nonce: String,
    /// How long the nonce must be remembered.
    pub ttl: Duration,
}

impl ReplayContext {
    /// Storage key: hex `sha256(issuer|keyid|nonce)`.
    #[must_use]
    pub fn replay_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.issuer.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.keyid.as_bytes());
        hasher.update(b"|");
        hasher.update(self.nonce.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Replay detection seam.
#[async_trait]
pub trait ReplayGuard: Send + Sync {
    /// Returns `true` if `ctx` was already seen (or if that cannot be ruled
    /// out), otherwise records it and returns `false`.
    async fn seen(&self, ctx: &ReplayContext) -> bool;
}

fn expiry_record(clock: &dyn Clock, ttl: Duration) -> Vec<u8> {
    let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    clock.now().saturating_add(ttl).to_string().into_bytes()
}

fn fail_closed(guard: &'static str, ctx: &ReplayContext, err: &StorageError) -> bool {
    tracing::error!(
        guard,
        issuer = %ctx.issuer,
        keyid = %ctx.keyid,
        error = %err,
        "replay backend failed; treating request as replay"
    );
    true
}

/// Strongly consistent guard over a backend with insert-if-absent.
pub struct AtomicReplayGuard<B> {
    backend: B,
    clock: Arc<dyn Clock>,
}

impl<B: ConditionalWrite> AtomicReplayGuard<B> {
    /// Wraps `backend`.
    pub fn new(backend: B) -> Self {
        Self { backend, clock: Arc::new(SystemClock) }
    }

    /// Uses `clock` for the stored expiry record.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl<B: ConditionalWrite> ReplayGuard for AtomicReplayGuard<B> {
    #[tracing::instrument(skip_all, fields(guard = "atomic"))]
    async fn seen(&self, ctx: &ReplayContext) -> bool {
        fail_point!("replay-before-store", |_| true);

        let record = expiry_record(self.clock.as_ref(), ctx.ttl);
        match self
            .backend
            .insert_if_absent_with_ttl(ctx.replay_key().into_bytes(), record, ctx.ttl)
            .await
        {
            Ok(()) => false,
            Err(StorageError::Conflict) => {
                tracing::debug!("nonce already recorded");
                true
            },
            Err(err) => fail_closed("atomic", ctx, &err),
        }
    }
}

/// Read-then-write guard for backends without conditional writes.
///
/// Two concurrent presentations of the same nonce can both read "absent"
/// before either writes, so both are accepted. Use [`AtomicReplayGuard`]
/// where the backend allows it.
pub struct EventualReplayGuard<B> {
    backend: B,
    clock: Arc<dyn Clock>,
}

impl<B: StorageBackend> EventualReplayGuard<B> {
    /// Wraps `backend`.
    pub fn new(backend: B) -> Self {
        Self { backend, clock: Arc::new(SystemClock) }
    }

    /// Uses `clock` for the stored expiry record.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl<B: StorageBackend> ReplayGuard for EventualReplayGuard<B> {
    #[tracing::instrument(skip_all, fields(guard = "eventual"))]
    async fn seen(&self, ctx: &ReplayContext) -> bool {
        fail_point!("replay-before-store", |_| true);

        let key = ctx.replay_key().into_bytes();
        match self.backend.get(&key).await {
            Ok(Some(_)) => return true,
            Ok(None) => {},
            Err(err) => return fail_closed("eventual", ctx, &err),
        }

        let record = expiry_record(self.clock.as_ref(), ctx.ttl);
        match self.backend.set_with_ttl(key, record, ctx.ttl).await {
            Ok(()) => false,
            Err(err) => fail_closed("eventual", ctx, &err),
        }
    }
}

/// Per-entry expiry: the stored value is the absolute deadline.
struct NonceExpiry;

impl moka::Expiry<String, Instant> for NonceExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Instant,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.saturating_duration_since(created_at))
    }
}

/// Process-local guard backed by a [`moka::future::Cache`].
///
/// Uses the cache's entry API so check-and-record is a single atomic step.
/// Live nonces are never evicted: once `max_capacity` unexpired nonces are
/// held, new nonces are reported as replays until entries expire. The bound
/// is soft under concurrent inserts.
pub struct InMemoryReplayGuard {
    seen: Cache<String, Instant>,
    max_capacity: u64,
}

impl InMemoryReplayGuard {
    /// Creates a guard tracking at most `max_capacity` nonces.
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        let seen = Cache::builder().expire_after(NonceExpiry).build();
        Self { seen, max_capacity }
    }

    /// Synchronizes pending cache operations.
    #[cfg(any(test, feature = "testutil"))]
    pub async fn sync(&self) {
        self.seen.run_pending_tasks().await;
    }

    async fn is_full(&self) -> bool {
        if self.seen.entry_count() < self.max_capacity {
            return false;
        }
        // Drop expired entries before refusing.
        self.seen.run_pending_tasks().await;
        self.seen.entry_count() >= self.max_capacity
    }
}

impl Default for InMemoryReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

#[async_trait]
impl ReplayGuard for InMemoryReplayGuard {
    #[tracing::instrument(skip_all, fields(guard = "in_memory"))]
    async fn seen(&self, ctx: &ReplayContext) -> bool {
        let key = ctx.replay_key();
        if self.seen.contains_key(&key) {
            return true;
        }
        if self.is_full().await {
            tracing::error!(
                capacity = self.max_capacity,
                issuer = %ctx.issuer,
                keyid = %ctx.keyid,
                "replay cache full; failing closed"
            );
            return true;
        }

        let deadline = Instant::now() + ctx.ttl;
        let entry = self.seen.entry(key).or_insert_with(async move { deadline }).await;
        !entry.is_fresh()
    }
}

/// Accepts every nonce. Only for tests and trusted environments.
#[derive(Debug)]
pub struct DisabledReplayGuard(());

impl DisabledReplayGuard {
    /// Creates the guard, logging a warning.
    #[must_use]
    pub fn new() -> Self {
        tracing::warn!("replay protection is disabled; nonces will not be checked");
        Self(())
    }
}

impl Default for DisabledReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplayGuard for DisabledReplayGuard {
    async fn seen(&self, _ctx: &ReplayContext) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reqsig_storage::{MemoryBackend, testutil::FailingBackend};
    use tokio::task::JoinSet;

    use super::*;

    fn ctx(nonce: &str, ttl: Duration) -> ReplayContext {
        ReplayContext {
            issuer: Issuer::normalize("https://agent.example"),
            keyid: "k1".into(),
            nonce: nonce.into(),
            ttl,
        }
    }

    #[test]
    fn test_replay_key_is_hex_sha256() {
        let key = ctx("n1", MAX_REPLAY_WINDOW).replay_key();
        assert_eq!(key.len(), 64);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit()));

        let mut other = ctx("n1", MAX_REPLAY_WINDOW);
        other.keyid = "k2".into();
        assert_ne!(key, other.replay_key());
        assert_eq!(key, ctx("n1", Duration::from_secs(1)).replay_key());
    }

    async fn check_second_presentation_is_replay(guard: &dyn ReplayGuard) {
        let first = ctx("n1", Duration::from_secs(60));
        assert!(!guard.seen(&first).await);
        assert!(guard.seen(&first).await);
        assert!(!guard.seen(&ctx("n2", Duration::from_secs(60))).await);
    }

    #[tokio::test]
    async fn test_atomic_guard() {
        check_second_presentation_is_replay(&AtomicReplayGuard::new(MemoryBackend::new())).await;
    }

    #[tokio::test]
    async fn test_eventual_guard() {
        check_second_presentation_is_replay(&EventualReplayGuard::new(MemoryBackend::new())).await;
    }

    #[tokio::test]
    async fn test_in_memory_guard() {
        check_second_presentation_is_replay(&InMemoryReplayGuard::new(100)).await;
    }

    #[tokio::test]
    async fn test_disabled_guard_never_reports_replay() {
        let guard = DisabledReplayGuard::new();
        let nonce = ctx("n1", Duration::from_secs(60));
        assert!(!guard.seen(&nonce).await);
        assert!(!guard.seen(&nonce).await);
    }

    #[tokio::test]
    async fn test_backend_failure_fails_closed() {
        let atomic = AtomicReplayGuard::new(FailingBackend::failing_with(StorageError::timeout()));
        assert!(atomic.seen(&ctx("n1", Duration::from_secs(60))).await);

        let eventual =
            EventualReplayGuard::new(FailingBackend::failing_with(StorageError::connection("down")));
        assert!(eventual.seen(&ctx("n1", Duration::from_secs(60))).await);
    }

    #[tokio::test]
    async fn test_record_expires_with_ttl() {
        let guard = AtomicReplayGuard::new(MemoryBackend::new());
        let nonce = ctx("n1", Duration::from_millis(50));
        assert!(!guard.seen(&nonce).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!guard.seen(&nonce).await);
    }

    #[tokio::test]
    async fn test_in_memory_entry_expires() {
        let guard = InMemoryReplayGuard::new(100);
        let nonce = ctx("n1", Duration::from_millis(50));
        assert!(!guard.seen(&nonce).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        guard.sync().await;
        assert!(!guard.seen(&nonce).await);
    }

    #[tokio::test]
    async fn test_in_memory_live_nonce_survives_capacity_pressure() {
        let guard = InMemoryReplayGuard::new(2);
        let first = ctx("n1", MAX_REPLAY_WINDOW);
        assert!(!guard.seen(&first).await);
        assert!(!guard.seen(&ctx("n2", MAX_REPLAY_WINDOW)).await);
        guard.sync().await;

        for idx in 3..13 {
            assert!(guard.seen(&ctx(&format!("n{idx}"), MAX_REPLAY_WINDOW)).await);
        }
        guard.sync().await;

        assert!(guard.seen(&first).await);
        assert_eq!(guard.seen.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_capacity_frees_after_expiry() {
        let guard = InMemoryReplayGuard::new(1);
        assert!(!guard.seen(&ctx("n1", Duration::from_millis(50))).await);
        guard.sync().await;
        assert!(guard.seen(&ctx("n2", MAX_REPLAY_WINDOW)).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!guard.seen(&ctx("n2", MAX_REPLAY_WINDOW)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_presentations_single_acceptance() {
        let guards: [Arc<dyn ReplayGuard>; 2] = [
            Arc::new(AtomicReplayGuard::new(MemoryBackend::new())),
            Arc::new(InMemoryReplayGuard::new(1_000)),
        ];

        for guard in guards {
            let mut set = JoinSet::new();
            for _ in 0..32 {
                let guard = Arc::clone(&guard);
                set.spawn(async move { guard.seen(&ctx("race", Duration::from_secs(60))).await });
            }
            let mut accepted = 0;
            while let Some(replayed) = set.join_next().await {
                if !replayed.unwrap() {
                    accepted += 1;
                }
            }
            assert_eq!(accepted, 1);
        }
    }
}
