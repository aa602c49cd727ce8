//! Public key discovery and caching.
//!
//! [`KeyResolver`] turns an `(issuer, keyid)` pair into an Ed25519 public
//! key, fetching the issuer's key set from well-known paths and caching the
//! result.
//!
//! # Architecture
//!
//! ```text
//! resolve(issuer, keyid)
//!     → cache hit and fresh?            → Cached
//!     → join in-flight resolution or start one:
//!         → URL safety check            (reject: final)
//!         → GET well-known paths, first 200 wins
//!         → parse key set, select by kid / fragment / thumbprint
//!         → cache with clamped max-age  → Fresh
//!         → transient failure and a retained entry? → Stale
//! ```
//!
//! # Cache Strategy
//!
//! - **Key**: `{issuer}:{keyid}`
//! - **Freshness**: `Cache-Control: max-age`, default 300 s, clamped to `[60 s, 24 h]`
//! - **Retention**: entries linger `max_stale` past expiry so stale-if-error has something to
//!   serve; they are never returned past expiry otherwise
//! - **Eviction**: capacity-bounded LRU
//!
//! # Singleflight
//!
//! Concurrent misses for the same cache key share one boxed future. The
//! future performs the whole resolution including the stale fallback, so
//! every waiter sees the same outcome, and it removes its own in-flight
//! entry once the cache has been written.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::{Bytes, BytesMut};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, VerifyingKey};
use fail::fail_point;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use moka::{Expiry, future::Cache, policy::EvictionPolicy};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::{
    clock::{Clock, SystemClock},
    config::KeyResolverConfig,
    error::{ConfigError, FetchError, ResolveError},
    issuer::Issuer,
    url_safety::{HostPredicate, UrlSafetyPolicy},
};

/// `Accept` header sent on key set fetches.
const KEY_SET_ACCEPT: &str = "application/http-message-signatures-directory+json, \
                              application/jwk-set+json;q=0.9, application/json;q=0.8";

/// An Ed25519 public key taken from a JWK.
#[derive(Clone)]
pub struct PublicKey {
    /// Key id; the RFC 7638 thumbprint when the JWK carries none.
    pub kid: String,
    /// Always `OKP`.
    pub kty: String,
    /// Always `Ed25519`.
    pub crv: String,
    /// base64url public key bytes.
    pub x: String,
    verifying_key: VerifyingKey,
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey").field("kid", &self.kid).field("crv", &self.crv).finish()
    }
}

impl PublicKey {
    /// Builds a key from raw verifying key material.
    #[must_use]
    pub fn from_verifying_key(kid: Option<String>, verifying_key: VerifyingKey) -> Self {
        let x = URL_SAFE_NO_PAD.encode(verifying_key.as_bytes());
        let kid = kid.unwrap_or_else(|| jwk_thumbprint(&x));
        Self { kid, kty: "OKP".into(), crv: "Ed25519".into(), x, verifying_key }
    }

    /// Builds a key from a JWK, accepting only `kty=OKP, crv=Ed25519`.
    ///
    /// # Errors
    ///
    /// Returns a description of why the JWK is unusable.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, String> {
        if jwk.kty != "OKP" {
            return Err(format!("unsupported kty '{}'", jwk.kty));
        }
        if jwk.crv.as_deref() != Some("Ed25519") {
            return Err("unsupported crv".into());
        }
        let x = jwk.x.as_deref().ok_or("missing x")?;
        let bytes = URL_SAFE_NO_PAD.decode(x).map_err(|err| format!("invalid base64url: {err}"))?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| format!("public key must be {PUBLIC_KEY_LENGTH} bytes"))?;
        let verifying_key =
            VerifyingKey::from_bytes(&bytes).map_err(|err| format!("invalid Ed25519 key: {err}"))?;
        Ok(Self::from_verifying_key(jwk.kid.clone(), verifying_key))
    }

    /// The Ed25519 verifying key.
    #[must_use]
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// RFC 7638 thumbprint of this key.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        jwk_thumbprint(&self.x)
    }
}

/// RFC 7638 thumbprint of an Ed25519 OKP key: members in lexicographic order,
/// no whitespace, SHA-256, base64url.
#[must_use]
pub fn jwk_thumbprint(x: &str) -> String {
    let canonical = format!(r#"{{"crv":"Ed25519","kty":"OKP","x":"{x}"}}"#);
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

/// A JSON Web Key as published in a key set. Unknown members are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type.
    pub kty: String,
    /// Curve.
    #[serde(default)]
    pub crv: Option<String>,
    /// Public key, base64url.
    #[serde(default)]
    pub x: Option<String>,
    /// Key id.
    #[serde(default)]
    pub kid: Option<String>,
    /// Lifecycle marker; `revoked` keys are skipped.
    #[serde(default, rename = "peac:status")]
    pub status: Option<String>,
}

#[derive(Deserialize)]
struct KeySetDocument {
    keys: Vec<serde_json::Value>,
}

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Fetched during this resolution.
    Fresh,
    /// Served from a fresh cache entry.
    Cached,
    /// Served from an expired entry because a refresh failed transiently.
    Stale,
}

/// A resolved key and its provenance.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    /// The key.
    pub key: Arc<PublicKey>,
    /// Provenance.
    pub source: KeySource,
}

/// Anything that can map an issuer and key id to a public key.
#[async_trait]
pub trait KeyLookup: Send + Sync {
    /// Resolves the key `keyid` for `issuer`.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolveError`] when no usable key can be produced.
    async fn resolve_key(&self, issuer: &Issuer, keyid: &str) -> Result<ResolvedKey, ResolveError>;
}

/// A key set HTTP response, reduced to what the resolver reads.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw `Cache-Control` header value.
    pub cache_control: Option<String>,
    /// Response body.
    pub body: Bytes,
}

/// Transport seam for key set retrieval.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    /// Performs a GET on `url`. Implementations must not follow redirects.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on transport failure, timeout or an oversized body.
    async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError>;
}

/// [`KeySetFetcher`] over `reqwest` with rustls, no redirects, a request
/// timeout and a streamed body cap.
#[derive(Debug, Clone)]
pub struct HttpKeySetFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpKeySetFetcher {
    /// Builds the HTTP client from resolver configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the client cannot be built.
    pub fn new(config: &KeyResolverConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.fetch_timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|err| ConfigError::invalid("key_resolver", err.to_string()))?;
        Ok(Self { client, max_body_bytes: config.max_body_bytes })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() { FetchError::Timeout } else { FetchError::Transport(err.to_string()) }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        let mut response = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, KEY_SET_ACCEPT)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let cache_control = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let limit = self.max_body_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(FetchError::BodyTooLarge { limit });
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse { status, cache_control, body: body.freeze() })
    }
}

/// A cached key with its absolute freshness deadline (unix seconds).
#[derive(Clone)]
struct CacheEntry {
    key: Arc<PublicKey>,
    expires_at: i64,
}

/// Keeps each entry for its remaining freshness plus the stale window.
struct EntryExpiry {
    clock: Arc<dyn Clock>,
    max_stale: Duration,
}

impl EntryExpiry {
    fn retention(&self, entry: &CacheEntry) -> Duration {
        let remaining = u64::try_from(entry.expires_at - self.clock.now()).unwrap_or(0);
        Duration::from_secs(remaining).saturating_add(self.max_stale)
    }
}

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.retention(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.retention(value))
    }
}

type SharedResolution = Shared<BoxFuture<'static, Result<ResolvedKey, ResolveError>>>;

/// Counters exposed by [`KeyResolver::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    /// Lookups answered from a fresh cache entry.
    pub hits: u64,
    /// Key set HTTP fetches attempted.
    pub fetches: u64,
    /// Lookups answered from an expired entry.
    pub stale_served: u64,
}

struct Inner {
    cache: Cache<String, CacheEntry>,
    in_flight: Mutex<HashMap<String, SharedResolution>>,
    fetcher: Arc<dyn KeySetFetcher>,
    clock: Arc<dyn Clock>,
    url_policy: UrlSafetyPolicy,
    config: KeyResolverConfig,
    /// Bumped on every invalidation so in-flight fetches do not re-populate
    /// the cache with keys fetched before the invalidation.
    invalidation_gen: AtomicU64,
    hits: AtomicU64,
    fetches: AtomicU64,
    stale_served: AtomicU64,
}

/// Caching, singleflighting key resolver.
///
/// Cheap to clone; clones share the cache and in-flight map.
///
/// # Examples
///
/// ```no_run
/// use reqsig_authn::{config::KeyResolverConfig, issuer::Issuer, key_resolver::KeyResolver};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let resolver = KeyResolver::builder().config(KeyResolverConfig::default()).build()?;
/// let issuer = Issuer::normalize("https://agent.example");
/// let resolved = resolver.resolve(&issuer, "key-2025-01").await?;
/// println!("resolved {} ({:?})", resolved.key.kid, resolved.source);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KeyResolver {
    inner: Arc<Inner>,
}

#[bon::bon]
impl KeyResolver {
    /// Creates a resolver.
    ///
    /// # Arguments
    ///
    /// * `config` - Resolver tuning (default: [`KeyResolverConfig::default`])
    /// * `fetcher` - Transport (default: [`HttpKeySetFetcher`] built from `config`)
    /// * `clock` - Time source (default: [`SystemClock`])
    /// * `host_predicate` - Extra host filter applied after the built-in URL rules
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid or the HTTP client cannot
    /// be built.
    #[builder]
    pub fn new(
        #[builder(default)] config: KeyResolverConfig,
        fetcher: Option<Arc<dyn KeySetFetcher>>,
        #[builder(default = Arc::new(SystemClock))] clock: Arc<dyn Clock>,
        host_predicate: Option<HostPredicate>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let fetcher = match fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpKeySetFetcher::new(&config)?),
        };

        let mut url_policy = UrlSafetyPolicy::new().with_allow_localhost(config.allow_localhost);
        if let Some(predicate) = host_predicate {
            url_policy = url_policy.with_host_predicate(move |host| predicate(host));
        }

        let cache = Cache::builder()
            .max_capacity(config.capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry { clock: Arc::clone(&clock), max_stale: config.max_stale })
            .build();

        Ok(Self {
            inner: Arc::new(Inner {
                cache,
                in_flight: Mutex::new(HashMap::new()),
                fetcher,
                clock,
                url_policy,
                config,
                invalidation_gen: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
                stale_served: AtomicU64::new(0),
            }),
        })
    }

    /// Resolves the key `keyid` published by `issuer`.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::UrlRejected`] if the discovery URL fails the safety policy
    /// - [`ResolveError::KeyNotFound`] if no path returned the key
    /// - [`ResolveError::FetchFailed`], [`ResolveError::Timeout`] or
    ///   [`ResolveError::MalformedKeySet`] when retrieval failed and no stale entry could be
    ///   served
    #[tracing::instrument(skip(self), fields(issuer = %issuer))]
    pub async fn resolve(&self, issuer: &Issuer, keyid: &str) -> Result<ResolvedKey, ResolveError> {
        let cache_key = format!("{issuer}:{keyid}");

        if let Some(entry) = self.inner.cache.get(&cache_key).await
            && self.inner.clock.now() < entry.expires_at
        {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cache = "key", "cache hit");
            return Ok(ResolvedKey { key: entry.key, source: KeySource::Cached });
        }
        tracing::debug!(cache = "key", "cache miss");

        let resolution = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&cache_key) {
                Some(existing) => {
                    tracing::debug!("joining in-flight resolution");
                    existing.clone()
                },
                None => {
                    let shared = resolve_uncached(
                        Arc::clone(&self.inner),
                        issuer.clone(),
                        keyid.to_owned(),
                        cache_key.clone(),
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(cache_key, shared.clone());
                    shared
                },
            }
        };

        resolution.await
    }

    /// Removes one key from the cache.
    ///
    /// An audit event is emitted at INFO level. Any fetch in flight at the
    /// time of the call still answers its waiters but does not write the
    /// cache.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, issuer: &Issuer, keyid: &str) {
        self.inner.invalidation_gen.fetch_add(1, Ordering::Release);
        self.inner.cache.invalidate(&format!("{issuer}:{keyid}")).await;
        tracing::info!(
            audit.action = "invalidate_key",
            audit.resource = %format_args!("issuer:{issuer}/keyid:{keyid}"),
            audit.result = "success",
            "audit_event"
        );
    }

    /// Removes every cached key. Useful during coordinated key rotation.
    #[tracing::instrument(skip(self))]
    pub async fn clear_all(&self) {
        let evicted = self.inner.cache.entry_count();
        self.inner.invalidation_gen.fetch_add(1, Ordering::Release);
        self.inner.cache.invalidate_all();
        tracing::info!(
            audit.action = "clear_key_cache",
            audit.resource = "all_keys",
            audit.result = "success",
            audit.evicted = evicted,
            "audit_event"
        );
    }

    /// Approximate number of cached entries, including entries retained for
    /// stale-if-error.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.cache.entry_count()
    }

    /// Snapshot of the resolver counters.
    #[must_use]
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            fetches: self.inner.fetches.load(Ordering::Relaxed),
            stale_served: self.inner.stale_served.load(Ordering::Relaxed),
        }
    }

    /// Number of resolutions currently in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Synchronizes pending cache operations.
    ///
    /// Call this before checking entry counts in tests.
    #[cfg(any(test, feature = "testutil"))]
    pub async fn sync(&self) {
        self.inner.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl KeyLookup for KeyResolver {
    async fn resolve_key(&self, issuer: &Issuer, keyid: &str) -> Result<ResolvedKey, ResolveError> {
        self.resolve(issuer, keyid).await
    }
}

/// The body of a shared resolution.
async fn resolve_uncached(
    inner: Arc<Inner>,
    issuer: Issuer,
    keyid: String,
    cache_key: String,
) -> Result<ResolvedKey, ResolveError> {
    let gen_before = inner.invalidation_gen.load(Ordering::Acquire);

    let result = match discover(&inner, &issuer, &keyid).await {
        Ok((key, ttl)) => {
            let key = Arc::new(key);
            if inner.invalidation_gen.load(Ordering::Acquire) == gen_before {
                let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
                let expires_at = inner.clock.now().saturating_add(ttl_secs);
                inner
                    .cache
                    .insert(cache_key.clone(), CacheEntry { key: Arc::clone(&key), expires_at })
                    .await;
                tracing::debug!(ttl_secs, kid = %key.kid, "key cached");
            } else {
                tracing::debug!(keyid, "discarding fetched key: invalidation occurred during fetch");
            }
            Ok(ResolvedKey { key, source: KeySource::Fresh })
        },
        Err(err) => stale_fallback(&inner, &cache_key, err).await,
    };

    inner.in_flight.lock().remove(&cache_key);
    result
}

async fn stale_fallback(
    inner: &Inner,
    cache_key: &str,
    err: ResolveError,
) -> Result<ResolvedKey, ResolveError> {
    if !inner.config.allow_stale_on_error || !err.is_transient() {
        return Err(err);
    }

    let Some(entry) = inner.cache.get(cache_key).await else {
        return Err(err);
    };

    let now = inner.clock.now();
    let max_stale = i64::try_from(inner.config.max_stale.as_secs()).unwrap_or(i64::MAX);
    if now > entry.expires_at.saturating_add(max_stale) {
        return Err(err);
    }

    inner.stale_served.fetch_add(1, Ordering::Relaxed);
    tracing::warn!(
        cache = "key",
        stale_secs = now - entry.expires_at,
        error = %err,
        "serving stale key: key set refresh failed"
    );
    Ok(ResolvedKey { key: entry.key, source: KeySource::Stale })
}

/// Walks the discovery paths and returns the selected key with its freshness.
async fn discover(
    inner: &Inner,
    issuer: &Issuer,
    keyid: &str,
) -> Result<(PublicKey, Duration), ResolveError> {
    let Some(origin) = issuer.origin_url() else {
        // Opaque issuers have nowhere to discover keys from.
        return Err(ResolveError::key_not_found(keyid));
    };
    inner.url_policy.check(&origin)?;

    fail_point!("key-resolver-before-fetch", |_| {
        Err(ResolveError::fetch_failed("injected failure before key set fetch"))
    });

    let mut remembered: Option<ResolveError> = None;
    for path in &inner.config.well_known_paths {
        let url = origin.join(path).map_err(|err| ResolveError::url_rejected(err.to_string()))?;
        inner.url_policy.check(&url)?;
        inner.fetches.fetch_add(1, Ordering::Relaxed);

        let response =
            match tokio::time::timeout(inner.config.fetch_timeout, inner.fetcher.fetch(&url)).await {
                Ok(Ok(response)) => response,
                Ok(Err(FetchError::Timeout)) | Err(_) => {
                    tracing::warn!(%url, "key set fetch timed out");
                    remembered = Some(ResolveError::Timeout);
                    continue;
                },
                Ok(Err(err)) => {
                    tracing::warn!(%url, error = %err, "key set fetch failed");
                    remembered = Some(ResolveError::fetch_failed(err.to_string()));
                    continue;
                },
            };

        match response.status {
            200 => {
                let keys = parse_key_set(&response.body)?;
                let ttl = freshness(&inner.config, response.cache_control.as_deref());
                return select_key(keys, keyid)
                    .map(|key| (key, ttl))
                    .ok_or_else(|| ResolveError::key_not_found(keyid));
            },
            status @ 500..=599 => {
                tracing::warn!(%url, status, "key set endpoint returned server error");
                remembered = Some(ResolveError::fetch_failed(format!("{url} returned {status}")));
            },
            status => tracing::debug!(%url, status, "no key set at path"),
        }
    }

    Err(remembered.unwrap_or_else(|| ResolveError::key_not_found(keyid)))
}

/// Parses a `{ "keys": [...] }` document into usable Ed25519 keys.
///
/// Members that are not usable keys are skipped individually. Only a
/// document that is not a key set at all is an error.
fn parse_key_set(body: &[u8]) -> Result<Vec<PublicKey>, ResolveError> {
    let document: KeySetDocument =
        serde_json::from_slice(body).map_err(|err| ResolveError::malformed(err.to_string()))?;

    let mut keys = Vec::with_capacity(document.keys.len());
    for value in document.keys {
        let Ok(jwk) = serde_json::from_value::<Jwk>(value) else {
            tracing::debug!("skipping key set member that is not a JWK");
            continue;
        };
        if jwk.status.as_deref() == Some("revoked") {
            tracing::debug!(kid = ?jwk.kid, "skipping revoked key");
            continue;
        }
        match PublicKey::from_jwk(&jwk) {
            Ok(key) => keys.push(key),
            Err(reason) => tracing::debug!(kid = ?jwk.kid, reason, "skipping unusable key"),
        }
    }
    Ok(keys)
}

/// Matches by `kid`, by the `keyid` URL fragment, or by JWK thumbprint.
fn select_key(keys: Vec<PublicKey>, keyid: &str) -> Option<PublicKey> {
    let fragment = keyid.split_once('#').map(|(_, fragment)| fragment);
    keys.into_iter().find(|key| {
        key.kid == keyid || Some(key.kid.as_str()) == fragment || key.thumbprint() == keyid
    })
}

/// Freshness lifetime from a `Cache-Control` value.
fn freshness(config: &KeyResolverConfig, cache_control: Option<&str>) -> Duration {
    let Some(header) = cache_control else {
        return config.clamp_ttl(config.default_ttl);
    };

    let mut max_age = None;
    for directive in header.split(',').map(|d| d.trim().to_ascii_lowercase()) {
        if directive == "no-store" || directive == "no-cache" {
            return config.min_ttl;
        }
        if let Some(value) = directive.strip_prefix("max-age=") {
            max_age = value.trim_matches('"').parse::<u64>().ok();
        }
    }

    config.clamp_ttl(max_age.map_or(config.default_ttl, Duration::from_secs))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;
    use tokio::task::JoinSet;

    use super::*;
    use crate::{
        clock::FixedClock,
        testutil::{ScriptedFetcher, TestKeypair},
    };

    const NOW: i64 = 1_700_000_000;
    const DIRECTORY_PATH: &str = "/.well-known/http-message-signatures-directory";
    const JWKS_PATH: &str = "/.well-known/jwks.json";

    fn issuer() -> Issuer {
        Issuer::normalize("https://agent.example")
    }

    fn resolver_with(
        fetcher: &ScriptedFetcher,
        clock: &Arc<FixedClock>,
        config: KeyResolverConfig,
    ) -> KeyResolver {
        KeyResolver::builder()
            .config(config)
            .fetcher(Arc::new(fetcher.clone()))
            .clock(Arc::clone(clock) as Arc<dyn Clock>)
            .build()
            .unwrap()
    }

    fn setup() -> (ScriptedFetcher, Arc<FixedClock>, KeyResolver, TestKeypair) {
        let keypair = TestKeypair::generate("k1");
        let fetcher = ScriptedFetcher::new();
        fetcher.respond_json(DIRECTORY_PATH, 200, Some("max-age=300"), &keypair.key_set());
        let clock = Arc::new(FixedClock::new(NOW));
        let resolver = resolver_with(&fetcher, &clock, KeyResolverConfig::default());
        (fetcher, clock, resolver, keypair)
    }

    #[tokio::test]
    async fn test_fresh_then_cached() {
        let (fetcher, _clock, resolver, keypair) = setup();

        let first = resolver.resolve(&issuer(), "k1").await.unwrap();
        assert_eq!(first.source, KeySource::Fresh);
        assert_eq!(first.key.verifying_key(), &keypair.verifying_key());

        let second = resolver.resolve(&issuer(), "k1").await.unwrap();
        assert_eq!(second.source, KeySource::Cached);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(resolver.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let (fetcher, clock, resolver, _keypair) = setup();
        resolver.resolve(&issuer(), "k1").await.unwrap();

        clock.advance(301);
        let again = resolver.resolve(&issuer(), "k1").await.unwrap();
        assert_eq!(again.source, KeySource::Fresh);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_falls_through_to_jwks_path() {
        let keypair = TestKeypair::generate("k1");
        let fetcher = ScriptedFetcher::new();
        fetcher.respond_json(DIRECTORY_PATH, 404, None, "");
        fetcher.respond_json(JWKS_PATH, 200, None, &keypair.key_set());
        let clock = Arc::new(FixedClock::new(NOW));
        let resolver = resolver_with(&fetcher, &clock, KeyResolverConfig::default());

        let resolved = resolver.resolve(&issuer(), "k1").await.unwrap();
        assert_eq!(resolved.key.kid, "k1");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_all_not_found_is_key_not_found() {
        let fetcher = ScriptedFetcher::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let resolver = resolver_with(&fetcher, &clock, KeyResolverConfig::default());

        let err = resolver.resolve(&issuer(), "k1").await.unwrap_err();
        assert_eq!(err, ResolveError::key_not_found("k1"));
    }

    #[tokio::test]
    async fn test_server_error_is_fetch_failed() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond_json(DIRECTORY_PATH, 503, None, "");
        let clock = Arc::new(FixedClock::new(NOW));
        let resolver = resolver_with(&fetcher, &clock, KeyResolverConfig::default());

        let err = resolver.resolve(&issuer(), "k1").await.unwrap_err();
        assert!(matches!(err, ResolveError::FetchFailed { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_unknown_kid_is_key_not_found() {
        let (_fetcher, _clock, resolver, _keypair) = setup();
        let err = resolver.resolve(&issuer(), "other").await.unwrap_err();
        assert_eq!(err, ResolveError::key_not_found("other"));
    }

    #[tokio::test]
    async fn test_match_by_fragment_and_thumbprint() {
        let (_fetcher, _clock, resolver, keypair) = setup();

        let by_fragment =
            resolver.resolve(&issuer(), "https://agent.example/keys#k1").await.unwrap();
        assert_eq!(by_fragment.key.kid, "k1");

        let thumbprint = keypair.thumbprint();
        let by_thumbprint = resolver.resolve(&issuer(), &thumbprint).await.unwrap();
        assert_eq!(by_thumbprint.key.kid, "k1");
    }

    #[tokio::test]
    async fn test_revoked_and_foreign_keys_are_skipped() {
        let keypair = TestKeypair::generate("k1");
        let fetcher = ScriptedFetcher::new();
        let body = serde_json::json!({
            "keys": [
                { "kty": "RSA", "kid": "k1", "n": "abc", "e": "AQAB" },
                { "kty": "OKP", "crv": "Ed25519", "kid": "k1", "x": keypair.x(), "peac:status": "revoked" },
                "not-an-object"
            ]
        });
        fetcher.respond_json(DIRECTORY_PATH, 200, None, &body.to_string());
        let clock = Arc::new(FixedClock::new(NOW));
        let resolver = resolver_with(&fetcher, &clock, KeyResolverConfig::default());

        let err = resolver.resolve(&issuer(), "k1").await.unwrap_err();
        assert_eq!(err, ResolveError::key_not_found("k1"));
    }

    #[tokio::test]
    async fn test_malformed_key_set() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond_json(DIRECTORY_PATH, 200, None, "{ not json");
        let clock = Arc::new(FixedClock::new(NOW));
        let resolver = resolver_with(&fetcher, &clock, KeyResolverConfig::default());

        let err = resolver.resolve(&issuer(), "k1").await.unwrap_err();
        assert!(matches!(err, ResolveError::MalformedKeySet { .. }));
    }

    #[tokio::test]
    async fn test_url_rejected_before_fetch() {
        let fetcher = ScriptedFetcher::new();
        let clock = Arc::new(FixedClock::new(NOW));
        let resolver = resolver_with(&fetcher, &clock, KeyResolverConfig::default());

        let err = resolver.resolve(&Issuer::normalize("https://10.0.0.8"), "k1").await.unwrap_err();
        assert!(matches!(err, ResolveError::UrlRejected { .. }));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_opaque_issuer_is_key_not_found() {
        let (fetcher, _clock, resolver, _keypair) = setup();
        let err = resolver.resolve(&Issuer::normalize("agent-7"), "k1").await.unwrap_err();
        assert_eq!(err, ResolveError::key_not_found("k1"));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_fetch() {
        let (fetcher, _clock, resolver, _keypair) = setup();
        let gate = fetcher.gate();

        let mut set = JoinSet::new();
        for _ in 0..50 {
            let resolver = resolver.clone();
            set.spawn(async move {
                resolver.resolve(&issuer(), "k1").await.map(|resolved| resolved.key.kid.clone())
            });
        }

        // Let every task reach the in-flight map before the fetch completes.
        while fetcher.calls() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.open();

        while let Some(outcome) = set.join_next().await {
            assert_eq!(outcome.unwrap().unwrap(), "k1");
        }
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(resolver.in_flight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_share_one_outcome() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond_json(DIRECTORY_PATH, 500, None, "");
        fetcher.respond_json(JWKS_PATH, 500, None, "");
        let clock = Arc::new(FixedClock::new(NOW));
        let resolver = resolver_with(&fetcher, &clock, KeyResolverConfig::default());
        let gate = fetcher.gate();

        let mut set = JoinSet::new();
        for _ in 0..20 {
            let resolver = resolver.clone();
            set.spawn(async move { resolver.resolve(&issuer(), "k1").await.map(|_| ()) });
        }
        while fetcher.calls() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.open();

        let mut outcomes = Vec::new();
        while let Some(outcome) = set.join_next().await {
            outcomes.push(outcome.unwrap().unwrap_err());
        }
        assert_eq!(fetcher.calls(), 2);
        assert!(outcomes.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn test_timeout_without_stale_entry() {
        let fetcher = ScriptedFetcher::new();
        fetcher.hang(DIRECTORY_PATH);
        fetcher.hang(JWKS_PATH);
        let clock = Arc::new(FixedClock::new(NOW));
        let config = KeyResolverConfig::builder().fetch_timeout(Duration::from_millis(20)).build();
        let resolver = resolver_with(&fetcher, &clock, config);

        let err = resolver.resolve(&issuer(), "k1").await.unwrap_err();
        assert_eq!(err, ResolveError::Timeout);
    }

    #[tokio::test]
    async fn test_stale_served_on_transient_failure() {
        let keypair = TestKeypair::generate("k1");
        let fetcher = ScriptedFetcher::new();
        fetcher.respond_json(DIRECTORY_PATH, 200, Some("max-age=60"), &keypair.key_set());
        let clock = Arc::new(FixedClock::new(NOW));
        let config = KeyResolverConfig::builder().allow_stale_on_error(true).build();
        let resolver = resolver_with(&fetcher, &clock, config);
        resolver.resolve(&issuer(), "k1").await.unwrap();

        clock.advance(120);
        fetcher.respond_json(DIRECTORY_PATH, 502, None, "");
        fetcher.respond_json(JWKS_PATH, 502, None, "");

        let stale = resolver.resolve(&issuer(), "k1").await.unwrap();
        assert_eq!(stale.source, KeySource::Stale);
        assert_eq!(resolver.stats().stale_served, 1);
    }

    #[tokio::test]
    async fn test_stale_not_served_when_disabled_or_too_old() {
        let keypair = TestKeypair::generate("k1");
        let fetcher = ScriptedFetcher::new();
        fetcher.respond_json(DIRECTORY_PATH, 200, Some("max-age=60"), &keypair.key_set());
        let clock = Arc::new(FixedClock::new(NOW));

        let strict = resolver_with(&fetcher, &clock, KeyResolverConfig::default());
        let lenient = resolver_with(
            &fetcher,
            &clock,
            KeyResolverConfig::builder().allow_stale_on_error(true).build(),
        );
        strict.resolve(&issuer(), "k1").await.unwrap();
        lenient.resolve(&issuer(), "k1").await.unwrap();

        fetcher.respond_json(DIRECTORY_PATH, 500, None, "");
        fetcher.respond_json(JWKS_PATH, 500, None, "");

        clock.advance(120);
        assert!(strict.resolve(&issuer(), "k1").await.is_err(), "stale fallback is opt-in");

        clock.advance(3_600);
        assert!(lenient.resolve(&issuer(), "k1").await.is_err(), "beyond max_stale");
    }

    #[tokio::test]
    async fn test_stale_not_served_for_key_not_found() {
        let keypair = TestKeypair::generate("k1");
        let fetcher = ScriptedFetcher::new();
        fetcher.respond_json(DIRECTORY_PATH, 200, Some("max-age=60"), &keypair.key_set());
        let clock = Arc::new(FixedClock::new(NOW));
        let config = KeyResolverConfig::builder().allow_stale_on_error(true).build();
        let resolver = resolver_with(&fetcher, &clock, config);
        resolver.resolve(&issuer(), "k1").await.unwrap();

        clock.advance(120);
        let rotated = TestKeypair::generate("k2");
        fetcher.respond_json(DIRECTORY_PATH, 200, None, &rotated.key_set());

        let err = resolver.resolve(&issuer(), "k1").await.unwrap_err();
        assert_eq!(err, ResolveError::key_not_found("k1"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let (fetcher, _clock, resolver, _keypair) = setup();
        resolver.resolve(&issuer(), "k1").await.unwrap();
        resolver.sync().await;
        assert_eq!(resolver.entry_count(), 1);

        resolver.invalidate(&issuer(), "k1").await;
        resolver.sync().await;
        assert_eq!(resolver.entry_count(), 0);

        let again = resolver.resolve(&issuer(), "k1").await.unwrap();
        assert_eq!(again.source, KeySource::Fresh);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let (_fetcher, _clock, resolver, _keypair) = setup();
        resolver.resolve(&issuer(), "k1").await.unwrap();
        resolver.clear_all().await;
        resolver.sync().await;
        assert_eq!(resolver.entry_count(), 0);
    }

    #[rstest]
    #[case::absent(None, 300)]
    #[case::max_age(Some("public, max-age=900"), 900)]
    #[case::too_small(Some("max-age=5"), 60)]
    #[case::too_large(Some("max-age=9999999"), 86_400)]
    #[case::no_store(Some("no-store"), 60)]
    #[case::no_cache(Some("max-age=600, no-cache"), 60)]
    #[case::garbage(Some("max-age=soon"), 300)]
    fn test_freshness(#[case] header: Option<&str>, #[case] expected_secs: u64) {
        let ttl = freshness(&KeyResolverConfig::default(), header);
        assert_eq!(ttl, Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_thumbprint_rfc8037_vector() {
        // RFC 8037 appendix A.3
        assert_eq!(
            jwk_thumbprint("11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo"),
            "kPrK_qmxVWaYVA9wwBF6Iuo3vVzz7TxHCTwXBygrS4k"
        );
    }
}
