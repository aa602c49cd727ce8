//! Shared test utilities for request verification testing.
//!
//! This module provides Ed25519 key pairs that publish themselves as JWK
//! sets, a request signer, a scripted key set fetcher and a static key
//! lookup. It is feature-gated behind `testutil` to prevent leaking into
//! production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! reqsig-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! Then sign a request:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use reqsig_authn::testutil::{TestKeypair, TestSigner, get_request};
//!
//! let keypair = TestKeypair::generate("k1");
//! let mut request = get_request("https://origin.example/");
//! TestSigner::new(&keypair).nonce("n1").sign(&mut request);
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use http::{HeaderMap, HeaderValue, Method, Uri};
use parking_lot::Mutex;
use rand_core::OsRng;
use serde_json::json;
use tokio::sync::Notify;
use url::Url;

use crate::{
    error::{FetchError, ResolveError},
    issuer::Issuer,
    key_resolver::{
        FetchResponse, KeyLookup, KeySetFetcher, KeySource, PublicKey, ResolvedKey, jwk_thumbprint,
    },
    signature::{self, RequestView, SIGNATURE, SIGNATURE_INPUT},
    structured::{BareItem, InnerList, Item, Parameters, serialize_inner_list},
};

/// An Ed25519 key pair with a key id.
pub struct TestKeypair {
    kid: String,
    signing_key: SigningKey,
}

impl TestKeypair {
    /// Generates a fresh random key pair.
    #[must_use]
    pub fn generate(kid: &str) -> Self {
        Self { kid: kid.to_owned(), signing_key: SigningKey::generate(&mut OsRng) }
    }

    /// Key id.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public half.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// base64url public key, the JWK `x` member.
    #[must_use]
    pub fn x(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key().as_bytes())
    }

    /// RFC 7638 thumbprint.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        jwk_thumbprint(&self.x())
    }

    /// The public key as the resolver would produce it.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(Some(self.kid.clone()), self.verifying_key())
    }

    /// The public JWK.
    #[must_use]
    pub fn jwk(&self) -> serde_json::Value {
        json!({ "kty": "OKP", "crv": "Ed25519", "kid": self.kid, "x": self.x() })
    }

    /// A `{ "keys": [...] }` document holding only this key.
    #[must_use]
    pub fn key_set(&self) -> String {
        json!({ "keys": [self.jwk()] }).to_string()
    }

    /// Signs raw bytes.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Issues a compact EdDSA JWS receipt carrying `claims`.
    #[must_use]
    pub fn sign_receipt(&self, claims: &serde_json::Value) -> String {
        let header = json!({ "alg": "EdDSA", "typ": "peac.receipt/0.9", "kid": self.kid });
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let signature = self.sign(signing_input.as_bytes());
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature))
    }
}

/// A `GET` request view for `url`.
///
/// # Panics
///
/// Panics if `url` is not a valid URI.
#[must_use]
pub fn get_request(url: &str) -> RequestView {
    RequestView::new(Method::GET, url.parse::<Uri>().expect("valid test URI"), HeaderMap::new())
}

/// Signs [`RequestView`]s the way an agent would.
///
/// Defaults: label `sig1`, the key pair's kid, `alg="ed25519"`, `created`
/// now, components `@method @authority @path`, no `expires`, `nonce` or `tag`.
pub struct TestSigner<'a> {
    keypair: &'a TestKeypair,
    label: String,
    keyid: String,
    alg: String,
    created: i64,
    expires: Option<i64>,
    nonce: Option<String>,
    tag: Option<String>,
    extra: Vec<(String, BareItem)>,
    components: Vec<String>,
}

impl<'a> TestSigner<'a> {
    /// Creates a signer with the defaults above.
    #[must_use]
    pub fn new(keypair: &'a TestKeypair) -> Self {
        Self {
            keypair,
            label: "sig1".to_owned(),
            keyid: keypair.kid.clone(),
            alg: "ed25519".to_owned(),
            created: chrono::Utc::now().timestamp(),
            expires: None,
            nonce: None,
            tag: None,
            extra: Vec::new(),
            components: ["@method", "@authority", "@path"].map(String::from).to_vec(),
        }
    }

    /// Dictionary label.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// `keyid` parameter.
    #[must_use]
    pub fn keyid(mut self, keyid: impl Into<String>) -> Self {
        self.keyid = keyid.into();
        self
    }

    /// `alg` parameter. The signature is still Ed25519.
    #[must_use]
    pub fn alg(mut self, alg: impl Into<String>) -> Self {
        self.alg = alg.into();
        self
    }

    /// `created` parameter.
    #[must_use]
    pub fn created(mut self, created: i64) -> Self {
        self.created = created;
        self
    }

    /// `expires` parameter.
    #[must_use]
    pub fn expires(mut self, expires: i64) -> Self {
        self.expires = Some(expires);
        self
    }

    /// `nonce` parameter.
    #[must_use]
    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// `tag` parameter.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Additional signature parameter, appended after the standard ones.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: BareItem) -> Self {
        self.extra.push((name.into(), value));
        self
    }

    /// Covered components, replacing the defaults.
    #[must_use]
    pub fn components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components = components.into_iter().map(Into::into).collect();
        self
    }

    /// Adds `Signature-Input` and `Signature` headers to `request`.
    ///
    /// # Panics
    ///
    /// Panics if a covered component cannot be derived from `request`.
    pub fn sign(self, request: &mut RequestView) {
        let mut params = Parameters::default();
        params.insert("created", BareItem::Integer(self.created));
        if let Some(expires) = self.expires {
            params.insert("expires", BareItem::Integer(expires));
        }
        params.insert("keyid", BareItem::String(self.keyid));
        params.insert("alg", BareItem::String(self.alg));
        if let Some(nonce) = self.nonce {
            params.insert("nonce", BareItem::String(nonce));
        }
        if let Some(tag) = self.tag {
            params.insert("tag", BareItem::String(tag));
        }
        for (name, value) in self.extra {
            params.insert(name, value);
        }

        let inner_list = InnerList {
            items: self
                .components
                .iter()
                .map(|name| Item { bare: BareItem::String(name.clone()), params: Parameters::default() })
                .collect(),
            params,
        };
        let signature_params = serialize_inner_list(&inner_list);
        let base = signature::signature_base(request, &self.components, &signature_params)
            .expect("covered components must be derivable");
        let signature = self.keypair.sign(base.as_bytes());

        let input = format!("{}={signature_params}", self.label);
        let value = format!("{}=:{}:", self.label, STANDARD.encode(signature));
        request.headers.insert(SIGNATURE_INPUT, HeaderValue::from_str(&input).expect("header"));
        request.headers.insert(SIGNATURE, HeaderValue::from_str(&value).expect("header"));
    }
}

/// [`KeyLookup`] over a fixed set of keys, or a fixed failure.
///
/// Matches by exact key id or by the fragment of a URL key id. Ignores the
/// issuer.
pub struct StaticKeys {
    keys: HashMap<String, Arc<PublicKey>>,
    error: Option<ResolveError>,
    source: KeySource,
    calls: AtomicUsize,
}

impl StaticKeys {
    /// No keys; every lookup is `KeyNotFound`.
    #[must_use]
    pub fn empty() -> Self {
        Self { keys: HashMap::new(), error: None, source: KeySource::Cached, calls: AtomicUsize::new(0) }
    }

    /// Serves `keypair`'s public key.
    #[must_use]
    pub fn with(keypair: &TestKeypair) -> Self {
        Self::empty().and(keypair)
    }

    /// Adds another key.
    #[must_use]
    pub fn and(mut self, keypair: &TestKeypair) -> Self {
        self.keys.insert(keypair.kid.clone(), Arc::new(keypair.public_key()));
        self
    }

    /// Fails every lookup with `error`.
    #[must_use]
    pub fn failing(error: ResolveError) -> Self {
        Self { error: Some(error), ..Self::empty() }
    }

    /// Reports `source` as the provenance of every key served.
    #[must_use]
    pub fn with_source(mut self, source: KeySource) -> Self {
        self.source = source;
        self
    }

    /// Number of lookups performed.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyLookup for StaticKeys {
    async fn resolve_key(&self, _issuer: &Issuer, keyid: &str) -> Result<ResolvedKey, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let fragment = keyid.split_once('#').map_or(keyid, |(_, fragment)| fragment);
        self.keys
            .get(keyid)
            .or_else(|| self.keys.get(fragment))
            .map(|key| ResolvedKey { key: Arc::clone(key), source: self.source })
            .ok_or_else(|| ResolveError::key_not_found(keyid))
    }
}

#[derive(Clone)]
enum Route {
    Respond(FetchResponse),
    Fail(FetchError),
    Hang,
}

/// Holds fetches until [`FetchGate::open`] is called.
#[derive(Default)]
pub struct FetchGate {
    open: AtomicBool,
    notify: Notify,
}

impl FetchGate {
    /// Releases every waiting and future fetch.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.open.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct ScriptedInner {
    routes: Mutex<HashMap<String, Route>>,
    requested: Mutex<Vec<Url>>,
    gate: Mutex<Option<Arc<FetchGate>>>,
    calls: AtomicUsize,
}

/// [`KeySetFetcher`] answering from per-path scripts. Unscripted paths
/// return `404`. Clones share scripts and counters.
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    inner: Arc<ScriptedInner>,
}

impl ScriptedFetcher {
    /// Creates a fetcher with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `path` with `status`, `Cache-Control` and `body`.
    pub fn respond_json(&self, path: &str, status: u16, cache_control: Option<&str>, body: &str) {
        let response = FetchResponse {
            status,
            cache_control: cache_control.map(str::to_owned),
            body: Bytes::copy_from_slice(body.as_bytes()),
        };
        self.inner.routes.lock().insert(path.to_owned(), Route::Respond(response));
    }

    /// Fails `path` with a transport error.
    pub fn fail(&self, path: &str, error: FetchError) {
        self.inner.routes.lock().insert(path.to_owned(), Route::Fail(error));
    }

    /// Never answers `path`.
    pub fn hang(&self, path: &str) {
        self.inner.routes.lock().insert(path.to_owned(), Route::Hang);
    }

    /// Installs a gate that holds every fetch until opened.
    #[must_use]
    pub fn gate(&self) -> Arc<FetchGate> {
        let gate = Arc::new(FetchGate::default());
        *self.inner.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Number of fetches started.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// URLs fetched, in order.
    #[must_use]
    pub fn requested_urls(&self) -> Vec<Url> {
        self.inner.requested.lock().clone()
    }
}

#[async_trait]
impl KeySetFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.requested.lock().push(url.clone());

        let gate = self.inner.gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }

        let route = self.inner.routes.lock().get(url.path()).cloned();
        match route {
            Some(Route::Respond(response)) => Ok(response),
            Some(Route::Fail(error)) => Err(error),
            Some(Route::Hang) => std::future::pending().await,
            None => Ok(FetchResponse { status: 404, cache_control: None, body: Bytes::new() }),
        }
    }
}

/// Asserts that a [`Decision`](crate::verifier::Decision) is a denial with
/// the given [`ErrorCode`](crate::problem::ErrorCode) variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use reqsig_authn::{assert_denied, verifier::Decision};
///
/// # fn check(decision: Decision) {
/// assert_denied!(decision, NonceReplay);
/// # }
/// ```
#[macro_export]
macro_rules! assert_denied {
    ($decision:expr, $code:ident) => {
        match &$decision {
            $crate::verifier::Decision::Denied(denial) => assert_eq!(
                denial.code(),
                $crate::problem::ErrorCode::$code,
                "expected denial with {}, got {:?}",
                stringify!($code),
                denial.error,
            ),
            other => panic!("expected denial with {}, got {:?}", stringify!($code), other),
        }
    };
}
