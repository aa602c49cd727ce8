//! Verifier configuration.
//!
//! Configuration is read once at startup, either deserialized from JSON
//! ([`VerifierConfig::from_json_str`]) or assembled with the `bon` builders.
//! Durations use `humantime` notation (`"10s"`, `"5m"`, `"24h"`).
//!
//! # Example
//!
//! ```
//! use reqsig_authn::config::VerifierConfig;
//!
//! let config = VerifierConfig::from_json_str(r#"{
//!     "policy": { "issuer_allowlist": ["https://agent.example"] },
//!     "key_resolver": { "fetch_timeout": "5s" },
//!     "clock_skew": "30s"
//! }"#)?;
//! assert_eq!(config.clock_skew.as_secs(), 30);
//! # Ok::<(), reqsig_authn::error::ConfigError>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, problem::ProblemConfig};

/// Default timeout for a single key set fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Freshness applied when a key set response carries no usable `max-age`.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(300);

/// Lower bound on key cache freshness.
pub const MIN_KEY_TTL: Duration = Duration::from_secs(60);

/// Upper bound on key cache freshness.
pub const MAX_KEY_TTL: Duration = Duration::from_secs(86_400);

/// How long past expiry an entry may still be served under stale-if-error.
pub const DEFAULT_MAX_STALE: Duration = Duration::from_secs(3_600);

/// Default key cache capacity.
pub const DEFAULT_KEY_CACHE_CAPACITY: u64 = 10_000;

/// Default cap on key set response bodies (1 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Default tolerance for `created` timestamps ahead of the verifier clock.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Well-known discovery paths, tried in order.
pub const DEFAULT_WELL_KNOWN_PATHS: [&str; 2] =
    ["/.well-known/http-message-signatures-directory", "/.well-known/jwks.json"];

/// Signature tags accepted unless `allow_unknown_tags` is set.
pub const DEFAULT_KNOWN_TAGS: [&str; 3] = ["web-bot-auth", "agent-browser-auth", "agent-payer-auth"];

fn default_known_tags() -> Vec<String> {
    DEFAULT_KNOWN_TAGS.iter().map(|tag| (*tag).to_owned()).collect()
}

fn default_well_known_paths() -> Vec<String> {
    DEFAULT_WELL_KNOWN_PATHS.iter().map(|path| (*path).to_owned()).collect()
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_key_ttl() -> Duration {
    DEFAULT_KEY_TTL
}

fn default_min_ttl() -> Duration {
    MIN_KEY_TTL
}

fn default_max_ttl() -> Duration {
    MAX_KEY_TTL
}

fn default_max_stale() -> Duration {
    DEFAULT_MAX_STALE
}

fn default_capacity() -> u64 {
    DEFAULT_KEY_CACHE_CAPACITY
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_user_agent() -> String {
    concat!("reqsig-authn/", env!("CARGO_PKG_VERSION")).to_owned()
}

fn default_clock_skew() -> Duration {
    DEFAULT_CLOCK_SKEW
}

/// Security policy applied by the verification orchestrator.
///
/// Every relaxation defaults to off. An empty allowlist without
/// `allow_any_issuer` is a configuration error surfaced on every request
/// rather than an open door.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityPolicy {
    /// Issuers (origins or opaque identifiers) allowed to sign requests.
    #[serde(default)]
    #[builder(default, with = |iter: impl IntoIterator<Item = impl Into<String>>| {
        iter.into_iter().map(Into::into).collect()
    })]
    pub issuer_allowlist: Vec<String>,

    /// Path globs that skip verification. `*` matches within one segment,
    /// `**` matches any number of segments.
    #[serde(default)]
    #[builder(default, with = |iter: impl IntoIterator<Item = impl Into<String>>| {
        iter.into_iter().map(Into::into).collect()
    })]
    pub bypass_paths: Vec<String>,

    /// Accept any issuer, even with an empty allowlist.
    #[serde(default)]
    #[builder(default)]
    pub allow_any_issuer: bool,

    /// Accept signatures whose `tag` is not in `known_tags`.
    #[serde(default)]
    #[builder(default)]
    pub allow_unknown_tags: bool,

    /// Accept signatures without a `nonce`.
    #[serde(default)]
    #[builder(default)]
    pub allow_no_replay_protection: bool,

    /// Recognized signature tags.
    #[serde(default = "default_known_tags")]
    #[builder(default = default_known_tags(), with = |iter: impl IntoIterator<Item = impl Into<String>>| {
        iter.into_iter().map(Into::into).collect()
    })]
    pub known_tags: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SecurityPolicy {
    /// Returns `true` when the policy would deny every request with
    /// `ConfigIssuerAllowlistRequired`.
    #[must_use]
    pub fn requires_allowlist(&self) -> bool {
        self.issuer_allowlist.is_empty() && !self.allow_any_issuer
    }

    /// Startup checks.
    ///
    /// An empty allowlist is not reported here; the verifier denies each
    /// request with `ConfigIssuerAllowlistRequired` instead.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed bypass globs or
    /// blank allowlist entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for pattern in &self.bypass_paths {
            PathPattern::parse(pattern)?;
        }
        if self.issuer_allowlist.iter().any(|issuer| issuer.trim().is_empty()) {
            return Err(ConfigError::invalid("issuer_allowlist", "entries must not be blank"));
        }
        if self.known_tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(ConfigError::invalid("known_tags", "entries must not be blank"));
        }
        Ok(())
    }
}

/// Key resolver tuning.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyResolverConfig {
    /// Timeout for one key set fetch.
    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    #[builder(default = DEFAULT_FETCH_TIMEOUT)]
    pub fetch_timeout: Duration,

    /// Freshness when the response has no `max-age`.
    #[serde(with = "humantime_serde", default = "default_key_ttl")]
    #[builder(default = DEFAULT_KEY_TTL)]
    pub default_ttl: Duration,

    /// Lower clamp on freshness.
    #[serde(with = "humantime_serde", default = "default_min_ttl")]
    #[builder(default = MIN_KEY_TTL)]
    pub min_ttl: Duration,

    /// Upper clamp on freshness.
    #[serde(with = "humantime_serde", default = "default_max_ttl")]
    #[builder(default = MAX_KEY_TTL)]
    pub max_ttl: Duration,

    /// How long past expiry an entry is retained for stale-if-error.
    #[serde(with = "humantime_serde", default = "default_max_stale")]
    #[builder(default = DEFAULT_MAX_STALE)]
    pub max_stale: Duration,

    /// Maximum number of cached keys.
    #[serde(default = "default_capacity")]
    #[builder(default = DEFAULT_KEY_CACHE_CAPACITY)]
    pub capacity: u64,

    /// Cap on key set response bodies.
    #[serde(default = "default_max_body_bytes")]
    #[builder(default = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Discovery paths, tried in order under the issuer origin.
    #[serde(default = "default_well_known_paths")]
    #[builder(default = default_well_known_paths())]
    pub well_known_paths: Vec<String>,

    /// `User-Agent` sent on key set fetches.
    #[serde(default = "default_user_agent")]
    #[builder(default = default_user_agent(), into)]
    pub user_agent: String,

    /// Permit `localhost` and loopback discovery URLs (development only).
    #[serde(default)]
    #[builder(default)]
    pub allow_localhost: bool,

    /// Serve an expired key when a refresh fails transiently.
    #[serde(default)]
    #[builder(default)]
    pub allow_stale_on_error: bool,
}

impl Default for KeyResolverConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl KeyResolverConfig {
    /// Startup checks.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a bound is inverted or zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::invalid("fetch_timeout", "must be greater than zero"));
        }
        if self.min_ttl > self.max_ttl {
            return Err(ConfigError::invalid(
                "min_ttl",
                format!("{:?} exceeds max_ttl {:?}", self.min_ttl, self.max_ttl),
            ));
        }
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be greater than zero"));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::invalid("max_body_bytes", "must be greater than zero"));
        }
        if self.well_known_paths.is_empty() {
            return Err(ConfigError::invalid("well_known_paths", "at least one path is required"));
        }
        if let Some(path) = self.well_known_paths.iter().find(|path| !path.starts_with('/')) {
            return Err(ConfigError::invalid(
                "well_known_paths",
                format!("'{path}' must start with '/'"),
            ));
        }
        Ok(())
    }

    /// Clamps a freshness lifetime into `[min_ttl, max_ttl]`.
    #[must_use]
    pub fn clamp_ttl(&self, ttl: Duration) -> Duration {
        ttl.clamp(self.min_ttl, self.max_ttl)
    }
}

/// What a request may present to be allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// Only an HTTP message signature is accepted.
    #[default]
    SignatureOnly,
    /// A signature is preferred; without one, a `PEAC-Receipt` header is
    /// checked by the configured receipt verifier.
    SignatureOrReceipt,
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifierConfig {
    /// Issuer, bypass, tag and replay policy.
    #[serde(default)]
    pub policy: SecurityPolicy,

    /// Key discovery and caching.
    #[serde(default)]
    pub key_resolver: KeyResolverConfig,

    /// Error response rendering.
    #[serde(default)]
    pub problem: ProblemConfig,

    /// Tolerance for `created` ahead of the verifier clock.
    #[serde(with = "humantime_serde", default = "default_clock_skew")]
    pub clock_skew: Duration,

    /// Accepted credential kinds.
    #[serde(default)]
    pub mode: VerificationMode,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            policy: SecurityPolicy::default(),
            key_resolver: KeyResolverConfig::default(),
            problem: ProblemConfig::default(),
            clock_skew: DEFAULT_CLOCK_SKEW,
            mode: VerificationMode::default(),
        }
    }
}

impl VerifierConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or unknown fields and
    /// [`ConfigError::InvalidValue`] when validation fails.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()?;
        self.key_resolver.validate()?;
        self.problem.validate()?;
        Ok(())
    }
}

/// A compiled bypass path glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// `**`: zero or more whole segments.
    Any,
    /// A literal segment, possibly containing `*` wildcards.
    Glob(String),
}

impl PathPattern {
    /// Compiles a glob such as `/health`, `/static/*` or `/public/**`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the pattern does not start
    /// with `/` or uses `**` inside a segment.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let Some(rest) = pattern.strip_prefix('/') else {
            return Err(ConfigError::invalid(
                "bypass_paths",
                format!("'{pattern}' must start with '/'"),
            ));
        };

        let mut segments = Vec::new();
        for part in rest.split('/') {
            if part == "**" {
                segments.push(Segment::Any);
            } else if part.contains("**") {
                return Err(ConfigError::invalid(
                    "bypass_paths",
                    format!("'{pattern}': '**' must be a whole segment"),
                ));
            } else {
                segments.push(Segment::Glob(part.to_owned()));
            }
        }
        Ok(Self { segments })
    }

    /// Returns `true` if `path` (without query) matches the pattern.
    ///
    /// Paths that an upstream could normalize to a different target (dot
    /// segments, literal or encoded, and any form of `\\` or encoded `/`)
    /// never match.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix('/') else {
            return false;
        };
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.iter().any(|part| is_ambiguous_segment(part)) {
            return false;
        }
        match_segments(&self.segments, &parts)
    }
}

fn is_ambiguous_segment(segment: &str) -> bool {
    let lowered = segment.to_ascii_lowercase();
    if lowered.contains('\\') || lowered.contains("%2f") || lowered.contains("%5c") {
        return true;
    }
    let decoded = lowered.replace("%2e", ".");
    decoded == "." || decoded == ".."
}

fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
    match pattern.split_first() {
        None => parts.is_empty(),
        Some((Segment::Any, tail)) => {
            (0..=parts.len()).any(|skip| match_segments(tail, &parts[skip..]))
        },
        Some((Segment::Glob(glob), tail)) => match parts.split_first() {
            Some((part, rest)) => {
                glob_match(glob.as_bytes(), part.as_bytes()) && match_segments(tail, rest)
            },
            None => false,
        },
    }
}

/// Single-segment glob where `*` matches any run of bytes.
fn glob_match(glob: &[u8], text: &[u8]) -> bool {
    let (mut g, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if g < glob.len() && glob[g] == b'*' {
            backtrack = Some((g, t));
            g += 1;
        } else if g < glob.len() && glob[g] == text[t] {
            g += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            g = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    glob[g..].iter().all(|&b| b == b'*')
}
