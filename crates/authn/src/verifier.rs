//! Request verification orchestrator.
//!
//! [`RequestVerifier`] composes issuer policy, signature verification, tag
//! policy and replay protection into a single fail-closed [`Decision`].
//!
//! # Flow
//!
//! ```text
//! Start
//!   ├─ no allowlist and no override        → Denied(ConfigIssuerAllowlistRequired)
//!   ├─ bypass glob matches                 → Bypassed
//!   ├─ no signature headers, receipt mode  → receipt check → Allowed | Denied
//!   ├─ parse, derive issuer, allowlist
//! IssuerChecked
//!   ├─ alg, time window, key, signature    (signature::verify_parsed)
//! SignatureChecked
//!   ├─ tag policy
//! TagChecked
//!   ├─ nonce replay / nonce required
//! ReplayChecked
//!   └─ Allowed
//! Decided
//! ```
//!
//! A denial records the last state reached before the failing check.
//! Panics in any step are caught and reported as [`ErrorCode::Internal`].

use std::{fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use http::{HeaderMap, HeaderName, HeaderValue, header::WARNING};

use crate::{
    clock::{Clock, SystemClock},
    config::{DEFAULT_CLOCK_SKEW, PathPattern, SecurityPolicy, VerificationMode, VerifierConfig},
    error::{ConfigError, VerifyError},
    issuer::Issuer,
    key_resolver::{KeyLookup, KeyResolver, KeySource},
    problem::{ErrorCode, ErrorResponse, ProblemBuilder},
    receipt::{RECEIPT_HEADER, ReceiptRejection, ReceiptVerifier},
    replay::{MAX_REPLAY_WINDOW, ReplayContext, ReplayGuard},
    signature::{self, RequestView, SIGNATURE_AGENT},
};

/// Signatures expiring sooner than this produce a warning.
pub const EXPIRY_WARNING_WINDOW: i64 = 30;

/// Forwarded header carrying the verified issuer.
pub const X_VERIFIED_ISSUER: HeaderName = HeaderName::from_static("x-verified-issuer");
/// Forwarded header carrying the verified key id.
pub const X_VERIFIED_KEYID: HeaderName = HeaderName::from_static("x-verified-keyid");
/// Forwarded header carrying the signature tag.
pub const X_VERIFIED_TAG: HeaderName = HeaderName::from_static("x-verified-tag");

/// Progress through the verification state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerificationState {
    /// Nothing checked yet.
    Start,
    /// Issuer derived and allowed.
    IssuerChecked,
    /// Signature verified.
    SignatureChecked,
    /// Tag accepted.
    TagChecked,
    /// Nonce accepted.
    ReplayChecked,
    /// Allowed.
    Decided,
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::IssuerChecked => "issuer_checked",
            Self::SignatureChecked => "signature_checked",
            Self::TagChecked => "tag_checked",
            Self::ReplayChecked => "replay_checked",
            Self::Decided => "decided",
        })
    }
}

/// The credential that admitted a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// An HTTP message signature.
    Signature {
        /// How the key was obtained.
        key_source: KeySource,
    },
    /// A receipt.
    Receipt {
        /// Receipt identifier.
        receipt_id: String,
    },
}

/// Evidence attached to an allowed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowance {
    /// Verified issuer.
    pub issuer: Issuer,
    /// Key id that verified.
    pub keyid: String,
    /// Signature tag.
    pub tag: Option<String>,
    /// Covered components; empty for receipts.
    pub covered_components: Vec<String>,
    /// What verified.
    pub verified: Credential,
    /// Non-fatal observations.
    pub warnings: Vec<String>,
}

impl Allowance {
    /// Headers to forward to the upstream application.
    #[must_use]
    pub fn forward_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut put = |name: HeaderName, value: &str| match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.append(name, value);
            },
            Err(_) => tracing::debug!(header = %name, "skipping non-visible forward header value"),
        };
        put(X_VERIFIED_ISSUER, self.issuer.as_str());
        put(X_VERIFIED_KEYID, &self.keyid);
        if let Some(tag) = &self.tag {
            put(X_VERIFIED_TAG, tag);
        }
        for warning in &self.warnings {
            put(WARNING, &format!("199 reqsig \"{}\"", warning.replace('"', "'")));
        }
        headers
    }
}

/// A denied request.
#[derive(Debug, Clone)]
pub struct Denial {
    /// Last state reached.
    pub state: VerificationState,
    /// The failing check.
    pub error: VerifyError,
    /// Rendered problem response.
    pub response: ErrorResponse,
}

impl Denial {
    /// The canonical error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.error.code()
    }
}

/// Verification outcome.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Verified; forward the request.
    Allowed(Allowance),
    /// Rejected; return the response.
    Denied(Denial),
    /// The path is exempt from verification.
    Bypassed,
}

impl Decision {
    /// `true` for [`Decision::Allowed`] and [`Decision::Bypassed`].
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Denied(_))
    }

    /// The denial, if any.
    #[must_use]
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Denied(denial) => Some(denial),
            _ => None,
        }
    }

    /// The allowance, if any.
    #[must_use]
    pub fn allowance(&self) -> Option<&Allowance> {
        match self {
            Self::Allowed(allowance) => Some(allowance),
            _ => None,
        }
    }
}

/// Replay window for a signature: its own validity span, capped at
/// [`MAX_REPLAY_WINDOW`] and never below one second.
#[must_use]
pub fn replay_ttl(created: i64, expires: Option<i64>) -> Duration {
    let max = MAX_REPLAY_WINDOW.as_secs();
    let secs = match expires {
        Some(expires) => u64::try_from(expires.saturating_sub(created)).unwrap_or(0).min(max),
        None => max,
    };
    Duration::from_secs(secs.max(1))
}

/// Fail-closed request verifier. Build once, share across requests.
pub struct RequestVerifier {
    policy: SecurityPolicy,
    allowlist: Vec<Issuer>,
    bypass: Vec<PathPattern>,
    keys: Arc<dyn KeyLookup>,
    replay: Arc<dyn ReplayGuard>,
    clock: Arc<dyn Clock>,
    problems: ProblemBuilder,
    receipts: Option<Arc<dyn ReceiptVerifier>>,
    mode: VerificationMode,
    clock_skew: Duration,
}

#[bon::bon]
impl RequestVerifier {
    /// Creates a verifier.
    ///
    /// # Arguments
    ///
    /// * `policy` - Issuer, bypass, tag and replay policy (default: strict, empty allowlist)
    /// * `keys` - Public key lookup, usually a [`KeyResolver`]
    /// * `replay` - Nonce replay guard
    /// * `clock` - Time source (default: [`SystemClock`])
    /// * `problems` - Error response renderer
    /// * `receipts` - Receipt verifier; required in receipt mode
    /// * `mode` - Accepted credentials (default: signature only)
    /// * `clock_skew` - Tolerance for `created` ahead of now (default: 60 seconds)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the policy is invalid or receipt mode is
    /// selected without a receipt verifier.
    #[builder]
    pub fn new(
        #[builder(default)] policy: SecurityPolicy,
        keys: Arc<dyn KeyLookup>,
        replay: Arc<dyn ReplayGuard>,
        #[builder(default = Arc::new(SystemClock))] clock: Arc<dyn Clock>,
        #[builder(default)] problems: ProblemBuilder,
        receipts: Option<Arc<dyn ReceiptVerifier>>,
        #[builder(default)] mode: VerificationMode,
        #[builder(default = DEFAULT_CLOCK_SKEW)] clock_skew: Duration,
    ) -> Result<Self, ConfigError> {
        policy.validate()?;
        if mode == VerificationMode::SignatureOrReceipt && receipts.is_none() {
            return Err(ConfigError::MissingComponent("receipt verifier"));
        }
        if policy.requires_allowlist() {
            tracing::error!(
                "issuer allowlist is empty and allow_any_issuer is off; every request will be denied"
            );
        }
        if policy.allow_no_replay_protection {
            tracing::warn!("requests without a nonce will be accepted");
        }

        let allowlist = policy.issuer_allowlist.iter().map(|entry| Issuer::normalize(entry)).collect();
        let bypass =
            policy.bypass_paths.iter().map(|glob| PathPattern::parse(glob)).collect::<Result<_, _>>()?;

        Ok(Self {
            policy,
            allowlist,
            bypass,
            keys,
            replay,
            clock,
            problems,
            receipts,
            mode,
            clock_skew,
        })
    }

    /// Builds a verifier, including an HTTP [`KeyResolver`], from a
    /// configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any section is invalid.
    pub fn from_config(
        config: &VerifierConfig,
        replay: Arc<dyn ReplayGuard>,
        receipts: Option<Arc<dyn ReceiptVerifier>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let keys = KeyResolver::builder().config(config.key_resolver.clone()).build()?;
        Self::builder()
            .policy(config.policy.clone())
            .keys(Arc::new(keys))
            .replay(replay)
            .problems(ProblemBuilder::new(config.problem.clone()))
            .maybe_receipts(receipts)
            .mode(config.mode)
            .clock_skew(config.clock_skew)
            .build()
    }

    /// Verifies one request. Never fails and never panics; every problem
    /// becomes a [`Decision::Denied`].
    #[tracing::instrument(skip_all, fields(method = %request.method, path = %request.path()))]
    pub async fn verify(&self, request: &RequestView) -> Decision {
        let mut state = VerificationState::Start;
        let outcome = AssertUnwindSafe(self.evaluate(request, &mut state)).catch_unwind().await;

        match outcome {
            Ok(Ok(allowance)) => {
                tracing::debug!(issuer = %allowance.issuer, keyid = %allowance.keyid, "request allowed");
                Decision::Allowed(allowance)
            },
            Ok(Err(Outcome::Bypassed)) => {
                tracing::debug!("verification bypassed");
                Decision::Bypassed
            },
            Ok(Err(Outcome::Denied(error))) => self.deny(state, error, request),
            Err(_) => {
                tracing::error!(%state, "panic during request verification");
                self.deny(state, VerifyError::internal("panic during verification"), request)
            },
        }
    }

    fn deny(&self, state: VerificationState, error: VerifyError, request: &RequestView) -> Decision {
        let response = self.problems.for_error(&error, Some(request.path()));
        match error.code().status().as_u16() {
            500.. => tracing::error!(code = %error.code(), %state, error = %error, "request denied"),
            _ => tracing::warn!(code = %error.code(), %state, error = %error, "request denied"),
        }
        Decision::Denied(Denial { state, error, response })
    }

    fn check_issuer(&self, issuer: &Issuer) -> Result<(), VerifyError> {
        if self.policy.allow_any_issuer || self.allowlist.contains(issuer) {
            Ok(())
        } else {
            Err(VerifyError::IssuerNotAllowed(issuer.to_string()))
        }
    }

    async fn evaluate(
        &self,
        request: &RequestView,
        state: &mut VerificationState,
    ) -> Result<Allowance, Outcome> {
        if self.policy.requires_allowlist() {
            return Err(VerifyError::ConfigIssuerAllowlistRequired.into());
        }

        let path = request.path();
        if self.bypass.iter().any(|pattern| pattern.matches(path)) {
            return Err(Outcome::Bypassed);
        }

        if !request.has_signature() && self.mode == VerificationMode::SignatureOrReceipt {
            return self.evaluate_receipt(request, state).await;
        }

        let params = signature::parse_signature_headers(request)?;
        let issuer = Issuer::derive(&params.keyid, request.header(SIGNATURE_AGENT).as_deref());
        self.check_issuer(&issuer)?;
        *state = VerificationState::IssuerChecked;

        let now = self.clock.now();
        let evidence = signature::verify_parsed(
            request,
            &params,
            &issuer,
            self.keys.as_ref(),
            now,
            self.clock_skew,
        )
        .await?;
        *state = VerificationState::SignatureChecked;

        if let Some(tag) = &evidence.tag
            && !self.policy.allow_unknown_tags
            && !self.policy.known_tags.contains(tag)
        {
            return Err(VerifyError::TagUnknown(tag.clone()).into());
        }
        *state = VerificationState::TagChecked;

        match &evidence.nonce {
            Some(nonce) => {
                let ctx = ReplayContext {
                    issuer: issuer.clone(),
                    keyid: evidence.keyid.clone(),
                    nonce: nonce.clone(),
                    ttl: replay_ttl(evidence.created, evidence.expires),
                };
                if self.replay.seen(&ctx).await {
                    return Err(VerifyError::NonceReplay.into());
                }
            },
            None if !self.policy.allow_no_replay_protection => {
                return Err(VerifyError::NonceRequired.into());
            },
            None => {},
        }
        *state = VerificationState::ReplayChecked;

        let mut warnings = Vec::new();
        if let Some(expires) = evidence.expires
            && expires - now < EXPIRY_WARNING_WINDOW
        {
            warnings.push(format!("signature expires in {}s", expires - now));
        }
        if evidence.key_source == KeySource::Stale {
            warnings.push("verification key served from stale cache".to_owned());
        }
        *state = VerificationState::Decided;

        Ok(Allowance {
            issuer,
            keyid: evidence.keyid,
            tag: evidence.tag,
            covered_components: evidence.covered_components,
            verified: Credential::Signature { key_source: evidence.key_source },
            warnings,
        })
    }

    async fn evaluate_receipt(
        &self,
        request: &RequestView,
        state: &mut VerificationState,
    ) -> Result<Allowance, Outcome> {
        let (Some(receipt), Some(verifier)) = (request.header(RECEIPT_HEADER), &self.receipts)
        else {
            return Err(VerifyError::ReceiptMissing.into());
        };

        let admit = |issuer: &Issuer| self.check_issuer(issuer).is_ok();
        let evidence = verifier.verify_receipt(&receipt, request, &admit).await.map_err(
            |rejection| match rejection {
                ReceiptRejection::IssuerNotAllowed(issuer) => {
                    VerifyError::IssuerNotAllowed(issuer.to_string())
                },
                ReceiptRejection::Invalid(reason) => VerifyError::ReceiptInvalid(reason),
            },
        )?;
        self.check_issuer(&evidence.issuer)?;
        *state = VerificationState::Decided;

        Ok(Allowance {
            issuer: evidence.issuer,
            keyid: evidence.keyid,
            tag: None,
            covered_components: Vec::new(),
            verified: Credential::Receipt { receipt_id: evidence.receipt_id },
            warnings: Vec::new(),
        })
    }
}

/// Early exits from [`RequestVerifier::evaluate`].
enum Outcome {
    Bypassed,
    Denied(VerifyError),
}

impl From<VerifyError> for Outcome {
    fn from(err: VerifyError) -> Self {
        Self::Denied(err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use async_trait::async_trait;
    use http::StatusCode;
    use rstest::rstest;

    use super::*;
    use crate::{
        clock::FixedClock,
        error::ResolveError,
        key_resolver::ResolvedKey,
        receipt::{IssuerFilter, JwsReceiptVerifier, ReceiptEvidence},
        replay::{DisabledReplayGuard, InMemoryReplayGuard},
        testutil::{StaticKeys, TestKeypair, TestSigner, get_request},
    };

    const NOW: i64 = 1_700_000_000;
    const ISSUER: &str = "https://agent.example";

    fn keyid() -> String {
        format!("{ISSUER}/.well-known/jwks.json#k1")
    }

    fn policy() -> SecurityPolicy {
        SecurityPolicy::builder().issuer_allowlist([ISSUER]).build()
    }

    fn verifier_with(keypair: &TestKeypair, policy: SecurityPolicy) -> RequestVerifier {
        RequestVerifier::builder()
            .policy(policy)
            .keys(Arc::new(StaticKeys::with(keypair)))
            .replay(Arc::new(InMemoryReplayGuard::new(1_000)))
            .clock(Arc::new(FixedClock::new(NOW)))
            .build()
            .unwrap()
    }

    fn signed_request(keypair: &TestKeypair, nonce: Option<&str>) -> RequestView {
        let mut request = get_request("https://origin.example/articles/1");
        let mut signer =
            TestSigner::new(keypair).keyid(keyid()).created(NOW - 1).expires(NOW + 120).tag("web-bot-auth");
        if let Some(nonce) = nonce {
            signer = signer.nonce(nonce);
        }
        signer.sign(&mut request);
        request
    }

    fn denial_code(decision: &Decision) -> ErrorCode {
        decision.denial().map(Denial::code).expect("expected a denial")
    }

    #[tokio::test]
    async fn test_allowed() {
        let keypair = TestKeypair::generate("k1");
        let verifier = verifier_with(&keypair, policy());

        let decision = verifier.verify(&signed_request(&keypair, Some("n1"))).await;
        let allowance = decision.allowance().expect("allowed");
        assert_eq!(allowance.issuer.as_str(), ISSUER);
        assert_eq!(allowance.tag.as_deref(), Some("web-bot-auth"));
        assert!(allowance.warnings.is_empty());

        let headers = allowance.forward_headers();
        assert_eq!(headers[&X_VERIFIED_ISSUER], ISSUER);
        assert_eq!(headers[&X_VERIFIED_KEYID], keyid().as_str());
        assert_eq!(headers[&X_VERIFIED_TAG], "web-bot-auth");
        assert!(!headers.contains_key(WARNING));
    }

    #[tokio::test]
    async fn test_nonce_replay() {
        let keypair = TestKeypair::generate("k1");
        let verifier = verifier_with(&keypair, policy());
        let request = signed_request(&keypair, Some("n1"));

        assert!(verifier.verify(&request).await.is_admitted());
        let second = verifier.verify(&request).await;
        assert_eq!(denial_code(&second), ErrorCode::NonceReplay);
        let denial = second.denial().unwrap();
        assert_eq!(denial.state, VerificationState::TagChecked);
        assert_eq!(denial.response.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_issuer_not_allowed() {
        let keypair = TestKeypair::generate("k1");
        let policy = SecurityPolicy::builder().issuer_allowlist(["https://other.example"]).build();
        let verifier = verifier_with(&keypair, policy);

        let decision = verifier.verify(&signed_request(&keypair, Some("n1"))).await;
        assert_eq!(denial_code(&decision), ErrorCode::IssuerNotAllowed);
        assert_eq!(decision.denial().unwrap().response.status, StatusCode::FORBIDDEN);
        assert_eq!(decision.denial().unwrap().state, VerificationState::Start);
    }

    #[tokio::test]
    async fn test_allowlist_entries_are_normalized() {
        let keypair = TestKeypair::generate("k1");
        let policy = SecurityPolicy::builder().issuer_allowlist(["HTTPS://Agent.Example:443/"]).build();
        let verifier = verifier_with(&keypair, policy);

        assert!(verifier.verify(&signed_request(&keypair, Some("n1"))).await.is_admitted());
    }

    #[tokio::test]
    async fn test_empty_allowlist_denies_everything() {
        let keypair = TestKeypair::generate("k1");
        let verifier = verifier_with(&keypair, SecurityPolicy::default());

        for request in [signed_request(&keypair, Some("n1")), get_request("https://origin.example/")] {
            let decision = verifier.verify(&request).await;
            assert_eq!(denial_code(&decision), ErrorCode::ConfigIssuerAllowlistRequired);
            assert_eq!(
                decision.denial().unwrap().response.status,
                StatusCode::INTERNAL_SERVER_ERROR
            );
        }
    }

    #[tokio::test]
    async fn test_allow_any_issuer() {
        let keypair = TestKeypair::generate("k1");
        let policy = SecurityPolicy::builder().allow_any_issuer(true).build();
        let verifier = verifier_with(&keypair, policy);

        assert!(verifier.verify(&signed_request(&keypair, Some("n1"))).await.is_admitted());
    }

    #[rstest]
    #[case("/health", true)]
    #[case("/static/app.js", true)]
    #[case("/public/a/b/c", true)]
    #[case("/static/a/b", false)]
    #[case("/articles/1", false)]
    #[case("/public/../admin", false)]
    #[case("/public/%2e%2e/admin", false)]
    #[tokio::test]
    async fn test_bypass(#[case] path: &str, #[case] bypassed: bool) {
        let keypair = TestKeypair::generate("k1");
        let policy = SecurityPolicy::builder()
            .issuer_allowlist([ISSUER])
            .bypass_paths(["/health", "/static/*", "/public/**"])
            .build();
        let verifier = verifier_with(&keypair, policy);

        let decision = verifier.verify(&get_request(&format!("https://origin.example{path}"))).await;
        assert_eq!(matches!(decision, Decision::Bypassed), bypassed);
    }

    #[tokio::test]
    async fn test_missing_signature() {
        let keypair = TestKeypair::generate("k1");
        let verifier = verifier_with(&keypair, policy());

        let decision = verifier.verify(&get_request("https://origin.example/")).await;
        assert_eq!(denial_code(&decision), ErrorCode::SignatureMissing);
        let response = &decision.denial().unwrap().response;
        assert!(response.headers.contains_key(http::header::WWW_AUTHENTICATE));
        assert_eq!(response.body.instance.as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn test_unsupported_algorithm() {
        let keypair = TestKeypair::generate("k1");
        let verifier = verifier_with(&keypair, policy());
        let mut request = get_request("https://origin.example/");
        TestSigner::new(&keypair).keyid(keyid()).alg("rsa").created(NOW).nonce("n").sign(&mut request);

        let decision = verifier.verify(&request).await;
        assert_eq!(denial_code(&decision), ErrorCode::AlgorithmUnsupported);
        assert_eq!(decision.denial().unwrap().response.status, StatusCode::BAD_REQUEST);
        assert_eq!(decision.denial().unwrap().state, VerificationState::IssuerChecked);
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let keypair = TestKeypair::generate("k1");
        let mut request = get_request("https://origin.example/");
        TestSigner::new(&keypair)
            .keyid(keyid())
            .created(NOW)
            .nonce("n1")
            .tag("crawler-x")
            .sign(&mut request);

        let strict = verifier_with(&keypair, policy());
        let decision = strict.verify(&request).await;
        assert_eq!(denial_code(&decision), ErrorCode::TagUnknown);
        assert_eq!(decision.denial().unwrap().state, VerificationState::SignatureChecked);

        let mut relaxed = policy();
        relaxed.allow_unknown_tags = true;
        assert!(verifier_with(&keypair, relaxed).verify(&request).await.is_admitted());
    }

    #[tokio::test]
    async fn test_nonce_required_by_default() {
        let keypair = TestKeypair::generate("k1");
        let request = signed_request(&keypair, None);

        let decision = verifier_with(&keypair, policy()).verify(&request).await;
        assert_eq!(denial_code(&decision), ErrorCode::NonceRequired);
        assert_eq!(decision.denial().unwrap().response.status, StatusCode::UNAUTHORIZED);

        let mut relaxed = policy();
        relaxed.allow_no_replay_protection = true;
        assert!(verifier_with(&keypair, relaxed).verify(&request).await.is_admitted());
    }

    #[tokio::test]
    async fn test_key_fetch_timeout_denies() {
        let keypair = TestKeypair::generate("k1");
        let verifier = RequestVerifier::builder()
            .policy(policy())
            .keys(Arc::new(StaticKeys::failing(ResolveError::Timeout)))
            .replay(Arc::new(InMemoryReplayGuard::new(100)))
            .clock(Arc::new(FixedClock::new(NOW)))
            .build()
            .unwrap();

        let decision = verifier.verify(&signed_request(&keypair, Some("n1"))).await;
        assert_eq!(denial_code(&decision), ErrorCode::KeyFetchFailed);
    }

    #[tokio::test]
    async fn test_warnings_are_forwarded() {
        let keypair = TestKeypair::generate("k1");
        let verifier = RequestVerifier::builder()
            .policy(policy())
            .keys(Arc::new(StaticKeys::with(&keypair).with_source(KeySource::Stale)))
            .replay(Arc::new(InMemoryReplayGuard::new(100)))
            .clock(Arc::new(FixedClock::new(NOW)))
            .build()
            .unwrap();
        let mut request = get_request("https://origin.example/");
        TestSigner::new(&keypair)
            .keyid(keyid())
            .created(NOW - 50)
            .expires(NOW + 10)
            .nonce("n1")
            .sign(&mut request);

        let decision = verifier.verify(&request).await;
        let allowance = decision.allowance().expect("allowed");
        assert_eq!(allowance.warnings.len(), 2);
        let warnings: Vec<_> =
            allowance.forward_headers().get_all(WARNING).iter().map(|v| v.to_str().unwrap().to_owned()).collect();
        assert_eq!(warnings[0], "199 reqsig \"signature expires in 10s\"");
        assert_eq!(warnings[1], "199 reqsig \"verification key served from stale cache\"");
    }

    struct PanickingKeys;

    #[async_trait]
    impl KeyLookup for PanickingKeys {
        async fn resolve_key(&self, _issuer: &Issuer, _keyid: &str) -> Result<ResolvedKey, ResolveError> {
            panic!("lookup exploded");
        }
    }

    #[tokio::test]
    async fn test_panic_is_normalized() {
        let keypair = TestKeypair::generate("k1");
        let verifier = RequestVerifier::builder()
            .policy(policy())
            .keys(Arc::new(PanickingKeys))
            .replay(Arc::new(DisabledReplayGuard::new()))
            .clock(Arc::new(FixedClock::new(NOW)))
            .build()
            .unwrap();

        let decision = verifier.verify(&signed_request(&keypair, Some("n1"))).await;
        let denial = decision.denial().expect("denied");
        assert_eq!(denial.code(), ErrorCode::Internal);
        assert_eq!(denial.state, VerificationState::IssuerChecked);
        assert_eq!(denial.response.body.detail.as_deref(), Some("An internal error occurred"));
    }

    struct FixedReceipts(Result<ReceiptEvidence, ReceiptRejection>);

    #[async_trait]
    impl ReceiptVerifier for FixedReceipts {
        async fn verify_receipt(
            &self,
            _receipt: &str,
            _request: &RequestView,
            _issuer_allowed: &IssuerFilter<'_>,
        ) -> Result<ReceiptEvidence, ReceiptRejection> {
            self.0.clone()
        }
    }

    fn receipt_verifier(
        keypair: &TestKeypair,
        outcome: Result<ReceiptEvidence, ReceiptRejection>,
    ) -> RequestVerifier {
        RequestVerifier::builder()
            .policy(policy())
            .keys(Arc::new(StaticKeys::with(keypair)))
            .replay(Arc::new(InMemoryReplayGuard::new(100)))
            .clock(Arc::new(FixedClock::new(NOW)))
            .mode(VerificationMode::SignatureOrReceipt)
            .receipts(Arc::new(FixedReceipts(outcome)))
            .build()
            .unwrap()
    }

    fn receipt_evidence(issuer: &str) -> ReceiptEvidence {
        ReceiptEvidence {
            issuer: Issuer::normalize(issuer),
            keyid: "rk".into(),
            receipt_id: "r-1".into(),
        }
    }

    #[tokio::test]
    async fn test_receipt_mode() {
        let keypair = TestKeypair::generate("k1");
        let mut with_receipt = get_request("https://origin.example/paid");
        with_receipt.headers.insert(RECEIPT_HEADER, HeaderValue::from_static("a.b.c"));

        let accepting = receipt_verifier(&keypair, Ok(receipt_evidence(ISSUER)));
        let decision = accepting.verify(&with_receipt).await;
        assert_eq!(
            decision.allowance().unwrap().verified,
            Credential::Receipt { receipt_id: "r-1".into() }
        );

        let missing = accepting.verify(&get_request("https://origin.example/paid")).await;
        assert_eq!(denial_code(&missing), ErrorCode::ReceiptMissing);
        let response = &missing.denial().unwrap().response;
        assert_eq!(response.status, StatusCode::PAYMENT_REQUIRED);
        assert!(
            response.headers[http::header::WWW_AUTHENTICATE].to_str().unwrap().starts_with("Receipt ")
        );

        let rejecting = receipt_verifier(&keypair, Err(ReceiptRejection::invalid("expired")));
        assert_eq!(denial_code(&rejecting.verify(&with_receipt).await), ErrorCode::ReceiptInvalid);

        let foreign = receipt_verifier(&keypair, Ok(receipt_evidence("https://other.example")));
        assert_eq!(denial_code(&foreign.verify(&with_receipt).await), ErrorCode::IssuerNotAllowed);
    }

    #[tokio::test]
    async fn test_receipt_from_foreign_issuer_skips_key_lookup() {
        let keypair = TestKeypair::generate("k1");
        let keys = Arc::new(StaticKeys::with(&keypair));
        let receipts = JwsReceiptVerifier::builder()
            .keys(Arc::clone(&keys) as Arc<dyn KeyLookup>)
            .clock(Arc::new(FixedClock::new(NOW)))
            .build();
        let verifier = RequestVerifier::builder()
            .policy(policy())
            .keys(Arc::clone(&keys) as Arc<dyn KeyLookup>)
            .replay(Arc::new(InMemoryReplayGuard::new(100)))
            .clock(Arc::new(FixedClock::new(NOW)))
            .mode(VerificationMode::SignatureOrReceipt)
            .receipts(Arc::new(receipts))
            .build()
            .unwrap();

        let receipt = keypair.sign_receipt(&serde_json::json!({
            "iss": "https://attacker.example",
            "iat": NOW - 5,
            "exp": NOW + 60,
            "receipt_id": "r-9",
        }));
        let mut request = get_request("https://origin.example/paid");
        request.headers.insert(RECEIPT_HEADER, HeaderValue::from_str(&receipt).unwrap());

        let decision = verifier.verify(&request).await;
        assert_eq!(denial_code(&decision), ErrorCode::IssuerNotAllowed);
        assert_eq!(keys.calls(), 0);

        let allowed = keypair.sign_receipt(&serde_json::json!({
            "iss": ISSUER,
            "iat": NOW - 5,
            "exp": NOW + 60,
            "receipt_id": "r-10",
        }));
        request.headers.insert(RECEIPT_HEADER, HeaderValue::from_str(&allowed).unwrap());
        let decision = verifier.verify(&request).await;
        assert_eq!(
            decision.allowance().unwrap().verified,
            Credential::Receipt { receipt_id: "r-10".into() }
        );
        assert_eq!(keys.calls(), 1);
    }

    #[tokio::test]
    async fn test_receipt_mode_still_verifies_signatures() {
        let keypair = TestKeypair::generate("k1");
        let verifier = receipt_verifier(&keypair, Err(ReceiptRejection::invalid("unused")));

        let decision = verifier.verify(&signed_request(&keypair, Some("n1"))).await;
        assert!(matches!(
            decision.allowance().unwrap().verified,
            Credential::Signature { key_source: KeySource::Cached }
        ));
    }

    #[test]
    fn test_receipt_mode_requires_verifier() {
        let keypair = TestKeypair::generate("k1");
        let result = RequestVerifier::builder()
            .policy(policy())
            .keys(Arc::new(StaticKeys::with(&keypair)))
            .replay(Arc::new(InMemoryReplayGuard::new(100)))
            .mode(VerificationMode::SignatureOrReceipt)
            .build();
        assert!(matches!(result, Err(ConfigError::MissingComponent(_))));
    }

    #[test]
    fn test_invalid_bypass_glob_rejected() {
        let keypair = TestKeypair::generate("k1");
        let result = RequestVerifier::builder()
            .policy(SecurityPolicy::builder().allow_any_issuer(true).bypass_paths(["health"]).build())
            .keys(Arc::new(StaticKeys::with(&keypair)))
            .replay(Arc::new(InMemoryReplayGuard::new(100)))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[rstest]
    #[case::span(100, Some(160), 60)]
    #[case::capped(100, Some(10_000), 300)]
    #[case::no_expiry(100, None, 300)]
    #[case::inverted(100, Some(50), 1)]
    #[case::zero(100, Some(100), 1)]
    fn test_replay_ttl(#[case] created: i64, #[case] expires: Option<i64>, #[case] secs: u64) {
        assert_eq!(replay_ttl(created, expires), Duration::from_secs(secs));
    }

    #[test]
    fn test_from_config() {
        let config = VerifierConfig::from_json_str(
            r#"{ "policy": { "issuer_allowlist": ["https://agent.example"] } }"#,
        )
        .unwrap();
        let verifier =
            RequestVerifier::from_config(&config, Arc::new(InMemoryReplayGuard::new(10)), None);
        assert!(verifier.is_ok());
    }
}
