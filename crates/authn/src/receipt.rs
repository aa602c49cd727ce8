//! Receipt-based admission.
//!
//! In [`VerificationMode::SignatureOrReceipt`](crate::config::VerificationMode)
//! a request without signature headers may instead present a `PEAC-Receipt`
//! header: a compact JWS issued by a payment or policy service. The
//! orchestrator hands that header to a [`ReceiptVerifier`] together with its
//! issuer policy.
//!
//! [`JwsReceiptVerifier`] accepts EdDSA compact JWS receipts whose signing
//! key is resolved through the same [`KeyLookup`] used for request signatures.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header, errors::ErrorKind,
};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{
    clock::{Clock, SystemClock},
    issuer::Issuer,
    key_resolver::KeyLookup,
    signature::RequestView,
};

/// Receipt header name.
pub const RECEIPT_HEADER: &str = "peac-receipt";

/// Accepted JWS `alg` values for receipts.
pub const ACCEPTED_RECEIPT_ALGORITHMS: &[Algorithm] = &[Algorithm::EdDSA];

/// Default maximum receipt age.
pub const DEFAULT_RECEIPT_MAX_AGE: Duration = Duration::from_secs(3600);

/// Default tolerance for receipt time claims.
pub const DEFAULT_RECEIPT_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Issuer policy handed to a [`ReceiptVerifier`]. Returns `true` for issuers
/// whose receipts may be checked.
pub type IssuerFilter<'a> = dyn Fn(&Issuer) -> bool + Send + Sync + 'a;

/// What an accepted receipt established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptEvidence {
    /// Receipt issuer.
    pub issuer: Issuer,
    /// Key id that signed the receipt.
    pub keyid: String,
    /// Receipt identifier.
    pub receipt_id: String,
}

/// Why a receipt was rejected. Reasons are for logs only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ReceiptRejection {
    /// The receipt failed a structural, time, binding or signature check.
    #[error("receipt rejected: {0}")]
    Invalid(String),

    /// The receipt names an issuer the policy does not admit. No key lookup
    /// was performed.
    #[error("receipt issuer not allowed: {0}")]
    IssuerNotAllowed(Issuer),
}

impl ReceiptRejection {
    /// Creates an [`Invalid`](Self::Invalid) rejection.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

/// Receipt verification seam.
#[async_trait]
pub trait ReceiptVerifier: Send + Sync {
    /// Verifies the raw `PEAC-Receipt` value presented with `request`.
    ///
    /// Implementations must consult `issuer_allowed` before any key lookup
    /// or other outbound work.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptRejection`] when the receipt must not admit the request.
    async fn verify_receipt(
        &self,
        receipt: &str,
        request: &RequestView,
        issuer_allowed: &IssuerFilter<'_>,
    ) -> Result<ReceiptEvidence, ReceiptRejection>;
}

#[derive(Debug, Deserialize)]
struct ReceiptClaims {
    iss: String,
    iat: i64,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
    receipt_id: String,
    #[serde(default)]
    resource_uri: Option<String>,
}

/// Verifies EdDSA compact JWS receipts.
pub struct JwsReceiptVerifier {
    keys: Arc<dyn KeyLookup>,
    clock: Arc<dyn Clock>,
    audience: Option<String>,
    max_age: Duration,
    clock_skew: Duration,
}

#[bon::bon]
impl JwsReceiptVerifier {
    /// Creates a verifier.
    ///
    /// # Arguments
    ///
    /// * `keys` - Resolves `(iss, kid)` to the receipt signing key
    /// * `clock` - Time source (default: [`SystemClock`])
    /// * `audience` - Required `aud` member, if any
    /// * `max_age` - Oldest acceptable `iat` (default: 1 hour)
    /// * `clock_skew` - Tolerance for `iat`, `nbf` and `exp` (default: 30 seconds)
    #[builder]
    pub fn new(
        keys: Arc<dyn KeyLookup>,
        #[builder(default = Arc::new(SystemClock))] clock: Arc<dyn Clock>,
        #[builder(into)] audience: Option<String>,
        #[builder(default = DEFAULT_RECEIPT_MAX_AGE)] max_age: Duration,
        #[builder(default = DEFAULT_RECEIPT_CLOCK_SKEW)] clock_skew: Duration,
    ) -> Self {
        Self { keys, clock, audience, max_age, clock_skew }
    }

    /// Validation for the signed decode. Time claims are checked against the
    /// injected clock in [`Self::check_times`] instead.
    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.algorithms = ACCEPTED_RECEIPT_ALGORITHMS.to_vec();
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        match &self.audience {
            Some(audience) => {
                validation.set_audience(&[audience]);
                validation.required_spec_claims.insert("aud".to_owned());
            },
            None => validation.validate_aud = false,
        }
        validation
    }

    fn check_times(&self, claims: &ReceiptClaims) -> Result<(), ReceiptRejection> {
        let now = self.clock.now();
        let skew = i64::try_from(self.clock_skew.as_secs()).unwrap_or(i64::MAX);
        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);

        if claims.iat > now.saturating_add(skew) {
            return Err(ReceiptRejection::invalid("issued in the future"));
        }
        if claims.nbf.is_some_and(|nbf| nbf > now.saturating_add(skew)) {
            return Err(ReceiptRejection::invalid("not yet valid"));
        }
        if claims.exp.is_some_and(|exp| exp < now.saturating_sub(skew)) {
            return Err(ReceiptRejection::invalid("expired"));
        }
        if now.saturating_sub(claims.iat) > max_age.saturating_add(skew) {
            return Err(ReceiptRejection::invalid("exceeds maximum age"));
        }
        Ok(())
    }
}

/// Reads the claims without checking the signature, so issuer policy and
/// local checks run before any key lookup.
fn peek_claims(receipt: &str) -> Result<ReceiptClaims, ReceiptRejection> {
    let parts: Vec<&str> = receipt.split('.').collect();
    if parts.len() != 3 {
        return Err(ReceiptRejection::invalid("receipt must have 3 segments"));
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|err| ReceiptRejection::invalid(format!("payload encoding: {err}")))?;
    serde_json::from_slice(&payload)
        .map_err(|err| ReceiptRejection::invalid(format!("claims: {err}")))
}

fn rejection_from_jwt(err: &jsonwebtoken::errors::Error) -> ReceiptRejection {
    match err.kind() {
        ErrorKind::InvalidSignature => ReceiptRejection::invalid("signature does not verify"),
        ErrorKind::InvalidAudience => ReceiptRejection::invalid("audience mismatch"),
        ErrorKind::MissingRequiredClaim(claim) => {
            ReceiptRejection::invalid(format!("missing {claim} claim"))
        },
        _ => ReceiptRejection::invalid(err.to_string()),
    }
}

/// Path of a `resource_uri` claim, which may be absolute or a bare path.
fn resource_path(resource: &str) -> String {
    match Url::parse(resource) {
        Ok(url) => url.path().to_owned(),
        Err(_) => resource.to_owned(),
    }
}

#[async_trait]
impl ReceiptVerifier for JwsReceiptVerifier {
    #[tracing::instrument(skip_all)]
    async fn verify_receipt(
        &self,
        receipt: &str,
        request: &RequestView,
        issuer_allowed: &IssuerFilter<'_>,
    ) -> Result<ReceiptEvidence, ReceiptRejection> {
        let receipt = receipt.trim();

        let header = decode_header(receipt)
            .map_err(|err| ReceiptRejection::invalid(format!("header: {err}")))?;
        if !ACCEPTED_RECEIPT_ALGORITHMS.contains(&header.alg) {
            return Err(ReceiptRejection::invalid(format!(
                "unsupported algorithm '{:?}'",
                header.alg
            )));
        }
        if let Some(typ) = &header.typ
            && !typ.starts_with("peac.receipt/")
        {
            return Err(ReceiptRejection::invalid(format!("unexpected typ '{typ}'")));
        }
        let kid = header
            .kid
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| ReceiptRejection::invalid("missing kid"))?;

        let claims = peek_claims(receipt)?;
        let issuer = Issuer::normalize(&claims.iss);
        if !issuer_allowed(&issuer) {
            tracing::debug!(%issuer, "receipt issuer not allowed");
            return Err(ReceiptRejection::IssuerNotAllowed(issuer));
        }
        self.check_times(&claims)?;
        if let Some(resource) = &claims.resource_uri
            && resource_path(resource) != request.path()
        {
            return Err(ReceiptRejection::invalid("receipt is for a different resource"));
        }

        let resolved = self
            .keys
            .resolve_key(&issuer, &kid)
            .await
            .map_err(|err| ReceiptRejection::invalid(format!("key resolution: {err}")))?;
        let key = DecodingKey::from_ed_components(&resolved.key.x)
            .map_err(|err| ReceiptRejection::invalid(format!("key encoding: {err}")))?;

        let verified = decode::<ReceiptClaims>(receipt, &key, &self.validation())
            .map_err(|err| rejection_from_jwt(&err))?
            .claims;

        Ok(ReceiptEvidence { issuer, keyid: kid, receipt_id: verified.receipt_id })
    }
}
