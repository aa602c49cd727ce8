//! HTTP Message Signatures (RFC 9421) verification for Ed25519.
//!
//! Only the first label in `Signature-Input` is considered. Covered
//! components are restricted to the request-side derived components and
//! plain lower-case header names; component parameters (`;sf`, `;key`,
//! `;req`, ...) are rejected.

use std::{fmt::Write as _, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use ed25519_dalek::{SIGNATURE_LENGTH, Signature};
use http::{HeaderMap, Method, Uri, header::HOST};
use sha2::{Digest, Sha256};

use crate::{
    error::VerifyError,
    issuer::Issuer,
    key_resolver::{KeyLookup, KeySource},
    problem::ErrorCode,
    structured::{self, BareItem, InnerList, Member},
};

/// The only accepted `alg` parameter value.
pub const ACCEPTED_ALGORITHMS: &[&str] = &["ed25519"];

/// `Signature-Input` header name.
pub const SIGNATURE_INPUT: &str = "signature-input";
/// `Signature` header name.
pub const SIGNATURE: &str = "signature";
/// `Signature-Agent` header name.
pub const SIGNATURE_AGENT: &str = "signature-agent";

const DERIVED_COMPONENTS: &[&str] =
    &["@method", "@target-uri", "@authority", "@scheme", "@request-target", "@path", "@query"];

/// The parts of an HTTP request that verification reads.
#[derive(Debug, Clone)]
pub struct RequestView {
    /// Request method.
    pub method: Method,
    /// Request target as received; may be origin-form.
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
    /// Buffered body, when the caller has one. Needed for `content-digest`.
    pub body: Option<Bytes>,
    /// Scheme used when `uri` carries none.
    pub default_scheme: &'static str,
}

impl RequestView {
    /// A view without body, assuming `https` for origin-form targets.
    #[must_use]
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self { method, uri, headers, body: None, default_scheme: "https" }
    }

    /// Attaches the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Overrides the scheme assumed for origin-form targets.
    #[must_use]
    pub fn with_default_scheme(mut self, scheme: &'static str) -> Self {
        self.default_scheme = scheme;
        self
    }

    /// Builds a view from an [`http::Request`], copying its body.
    pub fn from_request<B: AsRef<[u8]>>(request: &http::Request<B>) -> Self {
        Self::new(request.method().clone(), request.uri().clone(), request.headers().clone())
            .with_body(Bytes::copy_from_slice(request.body().as_ref()))
    }

    /// The request path, `/` when empty.
    #[must_use]
    pub fn path(&self) -> &str {
        match self.uri.path() {
            "" => "/",
            path => path,
        }
    }

    /// A header's field value: all occurrences trimmed and joined with `, `.
    /// `None` when absent or not visible ASCII.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        let mut values = self.headers.get_all(name).iter().peekable();
        values.peek()?;
        let mut joined = String::new();
        for (idx, value) in values.enumerate() {
            if idx > 0 {
                joined.push_str(", ");
            }
            joined.push_str(value.to_str().ok()?.trim());
        }
        Some(joined)
    }

    /// Whether either signature header is present.
    #[must_use]
    pub fn has_signature(&self) -> bool {
        self.headers.contains_key(SIGNATURE_INPUT) || self.headers.contains_key(SIGNATURE)
    }

    fn scheme(&self) -> String {
        self.uri.scheme_str().unwrap_or(self.default_scheme).to_ascii_lowercase()
    }

    fn authority(&self) -> Option<String> {
        let raw = match self.uri.authority() {
            Some(authority) => authority.as_str().to_owned(),
            None => self.headers.get(HOST)?.to_str().ok()?.trim().to_owned(),
        };
        let raw = raw.rsplit_once('@').map_or(raw.as_str(), |(_, host)| host).to_ascii_lowercase();
        let default_port = match self.scheme().as_str() {
            "https" => Some(":443"),
            "http" => Some(":80"),
            _ => None,
        };
        Some(match default_port {
            Some(port) if raw.ends_with(port) => raw[..raw.len() - port.len()].to_owned(),
            _ => raw,
        })
    }

    fn request_target(&self) -> String {
        match self.uri.query() {
            Some(query) => format!("{}?{query}", self.path()),
            None => self.path().to_owned(),
        }
    }
}

/// Parameters of the selected signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureParams {
    /// Dictionary label, e.g. `sig1`.
    pub label: String,
    /// `keyid` parameter.
    pub keyid: String,
    /// `alg` parameter.
    pub alg: String,
    /// `created`, unix seconds.
    pub created: i64,
    /// `expires`, unix seconds.
    pub expires: Option<i64>,
    /// `nonce` parameter.
    pub nonce: Option<String>,
    /// `tag` parameter.
    pub tag: Option<String>,
    /// Covered component identifiers, in signing order.
    pub covered_components: Vec<String>,
    /// Raw signature bytes from the `Signature` header.
    pub signature: Vec<u8>,
    /// The `Signature-Input` member as parsed, for rebuilding `@signature-params`.
    pub inner_list: InnerList,
}

/// Parses `Signature-Input` and `Signature` and selects the first label.
///
/// # Errors
///
/// - [`VerifyError::SignatureMissing`] if either header is absent
/// - [`VerifyError::SignatureInputMalformed`] on syntax or shape errors
/// - [`VerifyError::SignatureParamMissing`] if `keyid`, `alg` or `created` is absent
pub fn parse_signature_headers(request: &RequestView) -> Result<SignatureParams, VerifyError> {
    let (Some(input), Some(signature)) = (request.header(SIGNATURE_INPUT), request.header(SIGNATURE))
    else {
        return Err(VerifyError::SignatureMissing);
    };

    let input = structured::parse_dictionary(&input)
        .map_err(|err| VerifyError::malformed(format!("Signature-Input: {err}")))?;
    let signatures = structured::parse_dictionary(&signature)
        .map_err(|err| VerifyError::malformed(format!("Signature: {err}")))?;

    let (label, member) =
        input.first().ok_or_else(|| VerifyError::malformed("Signature-Input has no members"))?;
    let Member::InnerList(inner_list) = member else {
        return Err(VerifyError::malformed("Signature-Input member must be an inner list"));
    };

    let signature = match signatures.get(label) {
        Some(Member::Item(item)) => item
            .bare
            .as_bytes()
            .ok_or_else(|| VerifyError::malformed("Signature member must be a byte sequence"))?
            .to_vec(),
        _ => return Err(VerifyError::malformed(format!("no Signature member for label '{label}'"))),
    };

    let mut covered_components = Vec::with_capacity(inner_list.items.len());
    for item in &inner_list.items {
        let name = item
            .bare
            .as_string()
            .ok_or_else(|| VerifyError::malformed("component identifiers must be strings"))?;
        if !item.params.is_empty() {
            return Err(VerifyError::malformed(format!("component parameters on '{name}'")));
        }
        if name.starts_with('@') {
            if !DERIVED_COMPONENTS.contains(&name) {
                return Err(VerifyError::malformed(format!("unsupported component '{name}'")));
            }
        } else if name.is_empty() || name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(VerifyError::malformed(format!("invalid header component '{name}'")));
        }
        if covered_components.iter().any(|seen| seen == name) {
            return Err(VerifyError::malformed(format!("duplicate component '{name}'")));
        }
        covered_components.push(name.to_owned());
    }

    let params = &inner_list.params;
    let string_param = |name: &'static str| -> Result<Option<String>, VerifyError> {
        match params.get(name) {
            None => Ok(None),
            Some(BareItem::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(VerifyError::malformed(format!("'{name}' must be a string"))),
        }
    };
    let integer_param = |name: &'static str| -> Result<Option<i64>, VerifyError> {
        match params.get(name) {
            None => Ok(None),
            Some(BareItem::Integer(value)) => Ok(Some(*value)),
            Some(_) => Err(VerifyError::malformed(format!("'{name}' must be an integer"))),
        }
    };

    Ok(SignatureParams {
        label: label.to_owned(),
        keyid: string_param("keyid")?.ok_or(VerifyError::SignatureParamMissing("keyid"))?,
        alg: string_param("alg")?.ok_or(VerifyError::SignatureParamMissing("alg"))?,
        created: integer_param("created")?.ok_or(VerifyError::SignatureParamMissing("created"))?,
        expires: integer_param("expires")?,
        nonce: string_param("nonce")?,
        tag: string_param("tag")?,
        covered_components,
        signature,
        inner_list: inner_list.clone(),
    })
}

/// Builds the RFC 9421 signature base.
///
/// `signature_params` is the serialized inner list that becomes the
/// `@signature-params` line.
///
/// # Errors
///
/// - [`VerifyError::SignatureInvalid`] if a covered header is absent
/// - [`VerifyError::SignatureInputMalformed`] for components that cannot be derived
pub fn signature_base(
    request: &RequestView,
    covered_components: &[String],
    signature_params: &str,
) -> Result<String, VerifyError> {
    let mut base = String::new();
    for name in covered_components {
        let value = component_value(request, name)?;
        let _ = writeln!(base, "\"{name}\": {value}");
    }
    let _ = write!(base, "\"@signature-params\": {signature_params}");
    Ok(base)
}

fn component_value(request: &RequestView, name: &str) -> Result<String, VerifyError> {
    let authority = || {
        request.authority().ok_or_else(|| VerifyError::invalid("request has no authority"))
    };
    match name {
        "@method" => Ok(request.method.as_str().to_owned()),
        "@scheme" => Ok(request.scheme()),
        "@authority" => authority(),
        "@target-uri" => {
            Ok(format!("{}://{}{}", request.scheme(), authority()?, request.request_target()))
        },
        "@request-target" => Ok(request.request_target()),
        "@path" => Ok(request.path().to_owned()),
        "@query" => Ok(format!("?{}", request.uri.query().unwrap_or_default())),
        derived if derived.starts_with('@') => {
            Err(VerifyError::malformed(format!("unsupported component '{derived}'")))
        },
        header => request
            .header(header)
            .ok_or_else(|| VerifyError::invalid(format!("covered header '{header}' is absent"))),
    }
}

/// What a successful verification established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEvidence {
    /// Signature label.
    pub label: String,
    /// Key id that verified.
    pub keyid: String,
    /// Algorithm.
    pub alg: String,
    /// `created`, unix seconds.
    pub created: i64,
    /// `expires`, unix seconds.
    pub expires: Option<i64>,
    /// Nonce, if any.
    pub nonce: Option<String>,
    /// Tag, if any.
    pub tag: Option<String>,
    /// Covered components.
    pub covered_components: Vec<String>,
    /// Derived issuer.
    pub issuer: Issuer,
    /// How the key was obtained.
    pub key_source: KeySource,
}

/// Outcome of [`verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationVerdict {
    /// `true` only when the signature verified.
    pub valid: bool,
    /// Present when `valid`.
    pub evidence: Option<SignatureEvidence>,
    /// Present when not `valid`.
    pub error: Option<VerifyError>,
}

impl VerificationVerdict {
    fn from_result(result: Result<SignatureEvidence, VerifyError>) -> Self {
        match result {
            Ok(evidence) => Self { valid: true, evidence: Some(evidence), error: None },
            Err(error) => Self { valid: false, evidence: None, error: Some(error) },
        }
    }

    /// The failure's error code, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(VerifyError::code)
    }
}

/// Verifies the request's signature end to end.
///
/// The issuer is derived from the `keyid` and the `Signature-Agent` header.
pub async fn verify(
    request: &RequestView,
    keys: &dyn KeyLookup,
    now: i64,
    clock_skew: Duration,
) -> VerificationVerdict {
    let result = async {
        let params = parse_signature_headers(request)?;
        let issuer =
            Issuer::derive(&params.keyid, request.header(SIGNATURE_AGENT).as_deref());
        verify_parsed(request, &params, &issuer, keys, now, clock_skew).await
    }
    .await;
    VerificationVerdict::from_result(result)
}

/// Verifies already-parsed parameters against the request.
///
/// Checks run in a fixed order: algorithm, time window, key resolution,
/// content digest, signature bytes.
///
/// # Errors
///
/// Returns the first failing check as a [`VerifyError`].
#[tracing::instrument(skip_all, fields(keyid = %params.keyid, issuer = %issuer))]
pub async fn verify_parsed(
    request: &RequestView,
    params: &SignatureParams,
    issuer: &Issuer,
    keys: &dyn KeyLookup,
    now: i64,
    clock_skew: Duration,
) -> Result<SignatureEvidence, VerifyError> {
    if !ACCEPTED_ALGORITHMS.contains(&params.alg.as_str()) {
        return Err(VerifyError::AlgorithmUnsupported(params.alg.clone()));
    }

    if let Some(expires) = params.expires
        && now > expires
    {
        return Err(VerifyError::SignatureExpired { expires, now });
    }
    let skew = i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX);
    if params.created > now.saturating_add(skew) {
        return Err(VerifyError::SignatureFuture { created: params.created, now });
    }

    let resolved = keys.resolve_key(issuer, &params.keyid).await?;

    let base = signature_base(
        request,
        &params.covered_components,
        &structured::serialize_inner_list(&params.inner_list),
    )?;

    if params.covered_components.iter().any(|name| name == "content-digest")
        && let Some(body) = &request.body
    {
        check_content_digest(request, body)?;
    }

    let bytes: [u8; SIGNATURE_LENGTH] = params.signature.as_slice().try_into().map_err(|_| {
        VerifyError::invalid(format!("signature must be {SIGNATURE_LENGTH} bytes"))
    })?;
    resolved
        .key
        .verifying_key()
        .verify_strict(base.as_bytes(), &Signature::from_bytes(&bytes))
        .map_err(|_| VerifyError::invalid("signature does not verify"))?;

    tracing::debug!(key_source = ?resolved.source, "signature verified");

    Ok(SignatureEvidence {
        label: params.label.clone(),
        keyid: params.keyid.clone(),
        alg: params.alg.clone(),
        created: params.created,
        expires: params.expires,
        nonce: params.nonce.clone(),
        tag: params.tag.clone(),
        covered_components: params.covered_components.clone(),
        issuer: issuer.clone(),
        key_source: resolved.source,
    })
}

fn check_content_digest(request: &RequestView, body: &[u8]) -> Result<(), VerifyError> {
    let header = request
        .header("content-digest")
        .ok_or_else(|| VerifyError::invalid("covered header 'content-digest' is absent"))?;
    let digests = structured::parse_dictionary(&header)
        .map_err(|err| VerifyError::invalid(format!("content-digest: {err}")))?;
    let expected = match digests.get("sha-256") {
        Some(Member::Item(item)) => item.bare.as_bytes(),
        _ => None,
    }
    .ok_or_else(|| VerifyError::invalid("content-digest lacks a sha-256 value"))?;

    if Sha256::digest(body).as_slice() != expected {
        return Err(VerifyError::invalid("content-digest does not match body"));
    }
    Ok(())
}

/// `Content-Digest` header value for `body`.
#[must_use]
pub fn content_digest(body: &[u8]) -> String {
    format!("sha-256=:{}:", STANDARD.encode(Sha256::digest(body)))
}
