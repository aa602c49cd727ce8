//! Verification error types.
//!
//! Three error families live here:
//!
//! - [`ResolveError`]: why a public key could not be produced for an issuer and key id.
//! - [`VerifyError`]: why a request was denied. Every variant maps to exactly one
//!   [`ErrorCode`] via [`VerifyError::code`].
//! - [`ConfigError`]: invalid configuration detected at construction time.
//!
//! `Display` output is meant for logs. Text returned to callers goes through
//! [`VerifyError::public_detail`], which never includes key material, raw
//! header values or upstream error bodies.

use thiserror::Error;

use crate::problem::ErrorCode;

/// Reasons a public key could not be resolved.
///
/// `Clone` so that every waiter on a shared in-flight resolution observes the
/// identical outcome.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. Downstream match expressions
/// must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// The key set was retrieved but holds no usable key for the key id.
    #[error("Key not found: {kid}")]
    KeyNotFound {
        /// Key ID that was not found.
        kid: String,
    },

    /// The discovery URL failed the safety policy. Never retried, never
    /// served from a stale entry.
    #[error("Key URL rejected: {reason}")]
    UrlRejected {
        /// Which safety rule rejected the URL.
        reason: String,
    },

    /// Transport failure or an unexpected status from every discovery path.
    #[error("Key set fetch failed: {message}")]
    FetchFailed {
        /// Description of the failure.
        message: String,
    },

    /// The fetch did not complete within the configured timeout.
    #[error("Key set fetch timed out")]
    Timeout,

    /// A `200` response whose body is not a usable key set.
    #[error("Malformed key set: {message}")]
    MalformedKeySet {
        /// Description of the parse failure.
        message: String,
    },
}

impl ResolveError {
    /// Creates a new `KeyNotFound` error.
    #[must_use]
    pub fn key_not_found(kid: impl Into<String>) -> Self {
        Self::KeyNotFound { kid: kid.into() }
    }

    /// Creates a new `UrlRejected` error.
    #[must_use]
    pub fn url_rejected(reason: impl Into<String>) -> Self {
        Self::UrlRejected { reason: reason.into() }
    }

    /// Creates a new `FetchFailed` error.
    #[must_use]
    pub fn fetch_failed(message: impl Into<String>) -> Self {
        Self::FetchFailed { message: message.into() }
    }

    /// Creates a new `MalformedKeySet` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedKeySet { message: message.into() }
    }

    /// Returns `true` for failures that may succeed on a later attempt and
    /// are therefore eligible for stale-if-error fallback.
    ///
    /// `KeyNotFound` and `UrlRejected` are definitive answers.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::Timeout | Self::MalformedKeySet { .. })
    }
}

/// Transport-level failure from a [`KeySetFetcher`](crate::key_resolver::KeySetFetcher).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// Connection, TLS or protocol failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body exceeded the configured cap.
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge {
        /// The configured cap in bytes.
        limit: usize,
    },
}

/// Reasons a request failed verification.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. Downstream match expressions
/// must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum VerifyError {
    /// `Signature-Input` or `Signature` header absent.
    #[error("Signature headers missing")]
    SignatureMissing,

    /// Signature headers could not be parsed.
    #[error("Malformed signature input: {0}")]
    SignatureInputMalformed(String),

    /// A required signature parameter is absent.
    #[error("Missing signature parameter: {0}")]
    SignatureParamMissing(&'static str),

    /// Algorithm is not on the accepted list.
    #[error("Unsupported algorithm: {0}")]
    AlgorithmUnsupported(String),

    /// `now` is past the `expires` parameter.
    #[error("Signature expired at {expires} (now {now})")]
    SignatureExpired {
        /// The `expires` parameter.
        expires: i64,
        /// Verification time.
        now: i64,
    },

    /// `created` is further in the future than the allowed skew.
    #[error("Signature created at {created} is in the future (now {now})")]
    SignatureFuture {
        /// The `created` parameter.
        created: i64,
        /// Verification time.
        now: i64,
    },

    /// Key resolution failed.
    #[error("Key resolution failed: {0}")]
    KeyResolution(#[source] ResolveError),

    /// Cryptographic check or signature base reconstruction failed.
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// The `tag` parameter is not a known tag.
    #[error("Unknown signature tag: {0}")]
    TagUnknown(String),

    /// The issuer is not on the allowlist.
    #[error("Issuer not allowed: {0}")]
    IssuerNotAllowed(String),

    /// The nonce has been seen within its replay window.
    #[error("Nonce replayed")]
    NonceReplay,

    /// No nonce was supplied and replay protection is required.
    #[error("Nonce required")]
    NonceRequired,

    /// Receipt mode: neither signature nor receipt was supplied.
    #[error("Receipt missing")]
    ReceiptMissing,

    /// Receipt mode: the receipt was rejected.
    #[error("Receipt invalid: {0}")]
    ReceiptInvalid(String),

    /// Issuer allowlist is empty and no explicit override was configured.
    #[error("Issuer allowlist required")]
    ConfigIssuerAllowlistRequired,

    /// Anything unexpected, including caught panics.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VerifyError {
    /// Creates a new `SignatureInputMalformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::SignatureInputMalformed(message.into())
    }

    /// Creates a new `SignatureInvalid` error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::SignatureInvalid(message.into())
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the canonical error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SignatureMissing => ErrorCode::SignatureMissing,
            Self::SignatureInputMalformed(_) => ErrorCode::SignatureInputMalformed,
            Self::SignatureParamMissing(_) => ErrorCode::SignatureParamMissing,
            Self::AlgorithmUnsupported(_) => ErrorCode::AlgorithmUnsupported,
            Self::SignatureExpired { .. } => ErrorCode::SignatureExpired,
            Self::SignatureFuture { .. } => ErrorCode::SignatureFuture,
            Self::KeyResolution(err) => match err {
                ResolveError::KeyNotFound { .. } => ErrorCode::KeyNotFound,
                ResolveError::UrlRejected { .. } => ErrorCode::KeyUrlRejected,
                ResolveError::FetchFailed { .. }
                | ResolveError::Timeout
                | ResolveError::MalformedKeySet { .. } => ErrorCode::KeyFetchFailed,
            },
            Self::SignatureInvalid(_) => ErrorCode::SignatureInvalid,
            Self::TagUnknown(_) => ErrorCode::TagUnknown,
            Self::IssuerNotAllowed(_) => ErrorCode::IssuerNotAllowed,
            Self::NonceReplay => ErrorCode::NonceReplay,
            Self::NonceRequired => ErrorCode::NonceRequired,
            Self::ReceiptMissing => ErrorCode::ReceiptMissing,
            Self::ReceiptInvalid(_) => ErrorCode::ReceiptInvalid,
            Self::ConfigIssuerAllowlistRequired => ErrorCode::ConfigIssuerAllowlistRequired,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Caller-facing detail text.
    ///
    /// Only parameter names, tags and timestamps the caller supplied
    /// themselves are echoed back.
    #[must_use]
    pub fn public_detail(&self) -> String {
        match self {
            Self::SignatureMissing => {
                "Request must carry Signature-Input and Signature headers".into()
            },
            Self::SignatureInputMalformed(_) => "Signature headers could not be parsed".into(),
            Self::SignatureParamMissing(param) => {
                format!("Signature parameter '{param}' is required")
            },
            Self::AlgorithmUnsupported(_) => "Signature algorithm must be ed25519".into(),
            Self::SignatureExpired { expires, .. } => format!("Signature expired at {expires}"),
            Self::SignatureFuture { created, .. } => {
                format!("Signature created at {created} is in the future")
            },
            Self::KeyResolution(err) => match err {
                ResolveError::KeyNotFound { .. } => "No usable key found for keyid".into(),
                ResolveError::UrlRejected { .. } => "Key discovery URL is not permitted".into(),
                _ => "Key set could not be retrieved".into(),
            },
            Self::SignatureInvalid(_) => "Signature verification failed".into(),
            Self::TagUnknown(tag) => format!("Signature tag '{tag}' is not recognized"),
            Self::IssuerNotAllowed(_) => "Issuer is not on the allowlist".into(),
            Self::NonceReplay => "Nonce has already been used".into(),
            Self::NonceRequired => "Signature must carry a nonce".into(),
            Self::ReceiptMissing => "Request must carry a signature or a receipt".into(),
            Self::ReceiptInvalid(_) => "Receipt verification failed".into(),
            Self::ConfigIssuerAllowlistRequired => {
                "Verifier is not configured with an issuer allowlist".into()
            },
            Self::Internal(_) => "An internal error occurred".into(),
        }
    }
}

impl From<ResolveError> for VerifyError {
    fn from(err: ResolveError) -> Self {
        VerifyError::KeyResolution(err)
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// The offending field.
        field: &'static str,
        /// Why the value is invalid.
        reason: String,
    },

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Required collaborator missing from the builder.
    #[error("Missing component: {0}")]
    MissingComponent(&'static str),
}

impl ConfigError {
    /// Creates a new `InvalidValue` error.
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue { field, reason: reason.into() }
    }
}

/// Result type alias for verification operations.
pub type Result<T> = std::result::Result<T, VerifyError>;
