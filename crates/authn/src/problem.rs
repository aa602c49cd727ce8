//! RFC 9457 Problem Details responses for verification failures.
//!
//! Every denial becomes exactly one [`ErrorCode`], and every code maps to
//! exactly one HTTP status and title. [`ProblemBuilder`] renders the code as
//! an `application/problem+json` response with the authentication challenge
//! headers clients need.

use std::{error::Error as StdError, fmt, time::Duration};

use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue, Response, StatusCode,
    header::{CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER, WWW_AUTHENTICATE},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, VerifyError};

/// Media type of problem responses.
pub const PROBLEM_JSON: &str = "application/problem+json";

/// Default base URI for problem `type` links.
pub const DEFAULT_PROBLEM_BASE_URI: &str = "https://reqsig.dev/problems";

/// Default `WWW-Authenticate` realm.
pub const DEFAULT_REALM: &str = "reqsig";

/// Default `Retry-After` for throttled responses.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

const GENERIC_INTERNAL_DETAIL: &str = "An internal error occurred";

/// Canonical verification error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No signature headers.
    SignatureMissing,
    /// Signature headers did not parse.
    SignatureInputMalformed,
    /// A required signature parameter is absent.
    SignatureParamMissing,
    /// `alg` is not accepted.
    AlgorithmUnsupported,
    /// Past `expires`.
    SignatureExpired,
    /// `created` beyond allowed skew.
    SignatureFuture,
    /// No key for the key id.
    KeyNotFound,
    /// Key discovery URL rejected.
    KeyUrlRejected,
    /// Key set could not be retrieved.
    KeyFetchFailed,
    /// Signature bytes do not verify.
    SignatureInvalid,
    /// Tag not in the known set.
    TagUnknown,
    /// Issuer not on the allowlist.
    IssuerNotAllowed,
    /// Nonce already used.
    NonceReplay,
    /// Nonce absent while replay protection is required.
    NonceRequired,
    /// Receipt mode without signature or receipt.
    ReceiptMissing,
    /// Receipt rejected.
    ReceiptInvalid,
    /// Verifier has no allowlist and no override.
    ConfigIssuerAllowlistRequired,
    /// Unexpected failure.
    Internal,
    /// Throttled.
    RateLimited,
}

impl ErrorCode {
    /// Every code, in table order.
    pub const ALL: [ErrorCode; 19] = [
        Self::SignatureMissing,
        Self::SignatureInputMalformed,
        Self::SignatureParamMissing,
        Self::AlgorithmUnsupported,
        Self::SignatureExpired,
        Self::SignatureFuture,
        Self::KeyNotFound,
        Self::KeyUrlRejected,
        Self::KeyFetchFailed,
        Self::SignatureInvalid,
        Self::TagUnknown,
        Self::IssuerNotAllowed,
        Self::NonceReplay,
        Self::NonceRequired,
        Self::ReceiptMissing,
        Self::ReceiptInvalid,
        Self::ConfigIssuerAllowlistRequired,
        Self::Internal,
        Self::RateLimited,
    ];

    /// Wire identifier, used in `code`, `type` and `WWW-Authenticate`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SignatureMissing => "signature-missing",
            Self::SignatureInputMalformed => "signature-input-malformed",
            Self::SignatureParamMissing => "signature-param-missing",
            Self::AlgorithmUnsupported => "algorithm-unsupported",
            Self::SignatureExpired => "signature-expired",
            Self::SignatureFuture => "signature-future",
            Self::KeyNotFound => "key-not-found",
            Self::KeyUrlRejected => "key-url-rejected",
            Self::KeyFetchFailed => "key-fetch-failed",
            Self::SignatureInvalid => "signature-invalid",
            Self::TagUnknown => "tag-unknown",
            Self::IssuerNotAllowed => "issuer-not-allowed",
            Self::NonceReplay => "nonce-replay",
            Self::NonceRequired => "nonce-required",
            Self::ReceiptMissing => "receipt-missing",
            Self::ReceiptInvalid => "receipt-invalid",
            Self::ConfigIssuerAllowlistRequired => "config-issuer-allowlist-required",
            Self::Internal => "internal-error",
            Self::RateLimited => "rate-limited",
        }
    }

    /// HTTP status.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::SignatureInputMalformed
            | Self::SignatureParamMissing
            | Self::AlgorithmUnsupported
            | Self::TagUnknown => StatusCode::BAD_REQUEST,
            Self::SignatureMissing
            | Self::SignatureExpired
            | Self::SignatureFuture
            | Self::KeyNotFound
            | Self::KeyUrlRejected
            | Self::KeyFetchFailed
            | Self::SignatureInvalid
            | Self::NonceRequired => StatusCode::UNAUTHORIZED,
            Self::ReceiptMissing | Self::ReceiptInvalid => StatusCode::PAYMENT_REQUIRED,
            Self::IssuerNotAllowed => StatusCode::FORBIDDEN,
            Self::NonceReplay => StatusCode::CONFLICT,
            Self::ConfigIssuerAllowlistRequired | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
            Self::RateLimited => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short human-readable summary.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::SignatureMissing => "Signature Missing",
            Self::SignatureInputMalformed => "Malformed Signature Input",
            Self::SignatureParamMissing => "Signature Parameter Missing",
            Self::AlgorithmUnsupported => "Unsupported Signature Algorithm",
            Self::SignatureExpired => "Signature Expired",
            Self::SignatureFuture => "Signature Not Yet Valid",
            Self::KeyNotFound => "Key Not Found",
            Self::KeyUrlRejected => "Key URL Rejected",
            Self::KeyFetchFailed => "Key Fetch Failed",
            Self::SignatureInvalid => "Invalid Signature",
            Self::TagUnknown => "Unknown Signature Tag",
            Self::IssuerNotAllowed => "Issuer Not Allowed",
            Self::NonceReplay => "Nonce Replay",
            Self::NonceRequired => "Nonce Required",
            Self::ReceiptMissing => "Receipt Required",
            Self::ReceiptInvalid => "Invalid Receipt",
            Self::ConfigIssuerAllowlistRequired => "Issuer Allowlist Required",
            Self::Internal => "Internal Error",
            Self::RateLimited => "Rate Limited",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Problem response settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProblemConfig {
    /// Base for `type` and `error_uri` links; the code is appended as a path segment.
    #[serde(default = "default_base_uri")]
    pub base_uri: String,

    /// `WWW-Authenticate` realm.
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Echo internal error messages to callers. Development only.
    #[serde(default)]
    pub expose_internal_errors: bool,

    /// `Retry-After` for throttled responses.
    #[serde(default = "default_retry_after", with = "humantime_serde")]
    pub retry_after: Duration,
}

fn default_base_uri() -> String {
    DEFAULT_PROBLEM_BASE_URI.to_owned()
}

fn default_realm() -> String {
    DEFAULT_REALM.to_owned()
}

fn default_retry_after() -> Duration {
    DEFAULT_RETRY_AFTER
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            base_uri: default_base_uri(),
            realm: default_realm(),
            expose_internal_errors: false,
            retry_after: default_retry_after(),
        }
    }
}

impl ProblemConfig {
    /// Checks that the base URI is absolute and the realm is a valid quoted-string body.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = Url::parse(&self.base_uri)
            .map_err(|err| ConfigError::invalid("problem.base_uri", err.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::invalid("problem.base_uri", "must be an http(s) URL"));
        }
        if self.realm.is_empty()
            || self.realm.chars().any(|c| c == '"' || c == '\\' || c.is_control())
        {
            return Err(ConfigError::invalid(
                "problem.realm",
                "must be non-empty without quotes, backslashes or control characters",
            ));
        }
        if self.retry_after.is_zero() {
            return Err(ConfigError::invalid("problem.retry_after", "must be positive"));
        }
        Ok(())
    }
}

/// The JSON body. Field order is the serialization order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// `<base>/<code>`.
    #[serde(rename = "type")]
    pub problem_type: String,
    /// Summary from the canonical table.
    pub title: String,
    /// HTTP status.
    pub status: u16,
    /// Wire code.
    pub code: String,
    /// Occurrence-specific text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Occurrence identifier, typically the request path or id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// A rendered error response.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Problem body.
    pub body: ProblemDetails,
}

impl ErrorResponse {
    /// The error code carried in the body.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.body.code
    }

    /// Serialized body.
    #[must_use]
    pub fn body_bytes(&self) -> Bytes {
        match serde_json::to_vec(&self.body) {
            Ok(json) => Bytes::from(json),
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize problem details");
                Bytes::from_static(
                    br#"{"type":"about:blank","title":"Internal Error","status":500}"#,
                )
            },
        }
    }

    /// Converts into an [`http::Response`].
    #[must_use]
    pub fn into_http_response(self) -> Response<Bytes> {
        let body = self.body_bytes();
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Renders [`ErrorCode`]s as problem responses.
#[derive(Debug, Clone, Default)]
pub struct ProblemBuilder {
    config: ProblemConfig,
}

impl ProblemBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(config: ProblemConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ProblemConfig {
        &self.config
    }

    fn link(&self, code: ErrorCode) -> String {
        format!("{}/{}", self.config.base_uri.trim_end_matches('/'), code.as_str())
    }

    /// Renders `code`.
    ///
    /// For [`ErrorCode::Internal`] the detail is replaced by a generic
    /// message unless `expose_internal_errors` is set.
    #[must_use]
    pub fn build_error_response(
        &self,
        code: ErrorCode,
        detail: Option<&str>,
        instance: Option<&str>,
    ) -> ErrorResponse {
        let status = code.status();
        let detail = match code {
            ErrorCode::Internal if !self.config.expose_internal_errors => {
                Some(GENERIC_INTERNAL_DETAIL.to_owned())
            },
            _ => detail.map(str::to_owned),
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

        let scheme = match status {
            StatusCode::UNAUTHORIZED => Some("Signature"),
            StatusCode::PAYMENT_REQUIRED => Some("Receipt"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            let challenge = format!(
                r#"{scheme} realm="{}", error="{}", error_uri="{}""#,
                self.config.realm,
                code.as_str(),
                self.link(code)
            );
            match HeaderValue::from_str(&challenge) {
                Ok(value) => {
                    headers.insert(WWW_AUTHENTICATE, value);
                },
                Err(err) => tracing::error!(error = %err, "invalid WWW-Authenticate challenge"),
            }
        }

        if status == StatusCode::SERVICE_UNAVAILABLE {
            headers.insert(RETRY_AFTER, HeaderValue::from(self.config.retry_after.as_secs()));
        }

        ErrorResponse {
            status,
            headers,
            body: ProblemDetails {
                problem_type: self.link(code),
                title: code.title().to_owned(),
                status: status.as_u16(),
                code: code.as_str().to_owned(),
                detail,
                instance: instance.map(str::to_owned),
            },
        }
    }

    /// Renders a [`VerifyError`] with its caller-safe detail.
    #[must_use]
    pub fn for_error(&self, err: &VerifyError, instance: Option<&str>) -> ErrorResponse {
        let detail = match err {
            VerifyError::Internal(message) if self.config.expose_internal_errors => message.clone(),
            _ => err.public_detail(),
        };
        self.build_error_response(err.code(), Some(&detail), instance)
    }

    /// Renders an unexpected error as [`ErrorCode::Internal`], logging it.
    #[must_use]
    pub fn internal(&self, err: &(dyn StdError + 'static), instance: Option<&str>) -> ErrorResponse {
        tracing::error!(error = %err, "unexpected verification error");
        self.build_error_response(ErrorCode::Internal, Some(&err.to_string()), instance)
    }
}
