//! Issuer identity.
//!
//! An issuer is either a URL origin (scheme, lowercased host, non-default
//! port) or an opaque identifier compared verbatim. Allowlist entries and
//! request-derived issuers go through the same normalization so they compare
//! byte-for-byte.

use std::fmt;

use url::Url;

use crate::structured::{self, BareItem, Member};

/// Who signed a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Issuer {
    /// ASCII serialization of an `http`/`https` origin, e.g. `https://agent.example`.
    Origin(String),
    /// Any other identifier.
    Opaque(String),
}

impl Issuer {
    /// Normalizes an allowlist entry or other configured identifier.
    #[must_use]
    pub fn normalize(value: &str) -> Self {
        let trimmed = value.trim();
        Self::origin_of(trimmed).unwrap_or_else(|| Self::Opaque(trimmed.to_owned()))
    }

    /// The origin of `value` if it is an absolute `http`/`https` URL.
    #[must_use]
    pub fn origin_of(value: &str) -> Option<Self> {
        let url = Url::parse(value).ok()?;
        if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
            return None;
        }
        Some(Self::Origin(url.origin().ascii_serialization()))
    }

    /// Derives the issuer of a signature.
    ///
    /// An absolute-URL `keyid` wins. Otherwise a `Signature-Agent` header
    /// naming a URL supplies the origin. Failing both, the `keyid` itself is
    /// the (opaque) issuer.
    #[must_use]
    pub fn derive(keyid: &str, signature_agent: Option<&str>) -> Self {
        if let Some(issuer) = Self::origin_of(keyid) {
            return issuer;
        }
        if let Some(issuer) = signature_agent.and_then(signature_agent_origin) {
            return issuer;
        }
        Self::Opaque(keyid.to_owned())
    }

    /// The issuer text used in cache keys, replay keys and logs.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Origin(value) | Self::Opaque(value) => value,
        }
    }

    /// The origin as a URL, for key discovery.
    #[must_use]
    pub fn origin_url(&self) -> Option<Url> {
        match self {
            Self::Origin(origin) => Url::parse(origin).ok(),
            Self::Opaque(_) => None,
        }
    }
}

impl fmt::Display for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads a `Signature-Agent` value: an sf-string item, or a dictionary whose
/// first member is an sf-string.
fn signature_agent_origin(header: &str) -> Option<Issuer> {
    if let Ok(item) = structured::parse_item(header)
        && let BareItem::String(value) = &item.bare
    {
        return Issuer::origin_of(value);
    }

    let dictionary = structured::parse_dictionary(header).ok()?;
    match dictionary.first()? {
        (_, Member::Item(item)) => item.bare.as_string().and_then(Issuer::origin_of),
        (_, Member::InnerList(_)) => None,
    }
}
