//! Outbound URL safety checks for key discovery.
//!
//! Key discovery URLs are derived from attacker-controlled input (the
//! `keyid` parameter or a `Signature-Agent` header). Before any network call
//! the URL passes [`UrlSafetyPolicy::check`]. A rejection is final: it is
//! never retried and never answered from a stale cache entry.
//!
//! Rules, in order:
//!
//! 1. The URL has a host and carries no userinfo.
//! 2. `localhost` and loopback addresses are allowed (over `http` or `https`) only when
//!    `allow_localhost` is set.
//! 3. Every other URL must use `https`.
//! 4. Literal IP hosts are rejected.
//! 5. Cloud metadata host names are rejected.
//! 6. The optional caller predicate must accept the host.
//!
//! Host names are not resolved here; DNS rebinding to private ranges is the
//! egress proxy's concern.

use std::{fmt, net::IpAddr, sync::Arc};

use url::{Host, Url};

use crate::error::ResolveError;

/// Caller-supplied host filter.
pub type HostPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Host names that resolve to instance metadata services.
const METADATA_HOSTS: [&str; 4] =
    ["metadata.google.internal", "metadata", "instance-data", "metadata.azure.internal"];

/// Policy applied to every discovery URL.
#[derive(Clone, Default)]
pub struct UrlSafetyPolicy {
    allow_localhost: bool,
    allow_host: Option<HostPredicate>,
}

impl fmt::Debug for UrlSafetyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlSafetyPolicy")
            .field("allow_localhost", &self.allow_localhost)
            .field("allow_host", &self.allow_host.is_some())
            .finish()
    }
}

impl UrlSafetyPolicy {
    /// Production policy: https only, no localhost, no predicate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Permits `localhost` and loopback hosts.
    #[must_use]
    pub fn with_allow_localhost(mut self, allow: bool) -> Self {
        self.allow_localhost = allow;
        self
    }

    /// Installs a predicate every remaining host must satisfy.
    #[must_use]
    pub fn with_host_predicate(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.allow_host = Some(Arc::new(predicate));
        self
    }

    /// Checks `url` against the policy.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UrlRejected`] naming the rule that failed.
    pub fn check(&self, url: &Url) -> Result<(), ResolveError> {
        let Some(host) = url.host() else {
            return Err(ResolveError::url_rejected("URL has no host"));
        };
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ResolveError::url_rejected("URL carries userinfo"));
        }

        let scheme = url.scheme();
        if is_loopback(&host) {
            if !self.allow_localhost {
                return Err(ResolveError::url_rejected("localhost is not permitted"));
            }
            if scheme != "https" && scheme != "http" {
                return Err(ResolveError::url_rejected(format!("scheme '{scheme}' not permitted")));
            }
            return Ok(());
        }

        if scheme != "https" {
            return Err(ResolveError::url_rejected(format!("scheme '{scheme}' not permitted")));
        }

        let name = match host {
            Host::Ipv4(_) | Host::Ipv6(_) => {
                return Err(ResolveError::url_rejected("IP literal hosts are not permitted"));
            },
            Host::Domain(name) => name.trim_end_matches('.').to_ascii_lowercase(),
        };

        if METADATA_HOSTS.contains(&name.as_str()) || name.ends_with(".internal") {
            return Err(ResolveError::url_rejected("metadata host is not permitted"));
        }

        if let Some(predicate) = &self.allow_host
            && !predicate(&name)
        {
            return Err(ResolveError::url_rejected(format!("host '{name}' not allowed")));
        }

        Ok(())
    }
}

fn is_loopback(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => {
            let name = name.trim_end_matches('.');
            name.eq_ignore_ascii_case("localhost")
                || name.to_ascii_lowercase().ends_with(".localhost")
        },
        Host::Ipv4(addr) => IpAddr::V4(*addr).is_loopback(),
        Host::Ipv6(addr) => IpAddr::V6(*addr).is_loopback(),
    }
}
