//! # Reqsig Authentication
//!
//! Verification of cryptographically signed HTTP requests from automated
//! agents, in front of an origin server.
//!
//! This crate provides:
//! - **Key resolution**: SSRF-guarded discovery of issuer JWK sets, cached
//!   with TTL, singleflight and stale-if-error
//! - **Signature verification**: RFC 9421 signature bases over Ed25519
//!   with Web Bot Auth tags
//! - **Replay protection**: fail-closed nonce tracking over any
//!   [`reqsig_storage`] backend
//! - **Decisions**: a verification state machine that admits, bypasses or
//!   denies with RFC 9457 problem responses
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use reqsig_authn::{
//!     InMemoryReplayGuard, KeyResolver, RequestVerifier, SecurityPolicy,
//!     signature::RequestView,
//! };
//!
//! # async fn example(request: RequestView) -> Result<(), Box<dyn std::error::Error>> {
//! let keys = KeyResolver::builder().build()?;
//! let verifier = RequestVerifier::builder()
//!     .policy(SecurityPolicy::builder().issuer_allowlist(["https://agent.example"]).build())
//!     .keys(Arc::new(keys))
//!     .replay(Arc::new(InMemoryReplayGuard::default()))
//!     .build()?;
//!
//! let decision = verifier.verify(&request).await;
//! if let Some(denial) = decision.denial() {
//!     println!("denied: {}", denial.code());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Time source abstraction.
pub mod clock;
/// Verifier configuration and security policy.
pub mod config;
/// Error types.
pub mod error;
/// Issuer identity derivation.
pub mod issuer;
/// Issuer key discovery and caching.
pub mod key_resolver;
/// RFC 9457 problem responses.
pub mod problem;
/// Payment receipt verification.
pub mod receipt;
/// Nonce replay protection.
pub mod replay;
/// RFC 9421 message signatures.
pub mod signature;
/// RFC 8941 structured field parsing.
pub mod structured;
/// Outbound URL validation.
pub mod url_safety;
/// Request verification state machine.
pub mod verifier;

/// Shared test utilities (key pairs, request signer, scripted fetcher).
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{KeyResolverConfig, SecurityPolicy, VerificationMode, VerifierConfig};
pub use error::{ConfigError, FetchError, ResolveError, Result, VerifyError};
pub use issuer::Issuer;
pub use key_resolver::{HttpKeySetFetcher, KeyLookup, KeyResolver, KeySource, PublicKey};
pub use problem::{ErrorCode, ErrorResponse, ProblemBuilder, ProblemConfig};
pub use receipt::{IssuerFilter, JwsReceiptVerifier, ReceiptRejection, ReceiptVerifier};
pub use replay::{
    AtomicReplayGuard, DisabledReplayGuard, EventualReplayGuard, InMemoryReplayGuard, ReplayGuard,
};
pub use signature::{RequestView, SignatureEvidence, VerificationVerdict};
pub use verifier::{Allowance, Decision, Denial, RequestVerifier};
