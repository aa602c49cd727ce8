//! Integration test verifying that `#[instrument]` annotations and audit
//! events are emitted by the verifier and key resolver.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use reqsig_authn::{
    Clock, FixedClock, InMemoryReplayGuard, KeyResolver, RequestVerifier, SecurityPolicy,
    issuer::Issuer,
    testutil::{ScriptedFetcher, TestKeypair, TestSigner, get_request},
};
use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

const NOW: i64 = 1_700_000_000;

// ---------------------------------------------------------------------------
// Collecting layer: records span names and audit actions
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Collector {
    spans: Arc<Mutex<Vec<String>>>,
    audit_actions: Arc<Mutex<Vec<String>>>,
}

#[derive(Default)]
struct AuditVisitor {
    action: Option<String>,
    is_audit: bool,
}

impl Visit for AuditVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "audit.action" {
            self.action = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" && format!("{value:?}") == "audit_event" {
            self.is_audit = true;
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for Collector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = AuditVisitor::default();
        event.record(&mut visitor);
        if let (true, Some(action)) = (visitor.is_audit, visitor.action) {
            self.audit_actions.lock().expect("lock poisoned").push(action);
        }
    }
}

fn resolver(keypair: &TestKeypair) -> KeyResolver {
    let fetcher = ScriptedFetcher::new();
    fetcher.respond_json(
        "/.well-known/http-message-signatures-directory",
        200,
        None,
        &keypair.key_set(),
    );
    KeyResolver::builder()
        .fetcher(Arc::new(fetcher))
        .clock(Arc::new(FixedClock::new(NOW)) as Arc<dyn Clock>)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verify_creates_verify_and_resolve_spans() {
    let collector = Collector::default();
    let spans = Arc::clone(&collector.spans);
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let keypair = TestKeypair::generate("k1");
    let verifier = RequestVerifier::builder()
        .policy(SecurityPolicy::builder().issuer_allowlist(["https://agent.example"]).build())
        .keys(Arc::new(resolver(&keypair)))
        .replay(Arc::new(InMemoryReplayGuard::default()))
        .clock(Arc::new(FixedClock::new(NOW)) as Arc<dyn Clock>)
        .build()
        .unwrap();

    let mut request = get_request("https://origin.example/");
    TestSigner::new(&keypair)
        .keyid("https://agent.example/jwks#k1")
        .created(NOW)
        .nonce("n1")
        .sign(&mut request);
    assert!(verifier.verify(&request).await.is_admitted());

    let recorded = spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|s| s == "verify"), "expected a 'verify' span, got: {recorded:?}");
    assert!(recorded.iter().any(|s| s == "resolve"), "expected a 'resolve' span, got: {recorded:?}");
}

#[tokio::test]
async fn cache_invalidation_emits_audit_events() {
    let collector = Collector::default();
    let actions = Arc::clone(&collector.audit_actions);
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

    let keypair = TestKeypair::generate("k1");
    let resolver = resolver(&keypair);
    let issuer = Issuer::normalize("https://agent.example");
    resolver.resolve(&issuer, "k1").await.unwrap();

    resolver.invalidate(&issuer, "k1").await;
    resolver.clear_all().await;

    let recorded = actions.lock().expect("lock poisoned");
    assert_eq!(*recorded, ["invalidate_key", "clear_key_cache"]);
}
