//! Fuzz target for signature header parsing.
//!
//! Feeds arbitrary strings as `Signature-Input`, `Signature` and
//! `Signature-Agent` values. Every result must be either `Ok(...)` or
//! `Err(VerifyError)`; no input may panic.

#![no_main]

use http::{HeaderMap, HeaderValue, Method};
use libfuzzer_sys::fuzz_target;
use reqsig_authn::{
    issuer::Issuer,
    signature::{self, RequestView, SIGNATURE, SIGNATURE_AGENT, SIGNATURE_INPUT},
    structured,
};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let _ = structured::parse_dictionary(text);
    let _ = structured::parse_item(text);

    // Split the input three ways so each header gets independent content.
    let mut parts = text.splitn(3, '\n');
    let input = parts.next().unwrap_or_default();
    let sig = parts.next().unwrap_or_default();
    let agent = parts.next();

    let mut headers = HeaderMap::new();
    let (Ok(input), Ok(sig)) = (HeaderValue::from_str(input), HeaderValue::from_str(sig)) else {
        return;
    };
    headers.insert(SIGNATURE_INPUT, input);
    headers.insert(SIGNATURE, sig);
    if let Some(agent) = agent.and_then(|agent| HeaderValue::from_str(agent).ok()) {
        headers.insert(SIGNATURE_AGENT, agent);
    }

    let uri = http::Uri::from_static("https://origin.example/path?q=1");
    let request = RequestView::new(Method::GET, uri, headers);
    if let Ok(params) = signature::parse_signature_headers(&request) {
        let _ = Issuer::derive(&params.keyid, request.header(SIGNATURE_AGENT).as_deref());
        let signature_params = structured::serialize_inner_list(&params.inner_list);
        let _ = signature::signature_base(&request, &params.covered_components, &signature_params);
    }
});
