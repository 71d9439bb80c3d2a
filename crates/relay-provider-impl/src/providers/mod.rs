pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod proxy;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use relay_protocol::openai::create_chat_completions::types::Usage;
use relay_provider_core::{Downstream, ResponseOutcome};

/// Join a channel base URL with a vendor path, collapsing a doubled `/v1`.
pub(crate) fn build_url(base_url: &str, default_base: &str, path: &str) -> String {
    let base = if base_url.is_empty() {
        default_base
    } else {
        base_url
    };
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") && (path == "v1" || path.starts_with("v1/")) {
        path = path.trim_start_matches("v1/").trim_start_matches("v1");
    }
    format!("{base}/{path}")
}

/// `usage` of an OpenAI-shaped JSON body, when it carries one.
pub(crate) fn usage_of(value: &JsonValue) -> Option<Usage> {
    let usage = value.get("usage")?;
    serde_json::from_value::<Usage>(usage.clone()).ok()
}

/// Write a complete JSON reply and fold a vanished client into the outcome.
pub(crate) async fn respond_json(
    downstream: &mut Downstream,
    body: Bytes,
    mut outcome: ResponseOutcome,
) -> ResponseOutcome {
    if downstream.respond_json(200, body).await.is_err() {
        outcome.client_gone = true;
    }
    outcome
}
