use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use relay_protocol::openai::create_chat_completions::request::TextRequest;
use relay_provider_core::{
    Adaptor, AdaptorError, AdaptorResult, Downstream, Headers, Meta, PROXY_PATH_PREFIX,
    RelayError, ResponseOutcome, TokenEstimator, UpstreamBody, UpstreamHttpResponse, header_set,
};

/// Not forwarded in either direction.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "accept-encoding",
    "connection",
];

const SKIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

/// Reverse proxy to a channel: `/v1/oneapi/proxy/{channel_id}/...` is forwarded
/// verbatim with the channel key as `Authorization`. Nothing is metered.
#[derive(Debug, Default)]
pub struct ProxyAdaptor;

impl ProxyAdaptor {
    pub fn new() -> Self {
        Self
    }
}

fn is_skipped(name: &str, list: &[&str]) -> bool {
    list.iter().any(|skipped| name.eq_ignore_ascii_case(skipped))
}

#[async_trait]
impl Adaptor for ProxyAdaptor {
    async fn request_url(&self, meta: &Meta) -> AdaptorResult<String> {
        let prefix = format!("{PROXY_PATH_PREFIX}/{}", meta.channel_id);
        let path = meta
            .request_path
            .strip_prefix(&prefix)
            .ok_or_else(|| {
                AdaptorError::InvalidRequest(format!(
                    "proxy path must start with {prefix}"
                ))
            })?;
        let url = format!("{}{path}", meta.base());
        Ok(match meta.request_query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => format!("{url}?{query}"),
            None => url,
        })
    }

    async fn setup_request_header(
        &self,
        inbound: &Headers,
        outbound: &mut Headers,
        meta: &Meta,
    ) -> AdaptorResult<()> {
        for (name, value) in inbound {
            if !is_skipped(name, SKIPPED_REQUEST_HEADERS) {
                outbound.push((name.clone(), value.clone()));
            }
        }
        header_set(outbound, "Authorization", meta.api_key.clone());
        Ok(())
    }

    fn convert_request(&self, _meta: &Meta, _request: &TextRequest) -> AdaptorResult<Bytes> {
        Err(AdaptorError::NotImplemented("proxy bodies are forwarded verbatim"))
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: UpstreamHttpResponse,
        downstream: &mut Downstream,
        _estimator: &dyn TokenEstimator,
    ) -> Result<ResponseOutcome, RelayError> {
        let headers: Headers = response
            .headers
            .into_iter()
            .filter(|(name, _)| !is_skipped(name, SKIPPED_RESPONSE_HEADERS))
            .collect();
        let mut outcome = ResponseOutcome::default();
        if downstream.start(response.status, headers).is_err() {
            outcome.client_gone = true;
            return Ok(outcome);
        }
        match response.body {
            UpstreamBody::Bytes(bytes) => {
                if !bytes.is_empty() && downstream.send(bytes).await.is_err() {
                    outcome.client_gone = true;
                }
            }
            UpstreamBody::Stream(mut rx) => {
                while let Some(item) = rx.recv().await {
                    match item {
                        Ok(bytes) => {
                            if downstream.send(bytes).await.is_err() {
                                outcome.client_gone = true;
                                break;
                            }
                        }
                        Err(failure) => {
                            let message = failure.message();
                            warn!(
                                event = "stream_terminated",
                                trace_id = %meta.trace_id,
                                reason = "transport_error",
                                error = %message
                            );
                            outcome.partial_failure = Some(message);
                            break;
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn model_list(&self) -> Vec<String> {
        Vec::new()
    }

    fn channel_name(&self) -> &'static str {
        "proxy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_provider_core::{RelayMode, header_get};

    fn meta() -> Meta {
        let mut meta = Meta::new("t", RelayMode::Proxy);
        meta.channel_id = 7;
        meta.base_url = "https://upstream.example/".to_string();
        meta.request_path = "/v1/oneapi/proxy/7/v1/models".to_string();
        meta.request_query = Some("limit=5".to_string());
        meta.api_key = "raw-key".to_string();
        meta
    }

    #[tokio::test]
    async fn prefix_is_stripped() {
        let url = ProxyAdaptor::new().request_url(&meta()).await.expect("url");
        assert_eq!(url, "https://upstream.example/v1/models?limit=5");
    }

    #[tokio::test]
    async fn hop_headers_are_dropped_and_key_is_raw() {
        let inbound: Headers = vec![
            ("Host".to_string(), "relay.local".to_string()),
            ("Content-Length".to_string(), "12".to_string()),
            ("X-Custom".to_string(), "1".to_string()),
        ];
        let mut outbound = Headers::new();
        ProxyAdaptor::new()
            .setup_request_header(&inbound, &mut outbound, &meta())
            .await
            .expect("headers");
        assert_eq!(header_get(&outbound, "host"), None);
        assert_eq!(header_get(&outbound, "content-length"), None);
        assert_eq!(header_get(&outbound, "x-custom"), Some("1"));
        assert_eq!(header_get(&outbound, "authorization"), Some("raw-key"));
    }

    #[tokio::test]
    async fn upstream_status_and_body_pass_through() {
        let (mut downstream, mut rx) = Downstream::channel();
        let response = UpstreamHttpResponse {
            status: 404,
            headers: vec![
                ("content-type".to_string(), "text/plain".to_string()),
                ("content-length".to_string(), "9".to_string()),
            ],
            body: UpstreamBody::Bytes(Bytes::from_static(b"not found")),
        };
        struct Zero;
        impl TokenEstimator for Zero {
            fn count_text(&self, _text: &str, _model: &str) -> u64 {
                0
            }
        }
        let outcome = ProxyAdaptor::new()
            .do_response(&meta(), response, &mut downstream, &Zero)
            .await
            .expect("forwarded");
        assert!(outcome.usage.is_none());
        let head = rx.head.await.expect("head");
        assert_eq!(head.status, 404);
        assert_eq!(header_get(&head.headers, "content-length"), None);
        assert_eq!(rx.body.recv().await.expect("body"), Bytes::from_static(b"not found"));
    }
}
