mod stream;

pub use stream::OpenAIStreamMapper;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;

use relay_protocol::openai::create_chat_completions::request::TextRequest;
use relay_protocol::openai::create_chat_completions::response::ChatCompletionResponse;
use relay_protocol::openai::create_chat_completions::types::{StreamOptions, Usage};
use relay_protocol::openai::create_image::request::ImageRequest;
use relay_protocol::openai::create_speech::request::SpeechRequest;
use relay_provider_core::stream::StreamTranslator;
use relay_provider_core::{
    Adaptor, AdaptorError, AdaptorResult, Downstream, Headers, Meta, RelayError, RelayMode,
    ResponseOutcome, TokenEstimator, UpstreamHttpResponse, check_upstream_response, header_get,
    header_set,
};

use crate::auth_extractor;
use crate::providers::{respond_json, usage_of};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const CLOUDFLARE_GATEWAY_PREFIX: &str = "https://gateway.ai.cloudflare.com";

const MODEL_LIST: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1",
    "gpt-4.1-mini",
    "o1",
    "o3-mini",
    "text-embedding-3-small",
    "text-embedding-3-large",
    "text-moderation-latest",
    "dall-e-2",
    "dall-e-3",
    "tts-1",
    "tts-1-hd",
    "whisper-1",
];

/// Vendors speaking the OpenAI wire format with their own URL and auth rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAIVariant {
    OpenAI,
    Azure,
    OpenRouter,
}

#[derive(Debug)]
pub struct OpenAIAdaptor {
    variant: OpenAIVariant,
}

impl OpenAIAdaptor {
    pub fn new(variant: OpenAIVariant) -> Self {
        Self { variant }
    }

    fn azure_url(&self, meta: &Meta) -> AdaptorResult<String> {
        let api_version = meta
            .channel_config
            .api_version
            .as_deref()
            .filter(|version| !version.is_empty())
            .ok_or_else(|| {
                AdaptorError::InvalidChannelConfig("azure channel requires api_version".into())
            })?;
        let base = meta.base();
        let deployment = meta.actual_model.replace('.', "");
        if meta.mode == RelayMode::ImagesGenerations {
            return Ok(format!(
                "{base}/openai/deployments/{deployment}/images/generations?api-version={api_version}"
            ));
        }
        let task = meta.request_path.trim_start_matches("/v1/");
        Ok(format!(
            "{base}/openai/deployments/{deployment}/{task}?api-version={api_version}"
        ))
    }
}

/// Base URL plus the inbound path. Cloudflare AI Gateway bases already carry
/// the provider segment, so the leading `/v1` is dropped there.
fn full_request_url(meta: &Meta) -> String {
    let base = if meta.base_url.is_empty() {
        DEFAULT_BASE_URL
    } else {
        meta.base()
    };
    let mut path = meta.request_path.as_str();
    if base.starts_with(CLOUDFLARE_GATEWAY_PREFIX) {
        path = path.strip_prefix("/v1").unwrap_or(path);
    }
    match meta.request_query.as_deref().filter(|query| !query.is_empty()) {
        Some(query) => format!("{base}{path}?{query}"),
        None => format!("{base}{path}"),
    }
}

fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("o1") || model.starts_with("o3")
}

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    async fn request_url(&self, meta: &Meta) -> AdaptorResult<String> {
        match self.variant {
            OpenAIVariant::Azure => self.azure_url(meta),
            OpenAIVariant::OpenAI | OpenAIVariant::OpenRouter => Ok(full_request_url(meta)),
        }
    }

    async fn setup_request_header(
        &self,
        inbound: &Headers,
        outbound: &mut Headers,
        meta: &Meta,
    ) -> AdaptorResult<()> {
        auth_extractor::copy_content_negotiation(inbound, outbound, meta.is_stream);
        match self.variant {
            OpenAIVariant::Azure => {
                auth_extractor::set_header(outbound, "api-key", &meta.api_key);
            }
            OpenAIVariant::OpenAI => auth_extractor::set_bearer(outbound, &meta.api_key),
            OpenAIVariant::OpenRouter => {
                auth_extractor::set_bearer(outbound, &meta.api_key);
                if let Some(site_url) = meta.channel_config.site_url.as_deref() {
                    auth_extractor::set_header(outbound, "HTTP-Referer", site_url);
                }
                if let Some(site_name) = meta.channel_config.site_name.as_deref() {
                    auth_extractor::set_header(outbound, "X-Title", site_name);
                }
            }
        }
        Ok(())
    }

    fn convert_request(&self, meta: &Meta, request: &TextRequest) -> AdaptorResult<Bytes> {
        let mut request = request.clone();
        request.model = meta.actual_model.clone();
        if meta.is_stream
            && matches!(meta.mode, RelayMode::ChatCompletions | RelayMode::Completions)
        {
            request.stream_options = Some(StreamOptions {
                include_usage: Some(true),
            });
        }
        if is_reasoning_model(&request.model) {
            request.messages.retain(|message| message.role != "system");
            if let Some(max_tokens) = request.max_tokens.take() {
                request
                    .extra
                    .insert("max_completion_tokens".to_string(), JsonValue::from(max_tokens));
            }
        }
        Ok(Bytes::from(serde_json::to_vec(&request)?))
    }

    fn convert_image_request(&self, meta: &Meta, request: &ImageRequest) -> AdaptorResult<Bytes> {
        let mut request = request.clone();
        request.model = meta.actual_model.clone();
        Ok(Bytes::from(serde_json::to_vec(&request)?))
    }

    fn convert_speech_request(
        &self,
        meta: &Meta,
        request: &SpeechRequest,
    ) -> AdaptorResult<Bytes> {
        let mut request = request.clone();
        request.model = meta.actual_model.clone();
        Ok(Bytes::from(serde_json::to_vec(&request)?))
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: UpstreamHttpResponse,
        downstream: &mut Downstream,
        estimator: &dyn TokenEstimator,
    ) -> Result<ResponseOutcome, RelayError> {
        let response = check_upstream_response(response, meta.is_stream).await?;

        if meta.is_stream && matches!(meta.mode, RelayMode::ChatCompletions | RelayMode::Completions)
        {
            let summary = StreamTranslator::new(OpenAIStreamMapper::new(meta.mode), meta, estimator)
                .run(response.body, downstream)
                .await;
            return Ok(summary.into());
        }

        let content_type = header_get(&response.headers, "content-type").map(str::to_string);
        let body = response.body.collect().await?;

        match meta.mode {
            RelayMode::AudioSpeech => {
                let mut headers = Headers::new();
                if let Some(content_type) = content_type {
                    header_set(&mut headers, "content-type", content_type);
                }
                let outcome = ResponseOutcome {
                    usage: Some(Usage::new(meta.prompt_tokens, 0)),
                    ..ResponseOutcome::default()
                };
                Ok(forward(downstream, headers, body, outcome).await)
            }
            RelayMode::AudioTranscription | RelayMode::AudioTranslation => {
                let transcript = transcript_text(&body);
                let prompt = estimator.count_text(&transcript, &meta.actual_model);
                let mut headers = Headers::new();
                header_set(
                    &mut headers,
                    "content-type",
                    content_type.unwrap_or_else(|| "application/json".to_string()),
                );
                let outcome = ResponseOutcome {
                    usage: Some(Usage::new(prompt, 0)),
                    ..ResponseOutcome::default()
                };
                Ok(forward(downstream, headers, body, outcome).await)
            }
            RelayMode::ChatCompletions => {
                // forwarded verbatim even when it does not decode; usage is then estimated
                let parsed = serde_json::from_slice::<ChatCompletionResponse>(&body).ok();
                let outcome = ResponseOutcome {
                    usage: parsed
                        .as_ref()
                        .and_then(|parsed| parsed.usage.clone())
                        .filter(|usage| !usage.is_empty()),
                    completion_text: parsed
                        .as_ref()
                        .map(ChatCompletionResponse::completion_text)
                        .unwrap_or_default(),
                    ..ResponseOutcome::default()
                };
                Ok(respond_json(downstream, body, outcome).await)
            }
            _ => {
                let value: JsonValue = serde_json::from_slice(&body).unwrap_or(JsonValue::Null);
                let completion_text = value
                    .get("choices")
                    .and_then(JsonValue::as_array)
                    .map(|choices| {
                        choices
                            .iter()
                            .filter_map(|choice| choice.get("text").and_then(JsonValue::as_str))
                            .collect::<String>()
                    })
                    .unwrap_or_default();
                let outcome = ResponseOutcome {
                    usage: usage_of(&value).filter(|usage| !usage.is_empty()),
                    completion_text,
                    ..ResponseOutcome::default()
                };
                Ok(respond_json(downstream, body, outcome).await)
            }
        }
    }

    fn model_list(&self) -> Vec<String> {
        MODEL_LIST.iter().map(|model| model.to_string()).collect()
    }

    fn channel_name(&self) -> &'static str {
        match self.variant {
            OpenAIVariant::OpenAI => "openai",
            OpenAIVariant::Azure => "azure",
            OpenAIVariant::OpenRouter => "openrouter",
        }
    }
}

/// `text` of a JSON transcription, or the whole body for text/srt/vtt formats.
fn transcript_text(body: &[u8]) -> String {
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(value) => value
            .get("text")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

async fn forward(
    downstream: &mut Downstream,
    headers: Headers,
    body: Bytes,
    mut outcome: ResponseOutcome,
) -> ResponseOutcome {
    if downstream.respond(200, headers, body).await.is_err() {
        outcome.client_gone = true;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::openai::create_chat_completions::types::ChatMessage;
    use serde_json::json;

    fn meta(mode: RelayMode, path: &str) -> Meta {
        let mut meta = Meta::new("trace", mode);
        meta.base_url = "https://api.openai.com/".to_string();
        meta.request_path = path.to_string();
        meta.actual_model = "gpt-4o".to_string();
        meta.api_key = "sk-test".to_string();
        meta
    }

    #[tokio::test]
    async fn plain_openai_url_keeps_path_and_query() {
        let mut meta = meta(RelayMode::ChatCompletions, "/v1/chat/completions");
        meta.request_query = Some("foo=bar".to_string());
        let adaptor = OpenAIAdaptor::new(OpenAIVariant::OpenAI);
        assert_eq!(
            adaptor.request_url(&meta).await.expect("url"),
            "https://api.openai.com/v1/chat/completions?foo=bar"
        );
    }

    #[tokio::test]
    async fn cloudflare_gateway_drops_v1() {
        let mut meta = meta(RelayMode::Embeddings, "/v1/embeddings");
        meta.base_url = "https://gateway.ai.cloudflare.com/v1/acct/gw/openai".to_string();
        let adaptor = OpenAIAdaptor::new(OpenAIVariant::OpenAI);
        assert_eq!(
            adaptor.request_url(&meta).await.expect("url"),
            "https://gateway.ai.cloudflare.com/v1/acct/gw/openai/embeddings"
        );
    }

    #[tokio::test]
    async fn azure_uses_deployment_without_dots() {
        let mut meta = meta(RelayMode::ChatCompletions, "/v1/chat/completions");
        meta.base_url = "https://res.openai.azure.com".to_string();
        meta.actual_model = "gpt-3.5-turbo".to_string();
        meta.channel_config.api_version = Some("2024-02-01".to_string());
        let adaptor = OpenAIAdaptor::new(OpenAIVariant::Azure);
        assert_eq!(
            adaptor.request_url(&meta).await.expect("url"),
            "https://res.openai.azure.com/openai/deployments/gpt-35-turbo/chat/completions?api-version=2024-02-01"
        );

        let mut headers = Headers::new();
        adaptor
            .setup_request_header(&Headers::new(), &mut headers, &meta)
            .await
            .expect("headers");
        assert_eq!(header_get(&headers, "api-key"), Some("sk-test"));
        assert_eq!(header_get(&headers, "authorization"), None);
    }

    #[tokio::test]
    async fn azure_image_deployment_drops_dots_too() {
        let mut meta = meta(RelayMode::ImagesGenerations, "/v1/images/generations");
        meta.base_url = "https://res.openai.azure.com".to_string();
        meta.actual_model = "dall-e-3.1".to_string();
        meta.channel_config.api_version = Some("2024-02-01".to_string());
        let adaptor = OpenAIAdaptor::new(OpenAIVariant::Azure);
        assert_eq!(
            adaptor.request_url(&meta).await.expect("url"),
            "https://res.openai.azure.com/openai/deployments/dall-e-31/images/generations?api-version=2024-02-01"
        );
    }

    #[tokio::test]
    async fn azure_without_api_version_is_a_config_error() {
        let meta = meta(RelayMode::ChatCompletions, "/v1/chat/completions");
        let adaptor = OpenAIAdaptor::new(OpenAIVariant::Azure);
        assert!(matches!(
            adaptor.request_url(&meta).await,
            Err(AdaptorError::InvalidChannelConfig(_))
        ));
    }

    #[tokio::test]
    async fn openrouter_adds_site_headers() {
        let mut meta = meta(RelayMode::ChatCompletions, "/v1/chat/completions");
        meta.channel_config.site_url = Some("https://relay.example".to_string());
        meta.channel_config.site_name = Some("Relay".to_string());
        let adaptor = OpenAIAdaptor::new(OpenAIVariant::OpenRouter);
        let mut headers = Headers::new();
        adaptor
            .setup_request_header(&Headers::new(), &mut headers, &meta)
            .await
            .expect("headers");
        assert_eq!(header_get(&headers, "authorization"), Some("Bearer sk-test"));
        assert_eq!(header_get(&headers, "HTTP-Referer"), Some("https://relay.example"));
        assert_eq!(header_get(&headers, "X-Title"), Some("Relay"));
    }

    #[test]
    fn streaming_forces_usage_and_reasoning_models_drop_system() {
        let mut meta = meta(RelayMode::ChatCompletions, "/v1/chat/completions");
        meta.is_stream = true;
        meta.actual_model = "o1-mini".to_string();
        let request = TextRequest {
            model: "my-o1".to_string(),
            messages: vec![
                ChatMessage::new("system", "be brief"),
                ChatMessage::new("user", "hi"),
            ],
            max_tokens: Some(64),
            stream: Some(true),
            ..TextRequest::default()
        };
        let adaptor = OpenAIAdaptor::new(OpenAIVariant::OpenAI);
        let body = adaptor.convert_request(&meta, &request).expect("convert");
        let value: JsonValue = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["model"], "o1-mini");
        assert_eq!(value["stream_options"], json!({"include_usage": true}));
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(1));
        assert_eq!(value["max_completion_tokens"], 64);
        assert!(value.get("max_tokens").is_none());
    }
}
