mod stream;

pub use stream::GeminiStreamMapper;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value as JsonValue, json};

use relay_protocol::gemini::generate_content::request::{
    Content, FunctionDeclaration, GeminiFunctionCall, GeminiFunctionResponse, GeminiTool,
    GenerateContentRequest, GenerationConfig, InlineData, Part,
};
use relay_protocol::gemini::generate_content::response::{Candidate, GenerateContentResponse};
use relay_protocol::now_unix_seconds;
use relay_protocol::openai::create_chat_completions::request::TextRequest;
use relay_protocol::openai::create_chat_completions::response::{
    ChatCompletionChoice, ChatCompletionResponse, ResponseMessage,
};
use relay_protocol::openai::create_chat_completions::types::{
    ContentPart, FunctionCall, JsonObject, ToolCall, Usage,
};
use relay_provider_core::stream::{StreamTranslator, map_finish_reason};
use relay_provider_core::{
    Adaptor, AdaptorError, AdaptorResult, Downstream, Headers, Meta, RelayError, RelayMode,
    ResponseOutcome, TokenEstimator, UpstreamHttpResponse, check_upstream_response,
};

use crate::auth_extractor;
use crate::providers::respond_json;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_API_VERSION: &str = "v1beta";

pub(crate) const FINISH_REASONS: &[(&str, &str)] = &[
    ("STOP", "stop"),
    ("MAX_TOKENS", "length"),
    ("SAFETY", "content_filter"),
    ("RECITATION", "content_filter"),
];

const MODEL_LIST: &[&str] = &[
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
    "gemini-2.5-flash",
    "gemini-2.5-pro",
];

#[derive(Debug, Default)]
pub struct GeminiAdaptor;

impl GeminiAdaptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    async fn request_url(&self, meta: &Meta) -> AdaptorResult<String> {
        if meta.mode != RelayMode::ChatCompletions {
            return Err(AdaptorError::NotImplemented(meta.mode.as_str()));
        }
        let base = if meta.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            meta.base()
        };
        let version = meta
            .channel_config
            .api_version
            .as_deref()
            .filter(|version| !version.is_empty())
            .unwrap_or(DEFAULT_API_VERSION);
        let action = if meta.is_stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        Ok(format!(
            "{base}/{version}/models/{}:{action}",
            meta.actual_model
        ))
    }

    async fn setup_request_header(
        &self,
        _inbound: &Headers,
        outbound: &mut Headers,
        meta: &Meta,
    ) -> AdaptorResult<()> {
        auth_extractor::set_header(outbound, "x-goog-api-key", &meta.api_key);
        auth_extractor::set_content_type_json(outbound);
        Ok(())
    }

    fn convert_request(&self, _meta: &Meta, request: &TextRequest) -> AdaptorResult<Bytes> {
        let body = convert_generate_request(request)?;
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: UpstreamHttpResponse,
        downstream: &mut Downstream,
        estimator: &dyn TokenEstimator,
    ) -> Result<ResponseOutcome, RelayError> {
        // the stream endpoint answers with a JSON array, so content type says nothing here
        let response = check_upstream_response(response, false).await?;
        if meta.is_stream {
            let mapper = GeminiStreamMapper::new(&meta.trace_id, &meta.actual_model);
            let summary = StreamTranslator::new(mapper, meta, estimator)
                .run(response.body, downstream)
                .await;
            return Ok(summary.into());
        }

        let body = response.body.collect().await?;
        let parsed: GenerateContentResponse = serde_json::from_slice(&body)
            .map_err(|err| RelayError::Internal(format!("decode gemini response: {err}")))?;
        let completion = response_to_completion(&meta.trace_id, &meta.actual_model, parsed);
        let outcome = ResponseOutcome {
            usage: completion.usage.clone().filter(|usage| !usage.is_empty()),
            completion_text: completion.completion_text(),
            ..ResponseOutcome::default()
        };
        let body = serde_json::to_vec(&completion)
            .map_err(|err| RelayError::Internal(format!("encode chat response: {err}")))?;
        Ok(respond_json(downstream, Bytes::from(body), outcome).await)
    }

    fn model_list(&self) -> Vec<String> {
        MODEL_LIST.iter().map(|model| model.to_string()).collect()
    }

    fn channel_name(&self) -> &'static str {
        "gemini"
    }
}

pub(crate) fn convert_generate_request(
    request: &TextRequest,
) -> AdaptorResult<GenerateContentRequest> {
    let mut system_parts: Vec<Part> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        let (role, parts) = match message.role.as_str() {
            "system" | "developer" => {
                system_parts.push(Part::text(message.text()));
                continue;
            }
            "tool" => {
                let name = message
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id).cloned())
                    .or_else(|| message.name.clone())
                    .ok_or_else(|| {
                        AdaptorError::InvalidRequest(
                            "tool message does not name its function".into(),
                        )
                    })?;
                let text = message.text();
                let response = serde_json::from_str::<JsonValue>(&text)
                    .ok()
                    .filter(JsonValue::is_object)
                    .unwrap_or_else(|| json!({ "content": text }));
                let part = Part {
                    function_response: Some(GeminiFunctionResponse { name, response }),
                    ..Part::default()
                };
                ("user", vec![part])
            }
            "assistant" => {
                let mut parts = content_parts(message.content.as_ref().map(|c| c.parts()))?;
                for call in message.tool_calls.iter().flatten() {
                    call_names.insert(call.id.clone(), call.function.name.clone());
                    let args = serde_json::from_str::<JsonValue>(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    parts.push(Part {
                        function_call: Some(GeminiFunctionCall {
                            name: call.function.name.clone(),
                            args,
                        }),
                        ..Part::default()
                    });
                }
                ("model", parts)
            }
            _ => (
                "user",
                content_parts(message.content.as_ref().map(|c| c.parts()))?,
            ),
        };
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    if contents.is_empty() {
        return Err(AdaptorError::InvalidRequest("no user or model contents".into()));
    }

    let declarations: Vec<FunctionDeclaration> = request
        .tools
        .iter()
        .flatten()
        .map(|tool| FunctionDeclaration {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            parameters: tool.function.parameters.clone(),
        })
        .collect();

    let stop_sequences = request.stop_sequences();
    let generation_config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_output_tokens: request
            .max_tokens
            .filter(|max| *max > 0)
            .and_then(|max| u32::try_from(max).ok()),
        stop_sequences: (!stop_sequences.is_empty()).then_some(stop_sequences),
        candidate_count: request.n.filter(|n| *n > 1),
        seed: request.seed,
    };

    Ok(GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| Content {
            role: None,
            parts: system_parts,
        }),
        generation_config: (generation_config != GenerationConfig::default())
            .then_some(generation_config),
        tools: (!declarations.is_empty()).then(|| {
            vec![GeminiTool {
                function_declarations: declarations,
            }]
        }),
        safety_settings: None,
    })
}

/// Gemini only takes inline image bytes, so remote image URLs are refused.
fn content_parts(parts: Option<Vec<ContentPart>>) -> AdaptorResult<Vec<Part>> {
    let mut out = Vec::new();
    for part in parts.unwrap_or_default() {
        match part {
            ContentPart::Text { text } if text.is_empty() => {}
            ContentPart::Text { text } => out.push(Part::text(text)),
            ContentPart::ImageUrl { image_url } => {
                let (mime_type, data) = image_url
                    .url
                    .strip_prefix("data:")
                    .and_then(|rest| rest.split_once(";base64,"))
                    .ok_or_else(|| {
                        AdaptorError::InvalidRequest(
                            "gemini accepts base64 data URLs for images only".into(),
                        )
                    })?;
                out.push(Part {
                    inline_data: Some(InlineData {
                        mime_type: mime_type.to_string(),
                        data: data.to_string(),
                    }),
                    ..Part::default()
                });
            }
        }
    }
    Ok(out)
}

pub(crate) fn candidate_finish_reason(candidate: &Candidate, has_tool_calls: bool) -> Option<String> {
    let reason = candidate.finish_reason.as_deref()?;
    if has_tool_calls && reason == "STOP" {
        return Some("tool_calls".to_string());
    }
    Some(map_finish_reason(FINISH_REASONS, reason))
}

/// Gemini omits `args` for a call without parameters.
pub(crate) fn call_arguments(args: &JsonValue) -> String {
    match args {
        JsonValue::Null => "{}".to_string(),
        args => args.to_string(),
    }
}

pub(crate) fn usage_from(response: &GenerateContentResponse) -> Option<Usage> {
    response
        .usage_metadata
        .as_ref()
        .map(|usage| Usage::new(usage.prompt_token_count, usage.completion_tokens()))
}

pub(crate) fn response_to_completion(
    trace_id: &str,
    model: &str,
    response: GenerateContentResponse,
) -> ChatCompletionResponse {
    let usage = usage_from(&response);
    let choices = response
        .candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| {
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut tool_calls = Vec::new();
            for part in candidate.content.iter().flat_map(|content| &content.parts) {
                if let Some(call) = &part.function_call {
                    tool_calls.push(ToolCall {
                        id: format!("call_{}", tool_calls.len()),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: call.name.clone(),
                            arguments: call_arguments(&call.args),
                        },
                    });
                } else if let Some(part_text) = &part.text {
                    if part.thought.unwrap_or(false) {
                        reasoning.push_str(part_text);
                    } else {
                        text.push_str(part_text);
                    }
                }
            }
            let finish_reason = candidate_finish_reason(candidate, !tool_calls.is_empty());
            ChatCompletionChoice {
                index: candidate.index.unwrap_or(position as u32),
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some(text),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason,
                extra: JsonObject::new(),
            }
        })
        .collect();
    ChatCompletionResponse {
        id: format!("chatcmpl-{trace_id}"),
        object: "chat.completion".to_string(),
        created: now_unix_seconds(),
        model: model.to_string(),
        choices,
        usage,
        extra: JsonObject::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::openai::create_chat_completions::types::{
        ChatMessage, ImageUrl, MessageContent,
    };

    fn request(messages: Vec<ChatMessage>) -> TextRequest {
        TextRequest {
            model: "gemini-2.0-flash".to_string(),
            messages,
            ..TextRequest::default()
        }
    }

    #[tokio::test]
    async fn url_uses_version_and_action() {
        let mut meta = Meta::new("t", RelayMode::ChatCompletions);
        meta.actual_model = "gemini-2.0-flash".to_string();
        let adaptor = GeminiAdaptor::new();
        assert_eq!(
            adaptor.request_url(&meta).await.expect("url"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        meta.is_stream = true;
        meta.channel_config.api_version = Some("v1".to_string());
        meta.base_url = "https://proxy.example/".to_string();
        assert_eq!(
            adaptor.request_url(&meta).await.expect("url"),
            "https://proxy.example/v1/models/gemini-2.0-flash:streamGenerateContent"
        );
    }

    #[test]
    fn roles_and_system_instruction() {
        let mut req = request(vec![
            ChatMessage::new("system", "be brief"),
            ChatMessage::new("user", "hi"),
            ChatMessage::new("assistant", "hello"),
            ChatMessage::new("user", "again"),
        ]);
        req.max_tokens = Some(100);
        let body = convert_generate_request(&req).expect("convert");
        let value = serde_json::to_value(&body).expect("json");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["contents"].as_array().map(Vec::len), Some(3));
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 100);
    }

    #[test]
    fn tool_reply_names_the_function() {
        let mut assistant = ChatMessage::new("assistant", "");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_0".to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: "weather".to_string(),
                arguments: r#"{"city":"Oslo"}"#.to_string(),
            },
        }]);
        let mut tool = ChatMessage::new("tool", "sunny");
        tool.tool_call_id = Some("call_0".to_string());
        let body = convert_generate_request(&request(vec![
            ChatMessage::new("user", "weather?"),
            assistant,
            tool,
        ]))
        .expect("convert");
        let response = body.contents[2].parts[0]
            .function_response
            .as_ref()
            .expect("function response");
        assert_eq!(response.name, "weather");
        assert_eq!(response.response, json!({"content": "sunny"}));
    }

    #[test]
    fn remote_images_are_refused() {
        let mut message = ChatMessage::new("user", "");
        message.content = Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "https://example.com/cat.png".to_string(),
                detail: None,
            },
        }]));
        assert!(matches!(
            convert_generate_request(&request(vec![message])),
            Err(AdaptorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn safety_finish_maps_to_content_filter() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "partial"}]}, "finishReason": "SAFETY"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        }))
        .expect("response");
        let completion = response_to_completion("t", "gemini-2.0-flash", response);
        assert_eq!(
            completion.choices[0].finish_reason.as_deref(),
            Some("content_filter")
        );
        assert_eq!(completion.usage, Some(Usage::new(4, 2)));
    }

    #[test]
    fn call_without_args_gets_empty_object() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"functionCall": {"name": "now"}}]}, "finishReason": "STOP"}]
        }))
        .expect("response");
        let completion = response_to_completion("t", "gemini-2.0-flash", response);
        let calls = completion.choices[0]
            .message
            .tool_calls
            .as_ref()
            .expect("tool calls");
        assert_eq!(calls[0].function.name, "now");
        assert_eq!(calls[0].function.arguments, "{}");
        assert_eq!(
            completion.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }
}
