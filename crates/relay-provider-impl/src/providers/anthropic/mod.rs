mod stream;

pub use stream::AnthropicStreamMapper;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value as JsonValue, json};

use relay_protocol::claude::create_message::request::{
    ANTHROPIC_VERSION, ClaudeMessage, ClaudeTool, ContentBlock, CreateMessageRequest, ImageSource,
};
use relay_protocol::claude::create_message::response::CreateMessageResponse;
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
use crate::providers::{build_url, respond_json};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub(crate) const STOP_REASONS: &[(&str, &str)] = &[
    ("end_turn", "stop"),
    ("stop_sequence", "stop"),
    ("max_tokens", "length"),
    ("tool_use", "tool_calls"),
];

const MODEL_LIST: &[&str] = &[
    "claude-3-5-haiku-latest",
    "claude-3-7-sonnet-latest",
    "claude-sonnet-4-20250514",
    "claude-opus-4-20250514",
];

#[derive(Debug, Default)]
pub struct AnthropicAdaptor;

impl AnthropicAdaptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    async fn request_url(&self, meta: &Meta) -> AdaptorResult<String> {
        if meta.mode != RelayMode::ChatCompletions {
            return Err(AdaptorError::NotImplemented(meta.mode.as_str()));
        }
        Ok(build_url(meta.base(), DEFAULT_BASE_URL, "/v1/messages"))
    }

    async fn setup_request_header(
        &self,
        _inbound: &Headers,
        outbound: &mut Headers,
        meta: &Meta,
    ) -> AdaptorResult<()> {
        auth_extractor::set_header(outbound, "x-api-key", &meta.api_key);
        auth_extractor::set_header(outbound, "anthropic-version", ANTHROPIC_VERSION);
        auth_extractor::set_content_type_json(outbound);
        auth_extractor::set_accept(outbound, meta.is_stream);
        Ok(())
    }

    fn convert_request(&self, meta: &Meta, request: &TextRequest) -> AdaptorResult<Bytes> {
        let body = convert_messages_request(&meta.actual_model, request)?;
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: UpstreamHttpResponse,
        downstream: &mut Downstream,
        estimator: &dyn TokenEstimator,
    ) -> Result<ResponseOutcome, RelayError> {
        let response = check_upstream_response(response, meta.is_stream).await?;
        if meta.is_stream {
            let summary = StreamTranslator::new(AnthropicStreamMapper::new(), meta, estimator)
                .run(response.body, downstream)
                .await;
            return Ok(summary.into());
        }

        let body = response.body.collect().await?;
        let parsed: CreateMessageResponse = serde_json::from_slice(&body)
            .map_err(|err| RelayError::Internal(format!("decode anthropic response: {err}")))?;
        let completion = message_to_completion(parsed);
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
        "anthropic"
    }
}

pub(crate) fn convert_messages_request(
    model: &str,
    request: &TextRequest,
) -> AdaptorResult<CreateMessageRequest> {
    let mut system: Vec<String> = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();

    for message in &request.messages {
        let (role, blocks) = match message.role.as_str() {
            "system" | "developer" => {
                system.push(message.text());
                continue;
            }
            "tool" => {
                let tool_use_id = message.tool_call_id.clone().ok_or_else(|| {
                    AdaptorError::InvalidRequest("tool message without tool_call_id".into())
                })?;
                let block = ContentBlock::ToolResult {
                    tool_use_id,
                    content: message.text(),
                };
                ("user", vec![block])
            }
            "assistant" => {
                let mut blocks = content_blocks(message.content.as_ref().map(|c| c.parts()));
                for call in message.tool_calls.iter().flatten() {
                    let input = serde_json::from_str::<JsonValue>(&call.function.arguments)
                        .ok()
                        .filter(JsonValue::is_object)
                        .unwrap_or_else(|| json!({}));
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input,
                    });
                }
                ("assistant", blocks)
            }
            _ => (
                "user",
                content_blocks(message.content.as_ref().map(|c| c.parts())),
            ),
        };
        if blocks.is_empty() {
            continue;
        }
        // consecutive turns of one role are merged; the API requires alternation
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => messages.push(ClaudeMessage {
                role: role.to_string(),
                content: blocks,
            }),
        }
    }

    if messages.is_empty() {
        return Err(AdaptorError::InvalidRequest(
            "no user or assistant messages".into(),
        ));
    }

    let tools: Vec<ClaudeTool> = request
        .tools
        .iter()
        .flatten()
        .map(|tool| ClaudeTool {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: tool
                .function
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect();
    let tool_choice = if tools.is_empty() {
        None
    } else {
        Some(convert_tool_choice(request.tool_choice.as_ref()))
    };

    let stop_sequences = request.stop_sequences();
    Ok(CreateMessageRequest {
        model: model.to_string(),
        messages,
        system: (!system.is_empty()).then(|| system.join("\n")),
        max_tokens: request
            .max_tokens
            .filter(|max| *max > 0)
            .and_then(|max| u32::try_from(max).ok())
            .unwrap_or(DEFAULT_MAX_TOKENS),
        stop_sequences: (!stop_sequences.is_empty()).then_some(stop_sequences),
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice,
    })
}

fn content_blocks(parts: Option<Vec<ContentPart>>) -> Vec<ContentBlock> {
    parts
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if text.is_empty() => None,
            ContentPart::Text { text } => Some(ContentBlock::Text { text }),
            ContentPart::ImageUrl { image_url } => Some(ContentBlock::Image {
                source: image_source(&image_url.url),
            }),
        })
        .collect()
}

/// `data:` URLs become base64 sources; anything else is passed as a URL source.
fn image_source(url: &str) -> ImageSource {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((media_type, data)) = rest.split_once(";base64,")
    {
        return ImageSource {
            r#type: "base64".to_string(),
            media_type: Some(media_type.to_string()),
            data: Some(data.to_string()),
            url: None,
        };
    }
    ImageSource {
        r#type: "url".to_string(),
        media_type: None,
        data: None,
        url: Some(url.to_string()),
    }
}

fn convert_tool_choice(choice: Option<&JsonValue>) -> JsonValue {
    match choice {
        Some(JsonValue::String(kind)) if kind == "required" || kind == "any" => {
            json!({"type": "any"})
        }
        Some(JsonValue::String(kind)) if kind == "none" => json!({"type": "none"}),
        Some(JsonValue::Object(choice)) => {
            match choice
                .get("function")
                .and_then(|function| function.get("name"))
                .and_then(JsonValue::as_str)
            {
                Some(name) => json!({"type": "tool", "name": name}),
                None => json!({"type": "auto"}),
            }
        }
        _ => json!({"type": "auto"}),
    }
}

pub(crate) fn message_to_completion(message: CreateMessageResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in message.content {
        match block {
            ContentBlock::Text { text: part } => text.push_str(&part),
            ContentBlock::Thinking { thinking } => reasoning.push_str(&thinking),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                kind: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }
    let finish_reason = message
        .stop_reason
        .as_deref()
        .map(|reason| map_finish_reason(STOP_REASONS, reason));
    ChatCompletionResponse {
        id: message.id,
        object: "chat.completion".to_string(),
        created: now_unix_seconds(),
        model: message.model,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: Some(text),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason,
            extra: JsonObject::new(),
        }],
        usage: Some(Usage::new(
            message.usage.prompt_tokens(),
            message.usage.output_tokens,
        )),
        extra: JsonObject::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::openai::create_chat_completions::types::{
        ChatMessage, FunctionDefinition, ImageUrl, MessageContent, Tool,
    };

    fn request(messages: Vec<ChatMessage>) -> TextRequest {
        TextRequest {
            model: "claude".to_string(),
            messages,
            ..TextRequest::default()
        }
    }

    #[test]
    fn system_and_default_max_tokens() {
        let body = convert_messages_request(
            "claude-sonnet-4-20250514",
            &request(vec![
                ChatMessage::new("system", "be brief"),
                ChatMessage::new("user", "hi"),
            ]),
        )
        .expect("convert");
        assert_eq!(body.system.as_deref(), Some("be brief"));
        assert_eq!(body.max_tokens, 4096);
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn tool_round_trip_becomes_tool_use_and_result() {
        let mut assistant = ChatMessage::new("assistant", "");
        assistant.content = None;
        assistant.tool_calls = Some(vec![ToolCall {
            id: "toolu_1".to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: "lookup".to_string(),
                arguments: r#"{"q":"rust"}"#.to_string(),
            },
        }]);
        let mut tool = ChatMessage::new("tool", "42");
        tool.tool_call_id = Some("toolu_1".to_string());

        let mut req = request(vec![ChatMessage::new("user", "find"), assistant, tool]);
        req.tools = Some(vec![Tool {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: "lookup".to_string(),
                description: None,
                parameters: Some(json!({"type": "object"})),
            },
        }]);
        req.tool_choice = Some(json!({"type": "function", "function": {"name": "lookup"}}));

        let body = convert_messages_request("claude", &req).expect("convert");
        assert_eq!(body.messages.len(), 3);
        assert!(matches!(
            &body.messages[1].content[0],
            ContentBlock::ToolUse { input, .. } if input["q"] == "rust"
        ));
        assert_eq!(body.messages[2].role, "user");
        assert!(matches!(
            &body.messages[2].content[0],
            ContentBlock::ToolResult { tool_use_id, content } if tool_use_id == "toolu_1" && content == "42"
        ));
        assert_eq!(body.tool_choice, Some(json!({"type": "tool", "name": "lookup"})));
    }

    #[test]
    fn data_url_images_become_base64_sources() {
        let mut message = ChatMessage::new("user", "");
        message.content = Some(MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is this".to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,iVBORw0".to_string(),
                    detail: None,
                },
            },
        ]));
        let body = convert_messages_request("claude", &request(vec![message])).expect("convert");
        match &body.messages[0].content[1] {
            ContentBlock::Image { source } => {
                assert_eq!(source.r#type, "base64");
                assert_eq!(source.media_type.as_deref(), Some("image/png"));
                assert_eq!(source.data.as_deref(), Some("iVBORw0"));
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn stop_reasons_map_to_canonical() {
        let response: CreateMessageResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "model": "claude",
            "role": "assistant",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
        .expect("response");
        let completion = message_to_completion(response);
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(completion.usage, Some(Usage::new(10, 5)));
        assert_eq!(map_finish_reason(STOP_REASONS, "pause_turn"), "pause_turn");
    }
}
