use serde_json::Value as JsonValue;

use relay_protocol::openai::create_chat_completions::stream::ChatCompletionChunk;
use relay_protocol::openai::error::ErrorBody;
use relay_protocol::sse::DONE_SENTINEL;
use relay_provider_core::RelayMode;
use relay_provider_core::stream::{Frame, FrameError, FrameRule, StreamItem, StreamMapper};

use crate::providers::usage_of;

/// OpenAI-compatible streams are already canonical; chat chunks are decoded so
/// the translator can track tool calls, completion chunks pass through raw.
#[derive(Debug)]
pub struct OpenAIStreamMapper {
    mode: RelayMode,
}

impl OpenAIStreamMapper {
    pub fn new(mode: RelayMode) -> Self {
        Self { mode }
    }
}

impl StreamMapper for OpenAIStreamMapper {
    fn frame_rule(&self) -> FrameRule {
        FrameRule::Lines {
            require_data_prefix: true,
        }
    }

    fn map_frame(&mut self, frame: &Frame) -> Result<Vec<StreamItem>, FrameError> {
        let data = frame.data.trim();
        if data == DONE_SENTINEL {
            return Ok(vec![StreamItem::Done]);
        }
        let value: JsonValue = serde_json::from_str(data)?;
        if let Some(error) = stream_error(&value) {
            return Ok(vec![StreamItem::Error(error)]);
        }

        if self.mode == RelayMode::ChatCompletions {
            let chunk: ChatCompletionChunk = serde_json::from_value(value)?;
            return Ok(vec![StreamItem::Chunk(chunk)]);
        }

        let mut items = Vec::new();
        if let Some(usage) = usage_of(&value) {
            items.push(StreamItem::Usage(usage));
        }
        let choices = value
            .get("choices")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        // the trailing usage-only chunk is ours to emit, not the vendor's
        if !choices.is_empty() {
            let text: String = choices
                .iter()
                .filter_map(|choice| choice.get("text").and_then(JsonValue::as_str))
                .collect();
            items.push(StreamItem::Raw {
                data: data.to_string(),
                text,
            });
        }
        Ok(items)
    }
}

fn stream_error(value: &JsonValue) -> Option<ErrorBody> {
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("upstream stream error");
    let r#type = error
        .get("type")
        .and_then(JsonValue::as_str)
        .unwrap_or("upstream_error");
    let mut body = ErrorBody::new(message, r#type);
    body.code = error.get("code").filter(|code| !code.is_null()).cloned();
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_usage_chunk_is_not_forwarded() {
        let mut mapper = OpenAIStreamMapper::new(RelayMode::Completions);
        let items = mapper
            .map_frame(&Frame::data(
                r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
            ))
            .expect("frame");
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], StreamItem::Usage(_)));

        let items = mapper
            .map_frame(&Frame::data(r#"{"choices":[{"index":0,"text":"hi"}]}"#))
            .expect("frame");
        assert!(matches!(&items[0], StreamItem::Raw { text, .. } if text == "hi"));
    }

    #[test]
    fn error_payload_ends_the_stream() {
        let mut mapper = OpenAIStreamMapper::new(RelayMode::ChatCompletions);
        let items = mapper
            .map_frame(&Frame::data(
                r#"{"error":{"message":"overloaded","type":"server_error"}}"#,
            ))
            .expect("frame");
        assert!(matches!(&items[0], StreamItem::Error(error) if error.message == "overloaded"));
    }
}
