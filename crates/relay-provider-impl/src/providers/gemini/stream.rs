use std::collections::HashMap;

use relay_protocol::gemini::generate_content::response::GenerateContentResponse;
use relay_protocol::now_unix_seconds;
use relay_protocol::openai::create_chat_completions::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta,
};
use relay_protocol::openai::create_chat_completions::types::{FunctionCallDelta, ToolCallDelta};
use relay_protocol::openai::error::ErrorBody;
use relay_provider_core::stream::{Frame, FrameError, FrameRule, StreamItem, StreamMapper};

use super::{call_arguments, candidate_finish_reason, usage_from};

/// `streamGenerateContent` without `alt=sse` returns one JSON array that grows
/// an element at a time; each element is cut out by brace matching.
#[derive(Debug)]
pub struct GeminiStreamMapper {
    id: String,
    model: String,
    created: i64,
    /// Function calls seen so far per candidate; Gemini sends each call whole.
    tool_counts: HashMap<u32, u32>,
}

impl GeminiStreamMapper {
    pub fn new(trace_id: &str, model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{trace_id}"),
            model: model.to_string(),
            created: now_unix_seconds(),
            tool_counts: HashMap::new(),
        }
    }
}

impl StreamMapper for GeminiStreamMapper {
    fn frame_rule(&self) -> FrameRule {
        FrameRule::BraceMatched
    }

    fn map_frame(&mut self, frame: &Frame) -> Result<Vec<StreamItem>, FrameError> {
        let value: serde_json::Value = serde_json::from_str(&frame.data)?;
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("upstream stream error");
            let status = error
                .get("status")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("upstream_error");
            return Ok(vec![StreamItem::Error(ErrorBody::new(message, status))]);
        }
        let response: GenerateContentResponse = serde_json::from_value(value)?;

        let mut items = Vec::new();
        if let Some(usage) = usage_from(&response) {
            items.push(StreamItem::Usage(usage));
        }

        let mut chunk = ChatCompletionChunk::new(self.id.clone(), self.model.clone(), self.created);
        for (position, candidate) in response.candidates.iter().enumerate() {
            let index = candidate.index.unwrap_or(position as u32);
            let mut delta = ChunkDelta::default();
            let mut tool_calls = Vec::new();
            for part in candidate.content.iter().flat_map(|content| &content.parts) {
                if let Some(call) = &part.function_call {
                    let count = self.tool_counts.entry(index).or_insert(0);
                    tool_calls.push(ToolCallDelta {
                        index: *count,
                        id: Some(format!("call_{count}")),
                        kind: Some("function".to_string()),
                        function: Some(FunctionCallDelta {
                            name: Some(call.name.clone()),
                            arguments: Some(call_arguments(&call.args)),
                        }),
                    });
                    *count += 1;
                } else if let Some(text) = &part.text {
                    let slot = if part.thought.unwrap_or(false) {
                        &mut delta.reasoning_content
                    } else {
                        &mut delta.content
                    };
                    slot.get_or_insert_with(String::new).push_str(text);
                }
            }
            let has_tool_calls =
                !tool_calls.is_empty() || self.tool_counts.get(&index).is_some_and(|n| *n > 0);
            if !tool_calls.is_empty() {
                delta.tool_calls = Some(tool_calls);
            }
            chunk.choices.push(ChunkChoice {
                index,
                delta,
                finish_reason: candidate_finish_reason(candidate, has_tool_calls),
                ..ChunkChoice::default()
            });
        }
        if !chunk.choices.is_empty() {
            items.push(StreamItem::Chunk(chunk));
        }
        Ok(items)
    }
}
