use std::collections::HashMap;

use relay_protocol::claude::create_message::request::ContentBlock;
use relay_protocol::claude::create_message::stream::{BlockDelta, StreamEvent};
use relay_protocol::now_unix_seconds;
use relay_protocol::openai::create_chat_completions::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta,
};
use relay_protocol::openai::create_chat_completions::types::{
    FunctionCallDelta, ToolCallDelta, Usage,
};
use relay_protocol::openai::error::ErrorBody;
use relay_provider_core::stream::{
    Frame, FrameError, FrameRule, StreamItem, StreamMapper, map_finish_reason,
};

use super::STOP_REASONS;

/// Messages API event blocks to canonical chunks.
///
/// Tool-use blocks are numbered in the order they open; their `input_json_delta`
/// fragments are routed by content-block index to that number.
#[derive(Debug)]
pub struct AnthropicStreamMapper {
    id: String,
    model: String,
    created: i64,
    prompt_tokens: u64,
    tool_indexes: HashMap<u32, u32>,
}

impl AnthropicStreamMapper {
    pub fn new() -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            created: now_unix_seconds(),
            prompt_tokens: 0,
            tool_indexes: HashMap::new(),
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> StreamItem {
        StreamItem::Chunk(
            ChatCompletionChunk::new(self.id.clone(), self.model.clone(), self.created).with_choice(
                ChunkChoice {
                    index: 0,
                    delta,
                    finish_reason,
                    ..ChunkChoice::default()
                },
            ),
        )
    }

    fn tool_delta(&self, delta: ToolCallDelta) -> StreamItem {
        self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![delta]),
                ..ChunkDelta::default()
            },
            None,
        )
    }
}

impl Default for AnthropicStreamMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMapper for AnthropicStreamMapper {
    fn frame_rule(&self) -> FrameRule {
        FrameRule::EventBlocks
    }

    fn map_frame(&mut self, frame: &Frame) -> Result<Vec<StreamItem>, FrameError> {
        let event: StreamEvent = serde_json::from_str(&frame.data)?;
        let items = match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                let mut items = Vec::new();
                if let Some(usage) = message.usage {
                    self.prompt_tokens = usage.prompt_tokens();
                    items.push(StreamItem::Usage(Usage::new(
                        self.prompt_tokens,
                        usage.output_tokens,
                    )));
                }
                items.push(self.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
                items
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.tool_indexes.len() as u32;
                    self.tool_indexes.insert(index, tool_index);
                    vec![self.tool_delta(ToolCallDelta {
                        index: tool_index,
                        id: Some(id),
                        kind: Some("function".to_string()),
                        function: Some(FunctionCallDelta {
                            name: Some(name),
                            arguments: Some(String::new()),
                        }),
                    })]
                }
                ContentBlock::Text { text } if !text.is_empty() => vec![self.chunk(
                    ChunkDelta {
                        content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                )],
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![self.chunk(
                    ChunkDelta {
                        content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                )],
                BlockDelta::ThinkingDelta { thinking } => vec![self.chunk(
                    ChunkDelta {
                        reasoning_content: Some(thinking),
                        ..ChunkDelta::default()
                    },
                    None,
                )],
                BlockDelta::InputJsonDelta { partial_json } => {
                    let tool_index = self.tool_indexes.get(&index).copied().ok_or_else(|| {
                        FrameError::new(format!("input_json_delta for unopened block {index}"))
                    })?;
                    vec![self.tool_delta(ToolCallDelta {
                        index: tool_index,
                        id: None,
                        kind: None,
                        function: Some(FunctionCallDelta {
                            name: None,
                            arguments: Some(partial_json),
                        }),
                    })]
                }
                BlockDelta::Other => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let mut items = Vec::new();
                if let Some(usage) = usage {
                    let prompt = usage.prompt_tokens().max(self.prompt_tokens);
                    items.push(StreamItem::Usage(Usage::new(prompt, usage.output_tokens)));
                }
                if let Some(reason) = delta.stop_reason {
                    items.push(self.chunk(
                        ChunkDelta::default(),
                        Some(map_finish_reason(STOP_REASONS, &reason)),
                    ));
                }
                items
            }
            StreamEvent::MessageStop => vec![StreamItem::Done],
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping => Vec::new(),
            StreamEvent::Error { error } => {
                vec![StreamItem::Error(ErrorBody::new(error.message, error.r#type))]
            }
        };
        Ok(items)
    }
}
