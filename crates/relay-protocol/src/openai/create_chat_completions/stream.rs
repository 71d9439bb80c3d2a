use serde::{Deserialize, Serialize};

use crate::openai::create_chat_completions::types::{JsonObject, ToolCallDelta, Usage};

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    /// Serialized as `null` until the choice finishes, as OpenAI does.
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl ChatCompletionChunk {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            object: CHUNK_OBJECT.to_string(),
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: None,
            extra: JsonObject::new(),
        }
    }

    /// Convenience for a single-choice chunk.
    pub fn with_choice(mut self, choice: ChunkChoice) -> Self {
        self.choices.push(choice);
        self
    }
}

impl ChunkChoice {
    pub fn text(index: u32, content: impl Into<String>) -> Self {
        Self {
            index,
            delta: ChunkDelta {
                content: Some(content.into()),
                ..ChunkDelta::default()
            },
            finish_reason: None,
            extra: JsonObject::new(),
        }
    }

    pub fn finish(index: u32, reason: impl Into<String>) -> Self {
        Self {
            index,
            delta: ChunkDelta::default(),
            finish_reason: Some(reason.into()),
            extra: JsonObject::new(),
        }
    }
}

fn chunk_object() -> String {
    CHUNK_OBJECT.to_string()
}
