use serde::{Deserialize, Serialize};

use crate::openai::create_chat_completions::types::{JsonObject, ToolCall, Usage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chat_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatCompletionChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatCompletionResponse {
    /// All completion text across choices, used for usage estimation.
    pub fn completion_text(&self) -> String {
        let mut out = String::new();
        for choice in &self.choices {
            if let Some(content) = &choice.message.content {
                out.push_str(content);
            }
            if let Some(calls) = &choice.message.tool_calls {
                for call in calls {
                    out.push_str(&call.function.name);
                    out.push_str(&call.function.arguments);
                }
            }
        }
        out
    }
}

fn chat_completion_object() -> String {
    "chat.completion".to_string()
}

fn assistant_role() -> String {
    "assistant".to_string()
}
