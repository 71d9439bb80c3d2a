use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::openai::create_chat_completions::types::{ChatMessage, JsonObject, StreamOptions, Tool};

/// The general text request accepted on chat, completions, embeddings and moderations.
///
/// Only the fields the relay inspects are typed; everything else rides in
/// `extra` and is forwarded untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    /// Completions prompt: a string or an array of strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<JsonValue>,
    /// Embeddings / moderations input: a string or an array of strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Not an OpenAI field; forwarded to vendors that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl TextRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options
            .as_ref()
            .and_then(|options| options.include_usage)
            .unwrap_or(false)
    }

    /// `stop` normalized to a list of sequences.
    pub fn stop_sequences(&self) -> Vec<String> {
        match &self.stop {
            Some(JsonValue::String(value)) => vec![value.clone()],
            Some(JsonValue::Array(values)) => values
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Flatten a string-or-array field (`prompt` / `input`) into one text.
    pub fn joined_text(value: Option<&JsonValue>) -> String {
        match value {
            Some(JsonValue::String(text)) => text.clone(),
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(JsonValue::as_str)
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }

    /// Number of entries in `input`, at least one when present.
    pub fn input_len(&self) -> usize {
        match &self.input {
            Some(JsonValue::Array(items)) => items.len(),
            Some(JsonValue::String(text)) if !text.is_empty() => 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_round_trip_through_extra() {
        let raw = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "response_format": {"type": "json_object"},
            "stream": true,
            "stream_options": {"include_usage": true}
        });
        let req: TextRequest = serde_json::from_value(raw).expect("parse");
        assert!(req.is_stream());
        assert!(req.include_usage());
        assert_eq!(req.extra.get("response_format"), Some(&json!({"type": "json_object"})));
        let back = serde_json::to_value(&req).expect("serialize");
        assert_eq!(back["response_format"]["type"], "json_object");
        assert!(back.get("prompt").is_none());
    }

    #[test]
    fn stop_accepts_string_or_list() {
        let req: TextRequest = serde_json::from_value(json!({"stop": "END"})).expect("parse");
        assert_eq!(req.stop_sequences(), vec!["END".to_string()]);
        let req: TextRequest =
            serde_json::from_value(json!({"stop": ["a", "b"]})).expect("parse");
        assert_eq!(req.stop_sequences(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn content_parts_concatenate_text_only() {
        let req: TextRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look "},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}},
                {"type": "text", "text": "here"}
            ]}]
        }))
        .expect("parse");
        assert_eq!(req.messages[0].text(), "look here");
    }
}
