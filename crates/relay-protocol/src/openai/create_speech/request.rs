use serde::{Deserialize, Serialize};

use crate::openai::create_chat_completions::types::JsonObject;

/// Longest input accepted for text-to-speech, in characters.
pub const MAX_SPEECH_INPUT_CHARS: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl SpeechRequest {
    pub fn input_chars(&self) -> usize {
        self.input.chars().count()
    }
}
