use serde::{Deserialize, Serialize};

use crate::openai::create_chat_completions::types::JsonObject;

pub const DEFAULT_IMAGE_MODEL: &str = "dall-e-2";
pub const DEFAULT_IMAGE_SIZE: &str = "1024x1024";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl ImageRequest {
    /// Fill in the OpenAI defaults for `model`, `n` and `size`.
    pub fn apply_defaults(&mut self) {
        if self.model.is_empty() {
            self.model = DEFAULT_IMAGE_MODEL.to_string();
        }
        if self.n.unwrap_or(0) == 0 {
            self.n = Some(1);
        }
        if self.size.as_deref().unwrap_or("").is_empty() {
            self.size = Some(DEFAULT_IMAGE_SIZE.to_string());
        }
    }

    pub fn count(&self) -> u32 {
        self.n.unwrap_or(1).max(1)
    }

    pub fn size_or_default(&self) -> &str {
        self.size.as_deref().unwrap_or(DEFAULT_IMAGE_SIZE)
    }
}
