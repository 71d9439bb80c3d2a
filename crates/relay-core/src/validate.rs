//! Canonical request checks. Everything here runs before any quota is
//! reserved, so a rejected request never touches the ledger.

use relay_protocol::openai::create_chat_completions::request::TextRequest;
use relay_protocol::openai::create_image::request::ImageRequest;
use relay_protocol::openai::create_speech::request::{MAX_SPEECH_INPUT_CHARS, SpeechRequest};
use relay_provider_core::{RelayError, RelayMode};

pub const MAX_TOKENS_LIMIT: i64 = (i32::MAX / 2) as i64;
pub const DEFAULT_MODERATION_MODEL: &str = "text-moderation-latest";

const INVALID_MAX_TOKENS: &str = "invalid_max_tokens";
const REQUIRED_FIELD_MISSING: &str = "required_field_missing";

fn missing(field: &str) -> RelayError {
    RelayError::invalid_request(REQUIRED_FIELD_MISSING, format!("{field} is required"))
}

/// Chat, completions, embeddings and moderations. Fills the moderation model
/// default in place.
pub fn validate_text_request(mode: RelayMode, request: &mut TextRequest) -> Result<(), RelayError> {
    if mode == RelayMode::Moderations && request.model.trim().is_empty() {
        request.model = DEFAULT_MODERATION_MODEL.to_string();
    }
    if let Some(max_tokens) = request.max_tokens
        && !(0..=MAX_TOKENS_LIMIT).contains(&max_tokens)
    {
        return Err(RelayError::invalid_request(
            INVALID_MAX_TOKENS,
            format!("max_tokens must be within [0, {MAX_TOKENS_LIMIT}]"),
        ));
    }
    if request.model.trim().is_empty() {
        return Err(missing("model"));
    }
    match mode {
        RelayMode::ChatCompletions if request.messages.is_empty() => Err(missing("messages")),
        RelayMode::Completions if is_blank(request.prompt.as_ref()) => Err(missing("prompt")),
        RelayMode::Embeddings | RelayMode::Moderations if is_blank(request.input.as_ref()) => {
            Err(missing("input"))
        }
        _ => Ok(()),
    }
}

fn is_blank(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::String(text)) => text.is_empty(),
        Some(serde_json::Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// Applies the OpenAI defaults (`dall-e-2`, one image, 1024x1024) first.
pub fn validate_image_request(request: &mut ImageRequest) -> Result<(), RelayError> {
    request.apply_defaults();
    if request.prompt.trim().is_empty() {
        return Err(missing("prompt"));
    }
    if request.model == "dall-e-3" && request.count() != 1 {
        return Err(RelayError::invalid_request(
            "n_not_within_range",
            "dall-e-3 only supports n = 1",
        ));
    }
    Ok(())
}

pub fn validate_speech_request(request: &SpeechRequest) -> Result<(), RelayError> {
    if request.model.trim().is_empty() {
        return Err(missing("model"));
    }
    if request.input.is_empty() {
        return Err(missing("input"));
    }
    if request.input_chars() > MAX_SPEECH_INPUT_CHARS {
        return Err(RelayError::invalid_request(
            "text_too_long",
            format!("input is longer than {MAX_SPEECH_INPUT_CHARS} characters"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(value: serde_json::Value) -> TextRequest {
        serde_json::from_value(value).expect("request")
    }

    fn code(err: RelayError) -> &'static str {
        err.code()
    }

    #[test]
    fn max_tokens_bounds() {
        let mut request = text(json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}], "max_tokens": -1}));
        assert_eq!(
            code(validate_text_request(RelayMode::ChatCompletions, &mut request).expect_err("negative")),
            "invalid_max_tokens"
        );
        request.max_tokens = Some(MAX_TOKENS_LIMIT);
        assert!(validate_text_request(RelayMode::ChatCompletions, &mut request).is_ok());
        request.max_tokens = Some(MAX_TOKENS_LIMIT + 1);
        assert!(validate_text_request(RelayMode::ChatCompletions, &mut request).is_err());
    }

    #[test]
    fn per_mode_required_fields() {
        let mut chat = text(json!({"model": "gpt-4o", "messages": []}));
        let err = validate_text_request(RelayMode::ChatCompletions, &mut chat).expect_err("empty");
        assert_eq!(err.code(), "required_field_missing");
        assert_eq!(err.to_string(), "messages is required");

        let mut completion = text(json!({"model": "gpt-3.5-turbo-instruct", "prompt": ""}));
        assert!(validate_text_request(RelayMode::Completions, &mut completion).is_err());

        let mut embedding = text(json!({"model": "text-embedding-3-small", "input": ["a"]}));
        assert!(validate_text_request(RelayMode::Embeddings, &mut embedding).is_ok());

        let mut no_model = text(json!({"messages": [{"role": "user", "content": "hi"}]}));
        assert_eq!(
            validate_text_request(RelayMode::ChatCompletions, &mut no_model)
                .expect_err("model")
                .to_string(),
            "model is required"
        );
    }

    #[test]
    fn moderation_model_defaults() {
        let mut request = text(json!({"input": "some text"}));
        validate_text_request(RelayMode::Moderations, &mut request).expect("valid");
        assert_eq!(request.model, DEFAULT_MODERATION_MODEL);
    }

    #[test]
    fn image_defaults_and_prompt() {
        let mut request: ImageRequest =
            serde_json::from_value(json!({"prompt": "a cat"})).expect("image");
        validate_image_request(&mut request).expect("valid");
        assert_eq!(request.model, "dall-e-2");
        assert_eq!(request.n, Some(1));
        assert_eq!(request.size.as_deref(), Some("1024x1024"));

        let mut empty = ImageRequest::default();
        assert!(validate_image_request(&mut empty).is_err());

        let mut dalle3: ImageRequest =
            serde_json::from_value(json!({"model": "dall-e-3", "prompt": "x", "n": 2}))
                .expect("image");
        assert_eq!(
            validate_image_request(&mut dalle3).expect_err("n").code(),
            "n_not_within_range"
        );
    }

    #[test]
    fn speech_input_limit_counts_characters() {
        let mut request = SpeechRequest {
            model: "tts-1".to_string(),
            input: "é".repeat(MAX_SPEECH_INPUT_CHARS),
            voice: "alloy".to_string(),
            ..SpeechRequest::default()
        };
        assert!(validate_speech_request(&request).is_ok());
        request.input.push('x');
        assert_eq!(
            validate_speech_request(&request).expect_err("too long").code(),
            "text_too_long"
        );
    }
}
