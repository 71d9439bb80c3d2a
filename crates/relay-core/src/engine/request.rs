use bytes::Bytes;

use relay_protocol::openai::create_chat_completions::request::TextRequest;
use relay_protocol::openai::create_image::request::ImageRequest;
use relay_protocol::openai::create_speech::request::SpeechRequest;
use relay_provider_core::{
    Adaptor, AdaptorResult, Headers, HttpMethod, Meta, RelayError, RelayMode, TokenEstimator,
};

use crate::auth::AuthContext;
use crate::validate::{validate_image_request, validate_speech_request, validate_text_request};

pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// One authenticated client call, as handed over by the HTTP layer.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub trace_id: String,
    pub auth: AuthContext,
    pub method: HttpMethod,
    pub path: String,
    pub query: Option<String>,
    /// Client headers with its credentials already removed.
    pub headers: Headers,
    pub body: Bytes,
    /// `model` field of a multipart audio upload.
    pub form_model: Option<String>,
}

/// The decoded and validated request body.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Text(TextRequest),
    Image(ImageRequest),
    Speech(SpeechRequest),
    /// Multipart upload, forwarded as received.
    Upload { model: String },
}

fn invalid_body(err: serde_json::Error) -> RelayError {
    RelayError::invalid_request("invalid_request_body", format!("invalid request body: {err}"))
}

impl Payload {
    pub(crate) fn parse(mode: RelayMode, request: &InboundRequest) -> Result<Self, RelayError> {
        match mode {
            RelayMode::ChatCompletions
            | RelayMode::Completions
            | RelayMode::Embeddings
            | RelayMode::Moderations => {
                let mut text: TextRequest =
                    serde_json::from_slice(&request.body).map_err(invalid_body)?;
                validate_text_request(mode, &mut text)?;
                Ok(Payload::Text(text))
            }
            RelayMode::ImagesGenerations => {
                let mut image: ImageRequest =
                    serde_json::from_slice(&request.body).map_err(invalid_body)?;
                validate_image_request(&mut image)?;
                Ok(Payload::Image(image))
            }
            RelayMode::AudioSpeech => {
                let speech: SpeechRequest =
                    serde_json::from_slice(&request.body).map_err(invalid_body)?;
                validate_speech_request(&speech)?;
                Ok(Payload::Speech(speech))
            }
            RelayMode::AudioTranscription | RelayMode::AudioTranslation => Ok(Payload::Upload {
                model: request
                    .form_model
                    .as_deref()
                    .map(str::trim)
                    .filter(|model| !model.is_empty())
                    .unwrap_or(DEFAULT_TRANSCRIPTION_MODEL)
                    .to_string(),
            }),
            RelayMode::Proxy | RelayMode::Unknown => Err(RelayError::invalid_request(
                "invalid_relay_mode",
                format!("{} is not a relay endpoint", request.path),
            )),
        }
    }

    pub(crate) fn model(&self) -> &str {
        match self {
            Payload::Text(text) => &text.model,
            Payload::Image(image) => &image.model,
            Payload::Speech(speech) => &speech.model,
            Payload::Upload { model } => model,
        }
    }

    pub(crate) fn is_stream(&self) -> bool {
        matches!(self, Payload::Text(text) if text.is_stream())
    }

    pub(crate) fn include_usage(&self) -> bool {
        matches!(self, Payload::Text(text) if text.include_usage())
    }

    pub(crate) fn max_tokens(&self) -> u64 {
        match self {
            Payload::Text(text) => text.max_tokens.unwrap_or(0).max(0) as u64,
            _ => 0,
        }
    }

    /// Prompt size used for the reservation and as the usage fallback. Speech
    /// is metered by input characters.
    pub(crate) fn prompt_tokens(&self, mode: RelayMode, estimator: &dyn TokenEstimator) -> u64 {
        match self {
            Payload::Text(text) => match mode {
                RelayMode::ChatCompletions => estimator.count_messages(&text.messages, &text.model),
                RelayMode::Completions => estimator.count_text(
                    &TextRequest::joined_text(text.prompt.as_ref()),
                    &text.model,
                ),
                _ => estimator.count_text(
                    &TextRequest::joined_text(text.input.as_ref()),
                    &text.model,
                ),
            },
            Payload::Speech(speech) => speech.input_chars() as u64,
            Payload::Image(_) | Payload::Upload { .. } => 0,
        }
    }

    /// Vendor body for one attempt.
    pub(crate) fn upstream_body(
        &self,
        adaptor: &dyn Adaptor,
        meta: &Meta,
        raw: &Bytes,
    ) -> AdaptorResult<Bytes> {
        match self {
            Payload::Text(text) => adaptor.convert_request(meta, text),
            Payload::Image(image) => adaptor.convert_image_request(meta, image),
            Payload::Speech(speech) => adaptor.convert_speech_request(meta, speech),
            Payload::Upload { .. } => Ok(raw.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CharEstimator;

    impl TokenEstimator for CharEstimator {
        fn count_text(&self, text: &str, _model: &str) -> u64 {
            text.chars().count() as u64
        }
    }

    fn inbound(path: &str, body: serde_json::Value) -> InboundRequest {
        InboundRequest {
            trace_id: "t".to_string(),
            auth: AuthContext {
                token_id: 1,
                token_name: "t".to_string(),
                user_id: 1,
                group: "default".to_string(),
            },
            method: HttpMethod::Post,
            path: path.to_string(),
            query: None,
            headers: Headers::new(),
            body: Bytes::from(body.to_string()),
            form_model: None,
        }
    }

    #[test]
    fn malformed_json_is_an_invalid_request() {
        let mut request = inbound("/v1/chat/completions", json!({}));
        request.body = Bytes::from_static(b"{not json");
        let err = Payload::parse(RelayMode::ChatCompletions, &request).expect_err("bad body");
        assert_eq!(err.status(), 400);
        assert_eq!(err.code(), "invalid_request_body");
    }

    #[test]
    fn stream_flags_and_budget_come_from_text_requests() {
        let request = inbound(
            "/v1/chat/completions",
            json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hello"}],
                "stream": true,
                "stream_options": {"include_usage": true},
                "max_tokens": 64
            }),
        );
        let payload = Payload::parse(RelayMode::ChatCompletions, &request).expect("payload");
        assert!(payload.is_stream());
        assert!(payload.include_usage());
        assert_eq!(payload.max_tokens(), 64);
        // 3 per message + "user" + "hello" + 3 reply priming
        assert_eq!(payload.prompt_tokens(RelayMode::ChatCompletions, &CharEstimator), 15);
    }

    #[test]
    fn speech_is_metered_by_characters() {
        let request = inbound(
            "/v1/audio/speech",
            json!({"model": "tts-1", "input": "héllo", "voice": "alloy"}),
        );
        let payload = Payload::parse(RelayMode::AudioSpeech, &request).expect("payload");
        assert_eq!(payload.prompt_tokens(RelayMode::AudioSpeech, &CharEstimator), 5);
        assert!(!payload.is_stream());
    }

    #[test]
    fn uploads_default_to_whisper() {
        let mut request = inbound("/v1/audio/transcriptions", json!({}));
        request.body = Bytes::from_static(b"--boundary\r\n");
        let payload = Payload::parse(RelayMode::AudioTranscription, &request).expect("payload");
        assert_eq!(payload.model(), DEFAULT_TRANSCRIPTION_MODEL);
        request.form_model = Some("whisper-large".to_string());
        let payload = Payload::parse(RelayMode::AudioTranscription, &request).expect("payload");
        assert_eq!(payload.model(), "whisper-large");
    }
}
