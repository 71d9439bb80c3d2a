use std::fmt;

/// Operation selected from the inbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    ImagesGenerations,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Proxy,
    Unknown,
}

pub const PROXY_PATH_PREFIX: &str = "/v1/oneapi/proxy";

const PATH_TABLE: &[(&str, RelayMode)] = &[
    ("/v1/chat/completions", RelayMode::ChatCompletions),
    ("/v1/completions", RelayMode::Completions),
    ("/v1/embeddings", RelayMode::Embeddings),
    ("/v1/engines", RelayMode::Embeddings),
    ("/v1/moderations", RelayMode::Moderations),
    ("/v1/images/generations", RelayMode::ImagesGenerations),
    ("/v1/audio/speech", RelayMode::AudioSpeech),
    ("/v1/audio/transcriptions", RelayMode::AudioTranscription),
    ("/v1/audio/translations", RelayMode::AudioTranslation),
    (PROXY_PATH_PREFIX, RelayMode::Proxy),
];

impl RelayMode {
    /// Longest matching prefix wins.
    pub fn from_path(path: &str) -> RelayMode {
        PATH_TABLE
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, mode)| *mode)
            .unwrap_or(RelayMode::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "chat_completions",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
            RelayMode::Moderations => "moderations",
            RelayMode::ImagesGenerations => "images_generations",
            RelayMode::AudioSpeech => "audio_speech",
            RelayMode::AudioTranscription => "audio_transcription",
            RelayMode::AudioTranslation => "audio_translation",
            RelayMode::Proxy => "proxy",
            RelayMode::Unknown => "unknown",
        }
    }

    /// Modes whose body is a general text request.
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            RelayMode::ChatCompletions
                | RelayMode::Completions
                | RelayMode::Embeddings
                | RelayMode::Moderations
        )
    }

    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            RelayMode::AudioSpeech | RelayMode::AudioTranscription | RelayMode::AudioTranslation
        )
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        assert_eq!(
            RelayMode::from_path("/v1/chat/completions"),
            RelayMode::ChatCompletions
        );
        assert_eq!(RelayMode::from_path("/v1/completions"), RelayMode::Completions);
        assert_eq!(
            RelayMode::from_path("/v1/oneapi/proxy/7/v1/models"),
            RelayMode::Proxy
        );
        assert_eq!(
            RelayMode::from_path("/v1/audio/transcriptions"),
            RelayMode::AudioTranscription
        );
        assert_eq!(RelayMode::from_path("/v2/anything"), RelayMode::Unknown);
    }
}
