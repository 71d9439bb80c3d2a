use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};
use tiktoken_rs::{cl100k_base, o200k_base};

use relay_provider_core::{AdaptorError, TokenEstimator};

/// tiktoken-backed estimator.
///
/// Both encoders are built once in `new`; request tasks only read them. Models
/// tiktoken knows as cl100k use cl100k, everything else falls back to o200k.
pub struct TiktokenEstimator {
    cl100k: CoreBPE,
    o200k: CoreBPE,
}

impl TiktokenEstimator {
    pub fn new() -> Result<Self, AdaptorError> {
        let cl100k = cl100k_base()
            .map_err(|err| AdaptorError::Other(format!("load cl100k_base: {err}")))?;
        let o200k =
            o200k_base().map_err(|err| AdaptorError::Other(format!("load o200k_base: {err}")))?;
        Ok(Self { cl100k, o200k })
    }

    fn encoder(&self, model: &str) -> &CoreBPE {
        match get_tokenizer(model) {
            Some(Tokenizer::Cl100kBase) => &self.cl100k,
            _ => &self.o200k,
        }
    }
}

impl std::fmt::Debug for TiktokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenEstimator").finish_non_exhaustive()
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn count_text(&self, text: &str, model: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        self.encoder(model).encode_ordinary(text).len() as u64
    }
}
