use std::error::Error;
use std::fmt;

pub type AdaptorResult<T> = Result<T, AdaptorError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdaptorError {
    /// The vendor does not offer this capability (image, speech, ...).
    NotImplemented(&'static str),
    /// The canonical request is missing something or violates a vendor precondition.
    InvalidRequest(String),
    InvalidChannelConfig(String),
    Other(String),
}

impl fmt::Display for AdaptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdaptorError::NotImplemented(what) => write!(f, "not implemented: {what}"),
            AdaptorError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            AdaptorError::InvalidChannelConfig(msg) => write!(f, "invalid channel config: {msg}"),
            AdaptorError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for AdaptorError {}

impl From<serde_json::Error> for AdaptorError {
    fn from(err: serde_json::Error) -> Self {
        AdaptorError::Other(format!("serialize vendor request: {err}"))
    }
}
