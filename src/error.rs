//! Error taxonomy for talking to the inference server and driving a session

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Network failure, non-2xx status, or an error object in the stream
    #[error("transport error: {0}")]
    Transport(String),

    /// A `/load` identifier that matches neither an index nor a catalog name
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// User-initiated cancellation. Not a failure.
    #[error("generation aborted")]
    Aborted,

    /// A state transition refused because another operation is active
    #[error("{0}")]
    Busy(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Transport(format!("invalid response: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
