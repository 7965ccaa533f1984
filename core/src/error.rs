/// Error types for the chat client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Push channel could not be opened or written to
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persistence call answered with a non-success status
    #[error("Request failed ({status}): {message}")]
    Request { status: u16, message: String },

    /// The server rejected the session token (HTTP 401)
    #[error("Session expired")]
    Session,

    #[error("Configuration error: {0}")]
    Config(String),

    /// The sync loop is no longer running
    #[error("Sync loop closed")]
    Closed,
}

impl ChatError {
    /// True when this error must tear the whole session down.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ChatError::Session)
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
