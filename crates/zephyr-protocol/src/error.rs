//! Agent protocol errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("framing error: {0}")]
    Framing(#[from] tokio_util::codec::LinesCodecError),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("agent error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("connection closed")]
    Closed,
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
