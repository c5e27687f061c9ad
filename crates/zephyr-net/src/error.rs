//! Network allocation errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("no free network slots")]
    Exhausted,

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NetResult<T> = std::result::Result<T, NetError>;
