//! Hypervisor client errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The API rejected a request. `fault` is the hypervisor's message,
    /// verbatim.
    #[error("API error (status {status}): {fault}")]
    Api { status: u16, fault: String },

    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),

    #[error("request build error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type HypervisorResult<T> = std::result::Result<T, HypervisorError>;
