//! Error types for Zephyr.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid pipeline config: {0}")]
    ConfigInvalid(String),

    #[error("dependency cycle involving job '{0}'")]
    DependencyCycle(String),

    #[error("unknown dependency '{dependency}' declared by job '{job}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("hypervisor failed to start: {0}")]
    HypervisorStart(String),

    #[error("hypervisor API error (status {status}): {fault}")]
    HypervisorApi { status: u16, fault: String },

    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
