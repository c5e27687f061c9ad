//! VM manager errors.

use thiserror::Error;
use zephyr_hypervisor::HypervisorError;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("hypervisor failed to start: {0}")]
    Start(String),

    #[error(transparent)]
    Api(#[from] HypervisorError),

    #[error("VM {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("hypervisor process exited before the VM started")]
    ProcessExited,

    #[error("unknown VM: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VmResult<T> = std::result::Result<T, VmError>;
