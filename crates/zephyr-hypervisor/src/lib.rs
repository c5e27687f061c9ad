//! Typed client for the microVM configuration API.
//!
//! The hypervisor exposes an HTTP/JSON API over a Unix-domain socket. Each
//! call here opens a fresh connection, performs one request and surfaces the
//! hypervisor's fault message verbatim on failure.

pub mod client;
pub mod error;
pub mod types;

pub use client::HypervisorClient;
pub use error::{HypervisorError, HypervisorResult};
pub use types::*;
