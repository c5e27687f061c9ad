//! MicroVM lifecycle management.
//!
//! The manager spawns one hypervisor process per VM, drives its API through
//! `zephyr-hypervisor`, and owns the set of live instances. Every instance
//! is lent to exactly one executor at a time.

pub mod config;
pub mod error;
pub mod manager;

pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use manager::{VmManager, VmManagerConfig, VmState};
