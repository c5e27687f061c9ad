//! The microVM job executor.
//!
//! Each job gets a fresh VM: allocate a /30, boot the machine, wait for the
//! in-guest agent, push workspace inputs, run steps in order, then tear
//! everything down unconditionally.

pub mod context;
pub mod executor;

pub use executor::{VmJobRunner, VmJobRunnerConfig};
