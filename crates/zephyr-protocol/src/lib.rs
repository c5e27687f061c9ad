//! The host↔guest agent protocol.
//!
//! Messages are UTF-8 JSON objects, one per line. Requests flow host→guest;
//! the guest answers each request with a terminal response and, for streaming
//! executes, interleaves unsolicited `output` chunks before it.

pub mod channel;
pub mod error;
pub mod message;

pub use channel::{AgentChannel, HttpChannel, OutputEvent, VsockChannel};
pub use error::{AgentError, AgentResult};
pub use message::*;
