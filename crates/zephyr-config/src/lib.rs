//! YAML configuration loading for Zephyr.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (zephyr.yml)
//! - Condition expressions, resolved to booleans before scheduling

pub mod condition;
pub mod error;
pub mod pipeline;

pub use condition::RunContext;
pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline};
