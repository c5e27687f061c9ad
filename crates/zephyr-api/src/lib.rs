//! HTTP control surface for Zephyr.
//!
//! Provides the REST API, GitHub webhook intake, Prometheus-style metrics
//! and the WebSocket log feed.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
