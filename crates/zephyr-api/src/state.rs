//! Application state.

use std::sync::Arc;

use zephyr_scheduler::{LogBus, SchedulerHandle};
use zephyr_store::Store;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub bus: LogBus,
    pub scheduler: SchedulerHandle,
    /// When set, requests must carry this key (X-API-Key or bearer token).
    pub api_key: Option<Arc<String>>,
    /// Shared secret for GitHub webhook signatures.
    pub webhook_secret: Option<Arc<String>>,
}

impl AppState {
    pub fn new(store: Store, bus: LogBus, scheduler: SchedulerHandle) -> Self {
        Self {
            store,
            bus,
            scheduler,
            api_key: None,
            webhook_secret: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.map(Arc::new);
        self
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret.map(Arc::new);
        self
    }
}
