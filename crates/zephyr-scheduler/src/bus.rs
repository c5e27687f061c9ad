//! In-process fan-out of log chunks and status updates.
//!
//! Delivery is best-effort and non-blocking; the store is the source of
//! truth. Subscribers that fall behind or reconnect read the missed tail
//! from the store with a `since` cursor.

use serde::Serialize;
use tokio::sync::broadcast;

use zephyr_core::Status;

/// An event published while jobs execute.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    RunUpdate {
        run_id: String,
        status: Status,
    },
    JobUpdate {
        run_id: String,
        job_id: String,
        status: Status,
    },
    Log {
        job_id: String,
        step_id: Option<String>,
        seq: i64,
        stream: String,
        content: String,
    },
}

impl BusEvent {
    /// The job this event concerns, when it concerns one.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            BusEvent::JobUpdate { job_id, .. } | BusEvent::Log { job_id, .. } => Some(job_id),
            BusEvent::RunUpdate { .. } => None,
        }
    }
}

/// Broadcast bus for live subscribers.
#[derive(Clone)]
pub struct LogBus {
    tx: broadcast::Sender<BusEvent>,
}

impl LogBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish to all subscribers. Lack of subscribers is not an error.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = LogBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::Log {
            job_id: "j1".to_string(),
            step_id: None,
            seq: 1,
            stream: "stdout".to_string(),
            content: "hi\n".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), Some("j1"));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = LogBus::new();
        bus.publish(BusEvent::RunUpdate {
            run_id: "r1".to_string(),
            status: Status::Running,
        });
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let event = BusEvent::JobUpdate {
            run_id: "r1".to_string(),
            job_id: "j1".to_string(),
            status: Status::Success,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "job_update");
        assert_eq!(value["status"], "success");
    }
}
