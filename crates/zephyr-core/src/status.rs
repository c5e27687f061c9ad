//! The shared status machine for runs, jobs and steps.

use serde::{Deserialize, Serialize};

/// Lifecycle status shared by pipeline runs, jobs and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created but not yet picked up.
    Pending,
    /// Admitted to the queue, waiting for a worker slot.
    Queued,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Success,
    /// Failed.
    Failure,
    /// Cancelled before completion.
    Cancelled,
    /// Skipped (failed dependency or unmet condition).
    Skipped,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Cancelled | Status::Skipped
        )
    }

    /// Stable lowercase form used in the store and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "queued" => Ok(Status::Queued),
            "running" => Ok(Status::Running),
            "success" => Ok(Status::Success),
            "failure" => Ok(Status::Failure),
            "cancelled" => Ok(Status::Cancelled),
            "skipped" => Ok(Status::Skipped),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn terminal_states() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::Failure.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(Status::Skipped.is_terminal());
    }

    #[test]
    fn string_round_trip() {
        for status in [
            Status::Pending,
            Status::Queued,
            Status::Running,
            Status::Success,
            Status::Failure,
            Status::Cancelled,
            Status::Skipped,
        ] {
            assert_eq!(Status::from_str(status.as_str()).unwrap(), status);
        }
    }
}
