//! Request and response envelopes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Exit code reported when a step hits its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Content encoding for file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Utf8,
    Base64,
}

/// Which output stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// A request sent host→guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Run a command. With empty `args` the command string goes through
    /// `sh -c`; otherwise it is an argv vector. The request env is merged
    /// over the guest environment, request winning.
    Execute {
        id: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default)]
        stream: bool,
    },
    FileWrite {
        id: String,
        path: String,
        content: String,
        encoding: Encoding,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    FileRead {
        id: String,
        path: String,
        encoding: Encoding,
    },
    Ping {
        id: String,
    },
    Shutdown {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

impl AgentRequest {
    pub fn id(&self) -> &str {
        match self {
            AgentRequest::Execute { id, .. }
            | AgentRequest::FileWrite { id, .. }
            | AgentRequest::FileRead { id, .. }
            | AgentRequest::Ping { id }
            | AgentRequest::Shutdown { id, .. } => id,
        }
    }
}

/// A message sent guest→host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    /// Terminal result of an `execute`. Carries the full captured output
    /// even when chunks were streamed.
    Execute {
        id: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    },
    /// Unsolicited chunk interleaved during a streaming execute.
    Output {
        id: String,
        stream: StreamKind,
        data: String,
    },
    FileWrite {
        id: String,
        success: bool,
    },
    FileRead {
        id: String,
        content: String,
        encoding: Encoding,
    },
    Ping {
        id: String,
        timestamp: String,
        uptime_secs: u64,
    },
    Shutdown {
        id: String,
        success: bool,
    },
    /// A request failed inside the guest.
    Error {
        id: String,
        code: String,
        message: String,
    },
}

impl AgentResponse {
    pub fn id(&self) -> &str {
        match self {
            AgentResponse::Execute { id, .. }
            | AgentResponse::Output { id, .. }
            | AgentResponse::FileWrite { id, .. }
            | AgentResponse::FileRead { id, .. }
            | AgentResponse::Ping { id, .. }
            | AgentResponse::Shutdown { id, .. }
            | AgentResponse::Error { id, .. } => id,
        }
    }

    /// Whether this message completes the request with the same id.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentResponse::Output { .. })
    }
}

/// Error codes reported by the guest.
pub mod error_code {
    pub const FILE_WRITE_ERROR: &str = "FILE_WRITE_ERROR";
    pub const FILE_READ_ERROR: &str = "FILE_READ_ERROR";
    pub const FILE_NOT_FOUND: &str = "FILE_NOT_FOUND";
    pub const SPAWN_FAILED: &str = "SPAWN_FAILED";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_request_wire_shape() {
        let request = AgentRequest::Execute {
            id: "req-1".to_string(),
            command: "echo hi".to_string(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            timeout_secs: Some(30),
            stream: true,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["command"], "echo hi");
        assert_eq!(value["timeout_secs"], 30);
        assert_eq!(value["stream"], true);
        assert!(value.get("cwd").is_none());
    }

    #[test]
    fn responses_round_trip() {
        let line = r#"{"type":"execute","id":"req-1","exit_code":0,"stdout":"hi\n","stderr":"","duration_ms":12}"#;
        let response: AgentResponse = serde_json::from_str(line).unwrap();
        match &response {
            AgentResponse::Execute { exit_code, stdout, .. } => {
                assert_eq!(*exit_code, 0);
                assert_eq!(stdout, "hi\n");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(response.is_terminal());
    }

    #[test]
    fn output_chunks_are_not_terminal() {
        let line = r#"{"type":"output","id":"req-1","stream":"stderr","data":"oops"}"#;
        let response: AgentResponse = serde_json::from_str(line).unwrap();
        assert!(!response.is_terminal());
        match response {
            AgentResponse::Output { stream, .. } => assert_eq!(stream, StreamKind::Stderr),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn file_encoding_names() {
        assert_eq!(serde_json::to_string(&Encoding::Utf8).unwrap(), r#""utf8""#);
        assert_eq!(serde_json::to_string(&Encoding::Base64).unwrap(), r#""base64""#);
    }
}
