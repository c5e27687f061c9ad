//! Host-side channels to the in-guest agent.
//!
//! The primary channel is the hypervisor's host-visible vsock Unix socket.
//! During bring-up an HTTP channel over the VM's /30 can be used instead;
//! it does not interleave streamed output.

use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::trace;

use crate::error::{AgentError, AgentResult};
use crate::message::{AgentRequest, AgentResponse, StreamKind};

/// A streamed output chunk surfaced while a request is in flight.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    pub request_id: String,
    pub stream: StreamKind,
    pub data: String,
}

/// Either transport, behind one call surface.
pub enum AgentChannel {
    Vsock(VsockChannel),
    Http(HttpChannel),
}

impl AgentChannel {
    /// Send one request and wait for its terminal response. Streamed
    /// `output` chunks with the matching id are forwarded to `output_tx`.
    pub async fn call(
        &mut self,
        request: &AgentRequest,
        output_tx: Option<&mpsc::UnboundedSender<OutputEvent>>,
    ) -> AgentResult<AgentResponse> {
        match self {
            AgentChannel::Vsock(channel) => channel.call(request, output_tx).await,
            AgentChannel::Http(channel) => channel.call(request).await,
        }
    }

    pub async fn ping(&mut self, id: &str) -> AgentResult<AgentResponse> {
        self.call(&AgentRequest::Ping { id: id.to_string() }, None).await
    }
}

/// Newline-delimited JSON over the hypervisor's vsock Unix socket.
pub struct VsockChannel {
    framed: Framed<UnixStream, LinesCodec>,
}

impl VsockChannel {
    /// Connect to the host-side vsock socket and issue the `CONNECT <port>`
    /// preamble expected by the hypervisor.
    pub async fn connect(uds_path: impl AsRef<Path>, port: u32) -> AgentResult<Self> {
        let stream = UnixStream::connect(uds_path.as_ref()).await?;
        let mut framed = Framed::new(stream, LinesCodec::new());

        framed.send(format!("CONNECT {port}")).await?;
        let ack = framed.next().await.ok_or(AgentError::Closed)??;
        if !ack.starts_with("OK") {
            return Err(AgentError::Protocol(format!(
                "unexpected vsock handshake reply: {ack}"
            )));
        }
        Ok(Self { framed })
    }

    async fn call(
        &mut self,
        request: &AgentRequest,
        output_tx: Option<&mpsc::UnboundedSender<OutputEvent>>,
    ) -> AgentResult<AgentResponse> {
        let line = serde_json::to_string(request)?;
        trace!(id = request.id(), "agent request");
        self.framed.send(line).await?;

        loop {
            let line = self.framed.next().await.ok_or(AgentError::Closed)??;
            let response: AgentResponse = serde_json::from_str(&line)?;
            if response.id() != request.id() {
                return Err(AgentError::Protocol(format!(
                    "response id '{}' does not match request id '{}'",
                    response.id(),
                    request.id()
                )));
            }
            match response {
                AgentResponse::Output { id, stream, data } => {
                    if let Some(tx) = output_tx {
                        let _ = tx.send(OutputEvent {
                            request_id: id,
                            stream,
                            data,
                        });
                    }
                }
                terminal => return Ok(terminal),
            }
        }
    }
}

/// One JSON request/response per HTTP POST.
pub struct HttpChannel {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChannel {
    pub fn new(guest_ip: std::net::Ipv4Addr, port: u16) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("http://{guest_ip}:{port}/message"),
        })
    }

    async fn call(&mut self, request: &AgentRequest) -> AgentResult<AgentResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        let response: AgentResponse = response.json().await?;
        if response.id() != request.id() {
            return Err(AgentError::Protocol(format!(
                "response id '{}' does not match request id '{}'",
                response.id(),
                request.id()
            )));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// A scripted guest: acks the vsock handshake, then answers each request
    /// line with the queued response lines.
    async fn fake_agent(socket: std::path::PathBuf, scripts: Vec<Vec<String>>) {
        let listener = UnixListener::bind(&socket).unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, LinesCodec::new());

        let connect = framed.next().await.unwrap().unwrap();
        assert!(connect.starts_with("CONNECT "));
        framed.send("OK 1024").await.unwrap();

        for responses in scripts {
            let _request = framed.next().await.unwrap().unwrap();
            for response in responses {
                framed.send(response).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("v.sock");
        let agent = tokio::spawn(fake_agent(
            socket.clone(),
            vec![vec![
                r#"{"type":"ping","id":"p1","timestamp":"2026-01-01T00:00:00Z","uptime_secs":4}"#.to_string(),
            ]],
        ));

        let mut channel = AgentChannel::Vsock(VsockChannel::connect(&socket, 1024).await.unwrap());
        let response = channel.ping("p1").await.unwrap();
        match response {
            AgentResponse::Ping { uptime_secs, .. } => assert_eq!(uptime_secs, 4),
            other => panic!("unexpected {other:?}"),
        }
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn streamed_chunks_arrive_before_terminal_response() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("v.sock");
        let agent = tokio::spawn(fake_agent(
            socket.clone(),
            vec![vec![
                r#"{"type":"output","id":"e1","stream":"stdout","data":"hi\n"}"#.to_string(),
                r#"{"type":"output","id":"e1","stream":"stderr","data":"warn\n"}"#.to_string(),
                r#"{"type":"execute","id":"e1","exit_code":0,"stdout":"hi\n","stderr":"warn\n","duration_ms":3}"#.to_string(),
            ]],
        ));

        let mut channel = VsockChannel::connect(&socket, 1024).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = AgentRequest::Execute {
            id: "e1".to_string(),
            command: "echo hi".to_string(),
            args: vec![],
            cwd: None,
            env: Default::default(),
            timeout_secs: None,
            stream: true,
        };
        let response = channel.call(&request, Some(&tx)).await.unwrap();

        match response {
            AgentResponse::Execute { exit_code, stdout, .. } => {
                assert_eq!(exit_code, 0);
                assert_eq!(stdout, "hi\n");
            }
            other => panic!("unexpected {other:?}"),
        }

        let first = rx.recv().await.unwrap();
        assert_eq!(first.stream, StreamKind::Stdout);
        assert_eq!(first.data, "hi\n");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.stream, StreamKind::Stderr);
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_response_id_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("v.sock");
        let agent = tokio::spawn(fake_agent(
            socket.clone(),
            vec![vec![
                r#"{"type":"ping","id":"other","timestamp":"t","uptime_secs":1}"#.to_string(),
            ]],
        ));

        let mut channel = VsockChannel::connect(&socket, 1024).await.unwrap();
        let request = AgentRequest::Ping { id: "p1".to_string() };
        let err = channel.call(&request, None).await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
        agent.await.unwrap();
    }
}
