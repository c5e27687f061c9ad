//! The Unix-socket HTTP client.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tracing::trace;

use crate::error::{HypervisorError, HypervisorResult};
use crate::types::*;

/// Client for one hypervisor's API socket.
#[derive(Debug, Clone)]
pub struct HypervisorClient {
    socket_path: PathBuf,
}

impl HypervisorClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// `GET /`, the instance description; used as the readiness probe.
    pub async fn instance_info(&self) -> HypervisorResult<InstanceInfo> {
        let body = self.request(Method::GET, "/", None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn put_boot_source(&self, body: &BootSource) -> HypervisorResult<()> {
        self.put_json("/boot-source", body).await
    }

    pub async fn put_drive(&self, body: &Drive) -> HypervisorResult<()> {
        self.put_json(&format!("/drives/{}", body.drive_id), body).await
    }

    pub async fn put_network_interface(&self, body: &NetworkInterface) -> HypervisorResult<()> {
        self.put_json(&format!("/network-interfaces/{}", body.iface_id), body)
            .await
    }

    pub async fn put_machine_config(&self, body: &MachineConfig) -> HypervisorResult<()> {
        self.put_json("/machine-config", body).await
    }

    pub async fn put_vsock(&self, body: &VsockConfig) -> HypervisorResult<()> {
        self.put_json("/vsock", body).await
    }

    pub async fn put_logger(&self, body: &LoggerConfig) -> HypervisorResult<()> {
        self.put_json("/logger", body).await
    }

    pub async fn put_metrics(&self, body: &MetricsConfig) -> HypervisorResult<()> {
        self.put_json("/metrics", body).await
    }

    pub async fn put_mmds(&self, data: &serde_json::Value) -> HypervisorResult<()> {
        self.put_json("/mmds", data).await
    }

    pub async fn put_mmds_config(&self, body: &MmdsConfig) -> HypervisorResult<()> {
        self.put_json("/mmds/config", body).await
    }

    pub async fn put_balloon(&self, body: &BalloonConfig) -> HypervisorResult<()> {
        self.put_json("/balloon", body).await
    }

    pub async fn instance_start(&self) -> HypervisorResult<()> {
        self.action(ActionType::InstanceStart).await
    }

    pub async fn send_ctrl_alt_del(&self) -> HypervisorResult<()> {
        self.action(ActionType::SendCtrlAltDel).await
    }

    pub async fn flush_metrics(&self) -> HypervisorResult<()> {
        self.action(ActionType::FlushMetrics).await
    }

    pub async fn create_snapshot(&self, body: &SnapshotCreate) -> HypervisorResult<()> {
        self.put_json("/snapshot/create", body).await
    }

    pub async fn load_snapshot(&self, body: &SnapshotLoad) -> HypervisorResult<()> {
        self.put_json("/snapshot/load", body).await
    }

    pub async fn pause(&self) -> HypervisorResult<()> {
        self.patch_json("/vm", &VmState { state: VmStateKind::Paused }).await
    }

    pub async fn resume(&self) -> HypervisorResult<()> {
        self.patch_json("/vm", &VmState { state: VmStateKind::Resumed }).await
    }

    async fn action(&self, action_type: ActionType) -> HypervisorResult<()> {
        self.put_json("/actions", &Action { action_type }).await
    }

    async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> HypervisorResult<()> {
        let payload = serde_json::to_vec(body)?;
        self.request(Method::PUT, path, Some(payload)).await?;
        Ok(())
    }

    async fn patch_json<T: Serialize>(&self, path: &str, body: &T) -> HypervisorResult<()> {
        let payload = serde_json::to_vec(body)?;
        self.request(Method::PATCH, path, Some(payload)).await?;
        Ok(())
    }

    /// One request over a fresh connection.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> HypervisorResult<Bytes> {
        trace!(method = %method, path, socket = %self.socket_path.display(), "hypervisor request");

        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        // The connection task finishes when the response is fully read.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "localhost")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();

        if status.is_success() {
            Ok(bytes)
        } else {
            Err(api_error(status, &bytes))
        }
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> HypervisorError {
    let fault = serde_json::from_slice::<Fault>(body)
        .map(|f| f.fault_message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).to_string());
    HypervisorError::Api {
        status: status.as_u16(),
        fault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Serve one canned HTTP response on a Unix socket.
    async fn one_shot_server(socket: PathBuf, response: &'static str) {
        let listener = UnixListener::bind(&socket).unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request_complete(&request) {
                break;
            }
        }
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text
            .lines()
            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    #[tokio::test]
    async fn instance_info_parses_success_response() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let server = tokio::spawn(one_shot_server(
            socket.clone(),
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 31\r\n\r\n{\"id\":\"vm-1\",\"state\":\"Running\"}",
        ));

        let client = HypervisorClient::new(&socket);
        let info = client.instance_info().await.unwrap();
        assert_eq!(info.id, "vm-1");
        assert_eq!(info.state, "Running");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn fault_message_is_surfaced_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let server = tokio::spawn(one_shot_server(
            socket.clone(),
            "HTTP/1.1 400 Bad Request\r\ncontent-type: application/json\r\ncontent-length: 43\r\n\r\n{\"fault_message\":\"The drive path is bogus\"}",
        ));

        let client = HypervisorClient::new(&socket);
        let err = client
            .put_drive(&Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: "/nope".to_string(),
                is_root_device: true,
                is_read_only: false,
            })
            .await
            .unwrap_err();
        match err {
            HypervisorError::Api { status, fault } => {
                assert_eq!(status, 400);
                assert_eq!(fault, "The drive path is bogus");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_socket_is_an_io_error() {
        let client = HypervisorClient::new("/nonexistent/api.sock");
        let err = client.instance_info().await.unwrap_err();
        assert!(matches!(err, HypervisorError::Io(_)));
    }
}
