//! The VM manager: spawn, configure, start, stop, destroy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use zephyr_hypervisor::HypervisorClient;

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SOCKET_WAIT: Duration = Duration::from_secs(5);
const API_WAIT: Duration = Duration::from_secs(5);

/// Lifecycle state of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Configuring,
    Running,
    Stopped,
    Error,
}

impl VmState {
    fn name(&self) -> &'static str {
        match self {
            VmState::Configuring => "configuring",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Error => "error",
        }
    }
}

/// Manager settings.
#[derive(Debug, Clone)]
pub struct VmManagerConfig {
    /// Path to the hypervisor binary.
    pub hypervisor_bin: PathBuf,
    /// Directory holding per-VM sockets and logs.
    pub runtime_dir: PathBuf,
    /// Hypervisor log level.
    pub log_level: String,
}

impl Default for VmManagerConfig {
    fn default() -> Self {
        Self {
            hypervisor_bin: PathBuf::from("firecracker"),
            runtime_dir: PathBuf::from("/var/lib/zephyr/vms"),
            log_level: "Info".to_string(),
        }
    }
}

struct VmInstance {
    process: Child,
    client: HypervisorClient,
    api_socket: PathBuf,
    vsock_socket: PathBuf,
    state: VmState,
}

/// Owns the set of live VMs.
pub struct VmManager {
    config: VmManagerConfig,
    vms: Mutex<HashMap<String, VmInstance>>,
}

impl VmManager {
    pub fn new(config: VmManagerConfig) -> Self {
        Self {
            config,
            vms: Mutex::new(HashMap::new()),
        }
    }

    /// Paths used by the VM with this id.
    pub fn api_socket_path(&self, id: &str) -> PathBuf {
        self.config.runtime_dir.join(id).join("api.sock")
    }

    pub fn vsock_socket_path(&self, id: &str) -> PathBuf {
        self.config.runtime_dir.join(id).join("v.sock")
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.config.runtime_dir.join(id).join("hypervisor.log")
    }

    /// Spawn the hypervisor, wait for its API and apply the full config.
    /// The instance is registered in state `configuring`. On any error the
    /// caller must `destroy`.
    pub async fn create(&self, id: &str, config: &VmConfig) -> VmResult<()> {
        let vm_dir = self.config.runtime_dir.join(id);
        tokio::fs::create_dir_all(&vm_dir).await?;

        let api_socket = self.api_socket_path(id);
        let vsock_socket = self.vsock_socket_path(id);
        // A stale socket from a dead process blocks the new listener.
        for stale in [&api_socket, &vsock_socket] {
            match tokio::fs::remove_file(stale).await {
                Ok(()) => debug!(path = %stale.display(), "removed stale socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let log_path = self.log_path(id);
        tokio::fs::File::create(&log_path).await?;

        info!(vm_id = %id, "spawning hypervisor");
        let mut process = Command::new(&self.config.hypervisor_bin)
            .arg("--api-sock")
            .arg(&api_socket)
            .arg("--level")
            .arg(&self.config.log_level)
            .arg("--log-path")
            .arg(&log_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VmError::Start(format!("spawn {}: {e}", self.config.hypervisor_bin.display())))?;

        let client = HypervisorClient::new(&api_socket);

        if let Err(e) = wait_for_api(&mut process, &client, &api_socket).await {
            let _ = process.kill().await;
            return Err(e);
        }

        let result = apply_config(&client, config).await;
        // Register even on failure so destroy can reclaim the process.
        let state = if result.is_ok() {
            VmState::Configuring
        } else {
            VmState::Error
        };
        self.vms.lock().await.insert(
            id.to_string(),
            VmInstance {
                process,
                client,
                api_socket,
                vsock_socket,
                state,
            },
        );
        result
    }

    /// `configuring → running` via `InstanceStart`.
    pub async fn start(&self, id: &str) -> VmResult<()> {
        let mut vms = self.vms.lock().await;
        let vm = vms
            .get_mut(id)
            .ok_or_else(|| VmError::NotFound(id.to_string()))?;

        if vm.state != VmState::Configuring {
            return Err(VmError::InvalidState {
                id: id.to_string(),
                expected: VmState::Configuring.name(),
                actual: vm.state.name(),
            });
        }
        // A hypervisor that died during configuration is a fatal VM error.
        if vm.process.try_wait()?.is_some() {
            vm.state = VmState::Error;
            return Err(VmError::ProcessExited);
        }

        vm.client.instance_start().await?;
        vm.state = VmState::Running;
        info!(vm_id = %id, "VM started");
        Ok(())
    }

    /// Graceful stop: ctrl-alt-del, then SIGKILL after `timeout`.
    /// Idempotent if already stopped.
    pub async fn stop(&self, id: &str, timeout: Duration) -> VmResult<()> {
        let mut vms = self.vms.lock().await;
        let vm = vms
            .get_mut(id)
            .ok_or_else(|| VmError::NotFound(id.to_string()))?;

        if vm.state != VmState::Running {
            return Ok(());
        }

        if let Err(e) = vm.client.send_ctrl_alt_del().await {
            warn!(vm_id = %id, error = %e, "ctrl-alt-del failed, killing");
        }

        let deadline = Instant::now() + timeout;
        loop {
            if vm.process.try_wait()?.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(vm_id = %id, "graceful stop timed out, sending SIGKILL");
                vm.process.kill().await?;
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        vm.state = VmState::Stopped;
        info!(vm_id = %id, "VM stopped");
        Ok(())
    }

    /// Stop if needed, kill if still alive, delete sockets, unregister.
    /// Destroying twice is indistinguishable from once.
    pub async fn destroy(&self, id: &str) -> VmResult<()> {
        let instance = self.vms.lock().await.remove(id);
        let Some(mut vm) = instance else {
            return Ok(());
        };

        if vm.state == VmState::Running {
            if let Err(e) = vm.client.send_ctrl_alt_del().await {
                debug!(vm_id = %id, error = %e, "ctrl-alt-del during destroy failed");
            }
            sleep(Duration::from_millis(250)).await;
        }
        if vm.process.try_wait()?.is_none() {
            let _ = vm.process.kill().await;
        }

        for socket in [&vm.api_socket, &vm.vsock_socket] {
            if let Err(e) = tokio::fs::remove_file(socket).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %socket.display(), error = %e, "socket cleanup failed");
                }
            }
        }
        info!(vm_id = %id, "VM destroyed");
        Ok(())
    }

    pub async fn state(&self, id: &str) -> Option<VmState> {
        self.vms.lock().await.get(id).map(|vm| vm.state)
    }

    pub async fn live_count(&self) -> usize {
        self.vms.lock().await.len()
    }

    /// Destroy every remaining VM. Used on global shutdown.
    pub async fn destroy_all(&self) -> VmResult<()> {
        let ids: Vec<String> = self.vms.lock().await.keys().cloned().collect();
        for id in ids {
            self.destroy(&id).await?;
        }
        Ok(())
    }
}

/// Wait for the API socket to appear, then for `GET /` to answer.
async fn wait_for_api(
    process: &mut Child,
    client: &HypervisorClient,
    api_socket: &std::path::Path,
) -> VmResult<()> {
    let deadline = Instant::now() + SOCKET_WAIT;
    while !api_socket.exists() {
        if process.try_wait()?.is_some() {
            return Err(VmError::Start("hypervisor exited before creating its socket".into()));
        }
        if Instant::now() >= deadline {
            return Err(VmError::Start(format!(
                "API socket {} not created within {SOCKET_WAIT:?}",
                api_socket.display()
            )));
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }

    let deadline = Instant::now() + API_WAIT;
    loop {
        match client.instance_info().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(VmError::Start(format!("API not ready within {API_WAIT:?}: {e}")));
                }
                sleep(SOCKET_POLL_INTERVAL).await;
            }
        }
    }
}

/// Apply the config in the order the hypervisor expects:
/// boot source, machine config, drives, NICs, vsock, logger/metrics,
/// MMDS, balloon.
async fn apply_config(client: &HypervisorClient, config: &VmConfig) -> VmResult<()> {
    client.put_boot_source(&config.boot_source).await?;
    client.put_machine_config(&config.machine).await?;
    for drive in &config.drives {
        client.put_drive(drive).await?;
    }
    for nic in &config.network_interfaces {
        client.put_network_interface(nic).await?;
    }
    if let Some(vsock) = &config.vsock {
        client.put_vsock(vsock).await?;
    }
    if let Some(logger) = &config.logger {
        client.put_logger(logger).await?;
    }
    if let Some(metrics) = &config.metrics {
        client.put_metrics(metrics).await?;
    }
    if let Some(mmds) = &config.mmds {
        client.put_mmds(mmds).await?;
    }
    if let Some(balloon) = &config.balloon {
        client.put_balloon(balloon).await?;
    }
    Ok(())
}
