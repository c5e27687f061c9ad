//! The per-job VM executor.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use zephyr_core::Status;
use zephyr_core::pipeline::StepDef;
use zephyr_net::{NetworkAllocator, NetworkConfig};
use zephyr_protocol::{
    AgentChannel, AgentRequest, AgentResponse, Encoding, HttpChannel, OutputEvent, VsockChannel,
};
use zephyr_scheduler::{BusEvent, JobOutcome, JobRequest, JobRunner, LogBus};
use zephyr_store::{Store, StepRecord};
use zephyr_vmm::{VmConfig, VmManager};

use crate::context;

/// Executor settings.
#[derive(Debug, Clone)]
pub struct VmJobRunnerConfig {
    /// Kernel image booted into every VM.
    pub kernel_image: PathBuf,
    /// Directory of root filesystem images, one per runner image name.
    pub image_dir: PathBuf,
    /// Vsock port the in-guest agent listens on.
    pub vsock_port: u32,
    /// Bounded retry while waiting for the agent to answer `ping`.
    pub agent_ping_attempts: u32,
    pub agent_ping_interval: Duration,
    /// Graceful VM stop budget before SIGKILL.
    pub stop_timeout: Duration,
    /// When set, talk to the agent over HTTP on this port instead of vsock.
    pub http_agent_port: Option<u16>,
}

impl Default for VmJobRunnerConfig {
    fn default() -> Self {
        Self {
            kernel_image: PathBuf::from("/var/lib/zephyr/images/vmlinux"),
            image_dir: PathBuf::from("/var/lib/zephyr/images"),
            vsock_port: 52,
            agent_ping_attempts: 30,
            agent_ping_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
            http_agent_port: None,
        }
    }
}

/// Runs one job per microVM.
pub struct VmJobRunner {
    store: Store,
    bus: LogBus,
    net: Arc<NetworkAllocator>,
    vms: Arc<VmManager>,
    config: VmJobRunnerConfig,
}

impl VmJobRunner {
    pub fn new(
        store: Store,
        bus: LogBus,
        net: Arc<NetworkAllocator>,
        vms: Arc<VmManager>,
        config: VmJobRunnerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            net,
            vms,
            config,
        }
    }

    async fn execute_attempt(&self, request: &JobRequest, attempt: u32) -> JobOutcome {
        let vm_id = format!("{}-{attempt}", request.job_id);

        let net = match self.net.allocate(&vm_id).await {
            Ok(net) => net,
            Err(e) => return JobOutcome::failure(None, format!("network setup failed: {e}")),
        };

        let work = self.run_in_vm(request, &vm_id, &net);
        let outcome = match request.def.timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = self
                        .store
                        .mark_steps_for_job(&request.job_id, Status::Cancelled)
                        .await;
                    JobOutcome::failure(None, format!("job timed out after {secs}s"))
                }
            },
            None => work.await,
        };

        // Teardown is unconditional: destroy twice is indistinguishable
        // from once, and the slot must go back to the pool.
        if let Err(e) = self.vms.destroy(&vm_id).await {
            warn!(vm_id = %vm_id, error = %e, "VM destroy failed");
        }
        if let Err(e) = self.net.release(&net).await {
            warn!(vm_id = %vm_id, error = %e, "network release failed");
        }
        outcome
    }

    async fn run_in_vm(
        &self,
        request: &JobRequest,
        vm_id: &str,
        net: &NetworkConfig,
    ) -> JobOutcome {
        let vm_config = self.build_vm_config(request, vm_id, net);
        if let Err(e) = self.vms.create(vm_id, &vm_config).await {
            return JobOutcome::failure(None, format!("hypervisor start failed: {e}"));
        }
        if let Err(e) = self.vms.start(vm_id).await {
            return JobOutcome::failure(None, format!("hypervisor start failed: {e}"));
        }

        let mut channel = match self.wait_for_agent(vm_id, net).await {
            Ok(channel) => channel,
            Err(reason) => return JobOutcome::failure(None, reason),
        };

        if let Err(e) = self.upload_workspace(&mut channel, request).await {
            return JobOutcome::failure(None, format!("workspace upload failed: {e}"));
        }

        let outcome = self.run_steps(&mut channel, request).await;

        let shutdown = AgentRequest::Shutdown {
            id: format!("{vm_id}-shutdown"),
            timeout_secs: Some(self.config.stop_timeout.as_secs()),
        };
        if let Err(e) = channel.call(&shutdown, None).await {
            debug!(vm_id = %vm_id, error = %e, "agent shutdown failed");
        }
        if let Err(e) = self.vms.stop(vm_id, self.config.stop_timeout).await {
            debug!(vm_id = %vm_id, error = %e, "graceful stop failed");
        }
        outcome
    }

    fn build_vm_config(
        &self,
        request: &JobRequest,
        vm_id: &str,
        net: &NetworkConfig,
    ) -> VmConfig {
        let rootfs = context::rootfs_path(&self.config.image_dir, &request.def.runner.image);
        let mut config = VmConfig::new(
            self.config.kernel_image.display().to_string(),
            rootfs.display().to_string(),
        );
        config.boot_source.boot_args = Some(context::boot_args(net));
        config.machine.vcpu_count = request.def.runner.vcpus;
        config.machine.mem_size_mib = request.def.runner.memory_mib;
        config.network_interfaces.push(nic_for(net));
        config.vsock = Some(zephyr_hypervisor::VsockConfig {
            guest_cid: 3,
            uds_path: self.vms.vsock_socket_path(vm_id).display().to_string(),
        });
        config
    }

    /// Bounded ping retry; failure means the job fails with
    /// "agent unreachable".
    async fn wait_for_agent(&self, vm_id: &str, net: &NetworkConfig) -> Result<AgentChannel, String> {
        let mut last_error = String::new();
        for attempt in 0..self.config.agent_ping_attempts {
            match self.connect_agent(vm_id, net).await {
                Ok(mut channel) => match channel.ping(&format!("{vm_id}-ping-{attempt}")).await {
                    Ok(AgentResponse::Ping { .. }) => return Ok(channel),
                    Ok(other) => last_error = format!("unexpected ping reply: {other:?}"),
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            tokio::time::sleep(self.config.agent_ping_interval).await;
        }
        Err(format!("agent unreachable: {last_error}"))
    }

    async fn connect_agent(
        &self,
        vm_id: &str,
        net: &NetworkConfig,
    ) -> zephyr_protocol::AgentResult<AgentChannel> {
        match self.config.http_agent_port {
            Some(port) => Ok(AgentChannel::Http(HttpChannel::new(net.guest_ip, port)?)),
            None => {
                let socket = self.vms.vsock_socket_path(vm_id);
                Ok(AgentChannel::Vsock(
                    VsockChannel::connect(&socket, self.config.vsock_port).await?,
                ))
            }
        }
    }

    async fn upload_workspace(
        &self,
        channel: &mut AgentChannel,
        request: &JobRequest,
    ) -> Result<(), String> {
        use base64::Engine;

        for (index, file) in request.workspace_files.iter().enumerate() {
            let (content, encoding) = match String::from_utf8(file.content.clone()) {
                Ok(text) => (text, Encoding::Utf8),
                Err(_) => (
                    base64::engine::general_purpose::STANDARD.encode(&file.content),
                    Encoding::Base64,
                ),
            };
            let write = AgentRequest::FileWrite {
                id: format!("{}-ws-{index}", request.job_id),
                path: format!("{}/{}", context::WORKSPACE_DIR, file.path),
                content,
                encoding,
                mode: file.mode,
            };
            match channel.call(&write, None).await {
                Ok(AgentResponse::FileWrite { success: true, .. }) => {}
                Ok(AgentResponse::Error { message, .. }) => return Err(message),
                Ok(other) => return Err(format!("unexpected file_write reply: {other:?}")),
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(())
    }

    async fn run_steps(&self, channel: &mut AgentChannel, request: &JobRequest) -> JobOutcome {
        let rows = match self.store.steps_for_job(&request.job_id).await {
            Ok(rows) => rows,
            Err(e) => return JobOutcome::failure(None, format!("step rows unavailable: {e}")),
        };

        let mut fatal: Option<Option<i64>> = None;
        for (index, step) in request.def.steps.iter().enumerate() {
            let row = rows.get(index);

            // Cancellation intent is observed between steps, never mid-step.
            if request.cancel.is_cancelled() {
                let _ = self
                    .store
                    .mark_steps_for_job(&request.job_id, Status::Cancelled)
                    .await;
                return JobOutcome::cancelled();
            }

            if step.condition == Some(false) {
                self.persist_step(row, Status::Skipped, None).await;
                continue;
            }
            if fatal.is_some() {
                self.persist_step(row, Status::Skipped, None).await;
                continue;
            }

            if let Some(row) = row {
                if let Err(e) = self
                    .store
                    .update_step_status(&row.id, Status::Running, Some(Utc::now()), None, None)
                    .await
                {
                    warn!(step = %step.name, error = %e, "failed to mark step running");
                }
            }

            match self.run_step(channel, request, step, row, index).await {
                StepExecution::Exit(0) => {
                    self.persist_step(row, Status::Success, Some(0)).await;
                }
                StepExecution::Exit(code) => {
                    self.persist_step(row, Status::Failure, Some(code as i64)).await;
                    if step.continue_on_error {
                        info!(step = %step.name, code, "step failed, continuing");
                    } else {
                        fatal = Some(Some(code as i64));
                    }
                }
                StepExecution::AgentError(message) => {
                    self.persist_step(row, Status::Failure, None).await;
                    if step.continue_on_error {
                        info!(step = %step.name, error = %message, "step failed, continuing");
                    } else {
                        fatal = Some(None);
                    }
                }
            }
        }

        match fatal {
            Some(exit_code) => JobOutcome::failure(exit_code, "step failed"),
            None => JobOutcome::success(),
        }
    }

    async fn run_step(
        &self,
        channel: &mut AgentChannel,
        request: &JobRequest,
        step: &StepDef,
        row: Option<&StepRecord>,
        index: usize,
    ) -> StepExecution {
        let env: HashMap<String, String> = context::merge_env(&request.env, &request.def, step)
            .into_iter()
            .map(|(k, v)| (k, context::substitute_secrets(&v, &request.secrets)))
            .collect();
        let command = context::substitute_secrets(&step.run, &request.secrets);
        let args = step
            .args
            .iter()
            .map(|arg| context::substitute_secrets(arg, &request.secrets))
            .collect();

        let request_id = row
            .map(|r| r.id.clone())
            .unwrap_or_else(|| format!("{}-step-{index}", request.job_id));
        let execute = AgentRequest::Execute {
            id: request_id,
            command,
            args,
            cwd: Some(
                step.cwd
                    .clone()
                    .unwrap_or_else(|| context::WORKSPACE_DIR.to_string()),
            ),
            env,
            timeout_secs: step.timeout_secs,
            stream: true,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputEvent>();
        let response = channel.call(&execute, Some(&tx)).await;
        drop(tx);

        // Chunks are durable before the step's terminal status is written.
        let step_id = row.map(|r| r.id.as_str());
        let mut streamed = 0usize;
        while let Ok(event) = rx.try_recv() {
            self.append_chunk(request, step_id, event.stream.as_str(), &event.data).await;
            streamed += 1;
        }

        match response {
            Ok(AgentResponse::Execute {
                exit_code,
                stdout,
                stderr,
                ..
            }) => {
                if streamed == 0 {
                    if !stdout.is_empty() {
                        self.append_chunk(request, step_id, "stdout", &stdout).await;
                    }
                    if !stderr.is_empty() {
                        self.append_chunk(request, step_id, "stderr", &stderr).await;
                    }
                }
                StepExecution::Exit(exit_code)
            }
            Ok(AgentResponse::Error { message, .. }) => StepExecution::AgentError(message),
            Ok(other) => StepExecution::AgentError(format!("unexpected execute reply: {other:?}")),
            Err(e) => StepExecution::AgentError(e.to_string()),
        }
    }

    async fn append_chunk(
        &self,
        request: &JobRequest,
        step_id: Option<&str>,
        stream: &str,
        data: &str,
    ) {
        match self
            .store
            .append_log(&request.job_id, step_id, stream, data.as_bytes())
            .await
        {
            Ok(seq) => self.bus.publish(BusEvent::Log {
                job_id: request.job_id.clone(),
                step_id: step_id.map(String::from),
                seq,
                stream: stream.to_string(),
                content: data.to_string(),
            }),
            Err(e) => warn!(job_id = %request.job_id, error = %e, "failed to persist log chunk"),
        }
    }

    async fn persist_step(&self, row: Option<&StepRecord>, status: Status, exit_code: Option<i64>) {
        let Some(row) = row else {
            return;
        };
        if let Err(e) = self
            .store
            .update_step_status(&row.id, status, None, Some(Utc::now()), exit_code)
            .await
        {
            warn!(step_id = %row.id, error = %e, "failed to persist step status");
        }
    }
}

enum StepExecution {
    Exit(i32),
    AgentError(String),
}

fn nic_for(net: &NetworkConfig) -> zephyr_hypervisor::NetworkInterface {
    zephyr_hypervisor::NetworkInterface {
        iface_id: "eth0".to_string(),
        host_dev_name: net.tap_device.clone(),
        guest_mac: Some(net.guest_mac.clone()),
    }
}

#[async_trait]
impl JobRunner for VmJobRunner {
    async fn run_job(&self, request: JobRequest) -> JobOutcome {
        let max_attempts = request
            .def
            .retry
            .as_ref()
            .map(|retry| retry.max_attempts.max(1))
            .unwrap_or(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.execute_attempt(&request, attempt).await;

            if outcome.status != Status::Failure || attempt >= max_attempts {
                return outcome;
            }
            let Some(retry) = &request.def.retry else {
                return outcome;
            };
            if !retry.retries(outcome.exit_code.map(|code| code as i32)) {
                return outcome;
            }

            warn!(
                job_id = %request.job_id,
                attempt,
                max_attempts,
                "job failed, retrying after {}s",
                retry.delay_secs
            );
            if let Err(e) = self.store.reset_steps_for_job(&request.job_id).await {
                warn!(job_id = %request.job_id, error = %e, "failed to reset steps for retry");
                return outcome;
            }
            tokio::time::sleep(Duration::from_secs(retry.delay_secs)).await;
        }
    }
}
