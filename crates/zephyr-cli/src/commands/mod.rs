//! Command implementations.

mod init;
mod run;
mod server;
mod trigger;

pub use init::init;
pub use run::run;
pub use server::{server, ServerArgs};
pub use trigger::trigger;

use clap::Args;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use zephyr_executor::{VmJobRunner, VmJobRunnerConfig};
use zephyr_net::{NetworkAllocator, NetworkAllocatorConfig};
use zephyr_scheduler::LogBus;
use zephyr_store::Store;
use zephyr_vmm::{VmManager, VmManagerConfig};

/// Settings for the VM execution engine, shared by `run` and `server`.
#[derive(Debug, Args)]
pub struct EngineArgs {
    /// Kernel image booted into every VM
    #[arg(long, env = "ZEPHYR_KERNEL_IMAGE", default_value = "/var/lib/zephyr/images/vmlinux")]
    pub kernel_image: PathBuf,

    /// Directory of rootfs images
    #[arg(long, env = "ZEPHYR_IMAGE_DIR", default_value = "/var/lib/zephyr/images")]
    pub image_dir: PathBuf,

    /// Hypervisor binary
    #[arg(long, env = "ZEPHYR_HYPERVISOR_BIN", default_value = "firecracker")]
    pub hypervisor_bin: PathBuf,

    /// Directory for per-VM sockets and logs
    #[arg(long, env = "ZEPHYR_RUNTIME_DIR", default_value = "/var/lib/zephyr/vms")]
    pub runtime_dir: PathBuf,

    /// Base of the /16 carved into per-VM /30 subnets
    #[arg(long, env = "ZEPHYR_SUBNET_BASE", default_value = "172.30.0.0")]
    pub subnet_base: Ipv4Addr,

    /// External interface NAT rules attach to
    #[arg(long, env = "ZEPHYR_EXTERNAL_IFACE", default_value = "eth0")]
    pub external_interface: String,

    /// Disable NAT setup (VMs get host-only networking)
    #[arg(long)]
    pub no_nat: bool,

    /// DNS server injected into guests
    #[arg(long, default_value = "1.1.1.1")]
    pub dns: Ipv4Addr,

    /// Maximum concurrently running jobs
    #[arg(long, env = "ZEPHYR_MAX_CONCURRENT", default_value = "4")]
    pub max_concurrent: usize,
}

/// Wire the execution engine: allocator, VM manager and job runner.
pub(crate) fn build_engine(
    store: &Store,
    bus: &LogBus,
    args: &EngineArgs,
) -> (Arc<VmManager>, Arc<VmJobRunner>) {
    let net = Arc::new(NetworkAllocator::new(NetworkAllocatorConfig {
        base: args.subnet_base,
        external_interface: args.external_interface.clone(),
        nat_enabled: !args.no_nat,
        dns: args.dns,
    }));
    let vms = Arc::new(VmManager::new(VmManagerConfig {
        hypervisor_bin: args.hypervisor_bin.clone(),
        runtime_dir: args.runtime_dir.clone(),
        log_level: "Info".to_string(),
    }));
    let runner = Arc::new(VmJobRunner::new(
        store.clone(),
        bus.clone(),
        net,
        vms.clone(),
        VmJobRunnerConfig {
            kernel_image: args.kernel_image.clone(),
            image_dir: args.image_dir.clone(),
            stop_timeout: Duration::from_secs(10),
            ..Default::default()
        },
    ));
    (vms, runner)
}
