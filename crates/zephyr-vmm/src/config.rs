//! Aggregate VM configuration, applied resource by resource.

use zephyr_hypervisor::{
    BalloonConfig, BootSource, Drive, LoggerConfig, MachineConfig, MetricsConfig,
    NetworkInterface, VsockConfig,
};

/// Everything needed to configure one VM before `InstanceStart`.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub boot_source: BootSource,
    pub machine: MachineConfig,
    pub drives: Vec<Drive>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub vsock: Option<VsockConfig>,
    pub logger: Option<LoggerConfig>,
    pub metrics: Option<MetricsConfig>,
    pub mmds: Option<serde_json::Value>,
    pub balloon: Option<BalloonConfig>,
}

impl VmConfig {
    /// A minimal config: kernel + rootfs, one vCPU, 512 MiB.
    pub fn new(kernel_image_path: String, rootfs_path: String) -> Self {
        Self {
            boot_source: BootSource {
                kernel_image_path,
                boot_args: None,
                initrd_path: None,
            },
            machine: MachineConfig {
                vcpu_count: 1,
                mem_size_mib: 512,
                smt: None,
                cpu_template: None,
            },
            drives: vec![Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: rootfs_path,
                is_root_device: true,
                is_read_only: false,
            }],
            network_interfaces: Vec::new(),
            vsock: None,
            logger: None,
            metrics: None,
            mmds: None,
            balloon: None,
        }
    }
}
