//! Request and response bodies of the microVM API.

use serde::{Deserialize, Serialize};

/// `GET /` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub vmm_version: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
}

/// `PUT /boot-source`.
#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<String>,
}

/// `PUT /drives/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// `PUT /network-interfaces/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

/// `PUT /machine-config`.
#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_template: Option<String>,
}

/// `PUT /vsock`.
#[derive(Debug, Clone, Serialize)]
pub struct VsockConfig {
    pub guest_cid: u32,
    pub uds_path: String,
}

/// `PUT /logger`.
#[derive(Debug, Clone, Serialize)]
pub struct LoggerConfig {
    pub log_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_level: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_log_origin: Option<bool>,
}

/// `PUT /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsConfig {
    pub metrics_path: String,
}

/// `PUT /mmds/config`.
#[derive(Debug, Clone, Serialize)]
pub struct MmdsConfig {
    pub network_interfaces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `PUT /balloon`.
#[derive(Debug, Clone, Serialize)]
pub struct BalloonConfig {
    pub amount_mib: u32,
    pub deflate_on_oom: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_polling_interval_s: Option<u32>,
}

/// `PUT /actions`.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub action_type: ActionType,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum ActionType {
    InstanceStart,
    SendCtrlAltDel,
    FlushMetrics,
}

/// `PUT /snapshot/create`.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCreate {
    pub snapshot_path: String,
    pub mem_file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_type: Option<String>,
}

/// `PUT /snapshot/load`.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotLoad {
    pub snapshot_path: String,
    pub mem_file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_diff_snapshots: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_vm: Option<bool>,
}

/// `PATCH /vm`.
#[derive(Debug, Clone, Serialize)]
pub struct VmState {
    pub state: VmStateKind,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum VmStateKind {
    Paused,
    Resumed,
}

/// Error body returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct Fault {
    #[serde(default)]
    pub fault_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_source_omits_absent_fields() {
        let body = serde_json::to_value(BootSource {
            kernel_image_path: "/img/vmlinux".to_string(),
            boot_args: Some("console=ttyS0".to_string()),
            initrd_path: None,
        })
        .unwrap();
        assert_eq!(body["kernel_image_path"], "/img/vmlinux");
        assert_eq!(body["boot_args"], "console=ttyS0");
        assert!(body.get("initrd_path").is_none());
    }

    #[test]
    fn action_type_serializes_as_pascal_case() {
        let body = serde_json::to_string(&Action {
            action_type: ActionType::InstanceStart,
        })
        .unwrap();
        assert_eq!(body, r#"{"action_type":"InstanceStart"}"#);
    }

    #[test]
    fn instance_info_parses_minimal_body() {
        let info: InstanceInfo =
            serde_json::from_str(r#"{"id":"vm-1","state":"Running"}"#).unwrap();
        assert_eq!(info.state, "Running");
        assert!(info.vmm_version.is_none());
    }
}
