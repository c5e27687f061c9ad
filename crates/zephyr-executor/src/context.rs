//! Pure helpers for assembling a job's execution context.

use regex::Regex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use zephyr_core::pipeline::{JobDef, StepDef};
use zephyr_net::NetworkConfig;

/// Canonical workspace path inside the guest.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Kernel boot args injecting the guest's network identity. The guest
/// supervisor brings eth0 up from `ip=` before starting the agent.
pub fn boot_args(net: &NetworkConfig) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off \
         ip={}::{}:{}::eth0:off:{}:",
        net.guest_ip,
        net.gateway,
        prefix_to_netmask(net.prefix_len),
        net.dns,
    )
}

fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    let mask = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
    Ipv4Addr::from(mask)
}

/// Root filesystem image path for a runner image name. Registry-style names
/// are flattened (`node:20` → `node-20.ext4`).
pub fn rootfs_path(image_dir: &Path, image: &str) -> PathBuf {
    let flat: String = image
        .chars()
        .map(|c| if c == '/' || c == ':' { '-' } else { c })
        .collect();
    image_dir.join(format!("{flat}.ext4"))
}

/// Merge environments with step values winning over job values winning over
/// pipeline values.
pub fn merge_env(
    pipeline: &HashMap<String, String>,
    job: &JobDef,
    step: &StepDef,
) -> HashMap<String, String> {
    let mut env = pipeline.clone();
    env.extend(job.env.clone());
    env.extend(step.env.clone());
    env
}

/// Substitute `${{ secrets.NAME }}` references. Unknown names resolve to the
/// empty string so secret values never echo their own reference.
pub fn substitute_secrets(input: &str, secrets: &HashMap<String, String>) -> String {
    let pattern = match Regex::new(r"\$\{\{\s*secrets\.([A-Za-z0-9_]+)\s*\}\}") {
        Ok(pattern) => pattern,
        Err(_) => return input.to_string(),
    };
    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| {
            secrets.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zephyr_core::pipeline::RunnerSpec;

    fn net() -> NetworkConfig {
        NetworkConfig {
            slot: 3,
            tap_device: "ztap3".to_string(),
            host_ip: Ipv4Addr::new(172, 30, 0, 13),
            guest_ip: Ipv4Addr::new(172, 30, 0, 14),
            guest_mac: "02:00:00:00:00:01".to_string(),
            gateway: Ipv4Addr::new(172, 30, 0, 13),
            dns: Ipv4Addr::new(1, 1, 1, 1),
            prefix_len: 30,
        }
    }

    #[test]
    fn boot_args_inject_guest_network() {
        let args = boot_args(&net());
        assert!(args.contains("ip=172.30.0.14::172.30.0.13:255.255.255.252::eth0:off:1.1.1.1:"));
        assert!(args.starts_with("console=ttyS0"));
    }

    #[test]
    fn rootfs_path_flattens_registry_names() {
        let dir = Path::new("/var/lib/zephyr/images");
        assert_eq!(
            rootfs_path(dir, "alpine"),
            PathBuf::from("/var/lib/zephyr/images/alpine.ext4")
        );
        assert_eq!(
            rootfs_path(dir, "node:20"),
            PathBuf::from("/var/lib/zephyr/images/node-20.ext4")
        );
        assert_eq!(
            rootfs_path(dir, "ghcr.io/acme/builder:1"),
            PathBuf::from("/var/lib/zephyr/images/ghcr.io-acme-builder-1.ext4")
        );
    }

    #[test]
    fn env_precedence_is_step_over_job_over_pipeline() {
        let pipeline = HashMap::from([
            ("SHARED".to_string(), "pipeline".to_string()),
            ("PIPELINE_ONLY".to_string(), "p".to_string()),
        ]);
        let job = JobDef {
            name: "j".to_string(),
            runner: RunnerSpec::default(),
            depends_on: vec![],
            env: HashMap::from([
                ("SHARED".to_string(), "job".to_string()),
                ("JOB_ONLY".to_string(), "j".to_string()),
            ]),
            steps: vec![],
            matrix: None,
            retry: None,
            timeout_secs: None,
            condition: None,
        };
        let step = StepDef {
            name: "s".to_string(),
            run: "true".to_string(),
            args: vec![],
            env: HashMap::from([("SHARED".to_string(), "step".to_string())]),
            cwd: None,
            continue_on_error: false,
            timeout_secs: None,
            condition: None,
        };

        let env = merge_env(&pipeline, &job, &step);
        assert_eq!(env["SHARED"], "step");
        assert_eq!(env["PIPELINE_ONLY"], "p");
        assert_eq!(env["JOB_ONLY"], "j");
    }

    #[test]
    fn secrets_are_substituted() {
        let secrets = HashMap::from([("TOKEN".to_string(), "hunter2".to_string())]);
        assert_eq!(
            substitute_secrets("curl -H 'Auth: ${{ secrets.TOKEN }}'", &secrets),
            "curl -H 'Auth: hunter2'"
        );
        assert_eq!(
            substitute_secrets("echo ${{ secrets.MISSING }}", &secrets),
            "echo "
        );
        assert_eq!(substitute_secrets("no refs here", &secrets), "no refs here");
    }
}
