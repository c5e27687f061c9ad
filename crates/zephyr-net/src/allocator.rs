//! The slot allocator and host interface plumbing.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::process::Output;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{NetError, NetResult};

/// A /16 holds 2^14 /30 blocks.
const MAX_SLOTS: u32 = 1 << 14;

/// Network configuration handed to one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Slot index this config was allocated from.
    pub slot: u32,
    /// Host tap device name.
    pub tap_device: String,
    /// Host side of the /30.
    pub host_ip: Ipv4Addr,
    /// Guest side of the /30.
    pub guest_ip: Ipv4Addr,
    /// Guest MAC, locally administered and unicast.
    pub guest_mac: String,
    /// Gateway the guest routes through (the host IP).
    pub gateway: Ipv4Addr,
    /// DNS server injected into the guest.
    pub dns: Ipv4Addr,
    /// Always 30.
    pub prefix_len: u8,
}

/// Allocator settings.
#[derive(Debug, Clone)]
pub struct NetworkAllocatorConfig {
    /// Base of the /16 the VM subnets are carved from.
    pub base: Ipv4Addr,
    /// External interface NAT rules are installed against.
    pub external_interface: String,
    /// Whether to install masquerade/forward rules.
    pub nat_enabled: bool,
    /// DNS server handed to guests.
    pub dns: Ipv4Addr,
}

impl Default for NetworkAllocatorConfig {
    fn default() -> Self {
        Self {
            base: Ipv4Addr::new(172, 30, 0, 0),
            external_interface: "eth0".to_string(),
            nat_enabled: true,
            dns: Ipv4Addr::new(1, 1, 1, 1),
        }
    }
}

/// Allocates /30 slots and drives the host-side kernel state for them.
pub struct NetworkAllocator {
    config: NetworkAllocatorConfig,
    /// Slot index to owning VM id.
    slots: Mutex<BTreeMap<u32, String>>,
}

impl NetworkAllocator {
    pub fn new(config: NetworkAllocatorConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserve a slot, create the tap device and install NAT rules.
    pub async fn allocate(&self, vm_id: &str) -> NetResult<NetworkConfig> {
        let slot = {
            let mut slots = self.slots.lock().await;
            let slot = (0..MAX_SLOTS)
                .find(|candidate| !slots.contains_key(candidate))
                .ok_or(NetError::Exhausted)?;
            slots.insert(slot, vm_id.to_string());
            slot
        };

        let cfg = self.config_for_slot(slot);
        debug!(vm_id = %vm_id, slot, tap = %cfg.tap_device, "allocating network");

        if let Err(e) = self.set_up(&cfg).await {
            // Roll back so a transient failure does not leak the slot.
            self.release(&cfg).await?;
            return Err(e);
        }
        Ok(cfg)
    }

    /// Tear down NAT rules and the tap device, then free the slot.
    /// Safe to call more than once; missing kernel state is ignored.
    pub async fn release(&self, cfg: &NetworkConfig) -> NetResult<()> {
        if self.config.nat_enabled {
            for rule in self.nat_rules(cfg, "-D") {
                run_quiet("iptables", &rule).await;
            }
        }
        run_quiet("ip", &["link", "del", &cfg.tap_device]).await;

        self.slots.lock().await.remove(&cfg.slot);
        debug!(slot = cfg.slot, tap = %cfg.tap_device, "released network");
        Ok(())
    }

    /// The deterministic slot → /30 mapping.
    pub fn config_for_slot(&self, slot: u32) -> NetworkConfig {
        let base = u32::from(self.config.base);
        let host_ip = Ipv4Addr::from(base + (slot << 2) + 1);
        let guest_ip = Ipv4Addr::from(base + (slot << 2) + 2);
        NetworkConfig {
            slot,
            tap_device: format!("ztap{slot}"),
            host_ip,
            guest_ip,
            guest_mac: random_mac(),
            gateway: host_ip,
            dns: self.config.dns,
            prefix_len: 30,
        }
    }

    /// Number of slots currently held.
    pub async fn in_use(&self) -> usize {
        self.slots.lock().await.len()
    }

    async fn set_up(&self, cfg: &NetworkConfig) -> NetResult<()> {
        run("ip", &["tuntap", "add", &cfg.tap_device, "mode", "tap"]).await?;
        run(
            "ip",
            &[
                "addr",
                "add",
                &format!("{}/{}", cfg.host_ip, cfg.prefix_len),
                "dev",
                &cfg.tap_device,
            ],
        )
        .await?;
        run("ip", &["link", "set", &cfg.tap_device, "up"]).await?;

        if self.config.nat_enabled {
            tokio::fs::write("/proc/sys/net/ipv4/ip_forward", "1\n").await?;
            for rule in self.nat_rules(cfg, "-A") {
                run("iptables", &rule).await?;
            }
        }
        Ok(())
    }

    fn nat_rules(&self, cfg: &NetworkConfig, action: &str) -> Vec<Vec<String>> {
        let subnet = format!(
            "{}/{}",
            Ipv4Addr::from(u32::from(cfg.host_ip) & !0b11),
            cfg.prefix_len
        );
        let ext = &self.config.external_interface;
        vec![
            vec![
                "-t".into(),
                "nat".into(),
                action.into(),
                "POSTROUTING".into(),
                "-s".into(),
                subnet,
                "-o".into(),
                ext.clone(),
                "-j".into(),
                "MASQUERADE".into(),
            ],
            vec![
                action.into(),
                "FORWARD".into(),
                "-i".into(),
                cfg.tap_device.clone(),
                "-o".into(),
                ext.clone(),
                "-j".into(),
                "ACCEPT".into(),
            ],
            vec![
                action.into(),
                "FORWARD".into(),
                "-i".into(),
                ext.clone(),
                "-o".into(),
                cfg.tap_device.clone(),
                "-m".into(),
                "state".into(),
                "--state".into(),
                "RELATED,ESTABLISHED".into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        ]
    }
}

/// Generate a random MAC with the locally-administered bit set and the
/// multicast bit cleared.
pub fn random_mac() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes[0] = (bytes[0] | 0x02) & 0xFE;
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

async fn run<S: AsRef<str>>(program: &str, args: &[S]) -> NetResult<Output> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let output = Command::new(program).args(&args).output().await?;
    if !output.status.success() {
        return Err(NetError::Command {
            command: format!("{program} {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// Best-effort variant for teardown paths.
async fn run_quiet<S: AsRef<str>>(program: &str, args: &[S]) {
    if let Err(e) = run(program, args).await {
        warn!(error = %e, "ignoring cleanup failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> NetworkAllocator {
        NetworkAllocator::new(NetworkAllocatorConfig::default())
    }

    #[test]
    fn slot_maps_to_adjacent_host_and_guest_ips() {
        let alloc = allocator();
        for slot in [0, 1, 5, 100, MAX_SLOTS - 1] {
            let cfg = alloc.config_for_slot(slot);
            let host = u32::from(cfg.host_ip);
            let guest = u32::from(cfg.guest_ip);
            assert_eq!(guest, host + 1);
            assert_eq!(host & 0b11, 1);
            assert_eq!(guest & 0b11, 2);
        }
    }

    #[test]
    fn distinct_slots_yield_disjoint_blocks() {
        let alloc = allocator();
        let a = alloc.config_for_slot(3);
        let b = alloc.config_for_slot(4);
        assert_eq!(u32::from(a.host_ip) & !0b11, u32::from(a.guest_ip) & !0b11);
        assert_ne!(u32::from(a.host_ip) & !0b11, u32::from(b.host_ip) & !0b11);
    }

    #[test]
    fn slot_zero_uses_base_plus_one() {
        let alloc = allocator();
        let cfg = alloc.config_for_slot(0);
        assert_eq!(cfg.host_ip, Ipv4Addr::new(172, 30, 0, 1));
        assert_eq!(cfg.guest_ip, Ipv4Addr::new(172, 30, 0, 2));
        assert_eq!(cfg.gateway, cfg.host_ip);
    }

    #[test]
    fn mac_is_locally_administered_unicast() {
        for _ in 0..64 {
            let mac = random_mac();
            let first = u8::from_str_radix(&mac[..2], 16).unwrap();
            assert_eq!(first & 0x02, 0x02, "locally administered bit");
            assert_eq!(first & 0x01, 0x00, "multicast bit cleared");
            assert_eq!(mac.len(), 17);
        }
    }

    #[tokio::test]
    async fn slots_are_reused_after_release() {
        let alloc = allocator();
        // Reserve bookkeeping without touching the kernel.
        {
            let mut slots = alloc.slots.lock().await;
            slots.insert(0, "vm-a".to_string());
            slots.insert(1, "vm-b".to_string());
        }
        let cfg = alloc.config_for_slot(0);
        alloc.release(&cfg).await.unwrap();
        assert_eq!(alloc.in_use().await, 1);
        // Releasing again is indistinguishable from once.
        alloc.release(&cfg).await.unwrap();
        assert_eq!(alloc.in_use().await, 1);
    }
}
