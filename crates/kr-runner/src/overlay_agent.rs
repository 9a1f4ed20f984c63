//! Overlay agent (§4.7 Runner side): configures the local VXLAN endpoint,
//! bridge, and container-runtime network that let containers and VMs on
//! this Runner reach the Host's hub-and-spoke overlay.
//!
//! Netlink configuration is treated as an external tool driven through
//! subprocess (spec design note, §1) rather than a netlink-protocol crate —
//! `ip`/`bridge` from iproute2 are the stable, already-present interface on
//! every target host.

use kr_common::model::OverlayConfig;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::OverlayAgentError;

/// Deterministic name derived from the overlay slot, e.g. `vxkr7`.
fn vxlan_ifname(vxlan_id: u32) -> String {
    format!("vxkr{vxlan_id}")
}

fn bridge_ifname(vxlan_id: u32) -> String {
    format!("brkr{vxlan_id}")
}

/// Applies and remembers the overlay configuration handed back at register
/// time.
pub struct OverlayAgent {
    applied: RwLock<Option<OverlayConfig>>,
    host_underlay_addr: String,
}

impl OverlayAgent {
    #[must_use]
    pub fn new(host_underlay_addr: String) -> Self {
        Self {
            applied: RwLock::new(None),
            host_underlay_addr,
        }
    }

    /// Create the local VXLAN endpoint, bridge, and forwarding rules for the
    /// configuration received from the Host's register response.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayAgentError::ToolFailed`] if any `ip`/`iptables`
    /// invocation exits non-zero.
    pub async fn apply(&self, config: OverlayConfig) -> Result<(), OverlayAgentError> {
        let vx_if = vxlan_ifname(config.vxlan_id);
        let br_if = bridge_ifname(config.vxlan_id);

        run_ip([
            "link", "add", &vx_if, "type", "vxlan", "id", &config.vxlan_id.to_string(),
            "local", &self.host_underlay_addr, "remote", &config.host_vxlan_underlay_ip,
            "dstport", "4789",
        ])
        .await?;
        run_ip(["link", "add", &br_if, "type", "bridge"]).await?;
        run_ip(["link", "set", &vx_if, "master", &br_if]).await?;
        run_ip(["addr", "add", &format!("{}/{}", config.gateway_ip, prefix_len(&config.subnet_cidr)), "dev", &br_if]).await?;
        run_ip(["link", "set", &vx_if, "up"]).await?;
        run_ip(["link", "set", &br_if, "up"]).await?;

        run_tool(
            "iptables",
            ["-t", "nat", "-A", "POSTROUTING", "-s", &config.subnet_cidr, "-j", "MASQUERADE"],
        )
        .await?;

        info!(vxlan_id = config.vxlan_id, subnet = %config.subnet_cidr, "overlay applied");
        *self.applied.write().await = Some(config);
        Ok(())
    }

    /// The bridge/network name containers should attach to, once applied.
    pub async fn bridge_name(&self) -> Result<String, OverlayAgentError> {
        let guard = self.applied.read().await;
        let config = guard.as_ref().ok_or(OverlayAgentError::NotConfigured)?;
        Ok(bridge_ifname(config.vxlan_id))
    }

    /// Deterministic TAP device name for a VM task, derived from a hash of
    /// the task id and trimmed to the kernel's `IFNAMSIZ` limit (§4.7).
    #[must_use]
    pub fn tap_ifname(task_id: u64) -> String {
        let full = format!("tapkr{:x}", fxhash(task_id));
        full.chars().take(15).collect()
    }

    /// Locally-administered MAC address derived from the same hash, so a
    /// restarted Runner can recompute a VM's MAC deterministically.
    #[must_use]
    pub fn tap_mac(task_id: u64) -> String {
        let hash = fxhash(task_id).to_be_bytes();
        format!(
            "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            hash[2], hash[3], hash[4], hash[5], hash[6]
        )
    }

    /// Create a TAP device attached to the overlay bridge for a VM task.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayAgentError::ToolFailed`] if `ip tuntap add` fails.
    pub async fn create_tap(&self, task_id: u64) -> Result<String, OverlayAgentError> {
        let bridge = self.bridge_name().await?;
        let tap = Self::tap_ifname(task_id);
        run_ip(["tuntap", "add", "dev", &tap, "mode", "tap"]).await?;
        run_ip(["link", "set", &tap, "master", &bridge]).await?;
        run_ip(["link", "set", &tap, "up"]).await?;
        Ok(tap)
    }
}

fn fxhash(task_id: u64) -> u64 {
    // Small, deterministic, non-cryptographic mix — only used to derive
    // stable interface names and MACs, never for security.
    let mut h = task_id ^ 0x9E37_79B9_7F4A_7C15;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h
}

fn prefix_len(cidr: &str) -> &str {
    cidr.split('/').nth(1).unwrap_or("24")
}

async fn run_ip<const N: usize>(args: [&str; N]) -> Result<(), OverlayAgentError> {
    run_tool("ip", args).await
}

async fn run_tool<const N: usize>(tool: &str, args: [&str; N]) -> Result<(), OverlayAgentError> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|err| OverlayAgentError::ToolFailed {
            tool: tool.to_owned(),
            detail: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(OverlayAgentError::ToolFailed {
            tool: tool.to_owned(),
            detail: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_names_are_deterministic_and_short_enough() {
        let a = OverlayAgent::tap_ifname(42);
        let b = OverlayAgent::tap_ifname(42);
        assert_eq!(a, b);
        assert!(a.len() <= 15, "interface name must fit IFNAMSIZ: {a}");
    }

    #[test]
    fn mac_is_locally_administered() {
        let mac = OverlayAgent::tap_mac(7);
        // The low bit of the second hex nibble of byte 0 marks
        // locally-administered addresses; our prefix 0x02 already sets it.
        assert!(mac.starts_with("02:"));
    }
}
