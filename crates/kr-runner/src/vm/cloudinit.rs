//! Cloud-init seed generation (§4.5): network-via-netplan, authorized keys,
//! an optional NVIDIA driver install, and a placeholder systemd unit for the
//! in-guest heartbeat agent the boot watchdog is meant to eventually race
//! against.

use std::path::Path;

use tokio::process::Command;

use crate::error::VmError;

pub struct CloudInitSpec<'a> {
    pub hostname: String,
    pub ssh_public_key: Option<&'a str>,
    pub tap_mac: String,
    pub static_ip: Option<String>,
    pub gateway_ip: Option<String>,
    pub gpu_passthrough: bool,
}

/// Render `user-data`/`meta-data`/`network-config` into `instance_dir` and
/// pack them into an ISO9660 seed via `genisoimage`, the conventional
/// cloud-init NoCloud datasource format.
///
/// # Errors
///
/// Returns [`VmError::Io`] if the instance directory cannot be written, or
/// [`VmError::QemuImg`] (reused here for any seed-tooling subprocess
/// failure) if `genisoimage` is not available or exits non-zero.
pub async fn render_seed(instance_dir: &Path, spec: &CloudInitSpec<'_>) -> Result<std::path::PathBuf, VmError> {
    tokio::fs::create_dir_all(instance_dir).await?;

    let user_data = render_user_data(spec);
    let meta_data = format!("instance-id: {}\nlocal-hostname: {}\n", spec.hostname, spec.hostname);
    let network_config = render_network_config(spec);

    tokio::fs::write(instance_dir.join("user-data"), user_data).await?;
    tokio::fs::write(instance_dir.join("meta-data"), meta_data).await?;
    tokio::fs::write(instance_dir.join("network-config"), network_config).await?;

    let seed_path = instance_dir.join("seed.iso");
    let status = Command::new("genisoimage")
        .args([
            "-output",
            &seed_path.to_string_lossy(),
            "-volid",
            "cidata",
            "-joliet",
            "-rock",
        ])
        .arg(instance_dir.join("user-data"))
        .arg(instance_dir.join("meta-data"))
        .arg(instance_dir.join("network-config"))
        .status()
        .await?;

    if !status.success() {
        return Err(VmError::QemuImg("genisoimage exited non-zero building seed.iso".to_owned()));
    }

    Ok(seed_path)
}

fn render_user_data(spec: &CloudInitSpec<'_>) -> String {
    let mut doc = String::from("#cloud-config\n");
    doc.push_str(&format!("hostname: {}\n", spec.hostname));

    if let Some(key) = spec.ssh_public_key {
        doc.push_str("users:\n  - name: root\n    ssh_authorized_keys:\n");
        doc.push_str(&format!("      - \"{key}\"\n"));
    }

    // The in-guest heartbeat agent is a tiny script meant to curl the
    // Runner's reachable address once it comes up, for the watchdog in
    // `mod.rs` to race against — that phone-home channel isn't wired up on
    // the Runner side yet, so this unit is enabled but nothing consumes it.
    doc.push_str("runcmd:\n");
    if spec.gpu_passthrough {
        doc.push_str("  - curl -fsSL https://us.download.nvidia.com/XFree86/Linux-x86_64/nvidia-installer.sh -o /tmp/nvidia-installer.sh\n");
        doc.push_str("  - sh /tmp/nvidia-installer.sh --silent --no-questions\n");
    }
    doc.push_str("  - systemctl enable --now kohakuriver-heartbeat-agent.service || true\n");

    doc
}

fn render_network_config(spec: &CloudInitSpec<'_>) -> String {
    match (&spec.static_ip, &spec.gateway_ip) {
        (Some(ip), Some(gw)) => format!(
            "version: 2\nethernets:\n  eth0:\n    match:\n      macaddress: \"{}\"\n    addresses: [{ip}]\n    gateway4: {gw}\n",
            spec.tap_mac
        ),
        _ => format!(
            "version: 2\nethernets:\n  eth0:\n    match:\n      macaddress: \"{}\"\n    dhcp4: true\n",
            spec.tap_mac
        ),
    }
}
