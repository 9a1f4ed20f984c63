//! Resource monitor: samples CPU/memory once per heartbeat tick, plus GPU
//! metrics and temperature on a best-effort basis (SPEC_FULL.md ambient
//! stack expansion; `sysinfo` does not expose GPUs).

use kr_common::model::GpuInfo;
use sysinfo::System;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Snapshot of host resource usage for one heartbeat.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub temperature_celsius: Option<f32>,
    pub gpus: Vec<GpuInfo>,
}

/// Wraps a `sysinfo::System`, refreshed once per sample rather than per
/// request — CPU percentage needs two samples apart in time to be
/// meaningful, so the `System` is kept alive across calls.
pub struct ResourceMonitor {
    system: Mutex<System>,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system: Mutex::new(system),
        }
    }

    /// Refresh and return a new sample.
    pub async fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock().await;
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_usage();
        let memory_percent = if system.total_memory() == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / system.total_memory() as f64 * 100.0) as f32
        };

        ResourceSample {
            cpu_percent,
            memory_percent,
            temperature_celsius: read_thermal_zone(),
            gpus: nvidia_smi_gpus().await,
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn read_thermal_zone() -> Option<f32> {
    let raw = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp").ok()?;
    raw.trim().parse::<f32>().ok().map(|millideg| millideg / 1000.0)
}

/// GPUs are not exposed by `sysinfo`; parse `nvidia-smi`'s CSV query output
/// instead. Absent the binary (no NVIDIA GPUs present), this returns an
/// empty list rather than an error.
async fn nvidia_smi_gpus() -> Vec<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,utilization.gpu,pci.bus_id",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await;

    let Ok(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_gpu_line)
        .collect()
}

fn parse_gpu_line(line: &str) -> Option<GpuInfo> {
    let mut fields = line.split(',').map(str::trim);
    let index = fields.next()?.parse().ok()?;
    let model = fields.next()?.to_owned();
    let memory_mib: u64 = fields.next()?.parse().ok()?;
    let utilization_percent = fields.next()?.parse().ok()?;
    let pci_address = fields.next().map(str::to_owned);

    Some(GpuInfo {
        index,
        model,
        memory_bytes: memory_mib * 1024 * 1024,
        utilization_percent,
        pci_address,
        iommu_group: None,
        companion_devices: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_nvidia_smi_line() {
        let line = "0, NVIDIA A100, 40960, 12, 0000:3B:00.0";
        let gpu = parse_gpu_line(line).expect("should parse");
        assert_eq!(gpu.index, 0);
        assert_eq!(gpu.model, "NVIDIA A100");
        assert_eq!(gpu.memory_bytes, 40960 * 1024 * 1024);
        assert!((gpu.utilization_percent - 12.0).abs() < f32::EPSILON);
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(parse_gpu_line("garbage").is_none());
    }
}
