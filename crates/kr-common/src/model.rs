//! Wire contracts shared by the Host and Runner.
//!
//! These types cross the HTTP boundary in both directions: the Host sends
//! [`OverlayConfig`] to a registering Runner; the Runner sends
//! [`RegisterRequest`]/[`HeartbeatRequest`] to the Host and receives
//! [`ExecuteRequest`] in return.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The twelve task states of §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    PendingApproval,
    Rejected,
    Pending,
    Assigning,
    Running,
    Paused,
    Completed,
    Failed,
    Killed,
    KilledOom,
    Stopped,
    Lost,
}

impl TaskStatus {
    /// Terminal states per §4.1: `rejected`, `completed`, `failed`, `killed`,
    /// `killed_oom`, `stopped`. `lost` is terminal for COMMAND tasks only,
    /// so it is deliberately excluded here — callers that need the
    /// COMMAND-specific rule check task kind alongside this.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected
                | Self::Completed
                | Self::Failed
                | Self::Killed
                | Self::KilledOom
                | Self::Stopped
        )
    }
}

/// One-shot vs. long-lived task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Command,
    Vps,
}

/// VPS backend tag (§9: "explicit backend tag on the task, dispatch on that").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpsBackend {
    Docker,
    Qemu,
}

/// SSH bootstrap mode for a VPS task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshMode {
    Disabled,
    None,
    Upload,
    Generate,
}

/// Resource request attached to a task submission.
///
/// `cores == 0` means unlimited (§8 boundary: "container is created without
/// a CPU quota flag"); `memory_bytes == 0` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub gpu_indices: Vec<u32>,
    pub numa_node: Option<u32>,
}

/// A request to dispatch a task onto a Runner, sent Host → Runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub task_id: u64,
    pub kind: TaskKind,
    pub resources: ResourceRequest,
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub extra_mounts: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    pub command: Option<String>,
    pub vps: Option<VpsSpec>,
}

/// Container environment: either a named, tarball-distributed environment,
/// or a registry image reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentSpec {
    Named { name: String },
    Image { reference: String },
}

/// VPS-specific fields of an execute request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpsSpec {
    pub backend: VpsBackend,
    pub ssh_mode: SshMode,
    pub ssh_public_key: Option<String>,
    pub vm_image: Option<String>,
    pub vm_disk_size_bytes: Option<u64>,
    pub overlay_ip: Option<String>,
}

/// A status update reported Runner → Host for a single task (§5 "ordering":
/// delivered in arrival order per task).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub task_id: u64,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub ssh_port: Option<u16>,
}

/// GPU inventory entry reported by a Runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub model: String,
    pub memory_bytes: u64,
    pub utilization_percent: f32,
    pub pci_address: Option<String>,
    pub iommu_group: Option<u32>,
    /// PCI addresses of companion devices in the same IOMMU group (§4.6:
    /// "bind every non-bridge device in its IOMMU group").
    #[serde(default)]
    pub companion_devices: Vec<String>,
}

/// NUMA topology: node id to the CPU core ids it owns.
pub type NumaTopology = HashMap<u32, Vec<u32>>;

/// Registration document a Runner POSTs on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    pub reachable_url: String,
    pub total_cores: u32,
    pub total_memory_bytes: u64,
    #[serde(default)]
    pub numa_topology: NumaTopology,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    pub vm_capable: bool,
    pub runner_version: String,
}

/// Overlay network configuration returned to a Runner at register time,
/// when overlay networking is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub subnet_cidr: String,
    pub gateway_ip: String,
    pub vxlan_id: u32,
    pub host_vxlan_underlay_ip: String,
}

/// A killed-task entry reported in a heartbeat (§4.2: "tasks the Runner
/// killed since the previous heartbeat, with reason").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilledTaskReport {
    pub task_id: u64,
    pub reason: String,
}

/// Heartbeat a Runner PUTs at a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub hostname: String,
    #[serde(default)]
    pub running_task_ids: Vec<u64>,
    #[serde(default)]
    pub killed_tasks: Vec<KilledTaskReport>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub temperature_celsius: Option<f32>,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    pub vm_capable: bool,
    pub runner_version: String,
}

/// Online/offline status derived purely from heartbeat recency (invariant 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}
