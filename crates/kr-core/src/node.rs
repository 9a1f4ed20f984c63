//! Node entity (§3 Entities).

use chrono::{DateTime, Utc};
use kr_common::model::{GpuInfo, NodeStatus, NumaTopology};
use serde::{Deserialize, Serialize};

/// A registered Runner, keyed by hostname.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub reachable_url: String,
    pub total_cores: u32,
    pub total_memory_bytes: u64,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub temperature_celsius: Option<f32>,
    #[serde(default)]
    pub numa_topology: NumaTopology,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    pub vm_capable: bool,
    pub runner_version: String,
}

impl Node {
    /// Derive online/offline purely from heartbeat recency (invariant 3).
    #[must_use]
    pub fn status_from_heartbeat(
        last_heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
        heartbeat_interval_secs: i64,
        timeout_factor: u32,
    ) -> NodeStatus {
        let timeout = chrono::Duration::seconds(heartbeat_interval_secs * i64::from(timeout_factor));
        if now - last_heartbeat > timeout {
            NodeStatus::Offline
        } else {
            NodeStatus::Online
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_flips_offline_past_timeout() {
        let last = Utc::now() - chrono::Duration::seconds(31);
        let status = Node::status_from_heartbeat(last, Utc::now(), 5, 6);
        assert_eq!(status, NodeStatus::Offline);
    }

    #[test]
    fn status_stays_online_within_timeout() {
        let last = Utc::now() - chrono::Duration::seconds(10);
        let status = Node::status_from_heartbeat(last, Utc::now(), 5, 6);
        assert_eq!(status, NodeStatus::Online);
    }
}
