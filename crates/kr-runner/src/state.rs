//! Shared application state for the Runner.
//!
//! One [`AppState`] is built at startup and shared across HTTP/WS handlers
//! and the heartbeat loop via `Arc`, mirroring the Host's `state.rs` shape.

use std::sync::Arc;

use kr_common::model::{GpuInfo, KilledTaskReport, NumaTopology};
use tokio::sync::Mutex;

use crate::config::RunnerConfig;
use crate::executor::SharedPaths;
use crate::local_store::LocalStore;
use crate::monitor::ResourceMonitor;
use crate::overlay_agent::OverlayAgent;
use crate::tunnel_server::TunnelRegistry;
use crate::vm::VmManager;
use crate::vps_container::VpsContainerManager;

/// Shared application state passed to all HTTP/WS handlers and the
/// background heartbeat loop.
pub struct AppState {
    pub config: RunnerConfig,
    pub local_store: LocalStore,
    pub monitor: ResourceMonitor,
    pub overlay: Arc<OverlayAgent>,
    pub vm_manager: VmManager,
    pub vps: VpsContainerManager,
    pub tunnels: Arc<TunnelRegistry>,
    pub http_client: reqwest::Client,
    pub shared_paths: SharedPaths,
    /// Detected once at startup; reported unchanged in every register and
    /// heartbeat call.
    pub numa_topology: NumaTopology,
    pub gpu_inventory: Vec<GpuInfo>,
    /// Tasks this Runner killed (OOM or otherwise) since the last heartbeat
    /// was sent, drained by `heartbeat.rs` on each tick (§4.2).
    pub killed_since_last_heartbeat: Mutex<Vec<KilledTaskReport>>,
}

impl AppState {
    pub async fn report_killed(&self, task_id: u64, reason: impl Into<String>) {
        self.killed_since_last_heartbeat
            .lock()
            .await
            .push(KilledTaskReport {
                task_id,
                reason: reason.into(),
            });
    }

    pub async fn drain_killed(&self) -> Vec<KilledTaskReport> {
        std::mem::take(&mut *self.killed_since_last_heartbeat.lock().await)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
