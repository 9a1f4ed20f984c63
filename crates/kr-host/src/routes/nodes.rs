//! Node routes: `/api/register`, `/api/heartbeat/{hostname}`, `/api/nodes`,
//! `/api/cluster-health` (§6).

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use kr_common::model::{HeartbeatRequest, OverlayConfig, RegisterRequest};
use serde::Serialize;

use kr_core::auth::Role;
use kr_core::node::Node;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// Build the node routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register))
        .route("/heartbeat/{hostname}", put(heartbeat))
        .route("/nodes", get(list_nodes))
        .route("/cluster-health", get(cluster_health))
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub overlay: Option<OverlayConfig>,
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let hostname = req.hostname.clone();
    state.registry.register(req).await?;
    let allocation = state.overlay.allocate(&hostname).await?;

    Ok(Json(RegisterResponse {
        overlay: Some(OverlayConfig {
            subnet_cidr: allocation.subnet_cidr,
            gateway_ip: allocation.gateway_ip,
            vxlan_id: allocation.vxlan_id,
            host_vxlan_underlay_ip: state.config.bind_addr.ip().to_string(),
        }),
    }))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(hostname): Path<String>,
    Json(mut hb): Json<HeartbeatRequest>,
) -> Result<(), AppError> {
    hb.hostname = hostname.clone();
    state.registry.heartbeat(&hb).await?;

    let running: HashSet<u64> = hb.running_task_ids.iter().copied().collect();
    state.scheduler.age_assigning_tasks(&hostname, &running).await?;

    for killed in &hb.killed_tasks {
        if let Ok(task) = state.tasks.get(killed.task_id).await
            && !task.is_terminal()
        {
            let status = if killed.reason.eq_ignore_ascii_case("oom") {
                kr_common::model::TaskStatus::KilledOom
            } else {
                kr_common::model::TaskStatus::Killed
            };
            let _ = state.tasks.transition(killed.task_id, status).await;
        }
    }

    // A VPS the Runner still reports running has survived whatever made the
    // Host mark it lost (invariant 6); bring it back out of `lost`.
    for &task_id in &hb.running_task_ids {
        if let Ok(task) = state.tasks.get(task_id).await
            && task.status == kr_common::model::TaskStatus::Lost
            && task.kind == kr_common::model::TaskKind::Vps
        {
            let _ = state
                .tasks
                .transition(task_id, kr_common::model::TaskStatus::Running)
                .await;
        }
    }

    Ok(())
}

async fn list_nodes(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Node>>, AppError> {
    auth.require(Role::Viewer)?;
    Ok(Json(state.registry.list().await))
}

#[derive(Debug, Serialize)]
pub struct ClusterHealth {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub offline_nodes: usize,
}

async fn cluster_health(
    State(state): State<Arc<AppState>>,
) -> Json<ClusterHealth> {
    let nodes = state.registry.list().await;
    let online = nodes
        .iter()
        .filter(|n| n.status == kr_common::model::NodeStatus::Online)
        .count();
    Json(ClusterHealth {
        total_nodes: nodes.len(),
        online_nodes: online,
        offline_nodes: nodes.len() - online,
    })
}
