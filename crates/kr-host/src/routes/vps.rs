//! VPS routes: `/api/vps/create`, `/api/vps/stop/{id}`,
//! `/api/vps/restart/{id}`, `/api/vps`, `/api/vps/status` (§6, §4.4, §4.5).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use kr_common::model::{ResourceRequest, SshMode, TaskKind, TaskStatus, VpsBackend};
use serde::{Deserialize, Serialize};

use kr_core::auth::Role;
use kr_core::scheduler::SubmitRequest;
use kr_core::task::{Task, VpsFields};

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::runner_client;
use crate::state::AppState;

/// Build the VPS routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/vps/create", post(create))
        .route("/vps/stop/{id}", post(stop))
        .route("/vps/restart/{id}", post(restart))
        .route("/vps", get(list_vps))
        .route("/vps/status", get(status))
}

#[derive(Debug, Deserialize)]
pub struct CreateVpsRequest {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub resources: ResourceRequest,
    pub backend: VpsBackend,
    #[serde(default)]
    pub ssh_mode: SshMode,
    pub ssh_public_key: Option<String>,
    pub vm_image: Option<String>,
    pub vm_disk_size_bytes: Option<u64>,
    pub environment_name: Option<String>,
    pub environment_image: Option<String>,
    #[serde(default)]
    pub extra_mounts: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
}

async fn create(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateVpsRequest>,
) -> Result<Json<Task>, AppError> {
    auth.require(Role::User)?;
    let owner = auth.username.clone().unwrap_or_default();
    let requires_approval = !auth.role.satisfies(Role::Operator);

    let vps = VpsFields {
        backend: req.backend,
        ssh_mode: req.ssh_mode,
        ssh_public_key: req.ssh_public_key,
        ssh_port: None,
        vm_image: req.vm_image,
        vm_disk_size_bytes: req.vm_disk_size_bytes,
        overlay_ip: None,
    };

    let task = state
        .scheduler
        .submit(SubmitRequest {
            kind: TaskKind::Vps,
            owner,
            target: req.target,
            resources: req.resources,
            environment_name: req.environment_name,
            environment_image: req.environment_image,
            extra_mounts: req.extra_mounts,
            privileged: req.privileged,
            command: None,
            requires_approval,
            vps: Some(vps),
        })
        .await?;

    Ok(Json(task))
}

fn require_vps(task: &Task) -> Result<(), AppError> {
    if task.kind != TaskKind::Vps {
        return Err(AppError::new(
            kr_common::ErrorKind::BadRequest,
            "task is not a VPS",
        ));
    }
    Ok(())
}

async fn stop(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<u64>,
) -> Result<Json<Task>, AppError> {
    auth.require(Role::User)?;
    let task = state.tasks.get(id).await?;
    require_vps(&task)?;
    if task.is_terminal() {
        return Ok(Json(task));
    }
    let updated = state.tasks.transition(id, TaskStatus::Stopped).await?;
    if let Some(hostname) = &updated.assigned_hostname {
        let node = state.registry.get(hostname).await?;
        runner_client::vps_stop(&node.reachable_url, id).await?;
    }
    Ok(Json(updated))
}

/// Reboot the VPS's container/VM in place (§4.4: restart keeps the task's
/// id and assignment, unlike a resubmit). Only valid while `running` — the
/// Runner no longer tracks a `stopped` VPS's container.
async fn restart(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<u64>,
) -> Result<Json<Task>, AppError> {
    auth.require(Role::User)?;
    let task = state.tasks.get(id).await?;
    require_vps(&task)?;

    let updated = state.tasks.transition(id, TaskStatus::Running).await?;
    if let Some(hostname) = &updated.assigned_hostname {
        let node = state.registry.get(hostname).await?;
        runner_client::vps_restart(&node.reachable_url, id).await?;
    }
    Ok(Json(updated))
}

async fn list_vps(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Task>>, AppError> {
    auth.require(Role::Viewer)?;
    let tasks = state.tasks.list().await?;
    Ok(Json(
        tasks.into_iter().filter(|t| t.kind == TaskKind::Vps).collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct VpsStatusSummary {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
}

async fn status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<VpsStatusSummary>, AppError> {
    auth.require(Role::Viewer)?;
    let tasks = state.tasks.list().await?;
    let vps_tasks: Vec<_> = tasks.into_iter().filter(|t| t.kind == TaskKind::Vps).collect();
    let running = vps_tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .count();
    let stopped = vps_tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Stopped)
        .count();
    Ok(Json(VpsStatusSummary {
        total: vps_tasks.len(),
        running,
        stopped,
    }))
}
