//! Task routes: `/api/submit`, `/api/kill/{id}`, `/api/command/{id}/*`,
//! `/api/tasks`, `/api/status/{id}`, `/api/update` (§6).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use kr_common::model::{ResourceRequest, StatusUpdate, TaskKind, TaskStatus};
use serde::{Deserialize, Serialize};

use kr_core::scheduler::SubmitRequest;
use kr_core::task::Task;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::runner_client;
use crate::state::AppState;
use kr_core::auth::Role;

/// Build the task routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/submit", post(submit))
        .route("/kill/{id}", post(kill))
        .route("/command/{id}/{action}", post(command))
        .route("/tasks", get(list_tasks))
        .route("/status/{id}", get(status))
        .route("/tasks/{id}", delete(delete_task))
        .route("/update", post(status_update))
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub kind: TaskKind,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub resources: ResourceRequest,
    pub environment_name: Option<String>,
    pub environment_image: Option<String>,
    #[serde(default)]
    pub extra_mounts: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    pub command: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: u64,
    pub status: TaskStatus,
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<SubmitResponse>, AppError> {
    auth.require(Role::User)?;
    let owner = auth.username.clone().unwrap_or_default();
    // Operators' submissions skip approval (§4.10); everyone below that
    // enters pending_approval.
    let requires_approval = !auth.role.satisfies(Role::Operator);

    let task = state
        .scheduler
        .submit(SubmitRequest {
            kind: body.kind,
            owner,
            target: body.target,
            resources: body.resources,
            environment_name: body.environment_name,
            environment_image: body.environment_image,
            extra_mounts: body.extra_mounts,
            privileged: body.privileged,
            command: body.command,
            requires_approval,
            vps: None,
        })
        .await?;

    Ok(Json(SubmitResponse {
        task_id: task.id,
        status: task.status,
    }))
}

async fn kill(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<u64>,
) -> Result<Json<Task>, AppError> {
    auth.require(Role::User)?;
    let task = state.tasks.get(id).await?;
    // Killed task kill is idempotent (§8 round-trip law).
    if task.is_terminal() {
        return Ok(Json(task));
    }
    let updated = state.tasks.transition(id, TaskStatus::Killed).await?;
    if let Some(hostname) = &updated.assigned_hostname {
        let node = state.registry.get(hostname).await?;
        runner_client::kill(&node.reachable_url, id).await?;
    }
    Ok(Json(updated))
}

async fn command(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((id, action)): Path<(u64, String)>,
) -> Result<Json<Task>, AppError> {
    auth.require(Role::User)?;
    let target_status = match action.as_str() {
        "pause" => TaskStatus::Paused,
        "resume" => TaskStatus::Running,
        "restart" => {
            // Treated as resubmit with the original parameters (spec.md §9
            // open question — COMMAND restart semantics are not fully
            // defined; this is the documented interim behavior).
            let original = state.tasks.get(id).await?;
            let resubmitted = state
                .scheduler
                .submit(SubmitRequest {
                    kind: original.kind,
                    owner: original.owner,
                    target: original.assigned_hostname.unwrap_or_default(),
                    resources: original.resources,
                    environment_name: original.environment_name,
                    environment_image: original.environment_image,
                    extra_mounts: original.extra_mounts,
                    privileged: original.privileged,
                    command: original.command,
                    requires_approval: false,
                    vps: original.vps,
                })
                .await?;
            return Ok(Json(resubmitted));
        }
        other => {
            return Err(AppError::new(
                kr_common::ErrorKind::BadRequest,
                format!("unknown command action '{other}'"),
            ))
        }
    };
    let updated = state.tasks.transition(id, target_status).await?;
    if let Some(hostname) = &updated.assigned_hostname {
        let node = state.registry.get(hostname).await?;
        runner_client::command(&node.reachable_url, id, &action).await?;
    }
    Ok(Json(updated))
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Task>>, AppError> {
    auth.require(Role::Viewer)?;
    let tasks = state.tasks.list().await?;
    Ok(Json(tasks))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<u64>,
) -> Result<Json<Task>, AppError> {
    auth.require(Role::Viewer)?;
    let task = state.tasks.get(id).await?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<u64>,
) -> Result<(), AppError> {
    auth.require(Role::Operator)?;
    let task = state.tasks.get(id).await?;
    if !task.is_terminal() {
        return Err(AppError::new(
            kr_common::ErrorKind::Conflict,
            "cannot delete a non-terminal task",
        ));
    }
    state.tasks.delete(id).await?;
    Ok(())
}

/// Runner → Host status update (§6 `POST /api/update`).
async fn status_update(
    State(state): State<Arc<AppState>>,
    Json(update): Json<StatusUpdate>,
) -> Result<(), AppError> {
    let current = state.tasks.get(update.task_id).await?;
    if current.status == update.status {
        return Ok(());
    }
    let mut task = state.tasks.transition(update.task_id, update.status).await?;
    task.exit_code = update.exit_code;
    task.error_message = update.error_message;
    state.tasks.save(&task).await?;
    Ok(())
}
