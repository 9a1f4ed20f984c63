//! Runner HTTP routes (§6): `/api/execute`, `/api/vps/create`, `/api/kill`,
//! `/api/command/{id}/{pause|resume}`, `/api/vps/stop/{id}`,
//! `/api/vps/restart/{id}`, plus filesystem endpoints for the shared/log
//! directories and a terminal WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures_util::StreamExt;
use kr_common::model::{ExecuteRequest, GpuInfo, StatusUpdate, TaskKind, TaskStatus, VpsBackend};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::AppError;
use crate::executor;
use crate::local_store::LocalTaskRecord;
use crate::state::AppState;
use crate::vm::VmCreateSpec;
use crate::vps_container::VpsCreateSpec;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(execute))
        .route("/vps/create", post(execute))
        .route("/kill", post(kill))
        .route("/command/{id}/{action}", post(command))
        .route("/vps/stop/{id}", post(vps_stop))
        .route("/vps/restart/{id}", post(vps_restart))
        .route("/fs/{task_id}/list", get(fs_list))
        .route("/fs/{task_id}/read", get(fs_read))
        .route("/terminal/{task_id}", get(terminal_ws))
}

#[derive(Debug, Deserialize)]
pub struct KillRequest {
    pub task_id: u64,
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(), AppError> {
    let task_id = req.task_id;
    match req.kind {
        TaskKind::Command => execute_command(&state, &req).await?,
        TaskKind::Vps => execute_vps(&state, &req).await?,
    }
    info!(task_id, "task execution accepted");
    Ok(())
}

async fn execute_command(state: &Arc<AppState>, req: &ExecuteRequest) -> Result<(), AppError> {
    let network = runner_network(state).await;
    let container_id =
        executor::run_command_task(req, &state.shared_paths, &network, &state.numa_topology).await?;
    state.local_store.insert(LocalTaskRecord {
        task_id: req.task_id,
        kind: TaskKind::Command,
        backend: None,
        container_id: Some(container_id.clone()),
        qemu_pid: None,
        ssh_port: None,
    });
    report_status(state, req.task_id, TaskStatus::Running, None, None, None).await;
    spawn_exit_watcher(Arc::clone(state), req.task_id, container_id);
    Ok(())
}

async fn execute_vps(state: &Arc<AppState>, req: &ExecuteRequest) -> Result<(), AppError> {
    let vps = req
        .vps
        .clone()
        .ok_or_else(|| AppError::new(kr_common::ErrorKind::BadRequest, "vps task missing vps fields"))?;

    match vps.backend {
        VpsBackend::Docker => {
            let network = runner_network(state).await;
            let image = vps.vm_image.clone().unwrap_or_else(|| match &req.environment {
                kr_common::model::EnvironmentSpec::Named { name } => name.clone(),
                kr_common::model::EnvironmentSpec::Image { reference } => reference.clone(),
            });
            let gpus = resolve_gpus(state, &req.resources.gpu_indices);

            let spec = VpsCreateSpec {
                task_id: req.task_id,
                image,
                resources: req.resources.clone(),
                gpus,
                network,
                ssh_mode: vps.ssh_mode,
                ssh_public_key: vps.ssh_public_key.clone(),
                extra_mounts: req.extra_mounts.clone(),
            };
            let name = state.vps.create(&spec).await?;
            let ssh_port = if matches!(vps.ssh_mode, kr_common::model::SshMode::Disabled | kr_common::model::SshMode::None) {
                None
            } else {
                state.vps.discover_ssh_port(&name).await.ok()
            };

            state.local_store.insert(LocalTaskRecord {
                task_id: req.task_id,
                kind: TaskKind::Vps,
                backend: Some(VpsBackend::Docker),
                container_id: Some(name.clone()),
                qemu_pid: None,
                ssh_port,
            });
            report_status(state, req.task_id, TaskStatus::Running, None, None, ssh_port).await;
            spawn_exit_watcher(Arc::clone(state), req.task_id, name);
        }
        VpsBackend::Qemu => {
            let base_image = vps
                .vm_image
                .clone()
                .map(PathBuf::from)
                .ok_or_else(|| AppError::new(kr_common::ErrorKind::BadRequest, "vm task missing base image"))?;
            let gpus = resolve_gpus(state, &req.resources.gpu_indices);

            let create_spec = VmCreateSpec {
                task_id: req.task_id,
                base_image,
                disk_size_bytes: vps.vm_disk_size_bytes.unwrap_or(20 * 1024 * 1024 * 1024),
                memory_mb: (req.resources.memory_bytes / (1024 * 1024)).max(512) as u32,
                vcpus: req.resources.cores.max(1),
                gpus,
                ssh_public_key: vps.ssh_public_key.clone(),
                hostname: format!("kr-vm-{}", req.task_id),
            };
            state.vm_manager.create(create_spec).await?;

            state.local_store.insert(LocalTaskRecord {
                task_id: req.task_id,
                kind: TaskKind::Vps,
                backend: Some(VpsBackend::Qemu),
                container_id: None,
                qemu_pid: None,
                ssh_port: None,
            });
            report_status(state, req.task_id, TaskStatus::Running, None, None, None).await;
        }
    }
    Ok(())
}

async fn kill(State(state): State<Arc<AppState>>, Json(req): Json<KillRequest>) -> Result<(), AppError> {
    // Removed from the local store before the kill is issued so the exit
    // watcher spawned at task start finds nothing to remove when `docker
    // wait` unblocks, and skips its own status update (§4.3).
    let Some(record) = state.local_store.remove(req.task_id) else {
        return Err(AppError::new(kr_common::ErrorKind::NotFound, "task not tracked locally"));
    };

    match (record.kind, record.backend) {
        (TaskKind::Command, _) => {
            if let Some(container) = &record.container_id {
                executor::kill_container(container).await?;
            }
        }
        (TaskKind::Vps, Some(VpsBackend::Docker)) => {
            state.vps.stop(req.task_id, true).await?;
        }
        (TaskKind::Vps, Some(VpsBackend::Qemu)) => {
            state.vm_manager.shutdown(req.task_id).await?;
        }
        (TaskKind::Vps, None) => {}
    }

    report_status(&state, req.task_id, TaskStatus::Killed, None, None, None).await;
    Ok(())
}

async fn command(
    State(state): State<Arc<AppState>>,
    Path((task_id, action)): Path<(u64, String)>,
) -> Result<(), AppError> {
    let Some(record) = state.local_store.get(task_id) else {
        return Err(AppError::new(kr_common::ErrorKind::NotFound, "task not tracked locally"));
    };
    let Some(container) = record.container_id else {
        return Err(AppError::new(
            kr_common::ErrorKind::Conflict,
            "task has no docker container to pause/resume",
        ));
    };

    let status = match action.as_str() {
        "pause" => {
            executor::pause_container(&container).await?;
            TaskStatus::Paused
        }
        "resume" => {
            executor::resume_container(&container).await?;
            TaskStatus::Running
        }
        other => {
            return Err(AppError::new(
                kr_common::ErrorKind::BadRequest,
                format!("unknown command action '{other}'"),
            ))
        }
    };

    report_status(&state, task_id, status, None, None, None).await;
    Ok(())
}

async fn vps_stop(State(state): State<Arc<AppState>>, Path(task_id): Path<u64>) -> Result<(), AppError> {
    let Some(record) = state.local_store.remove(task_id) else {
        return Err(AppError::new(kr_common::ErrorKind::NotFound, "task not tracked locally"));
    };
    match record.backend {
        Some(VpsBackend::Docker) => state.vps.stop(task_id, true).await?,
        Some(VpsBackend::Qemu) => state.vm_manager.shutdown(task_id).await?,
        None => {}
    }
    report_status(&state, task_id, TaskStatus::Stopped, None, None, None).await;
    Ok(())
}

async fn vps_restart(State(state): State<Arc<AppState>>, Path(task_id): Path<u64>) -> Result<(), AppError> {
    let Some(record) = state.local_store.get(task_id) else {
        return Err(AppError::new(kr_common::ErrorKind::NotFound, "task not tracked locally"));
    };
    match record.backend {
        Some(VpsBackend::Docker) => {
            let Some(container) = record.container_id.clone() else {
                return Err(AppError::new(kr_common::ErrorKind::Conflict, "no tracked container"));
            };
            // Removed before the restart so the pre-restart exit watcher's
            // `docker wait` (which unblocks on the stop half of a restart)
            // finds nothing to report when it wakes up, same as `kill`'s
            // remove-before-kill ordering.
            state.local_store.remove(task_id);
            executor::restart_container(&container).await?;
            state.local_store.insert(record.clone());
            spawn_exit_watcher(Arc::clone(&state), task_id, container);
        }
        Some(VpsBackend::Qemu) => state.vm_manager.reboot(task_id).await?,
        None => {}
    }
    report_status(&state, task_id, TaskStatus::Running, None, None, record.ssh_port).await;
    Ok(())
}

/// Block on the container's exit in the background and report the
/// terminal status, distinguishing an OOM kill from an ordinary exit
/// (§4.1, §4.3). A task already removed from the local store by an
/// explicit kill/stop/restart before the container actually exits is left
/// alone — that caller already reported its own terminal status.
fn spawn_exit_watcher(state: Arc<AppState>, task_id: u64, container_id: String) {
    tokio::spawn(async move {
        let exit_code = match executor::wait_container(&container_id).await {
            Ok(code) => code,
            Err(err) => {
                warn!(task_id, error = %err, "docker wait failed, leaving task tracked");
                return;
            }
        };
        if state.local_store.remove(task_id).is_none() {
            return;
        }

        if executor::was_oom_killed(&container_id).await {
            state.report_killed(task_id, "oom").await;
            report_status(
                &state,
                task_id,
                TaskStatus::KilledOom,
                Some(exit_code),
                Some("container killed by the kernel OOM killer".to_owned()),
                None,
            )
            .await;
        } else if exit_code == 0 {
            report_status(&state, task_id, TaskStatus::Completed, Some(exit_code), None, None).await;
        } else {
            report_status(
                &state,
                task_id,
                TaskStatus::Failed,
                Some(exit_code),
                Some(format!("container exited with code {exit_code}")),
                None,
            )
            .await;
        }
    });
}

async fn runner_network(state: &AppState) -> String {
    state.overlay.bridge_name().await.unwrap_or_else(|_| "bridge".to_owned())
}

fn resolve_gpus(state: &AppState, indices: &[u32]) -> Vec<GpuInfo> {
    state
        .gpu_inventory
        .iter()
        .filter(|gpu| indices.contains(&gpu.index))
        .cloned()
        .collect()
}

async fn report_status(
    state: &AppState,
    task_id: u64,
    status: TaskStatus,
    exit_code: Option<i32>,
    error_message: Option<String>,
    ssh_port: Option<u16>,
) {
    let update = StatusUpdate {
        task_id,
        status,
        exit_code,
        error_message,
        ssh_port,
    };
    let url = format!("{}/api/update", state.config.host_url);
    if let Err(err) = state.http_client.post(&url).json(&update).send().await {
        warn!(task_id, error = %err, "failed to report status update to host");
    }
}

#[derive(Debug, Deserialize)]
struct FsQuery {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Serialize)]
struct FsEntry {
    name: String,
    is_dir: bool,
    size_bytes: u64,
}

fn task_log_dir(state: &AppState, task_id: u64) -> PathBuf {
    state.shared_paths.log_dir.join(task_id.to_string())
}

/// List entries under a task's log directory (§6 "filesystem endpoints").
/// Scoped to this one directory per task, not an arbitrary-path browser.
async fn fs_list(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<u64>,
    Query(query): Query<FsQuery>,
) -> Result<Json<Vec<FsEntry>>, AppError> {
    let dir = task_log_dir(&state, task_id).join(query.path.trim_start_matches('/'));
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(&dir)
        .await
        .map_err(|err| AppError::new(kr_common::ErrorKind::NotFound, err.to_string()))?;
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let Ok(metadata) = entry.metadata().await else { continue };
        entries.push(FsEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size_bytes: metadata.len(),
        });
    }
    Ok(Json(entries))
}

async fn fs_read(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<u64>,
    Query(query): Query<FsQuery>,
) -> Result<String, AppError> {
    let path = task_log_dir(&state, task_id).join(query.path.trim_start_matches('/'));
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|err| AppError::new(kr_common::ErrorKind::NotFound, err.to_string()))
}

/// Interactive terminal: execs a shell inside the task's container with a
/// TTY allocated, bridging stdin/stdout over the WebSocket as raw bytes.
async fn terminal_ws(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<u64>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal(state, task_id, socket))
}

async fn handle_terminal(state: Arc<AppState>, task_id: u64, mut socket: WebSocket) {
    let Some(record) = state.local_store.get(task_id) else {
        let _ = socket.send(Message::Text("ERROR task not tracked locally".into())).await;
        return;
    };
    let Some(container) = record.container_id else {
        let _ = socket.send(Message::Text("ERROR task has no container".into())).await;
        return;
    };

    let docker = state.vps.docker();
    let exec = match docker
        .create_exec(
            &container,
            CreateExecOptions {
                cmd: Some(vec!["/bin/sh".to_owned()]),
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(true),
                ..Default::default()
            },
        )
        .await
    {
        Ok(exec) => exec,
        Err(err) => {
            let _ = socket.send(Message::Text(format!("ERROR {err}").into())).await;
            return;
        }
    };

    let Ok(StartExecResults::Attached { mut output, mut input }) = docker.start_exec(&exec.id, None).await else {
        let _ = socket.send(Message::Text("ERROR failed to attach to exec session".into())).await;
        return;
    };

    loop {
        tokio::select! {
            chunk = output.next() => {
                match chunk {
                    Some(Ok(chunk)) => {
                        if socket.send(Message::Binary(chunk.into_bytes())).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        use tokio::io::AsyncWriteExt;
                        if input.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        use tokio::io::AsyncWriteExt;
                        if input.write_all(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }
}
