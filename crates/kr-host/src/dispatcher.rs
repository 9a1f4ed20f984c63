//! Dispatches pending tasks to their assigned Runner (§4.1 step 3).
//!
//! A background tick calls [`Scheduler::pending_dispatch_scan`], POSTs each
//! task to its Runner's `/api/execute`, and advances successfully-dispatched
//! tasks to `assigning`. A network or timeout failure on the POST leaves the
//! task in `pending` for the next tick — this function never errors the
//! whole scan on a single Runner's failure.

use std::sync::Arc;
use std::time::Duration;

use kr_common::model::{EnvironmentSpec, ExecuteRequest, TaskKind, VpsSpec};
use tracing::{info, instrument, warn};

use crate::state::AppState;

const DISPATCH_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// One dispatch-scan tick: attempt to dispatch every `pending` task.
#[instrument(skip(state))]
pub async fn dispatch_tick(state: &AppState) {
    let pending = match state.scheduler.pending_dispatch_scan().await {
        Ok(tasks) => tasks,
        Err(err) => {
            warn!(error = %err, "dispatch scan failed to list tasks");
            return;
        }
    };

    for task in pending {
        let Some(hostname) = task.assigned_hostname.clone() else {
            continue;
        };
        let node = match state.registry.get(&hostname).await {
            Ok(n) => n,
            Err(_) => continue,
        };

        let environment = match (&task.environment_image, &task.environment_name) {
            (Some(reference), _) => EnvironmentSpec::Image {
                reference: reference.clone(),
            },
            (None, Some(name)) => EnvironmentSpec::Named { name: name.clone() },
            (None, None) => EnvironmentSpec::Named {
                name: "base".to_owned(),
            },
        };

        let vps = if task.kind == TaskKind::Vps {
            let Some(fields) = &task.vps else {
                warn!(task_id = task.id, hostname, "vps task missing vps fields, skipping");
                continue;
            };
            Some(VpsSpec {
                backend: fields.backend,
                ssh_mode: fields.ssh_mode,
                ssh_public_key: fields.ssh_public_key.clone(),
                vm_image: fields.vm_image.clone(),
                vm_disk_size_bytes: fields.vm_disk_size_bytes,
                overlay_ip: fields.overlay_ip.clone(),
            })
        } else {
            None
        };

        let execute_req = ExecuteRequest {
            task_id: task.id,
            kind: task.kind,
            resources: task.resources.clone(),
            environment,
            extra_mounts: task.extra_mounts.clone(),
            privileged: task.privileged,
            command: task.command.clone(),
            vps,
        };

        let client = reqwest::Client::new();
        let url = format!("{}/api/execute", node.reachable_url);
        let result = client
            .post(&url)
            .json(&execute_req)
            .timeout(DISPATCH_HTTP_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                if let Err(err) = state.scheduler.mark_assigning(task.id).await {
                    warn!(task_id = task.id, error = %err, "failed to mark task assigning after dispatch");
                } else {
                    info!(task_id = task.id, hostname, "task dispatched");
                }
            }
            Ok(resp) => {
                warn!(task_id = task.id, hostname, status = %resp.status(), "runner rejected dispatch, retrying next tick");
            }
            Err(err) => {
                warn!(task_id = task.id, hostname, error = %err, "dispatch POST failed, retrying next tick");
            }
        }
    }
}

/// Spawn the dispatch-scan background loop.
pub fn spawn(state: Arc<AppState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            dispatch_tick(&state).await;
        }
    })
}
