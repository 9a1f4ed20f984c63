//! Task executor (§4.3): constructs and runs a container for a COMMAND
//! task via subprocess, not the typed Docker API — exact flag and signal
//! control matters for task execution in a way it doesn't for
//! administrative VPS operations (§9 design note).

use std::path::{Path, PathBuf};

use kr_common::model::{EnvironmentSpec, ExecuteRequest, NumaTopology};
use tokio::process::Command;
use tracing::info;

use crate::error::ExecutorError;

/// Paths the executor mounts into every container.
pub struct SharedPaths {
    pub shared_dir: PathBuf,
    pub log_dir: PathBuf,
    pub local_temp_dir: PathBuf,
    pub tunnel_client_binary: PathBuf,
}

/// Build and run the container for a COMMAND task. Returns the Docker
/// container id.
///
/// The inner shell starts the tunnel-client as a background daemon, then
/// `exec`s the user command with stdout/stderr redirected to per-task log
/// files (§4.3) — `exec` here replaces the shell process with the user
/// command, matching the shape of the container's own PID 1 so `docker
/// stop`'s SIGTERM (or our SIGKILL on kill) reaches it directly.
///
/// # Errors
///
/// Returns [`ExecutorError::Subprocess`] if the `docker run` invocation
/// cannot be spawned or exits indicating a setup failure.
pub async fn run_command_task(
    req: &ExecuteRequest,
    paths: &SharedPaths,
    network: &str,
    numa_topology: &NumaTopology,
) -> Result<String, ExecutorError> {
    let task_id = req.task_id;
    let stdout_path = paths.log_dir.join(format!("{task_id}.stdout.log"));
    let stderr_path = paths.log_dir.join(format!("{task_id}.stderr.log"));

    let mut cmd = Command::new("docker");
    cmd.arg("run").arg("--detach").arg("--rm");
    cmd.arg("--name").arg(format!("kohakuriver-task-{task_id}"));
    cmd.arg("--network").arg(network);

    if req.resources.cores > 0 {
        // §8 boundary: cores == 0 means no CPU quota flag at all.
        cmd.arg("--cpus").arg(req.resources.cores.to_string());
    }
    if req.resources.memory_bytes > 0 {
        cmd.arg("--memory").arg(req.resources.memory_bytes.to_string());
    }
    if !req.resources.gpu_indices.is_empty() {
        let device_spec = req
            .resources
            .gpu_indices
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        cmd.arg("--gpus").arg(format!("\"device={device_spec}\""));
    }
    if req.privileged {
        cmd.arg("--privileged");
    }

    cmd.arg("--volume").arg(bind(&paths.shared_dir, "/shared"));
    cmd.arg("--volume").arg(bind(&paths.log_dir, "/var/log/kohakuriver"));
    cmd.arg("--volume").arg(bind(&paths.local_temp_dir, "/tmp/kohakuriver"));
    cmd.arg("--volume").arg(bind(&paths.tunnel_client_binary, "/usr/local/bin/kr-tunnel-client"));

    for mount in &req.extra_mounts {
        cmd.arg("--volume").arg(mount);
    }

    let image = match &req.environment {
        EnvironmentSpec::Named { name } => name.clone(),
        EnvironmentSpec::Image { reference } => reference.clone(),
    };
    cmd.arg(image);

    let numa_prefix = numa_binder_prefix(req.resources.numa_node, numa_topology)?;
    let user_command = req.command.clone().unwrap_or_default();
    let inner = format!(
        "/usr/local/bin/kr-tunnel-client --task-id {task_id} & exec {numa_prefix}{user_command} > {} 2> {}",
        stdout_path.display(),
        stderr_path.display(),
    );
    cmd.arg("sh").arg("-c").arg(inner);

    let output = cmd
        .output()
        .await
        .map_err(|err| ExecutorError::Subprocess(err.to_string()))?;
    if !output.status.success() {
        return Err(ExecutorError::Subprocess(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    let container_id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    info!(task_id, %container_id, "command task container started");
    Ok(container_id)
}

fn bind(host_path: &Path, container_path: &str) -> String {
    format!("{}:{}", host_path.display(), container_path)
}

/// Wraps the user command with a NUMA-binder prefix that sets both CPU and
/// memory affinity for the requested node (§4.3).
fn numa_binder_prefix(numa_node: Option<u32>, topology: &NumaTopology) -> Result<String, ExecutorError> {
    let Some(node) = numa_node else {
        return Ok(String::new());
    };
    if !topology.contains_key(&node) {
        return Err(ExecutorError::UnknownNuma(node));
    }
    Ok(format!("numactl --cpunodebind={node} --membind={node} "))
}

/// Send `SIGKILL` to a container.
///
/// # Errors
///
/// Returns [`ExecutorError::Subprocess`] if the `docker kill` invocation
/// fails.
pub async fn kill_container(container_id: &str) -> Result<(), ExecutorError> {
    let status = Command::new("docker")
        .args(["kill", "--signal", "SIGKILL", container_id])
        .status()
        .await
        .map_err(|err| ExecutorError::Subprocess(err.to_string()))?;
    if !status.success() {
        return Err(ExecutorError::Subprocess(format!(
            "docker kill failed for {container_id}"
        )));
    }
    Ok(())
}

/// Freeze the container's cgroup (pause).
///
/// # Errors
///
/// Returns [`ExecutorError::Subprocess`] if `docker pause` fails.
pub async fn pause_container(container_id: &str) -> Result<(), ExecutorError> {
    run_docker(&["pause", container_id]).await
}

/// Unfreeze the container's cgroup (resume).
///
/// # Errors
///
/// Returns [`ExecutorError::Subprocess`] if `docker unpause` fails.
pub async fn resume_container(container_id: &str) -> Result<(), ExecutorError> {
    run_docker(&["unpause", container_id]).await
}

/// Restart a running container in place (Docker-backed VPS restart).
///
/// # Errors
///
/// Returns [`ExecutorError::Subprocess`] if `docker restart` fails.
pub async fn restart_container(container_id: &str) -> Result<(), ExecutorError> {
    run_docker(&["restart", container_id]).await
}

/// Block until a container exits, returning its exit code.
///
/// # Errors
///
/// Returns [`ExecutorError::Subprocess`] if `docker wait` cannot be run or
/// does not print a numeric exit code.
pub async fn wait_container(container_id: &str) -> Result<i32, ExecutorError> {
    let output = Command::new("docker")
        .args(["wait", container_id])
        .output()
        .await
        .map_err(|err| ExecutorError::Subprocess(err.to_string()))?;
    if !output.status.success() {
        return Err(ExecutorError::Subprocess(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|_| ExecutorError::Subprocess("docker wait returned a non-numeric exit code".to_owned()))
}

/// Whether the container's most recent exit was the kernel OOM killer,
/// distinguishing `killed_oom` from an ordinary non-zero exit (§4.1, §4.3).
pub async fn was_oom_killed(container_id: &str) -> bool {
    let output = Command::new("docker")
        .args(["inspect", "--format", "{{.State.OOMKilled}}", container_id])
        .output()
        .await;
    matches!(output, Ok(o) if String::from_utf8_lossy(&o.stdout).trim() == "true")
}

async fn run_docker(args: &[&str]) -> Result<(), ExecutorError> {
    let status = Command::new("docker")
        .args(args)
        .status()
        .await
        .map_err(|err| ExecutorError::Subprocess(err.to_string()))?;
    if !status.success() {
        return Err(ExecutorError::Subprocess(format!("docker {args:?} failed")));
    }
    Ok(())
}
