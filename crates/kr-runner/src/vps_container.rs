//! VPS manager, container backend (§4.4): long-running, auto-restarting
//! Docker containers with an SSH bootstrap sequence and filesystem
//! snapshot/restore.
//!
//! Administrative operations (create/inspect/commit/list) go through
//! `bollard`'s typed API rather than shelling out to the `docker` CLI, per
//! the design note in §9; task *execution* itself (the executor's
//! container-run command) keeps using the subprocess path because exact
//! flag and signal control matters there.

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, RemoveImageOptions};
use bollard::models::{HostConfig as DockerHostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use chrono::Utc;
use futures_util::StreamExt;
use kr_common::model::{GpuInfo, ResourceRequest, SshMode};
use tracing::{info, warn};

use crate::error::ExecutorError;

const CONTAINER_PREFIX: &str = "kohakuriver-vps-";
const SNAPSHOT_RETENTION: usize = 3;

fn container_name(task_id: u64) -> String {
    format!("{CONTAINER_PREFIX}{task_id}")
}

fn snapshot_repo(task_id: u64) -> String {
    format!("kohakuriver/vps-{task_id}")
}

/// Everything needed to create a VPS container.
pub struct VpsCreateSpec {
    pub task_id: u64,
    pub image: String,
    pub resources: ResourceRequest,
    pub gpus: Vec<GpuInfo>,
    pub network: String,
    pub ssh_mode: SshMode,
    pub ssh_public_key: Option<String>,
    pub extra_mounts: Vec<String>,
}

pub struct VpsContainerManager {
    docker: Docker,
}

impl VpsContainerManager {
    /// # Errors
    ///
    /// Returns [`ExecutorError::Runtime`] if the local Docker socket cannot
    /// be reached.
    pub fn connect() -> Result<Self, ExecutorError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Borrow the underlying Docker client, for callers (the terminal
    /// endpoint) that need lower-level access than this type exposes.
    #[must_use]
    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Create and start a detached, auto-restarting container. Does not use
    /// the auto-remove flag (§4.4: VPS containers are not ephemeral).
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Runtime`] on any Docker API failure.
    pub async fn create(&self, spec: &VpsCreateSpec) -> Result<String, ExecutorError> {
        let name = container_name(spec.task_id);
        let image = match self.latest_snapshot_tag(spec.task_id).await? {
            Some(snapshot) => {
                info!(task_id = spec.task_id, image = %snapshot, "restoring vps from snapshot");
                snapshot
            }
            None => spec.image.clone(),
        };

        let host_config = DockerHostConfig {
            binds: Some(spec.extra_mounts.clone()),
            network_mode: Some(spec.network.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            nano_cpus: non_zero_cpu_quota(spec.resources.cores),
            memory: non_zero_memory_limit(spec.resources.memory_bytes),
            port_bindings: Some(HashMap::from([(
                "22/tcp".to_owned(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_owned()),
                    host_port: None, // dynamic host port (§4.4)
                }]),
            )])),
            device_requests: gpu_device_requests(&spec.gpus),
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            exposed_ports: Some(HashMap::from([("22/tcp".to_owned(), HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;

        if !matches!(spec.ssh_mode, SshMode::Disabled | SshMode::None) {
            self.bootstrap_ssh(&name, spec.ssh_public_key.as_deref())
                .await?;
        }

        info!(task_id = spec.task_id, container = %name, "vps container created");
        Ok(name)
    }

    /// Install OpenSSH inside the running container and configure access,
    /// choosing the package manager by inspecting the base image (§4.4).
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Runtime`] if the bootstrap exec fails.
    async fn bootstrap_ssh(&self, name: &str, public_key: Option<&str>) -> Result<(), ExecutorError> {
        let install_cmd = detect_install_command(&self.docker, name).await?;
        self.exec(name, &install_cmd).await?;

        let auth_cmd = match public_key {
            Some(key) => format!(
                "mkdir -p /root/.ssh && echo '{key}' >> /root/.ssh/authorized_keys && chmod 700 /root/.ssh && chmod 600 /root/.ssh/authorized_keys"
            ),
            None => {
                "sed -i 's/^#\\?PermitRootLogin.*/PermitRootLogin yes/' /etc/ssh/sshd_config && passwd -d root".to_owned()
            }
        };
        self.exec(name, &auth_cmd).await?;
        self.exec(name, "service ssh start || /usr/sbin/sshd").await?;
        Ok(())
    }

    async fn exec(&self, container: &str, shell_command: &str) -> Result<(), ExecutorError> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_owned(), "-c".to_owned(), shell_command.to_owned()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                if let Ok(chunk) = chunk {
                    tracing::debug!(container, %chunk, "bootstrap exec output");
                }
            }
        }
        Ok(())
    }

    /// Discover the dynamic host port mapped to the container's port 22,
    /// with bounded retry (§4.4: Docker needs a moment to publish it).
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Runtime`] if inspection fails, or the port
    /// is never published within the retry budget.
    pub async fn discover_ssh_port(&self, container: &str) -> Result<u16, ExecutorError> {
        for attempt in 0..10 {
            let inspect = self.docker.inspect_container(container, None).await?;
            let port = inspect
                .network_settings
                .and_then(|n| n.ports)
                .and_then(|ports| ports.get("22/tcp").cloned().flatten())
                .and_then(|bindings| bindings.first().cloned())
                .and_then(|b| b.host_port)
                .and_then(|p| p.parse::<u16>().ok());

            if let Some(port) = port {
                return Ok(port);
            }
            tokio::time::sleep(std::time::Duration::from_millis(200 * (attempt + 1))).await;
        }
        Err(ExecutorError::Subprocess(format!(
            "ssh port for {container} was never published"
        )))
    }

    /// Stop the container, taking a snapshot first if `auto_snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Runtime`] on any Docker API failure.
    pub async fn stop(&self, task_id: u64, auto_snapshot: bool) -> Result<(), ExecutorError> {
        let name = container_name(task_id);
        if auto_snapshot {
            self.snapshot(task_id).await?;
        }
        self.docker
            .stop_container(&name, Some(StopContainerOptions { t: 10 }))
            .await?;
        self.docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    /// Commit the container's filesystem to a timestamped snapshot image
    /// (`kohakuriver/vps-<id>:snapshot-<unix-ts>`, §4.4, §9 open question
    /// resolved this way — see DESIGN.md), freezing briefly for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Runtime`] on any Docker API failure.
    pub async fn snapshot(&self, task_id: u64) -> Result<String, ExecutorError> {
        let name = container_name(task_id);
        let tag = format!("snapshot-{}", Utc::now().timestamp());
        let repo = snapshot_repo(task_id);

        self.docker.pause_container(&name).await.ok();
        let result = self
            .docker
            .commit_container(
                CommitContainerOptions {
                    container: name.clone(),
                    repo: repo.clone(),
                    tag: tag.clone(),
                    ..Default::default()
                },
                Config::<String>::default(),
            )
            .await;
        self.docker.unpause_container(&name).await.ok();
        result?;

        self.enforce_retention(task_id).await?;
        let image = format!("{repo}:{tag}");
        info!(task_id, %image, "vps snapshot created");
        Ok(image)
    }

    /// List this VPS's snapshot tags, newest first (timestamps sort
    /// lexicographically since they're monotonic and fixed-width).
    async fn snapshot_tags_newest_first(&self, task_id: u64) -> Result<Vec<String>, ExecutorError> {
        let repo = snapshot_repo(task_id);
        let images = self.docker.list_images::<String>(None).await?;
        let mut tags: Vec<String> = images
            .into_iter()
            .flat_map(|img| img.repo_tags)
            .filter(|t| t.starts_with(&format!("{repo}:snapshot-")))
            .collect();
        tags.sort_unstable();
        tags.reverse();
        Ok(tags)
    }

    /// The most recent snapshot image for a VPS, if one exists (§4.4: a
    /// snapshot replaces the base image as the next creation's source).
    async fn latest_snapshot_tag(&self, task_id: u64) -> Result<Option<String>, ExecutorError> {
        Ok(self.snapshot_tags_newest_first(task_id).await?.into_iter().next())
    }

    /// Keep only the newest [`SNAPSHOT_RETENTION`] snapshots for a VPS,
    /// deleting older ones.
    async fn enforce_retention(&self, task_id: u64) -> Result<(), ExecutorError> {
        let tags = self.snapshot_tags_newest_first(task_id).await?;

        for stale in tags.into_iter().skip(SNAPSHOT_RETENTION) {
            if let Err(err) = self
                .docker
                .remove_image(&stale, Some(RemoveImageOptions::default()), None)
                .await
            {
                warn!(task_id, image = %stale, error = %err, "failed to prune stale snapshot");
            }
        }
        Ok(())
    }

    /// List containers whose name matches the KohakuRiver VPS pattern, for
    /// the Runner-restart recovery pass (§4.4).
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Runtime`] on any Docker API failure.
    pub async fn list_tracked_containers(&self) -> Result<Vec<(u64, bool)>, ExecutorError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c.names?.into_iter().next()?.trim_start_matches('/').to_owned();
                let task_id: u64 = name.strip_prefix(CONTAINER_PREFIX)?.parse().ok()?;
                let running = c.state.as_deref() == Some("running");
                Some((task_id, running))
            })
            .collect())
    }
}

async fn detect_install_command(docker: &Docker, container: &str) -> Result<String, ExecutorError> {
    let inspect = docker.inspect_container(container, None).await?;
    let image = inspect
        .config
        .and_then(|c| c.image)
        .unwrap_or_default()
        .to_lowercase();

    let cmd = if image.contains("alpine") {
        "apk add --no-cache openssh"
    } else if image.contains("debian") || image.contains("ubuntu") {
        "apt-get update && apt-get install -y openssh-server"
    } else if image.contains("fedora") || image.contains("centos") || image.contains("rocky") {
        "dnf install -y openssh-server || yum install -y openssh-server"
    } else {
        // Best-effort default; most base images are Debian-derived.
        "apt-get update && apt-get install -y openssh-server"
    };
    Ok(cmd.to_owned())
}

fn non_zero_cpu_quota(cores: u32) -> Option<i64> {
    // §8 boundary: cores == 0 means no CPU quota flag at all.
    (cores > 0).then(|| i64::from(cores) * 1_000_000_000)
}

fn non_zero_memory_limit(memory_bytes: u64) -> Option<i64> {
    (memory_bytes > 0).then_some(memory_bytes as i64)
}

fn gpu_device_requests(gpus: &[GpuInfo]) -> Option<Vec<bollard::models::DeviceRequest>> {
    if gpus.is_empty() {
        return None;
    }
    let device_ids: Vec<String> = gpus.iter().map(|g| g.index.to_string()).collect();
    Some(vec![bollard::models::DeviceRequest {
        driver: Some("nvidia".to_owned()),
        device_ids: Some(device_ids),
        capabilities: Some(vec![vec!["gpu".to_owned()]]),
        ..Default::default()
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_and_snapshot_names_are_namespaced_by_task_id() {
        assert_eq!(container_name(42), "kohakuriver-vps-42");
        assert_eq!(snapshot_repo(42), "kohakuriver/vps-42");
    }

    #[test]
    fn zero_cores_and_memory_omit_the_quota_flags() {
        assert_eq!(non_zero_cpu_quota(0), None);
        assert_eq!(non_zero_memory_limit(0), None);
        assert_eq!(non_zero_cpu_quota(2), Some(2_000_000_000));
        assert_eq!(non_zero_memory_limit(512 * 1024 * 1024), Some(512 * 1024 * 1024));
    }

    #[test]
    fn gpu_device_requests_empty_when_no_gpus_assigned() {
        assert!(gpu_device_requests(&[]).is_none());
    }

    #[test]
    fn gpu_device_requests_lists_assigned_indices() {
        let gpus = vec![GpuInfo {
            index: 0,
            model: "NVIDIA A100".to_owned(),
            memory_bytes: 0,
            utilization_percent: 0.0,
            pci_address: None,
            iommu_group: None,
            companion_devices: Vec::new(),
        }];
        let requests = gpu_device_requests(&gpus).expect("gpus were assigned");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].device_ids.as_deref(), Some(["0".to_owned()].as_slice()));
    }
}
