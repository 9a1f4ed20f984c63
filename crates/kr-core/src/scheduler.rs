//! Task scheduler (§4.1).
//!
//! Owns the submission contract, target resolution, tie-breaking for
//! auto-scheduling, and the suspicion-counter aging used to detect a stuck
//! `assigning` task.

use std::collections::HashSet;
use std::sync::Arc;

use kr_common::model::{ResourceRequest, TaskKind, TaskStatus};
use tracing::{instrument, warn};

use crate::error::SchedulerError;
use crate::node::Node;
use crate::registry::NodeRegistry;
use crate::task::{Task, TaskRepository, VpsFields};

/// A parsed target specification: `hostname[:numa][::gpus]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub hostname: Option<String>,
    pub numa_node: Option<u32>,
    pub gpu_indices: Vec<u32>,
}

/// Parse a target string per §4.1's submission contract.
///
/// Grammar: `hostname`, `hostname:numa`, `hostname::gpu[,gpu...]`, or empty
/// (auto-schedule).
///
/// # Errors
///
/// Returns [`SchedulerError::BadTarget`] if the string does not match the
/// grammar or a GPU index does not parse as an integer.
pub fn parse_target(raw: &str) -> Result<Target, SchedulerError> {
    if raw.is_empty() {
        return Ok(Target::default());
    }

    if let Some((hostname, gpu_list)) = raw.split_once("::") {
        let gpu_indices = gpu_list
            .split(',')
            .map(|s| {
                s.trim().parse::<u32>().map_err(|_| SchedulerError::BadTarget {
                    target: raw.to_owned(),
                })
            })
            .collect::<Result<Vec<u32>, SchedulerError>>()?;
        return Ok(Target {
            hostname: Some(hostname.to_owned()),
            numa_node: None,
            gpu_indices,
        });
    }

    if let Some((hostname, numa)) = raw.split_once(':') {
        let numa_node = numa
            .parse::<u32>()
            .map_err(|_| SchedulerError::BadTarget {
                target: raw.to_owned(),
            })?;
        return Ok(Target {
            hostname: Some(hostname.to_owned()),
            numa_node: Some(numa_node),
            gpu_indices: vec![],
        });
    }

    Ok(Target {
        hostname: Some(raw.to_owned()),
        numa_node: None,
        gpu_indices: vec![],
    })
}

/// Suspicion threshold, proportional to `3 × heartbeat_interval`, expressed
/// as a count of monitor ticks rather than a duration (the monitor ticks
/// once per heartbeat interval).
pub const SUSPICION_THRESHOLD: u32 = 3;

/// Select an auto-scheduling target among online Nodes with enough free
/// cores and memory. Auto-scheduling never selects a GPU task (§4.1 step 1).
///
/// Tie-breaking (§4.1): fewer currently-running tasks first, then larger
/// free memory, then lexicographic hostname.
#[must_use]
pub fn pick_auto_schedule_target<'a>(
    candidates: &'a [Node],
    running_counts: &std::collections::HashMap<String, u32>,
    resources: &ResourceRequest,
) -> Option<&'a Node> {
    if !resources.gpu_indices.is_empty() {
        return None;
    }

    candidates
        .iter()
        .filter(|n| n.status == kr_common::model::NodeStatus::Online)
        .filter(|n| resources.cores == 0 || n.total_cores >= resources.cores)
        .filter(|n| resources.memory_bytes == 0 || n.total_memory_bytes >= resources.memory_bytes)
        .min_by(|a, b| {
            let running_a = running_counts.get(&a.hostname).copied().unwrap_or(0);
            let running_b = running_counts.get(&b.hostname).copied().unwrap_or(0);
            running_a
                .cmp(&running_b)
                .then_with(|| free_memory_bytes(b).total_cmp(&free_memory_bytes(a)))
                .then_with(|| a.hostname.cmp(&b.hostname))
        })
}

/// Estimated free memory from reported total capacity and current load.
fn free_memory_bytes(node: &Node) -> f64 {
    node.total_memory_bytes as f64 * (1.0 - f64::from(node.memory_percent) / 100.0)
}

/// Submission contract input, mirroring §4.1 "Submission contract".
pub struct SubmitRequest {
    pub kind: TaskKind,
    pub owner: String,
    pub target: String,
    pub resources: ResourceRequest,
    pub environment_name: Option<String>,
    pub environment_image: Option<String>,
    pub extra_mounts: Vec<String>,
    pub privileged: bool,
    pub command: Option<String>,
    pub requires_approval: bool,
    pub vps: Option<VpsFields>,
}

/// Coordinates task submission and dispatch against the [`TaskRepository`]
/// and [`NodeRegistry`].
pub struct Scheduler {
    tasks: TaskRepository,
    registry: Arc<NodeRegistry>,
    snowflake: kr_common::SnowflakeGenerator,
}

impl Scheduler {
    #[must_use]
    pub fn new(tasks: TaskRepository, registry: Arc<NodeRegistry>, node_id: u64) -> Self {
        Self {
            tasks,
            registry,
            snowflake: kr_common::SnowflakeGenerator::new(node_id),
        }
    }

    /// Validate the target and resource request, resolve a hostname, and
    /// create the Task row in `pending` or `pending_approval`.
    ///
    /// Dispatch to the Runner is a separate step ([`Scheduler::dispatch`]) so
    /// that a submit call always returns quickly even if the chosen Runner
    /// is briefly unreachable.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::BadTarget`] if the target string is malformed.
    /// - [`SchedulerError::NodeUnavailable`] if no Node can host the request.
    /// - [`SchedulerError::ResourceConflict`] if a requested GPU is already held.
    /// - [`SchedulerError::UnknownNuma`] if the NUMA id does not exist on the target.
    #[instrument(skip(self, req))]
    pub async fn submit(&self, req: SubmitRequest) -> Result<Task, SchedulerError> {
        let target = parse_target(&req.target)?;

        let hostname = match target.hostname {
            Some(h) => h,
            None => {
                let nodes = self.registry.list().await;
                let running_counts = self.running_counts().await;
                pick_auto_schedule_target(&nodes, &running_counts, &req.resources)
                    .map(|n| n.hostname.clone())
                    .ok_or(SchedulerError::NodeUnavailable)?
            }
        };

        // Target must name a known Node.
        self.registry
            .get(&hostname)
            .await
            .map_err(|_| SchedulerError::BadTarget {
                target: req.target.clone(),
            })?;

        if let Some(numa_node) = target.numa_node
            && !self.registry.has_numa_node(&hostname, numa_node).await
        {
            return Err(SchedulerError::UnknownNuma { hostname, numa_node });
        }

        let gpu_indices = if target.gpu_indices.is_empty() {
            req.resources.gpu_indices.clone()
        } else {
            target.gpu_indices
        };

        for gpu in &gpu_indices {
            if !self.registry.owns_gpu(&hostname, *gpu).await {
                return Err(SchedulerError::ResourceConflict {
                    hostname: hostname.clone(),
                    gpu: *gpu,
                });
            }
            if self.gpu_held_by_non_terminal_task(&hostname, *gpu).await? {
                return Err(SchedulerError::ResourceConflict {
                    hostname: hostname.clone(),
                    gpu: *gpu,
                });
            }
        }

        let mut resources = req.resources;
        resources.gpu_indices = gpu_indices;

        let id = self.snowflake.next_id();
        let status = if req.requires_approval {
            TaskStatus::PendingApproval
        } else {
            TaskStatus::Pending
        };

        let task = Task {
            id,
            batch_id: None,
            kind: req.kind,
            owner: req.owner,
            status,
            resources,
            environment_name: req.environment_name,
            environment_image: req.environment_image,
            extra_mounts: req.extra_mounts,
            privileged: req.privileged,
            command: req.command,
            vps: req.vps,
            assigned_hostname: Some(hostname),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error_message: None,
            stdout_path: None,
            stderr_path: None,
            suspicion_count: 0,
            created_at: chrono::Utc::now(),
        };
        self.tasks.insert(&task).await?;
        Ok(task)
    }

    async fn running_counts(&self) -> std::collections::HashMap<String, u32> {
        let mut counts = std::collections::HashMap::new();
        if let Ok(tasks) = self.tasks.list().await {
            for task in tasks {
                if task.status == TaskStatus::Running
                    && let Some(hostname) = task.assigned_hostname
                {
                    *counts.entry(hostname).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    async fn gpu_held_by_non_terminal_task(
        &self,
        hostname: &str,
        gpu: u32,
    ) -> Result<bool, SchedulerError> {
        let tasks = self.tasks.list().await?;
        Ok(tasks.iter().any(|t| {
            !t.is_terminal()
                && t.assigned_hostname.as_deref() == Some(hostname)
                && t.resources.gpu_indices.contains(&gpu)
        }))
    }

    /// One tick of the dispatch-retry background scan: every task still in
    /// `pending` gets dispatched. On a successful POST to the Runner the
    /// caller (via `on_dispatched`) transitions the task to `assigning`; on
    /// failure the task remains `pending` for the next tick (§4.1 step 3).
    ///
    /// Returns the tasks that are due for a dispatch attempt; the actual
    /// HTTP call lives in `kr-host` since this crate has no HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if listing tasks fails.
    pub async fn pending_dispatch_scan(&self) -> Result<Vec<Task>, SchedulerError> {
        let tasks = self.tasks.list().await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect())
    }

    /// Mark a task `assigning` after a successful dispatch POST.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] if the task is not
    /// currently `pending`.
    pub async fn mark_assigning(&self, task_id: u64) -> Result<Task, SchedulerError> {
        self.tasks.transition(task_id, TaskStatus::Assigning).await
    }

    /// Process one heartbeat's list of running task ids: reset the
    /// suspicion counter for every `assigning` task that is listed, and
    /// increment it for every `assigning` task assigned to this hostname
    /// that is NOT listed. Once a task's counter exceeds
    /// [`SUSPICION_THRESHOLD`] it is marked `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if listing or updating tasks fails.
    #[instrument(skip(self, running_task_ids))]
    pub async fn age_assigning_tasks(
        &self,
        hostname: &str,
        running_task_ids: &HashSet<u64>,
    ) -> Result<(), SchedulerError> {
        let tasks = self.tasks.list().await?;
        for mut task in tasks {
            if task.status != TaskStatus::Assigning || task.assigned_hostname.as_deref() != Some(hostname) {
                continue;
            }
            if running_task_ids.contains(&task.id) {
                task.suspicion_count = 0;
                self.tasks.save(&task).await?;
                self.tasks.transition(task.id, TaskStatus::Running).await?;
            } else {
                task.suspicion_count += 1;
                if task.suspicion_count > SUSPICION_THRESHOLD {
                    warn!(task_id = task.id, "assignment lost, marking failed");
                    task.error_message = Some("assignment lost".to_owned());
                    self.tasks.save(&task).await?;
                    self.tasks.transition(task.id, TaskStatus::Failed).await?;
                } else {
                    self.tasks.save(&task).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_target_empty_is_auto_schedule() {
        assert_eq!(parse_target("").unwrap(), Target::default());
    }

    #[test]
    fn parse_target_hostname_only() {
        let t = parse_target("node1").unwrap();
        assert_eq!(t.hostname.as_deref(), Some("node1"));
        assert_eq!(t.numa_node, None);
        assert!(t.gpu_indices.is_empty());
    }

    #[test]
    fn parse_target_with_numa() {
        let t = parse_target("node1:1").unwrap();
        assert_eq!(t.hostname.as_deref(), Some("node1"));
        assert_eq!(t.numa_node, Some(1));
    }

    #[test]
    fn parse_target_with_gpus() {
        let t = parse_target("node1::0,1").unwrap();
        assert_eq!(t.hostname.as_deref(), Some("node1"));
        assert_eq!(t.gpu_indices, vec![0, 1]);
    }

    #[test]
    fn parse_target_bad_numa_is_rejected() {
        assert!(parse_target("node1:abc").is_err());
    }

    fn sample_node(hostname: &str, cores: u32, memory: u64) -> Node {
        Node {
            hostname: hostname.to_owned(),
            reachable_url: format!("http://{hostname}:8001"),
            total_cores: cores,
            total_memory_bytes: memory,
            status: kr_common::model::NodeStatus::Online,
            last_heartbeat: chrono::Utc::now(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            temperature_celsius: None,
            numa_topology: std::collections::HashMap::new(),
            gpus: vec![],
            vm_capable: false,
            runner_version: "0.2.0".to_owned(),
        }
    }

    #[test]
    fn tie_break_prefers_fewer_running_tasks() {
        let nodes = vec![sample_node("a", 8, 1000), sample_node("b", 8, 1000)];
        let mut counts = std::collections::HashMap::new();
        counts.insert("a".to_owned(), 3);
        counts.insert("b".to_owned(), 1);
        let resources = ResourceRequest::default();
        let picked = pick_auto_schedule_target(&nodes, &counts, &resources).unwrap();
        assert_eq!(picked.hostname, "b");
    }

    #[test]
    fn tie_break_then_prefers_larger_free_memory() {
        let nodes = vec![sample_node("a", 8, 500), sample_node("b", 8, 2000)];
        let counts = std::collections::HashMap::new();
        let resources = ResourceRequest::default();
        let picked = pick_auto_schedule_target(&nodes, &counts, &resources).unwrap();
        assert_eq!(picked.hostname, "b");
    }

    #[test]
    fn tie_break_then_prefers_lower_load_at_equal_capacity() {
        let mut busy = sample_node("a", 8, 1000);
        busy.memory_percent = 90.0;
        let mut idle = sample_node("b", 8, 1000);
        idle.memory_percent = 10.0;
        let nodes = vec![busy, idle];
        let counts = std::collections::HashMap::new();
        let resources = ResourceRequest::default();
        let picked = pick_auto_schedule_target(&nodes, &counts, &resources).unwrap();
        assert_eq!(picked.hostname, "b");
    }

    #[test]
    fn tie_break_then_prefers_lexicographic_hostname() {
        let nodes = vec![sample_node("zebra", 8, 1000), sample_node("alpha", 8, 1000)];
        let counts = std::collections::HashMap::new();
        let resources = ResourceRequest::default();
        let picked = pick_auto_schedule_target(&nodes, &counts, &resources).unwrap();
        assert_eq!(picked.hostname, "alpha");
    }

    #[test]
    fn auto_schedule_never_picks_gpu_task() {
        let nodes = vec![sample_node("a", 8, 1000)];
        let counts = std::collections::HashMap::new();
        let resources = ResourceRequest {
            gpu_indices: vec![0],
            ..Default::default()
        };
        assert!(pick_auto_schedule_target(&nodes, &counts, &resources).is_none());
    }
}
