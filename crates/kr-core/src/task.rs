//! Task entity and state machine (§3 Entities, §4.1).
//!
//! Persisted through the [`Store`] at `tasks/<id>`. The repository is the
//! only place that mutates a task's `status`; every transition is checked
//! against [`VALID_TRANSITIONS`] before it is applied (invariant 2).

use chrono::{DateTime, Utc};
use kr_common::model::{ResourceRequest, TaskKind, TaskStatus, VpsBackend, SshMode};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::store::Store;

const TASK_PREFIX: &str = "tasks/";

fn task_key(task_id: u64) -> String {
    format!("{TASK_PREFIX}{task_id}")
}

/// VPS-specific fields, present only when `kind == Vps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpsFields {
    pub backend: VpsBackend,
    pub ssh_mode: SshMode,
    pub ssh_public_key: Option<String>,
    pub ssh_port: Option<u16>,
    pub vm_image: Option<String>,
    pub vm_disk_size_bytes: Option<u64>,
    pub overlay_ip: Option<String>,
}

/// A unit of work, identified by a Snowflake id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub batch_id: Option<u64>,
    pub kind: TaskKind,
    pub owner: String,
    pub status: TaskStatus,
    pub resources: ResourceRequest,
    pub environment_name: Option<String>,
    pub environment_image: Option<String>,
    #[serde(default)]
    pub extra_mounts: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    pub command: Option<String>,
    pub vps: Option<VpsFields>,
    pub assigned_hostname: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    /// Incremented once per heartbeat that omits this task while `assigning`;
    /// reset to 0 on every successful status update. §4.1: "when it exceeds
    /// a threshold proportional to 3 × heartbeat_interval, the task is
    /// marked failed".
    #[serde(default)]
    pub suspicion_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Terminal for this task's kind. `lost` is terminal for COMMAND tasks
    /// but resumable for VPS (invariant 6).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        if self.status == TaskStatus::Lost {
            return self.kind != TaskKind::Vps;
        }
        self.status.is_terminal()
    }
}

/// Valid `(from, to)` edges of the task state machine, per §4.1.
#[must_use]
pub fn is_valid_transition(kind: TaskKind, from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::{
        Assigning, Completed, Failed, Killed, KilledOom, Lost, Paused, Pending, PendingApproval,
        Rejected, Running, Stopped,
    };

    match (from, to) {
        (PendingApproval, Pending | Rejected) => true,
        (Pending, Assigning) => true,
        (Assigning, Running) => true,
        (Running, Paused | Stopped | Killed | KilledOom | Completed | Failed | Lost) => true,
        (Paused, Running) => true,
        (Lost, Running) => kind == TaskKind::Vps,
        _ => false,
    }
}

/// Stores and mutates [`Task`] rows through the durable [`Store`].
#[derive(Clone)]
pub struct TaskRepository {
    store: Store,
}

impl TaskRepository {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persist a newly created task.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if persistence fails.
    pub async fn insert(&self, task: &Task) -> Result<(), SchedulerError> {
        self.store.put(&task_key(task.id), task).await?;
        Ok(())
    }

    /// Fetch a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskNotFound`] if no such task exists, or
    /// [`SchedulerError::Store`] if the store fails.
    pub async fn get(&self, task_id: u64) -> Result<Task, SchedulerError> {
        self.store
            .get(&task_key(task_id))
            .await?
            .ok_or(SchedulerError::TaskNotFound { task_id })
    }

    /// List every task currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the store fails.
    pub async fn list(&self) -> Result<Vec<Task>, SchedulerError> {
        Ok(self.store.list_values(TASK_PREFIX).await?)
    }

    /// Apply a status transition, validating it against §4.1 first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] if `to` is not reachable
    /// from the task's current status.
    pub async fn transition(
        &self,
        task_id: u64,
        to: TaskStatus,
    ) -> Result<Task, SchedulerError> {
        let mut task = self.get(task_id).await?;
        if task.status == to {
            // Idempotent no-op (e.g. killing an already-killed task, §8 law).
            return Ok(task);
        }
        if !is_valid_transition(task.kind, task.status, to) {
            return Err(SchedulerError::InvalidTransition {
                task_id,
                from: task.status,
                to,
            });
        }
        task.status = to;
        if to.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        if to == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        self.store.put(&task_key(task_id), &task).await?;
        Ok(task)
    }

    /// Overwrite a task wholesale (used by the scheduler when updating
    /// fields other than `status`, e.g. `assigned_hostname`, `ssh_port`).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if persistence fails.
    pub async fn save(&self, task: &Task) -> Result<(), SchedulerError> {
        self.store.put(&task_key(task.id), task).await?;
        Ok(())
    }

    /// Delete a task row. Callers are responsible for checking it is not
    /// `running` (§3 lifecycle: "destroyed only by explicit delete on a
    /// non-running task").
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if persistence fails.
    pub async fn delete(&self, task_id: u64) -> Result<(), SchedulerError> {
        self.store.delete(&task_key(task_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kr_storage::MemoryBackend;
    use std::sync::Arc;

    fn make_repo() -> TaskRepository {
        TaskRepository::new(Store::new(Arc::new(MemoryBackend::new())))
    }

    fn sample_task(id: u64, kind: TaskKind) -> Task {
        Task {
            id,
            batch_id: None,
            kind,
            owner: "alice".to_owned(),
            status: TaskStatus::Pending,
            resources: ResourceRequest::default(),
            environment_name: Some("base".to_owned()),
            environment_image: None,
            extra_mounts: vec![],
            privileged: false,
            command: Some("/bin/true".to_owned()),
            vps: None,
            assigned_hostname: None,
            started_at: None,
            completed_at: None,
            exit_code: None,
            error_message: None,
            stdout_path: None,
            stderr_path: None,
            suspicion_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn valid_transitions_per_state_machine() {
        use TaskStatus::*;
        assert!(is_valid_transition(TaskKind::Command, PendingApproval, Pending));
        assert!(is_valid_transition(TaskKind::Command, Pending, Assigning));
        assert!(is_valid_transition(TaskKind::Command, Assigning, Running));
        assert!(is_valid_transition(TaskKind::Command, Running, Completed));
        assert!(is_valid_transition(TaskKind::Command, Running, Lost));
        assert!(is_valid_transition(TaskKind::Command, Paused, Running));
        assert!(is_valid_transition(TaskKind::Command, Running, Paused));
    }

    #[test]
    fn lost_to_running_only_for_vps() {
        assert!(is_valid_transition(TaskKind::Vps, TaskStatus::Lost, TaskStatus::Running));
        assert!(!is_valid_transition(
            TaskKind::Command,
            TaskStatus::Lost,
            TaskStatus::Running
        ));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(!is_valid_transition(
            TaskKind::Command,
            TaskStatus::Completed,
            TaskStatus::Running
        ));
        assert!(!is_valid_transition(
            TaskKind::Command,
            TaskStatus::PendingApproval,
            TaskStatus::Running
        ));
    }

    #[tokio::test]
    async fn transition_persists_and_rejects_invalid_edge() {
        let repo = make_repo();
        let task = sample_task(1, TaskKind::Command);
        repo.insert(&task).await.unwrap();

        repo.transition(1, TaskStatus::Assigning).await.unwrap();
        repo.transition(1, TaskStatus::Running).await.unwrap();
        let completed = repo.transition(1, TaskStatus::Completed).await.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(completed.completed_at.is_some());

        let err = repo.transition(1, TaskStatus::Running).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn killed_task_kill_is_idempotent() {
        let repo = make_repo();
        let mut task = sample_task(2, TaskKind::Command);
        task.status = TaskStatus::Running;
        repo.insert(&task).await.unwrap();

        repo.transition(2, TaskStatus::Killed).await.unwrap();
        // Second kill on an already-killed task is a no-op, not an error.
        let again = repo.transition(2, TaskStatus::Killed).await.unwrap();
        assert_eq!(again.status, TaskStatus::Killed);
    }

    #[tokio::test]
    async fn lost_is_terminal_for_command_not_for_vps() {
        let repo = make_repo();
        let mut command_task = sample_task(3, TaskKind::Command);
        command_task.status = TaskStatus::Lost;
        repo.insert(&command_task).await.unwrap();
        assert!(repo.get(3).await.unwrap().is_terminal());

        let mut vps_task = sample_task(4, TaskKind::Vps);
        vps_task.status = TaskStatus::Lost;
        repo.insert(&vps_task).await.unwrap();
        assert!(!repo.get(4).await.unwrap().is_terminal());
    }
}
