//! Local ephemeral task-tracking table (§6 "Persistent state layout": "Per
//! Runner: a local ephemeral state store").
//!
//! Unlike the Host's durable store, this table is not written through to
//! disk — it exists only to let the recovery pass (§4.4, §4.5) distinguish
//! "I started this" from "I'm adopting something I find running" after a
//! restart. It is rebuilt from scratch, empty, every time the Runner starts;
//! recovery reconciles it against the real container/VM state.

use std::collections::HashMap;
use std::sync::RwLock;

use kr_common::model::{TaskKind, VpsBackend};

/// What kind of workload a tracked task is and where it lives.
#[derive(Debug, Clone)]
pub struct LocalTaskRecord {
    pub task_id: u64,
    pub kind: TaskKind,
    pub backend: Option<VpsBackend>,
    /// Docker container id, when `backend == Docker` (or a COMMAND task).
    pub container_id: Option<String>,
    /// QEMU pid, when `backend == Qemu`.
    pub qemu_pid: Option<u32>,
    pub ssh_port: Option<u16>,
}

/// `RwLock`-guarded table of locally tracked tasks, mirroring the
/// read-mostly cached-table shape used throughout the Host's `kr-core`
/// (registry, overlay) but without a backing store — there is nothing to
/// persist through.
#[derive(Default)]
pub struct LocalStore {
    tasks: RwLock<HashMap<u64, LocalTaskRecord>>,
}

impl LocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: LocalTaskRecord) {
        #[allow(clippy::unwrap_used)]
        self.tasks.write().unwrap().insert(record.task_id, record);
    }

    #[must_use]
    pub fn get(&self, task_id: u64) -> Option<LocalTaskRecord> {
        #[allow(clippy::unwrap_used)]
        self.tasks.read().unwrap().get(&task_id).cloned()
    }

    pub fn remove(&self, task_id: u64) -> Option<LocalTaskRecord> {
        #[allow(clippy::unwrap_used)]
        self.tasks.write().unwrap().remove(&task_id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<LocalTaskRecord> {
        #[allow(clippy::unwrap_used)]
        self.tasks.read().unwrap().values().cloned().collect()
    }

    #[must_use]
    pub fn running_task_ids(&self) -> Vec<u64> {
        #[allow(clippy::unwrap_used)]
        self.tasks.read().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_remove_before_kill_avoids_double_update() {
        // §4.3: "the executor removes the task from the local ephemeral
        // store before issuing kill so that the exit-handler skips a
        // redundant status update."
        let store = LocalStore::new();
        store.insert(LocalTaskRecord {
            task_id: 1,
            kind: TaskKind::Command,
            backend: None,
            container_id: Some("abc".to_owned()),
            qemu_pid: None,
            ssh_port: None,
        });
        assert!(store.get(1).is_some());
        let removed = store.remove(1);
        assert!(removed.is_some());
        assert!(store.get(1).is_none());
    }

    #[test]
    fn list_reflects_all_tracked_tasks() {
        let store = LocalStore::new();
        for id in [1, 2, 3] {
            store.insert(LocalTaskRecord {
                task_id: id,
                kind: TaskKind::Vps,
                backend: Some(VpsBackend::Docker),
                container_id: Some(format!("c{id}")),
                qemu_pid: None,
                ssh_port: None,
            });
        }
        assert_eq!(store.list().len(), 3);
        assert_eq!(store.running_task_ids().len(), 3);
    }
}
