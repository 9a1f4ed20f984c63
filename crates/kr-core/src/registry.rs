//! Node registry and heartbeat monitor (§4.2).
//!
//! Follows the teacher's `MountManager` shape: an in-memory `RwLock`-cached
//! table, loaded from the store at startup and persisted on every write, so
//! reads (which happen on every scheduling decision) never touch storage.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use kr_common::model::{GpuInfo, HeartbeatRequest, NodeStatus, NumaTopology, RegisterRequest};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::error::RegistryError;
use crate::node::Node;
use crate::store::Store;
use crate::task::TaskRepository;

const NODE_PREFIX: &str = "nodes/";

fn node_key(hostname: &str) -> String {
    format!("{NODE_PREFIX}{hostname}")
}

/// Default heartbeat timeout multiplier (§4.2: "default factor 6").
pub const DEFAULT_TIMEOUT_FACTOR: u32 = 6;

/// Registry of all Nodes known to the Host.
pub struct NodeRegistry {
    store: Store,
    nodes: RwLock<HashMap<String, Node>>,
    heartbeat_interval_secs: i64,
    timeout_factor: u32,
}

impl NodeRegistry {
    /// Load the registry from the store at startup.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] if the store fails.
    pub async fn load(
        store: Store,
        heartbeat_interval_secs: i64,
        timeout_factor: u32,
    ) -> Result<Self, RegistryError> {
        let nodes = store.list_values::<Node>(NODE_PREFIX).await?;
        let map = nodes.into_iter().map(|n| (n.hostname.clone(), n)).collect();
        Ok(Self {
            store,
            nodes: RwLock::new(map),
            heartbeat_interval_secs,
            timeout_factor,
        })
    }

    /// Upsert a Node from a registration document (§4.2: "Runners POST a
    /// registration document on startup... the Host upserts the Node row").
    ///
    /// Round-trip law: register then register (same hostname) yields one
    /// Node row with updated fields.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] if persistence fails.
    pub async fn register(&self, req: RegisterRequest) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = Node {
            hostname: req.hostname.clone(),
            reachable_url: req.reachable_url,
            total_cores: req.total_cores,
            total_memory_bytes: req.total_memory_bytes,
            status: NodeStatus::Online,
            last_heartbeat: Utc::now(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            temperature_celsius: None,
            numa_topology: req.numa_topology,
            gpus: req.gpus,
            vm_capable: req.vm_capable,
            runner_version: req.runner_version,
        };
        self.store.put(&node_key(&node.hostname), &node).await?;
        nodes.insert(req.hostname.clone(), node);
        info!(hostname = %req.hostname, "node registered");
        Ok(())
    }

    /// Apply a heartbeat: update liveness metrics and bring the Node back
    /// online if it was previously offline.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the hostname is not registered,
    /// or [`RegistryError::Store`] if persistence fails.
    pub async fn heartbeat(&self, hb: &HeartbeatRequest) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&hb.hostname)
            .ok_or_else(|| RegistryError::NotFound {
                hostname: hb.hostname.clone(),
            })?;

        node.last_heartbeat = Utc::now();
        node.status = NodeStatus::Online;
        node.cpu_percent = hb.cpu_percent;
        node.memory_percent = hb.memory_percent;
        node.temperature_celsius = hb.temperature_celsius;
        if !hb.gpus.is_empty() {
            node.gpus = hb.gpus.clone();
        }
        node.vm_capable = hb.vm_capable;
        node.runner_version.clone_from(&hb.runner_version);

        self.store.put(&node_key(&hb.hostname), node).await?;
        Ok(())
    }

    /// Fetch a single Node.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the hostname is not registered.
    pub async fn get(&self, hostname: &str) -> Result<Node, RegistryError> {
        self.nodes
            .read()
            .await
            .get(hostname)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                hostname: hostname.to_owned(),
            })
    }

    /// List every known Node.
    pub async fn list(&self) -> Vec<Node> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Whether the given hostname currently owns the given GPU index,
    /// per the Node's last-reported GPU inventory (invariant 3/7).
    pub async fn owns_gpu(&self, hostname: &str, gpu_index: u32) -> bool {
        self.nodes
            .read()
            .await
            .get(hostname)
            .is_some_and(|n| n.gpus.iter().any(|g: &GpuInfo| g.index == gpu_index))
    }

    /// Whether `numa_node` exists in the hostname's reported topology.
    pub async fn has_numa_node(&self, hostname: &str, numa_node: u32) -> bool {
        self.nodes.read().await.get(hostname).is_some_and(|n| {
            let topo: &NumaTopology = &n.numa_topology;
            topo.contains_key(&numa_node)
        })
    }

    /// One tick of the offline-detection monitor: mark any Node whose
    /// heartbeat is older than `interval × timeout_factor` offline, and
    /// transition every non-terminal task assigned to it to `lost`.
    ///
    /// Grounded in the teacher's `lease_expiry_worker` background-scan
    /// shape, generalized from lease expiry to heartbeat-recency.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Store`] if persisting a Node status change fails.
    #[instrument(skip(self, tasks))]
    pub async fn monitor_tick(&self, tasks: &TaskRepository) -> Result<(), RegistryError> {
        let now = Utc::now();
        let newly_offline: Vec<String> = {
            let mut nodes = self.nodes.write().await;
            let mut offline = Vec::new();
            for node in nodes.values_mut() {
                if node.status == NodeStatus::Offline {
                    continue;
                }
                let derived = Node::status_from_heartbeat(
                    node.last_heartbeat,
                    now,
                    self.heartbeat_interval_secs,
                    self.timeout_factor,
                );
                if derived == NodeStatus::Offline {
                    node.status = NodeStatus::Offline;
                    offline.push(node.hostname.clone());
                }
            }
            offline
        };

        for hostname in &newly_offline {
            warn!(hostname, "node went offline, marking assigned tasks lost");
            if let Some(node) = self.nodes.read().await.get(hostname) {
                self.store.put(&node_key(hostname), node).await?;
            }
            if let Ok(all_tasks) = tasks.list().await {
                for task in all_tasks {
                    if task.assigned_hostname.as_deref() == Some(hostname.as_str())
                        && !task.is_terminal()
                    {
                        if let Err(e) = tasks
                            .transition(task.id, kr_common::model::TaskStatus::Lost)
                            .await
                        {
                            warn!(task_id = task.id, error = %e, "failed to mark task lost");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::task::Task;
    use kr_common::model::{ResourceRequest, TaskKind, TaskStatus};
    use kr_storage::MemoryBackend;

    fn sample_register(hostname: &str) -> RegisterRequest {
        RegisterRequest {
            hostname: hostname.to_owned(),
            reachable_url: format!("http://{hostname}:8001"),
            total_cores: 8,
            total_memory_bytes: 16 * 1024 * 1024 * 1024,
            numa_topology: HashMap::new(),
            gpus: vec![],
            vm_capable: false,
            runner_version: "0.2.0".to_owned(),
        }
    }

    async fn make_registry() -> NodeRegistry {
        NodeRegistry::load(Store::new(Arc::new(MemoryBackend::new())), 5, 6)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_twice_yields_one_row_with_updated_fields() {
        let registry = make_registry().await;
        registry.register(sample_register("node1")).await.unwrap();
        let mut second = sample_register("node1");
        second.total_cores = 16;
        registry.register(second).await.unwrap();

        let nodes = registry.list().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].total_cores, 16);
    }

    #[tokio::test]
    async fn heartbeat_on_unknown_hostname_errors() {
        let registry = make_registry().await;
        let hb = HeartbeatRequest {
            hostname: "ghost".to_owned(),
            running_task_ids: vec![],
            killed_tasks: vec![],
            cpu_percent: 1.0,
            memory_percent: 1.0,
            temperature_celsius: None,
            gpus: vec![],
            vm_capable: false,
            runner_version: "0.2.0".to_owned(),
        };
        let err = registry.heartbeat(&hb).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn monitor_tick_marks_stale_node_offline_and_tasks_lost() {
        let registry = make_registry().await;
        registry.register(sample_register("node1")).await.unwrap();

        // Force the last heartbeat far into the past.
        {
            let mut nodes = registry.nodes.write().await;
            let node = nodes.get_mut("node1").unwrap();
            node.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        }

        let task_repo = TaskRepository::new(Store::new(Arc::new(MemoryBackend::new())));
        let task = Task {
            id: 1,
            batch_id: None,
            kind: TaskKind::Command,
            owner: "alice".to_owned(),
            status: TaskStatus::Running,
            resources: ResourceRequest::default(),
            environment_name: Some("base".to_owned()),
            environment_image: None,
            extra_mounts: vec![],
            privileged: false,
            command: Some("/bin/true".to_owned()),
            vps: None,
            assigned_hostname: Some("node1".to_owned()),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error_message: None,
            stdout_path: None,
            stderr_path: None,
            suspicion_count: 0,
            created_at: Utc::now(),
        };
        task_repo.insert(&task).await.unwrap();

        registry.monitor_tick(&task_repo).await.unwrap();

        let node = registry.get("node1").await.unwrap();
        assert_eq!(node.status, NodeStatus::Offline);

        let updated = task_repo.get(1).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Lost);
    }
}
