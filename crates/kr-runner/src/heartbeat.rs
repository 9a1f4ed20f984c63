//! Registration and heartbeat loop (§4.2 Runner side): register once on
//! startup, then PUT a heartbeat at a fixed interval carrying resource
//! samples, running task ids, and tasks killed since the previous tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kr_common::model::{HeartbeatRequest, NumaTopology, OverlayConfig, RegisterRequest};
use sysinfo::System;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::state::AppState;

#[derive(serde::Deserialize)]
struct RegisterResponse {
    overlay: Option<OverlayConfig>,
}

/// POST `/api/register` once at startup. Returns the overlay configuration
/// the Host assigns, if overlay networking is enabled there.
///
/// # Errors
///
/// Returns an error if the Host cannot be reached or rejects registration.
pub async fn register(state: &AppState) -> anyhow::Result<Option<OverlayConfig>> {
    let req = RegisterRequest {
        hostname: state.config.hostname.clone(),
        reachable_url: state.config.reachable_url.clone(),
        total_cores: total_cores(),
        total_memory_bytes: total_memory_bytes(),
        numa_topology: state.numa_topology.clone(),
        gpus: state.gpu_inventory.clone(),
        vm_capable: state.config.vm_capable,
        runner_version: state.config.runner_version.clone(),
    };

    let url = format!("{}/api/register", state.config.host_url);
    let resp = state
        .http_client
        .post(&url)
        .json(&req)
        .send()
        .await?
        .error_for_status()?;
    let body: RegisterResponse = resp.json().await?;
    info!(hostname = %state.config.hostname, "registered with host");
    Ok(body.overlay)
}

/// Spawn the periodic heartbeat loop, stopping when `shutdown` fires.
pub fn spawn(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    let interval_secs = state.config.heartbeat_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    heartbeat_tick(&state).await;
                }
                _ = shutdown.changed() => {
                    info!("heartbeat loop shutting down");
                    return;
                }
            }
        }
    })
}

async fn heartbeat_tick(state: &AppState) {
    let sample = state.monitor.sample().await;
    let killed_tasks = state.drain_killed().await;
    let running_task_ids = state.local_store.running_task_ids();

    let req = HeartbeatRequest {
        hostname: state.config.hostname.clone(),
        running_task_ids,
        killed_tasks,
        cpu_percent: sample.cpu_percent,
        memory_percent: sample.memory_percent,
        temperature_celsius: sample.temperature_celsius,
        gpus: sample.gpus,
        vm_capable: state.config.vm_capable,
        runner_version: state.config.runner_version.clone(),
    };

    let url = format!("{}/api/heartbeat/{}", state.config.host_url, state.config.hostname);
    if let Err(err) = state.http_client.put(&url).json(&req).send().await {
        warn!(error = %err, "heartbeat PUT failed");
    }
}

fn total_cores() -> u32 {
    let system = System::new_all();
    system.cpus().len() as u32
}

fn total_memory_bytes() -> u64 {
    let mut system = System::new_all();
    system.refresh_memory();
    system.total_memory()
}

/// Read `/sys/devices/system/node/node*/cpulist` to build the NUMA topology
/// reported at register time. Hosts without NUMA (or without the sysfs
/// tree, e.g. in a container) report an empty topology.
#[must_use]
pub fn detect_numa_topology() -> NumaTopology {
    let mut topology = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") else {
        return topology;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(node_str) = name.strip_prefix("node") else { continue };
        let Ok(node_id) = node_str.parse::<u32>() else { continue };

        let cpulist_path = entry.path().join("cpulist");
        let Ok(raw) = std::fs::read_to_string(cpulist_path) else { continue };
        topology.insert(node_id, parse_cpulist(raw.trim()));
    }
    topology
}

fn parse_cpulist(raw: &str) -> Vec<u32> {
    let mut cores = Vec::new();
    for part in raw.split(',') {
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                cores.extend(start..=end);
            }
        } else if let Ok(core) = part.parse::<u32>() {
            cores.push(core);
        }
    }
    cores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_singletons() {
        assert_eq!(parse_cpulist("0-3,7,9-10"), vec![0, 1, 2, 3, 7, 9, 10]);
    }

    #[test]
    fn parses_empty_string_as_empty() {
        assert!(parse_cpulist("").is_empty());
    }
}
