//! KohakuRiver Runner entry point.
//!
//! Bootstraps local directories and the Docker connection, detects local
//! NUMA topology and GPU inventory, registers with the Host, recovers any
//! containers/VMs left running by a previous process, then starts the Axum
//! HTTP+WebSocket server with graceful shutdown coordinated through a
//! `watch` channel — the same shape as the Host's `main.rs`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use kr_runner::config::RunnerConfig;
use kr_runner::executor::SharedPaths;
use kr_runner::local_store::{LocalStore, LocalTaskRecord};
use kr_runner::monitor::ResourceMonitor;
use kr_runner::overlay_agent::OverlayAgent;
use kr_runner::state::AppState;
use kr_runner::tunnel_server::TunnelRegistry;
use kr_runner::vm::VmManager;
use kr_runner::vps_container::VpsContainerManager;
use kr_runner::{heartbeat, routes, tunnel_server, vfio};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RunnerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(hostname = %config.hostname, "KohakuRiver Runner starting");

    let state = build_app_state(config.clone()).await?;

    match heartbeat::register(&state).await {
        Ok(Some(overlay_config)) => {
            if let Err(err) = state.overlay.apply(overlay_config).await {
                warn!(error = %err, "failed to apply overlay configuration from host");
            }
        }
        Ok(None) => info!("host did not assign an overlay configuration"),
        Err(err) => warn!(error = %err, "registration with host failed, continuing unregistered"),
    }

    recover_local_state(&state).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat_handle = heartbeat::spawn(Arc::clone(&state), shutdown_rx.clone());

    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "KohakuRiver Runner listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), heartbeat_handle).await;

    info!("KohakuRiver Runner stopped");
    Ok(())
}

async fn build_app_state(config: RunnerConfig) -> anyhow::Result<Arc<AppState>> {
    for dir in [
        &config.vm_instances_dir,
        &config.vm_images_dir,
        &config.local_temp_dir,
        &config.shared_dir,
        &config.log_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let vps = VpsContainerManager::connect().context("failed to connect to docker")?;
    let overlay = Arc::new(OverlayAgent::new(config.bind_addr.ip().to_string()));
    let vm_manager = VmManager::new(config.vm_instances_dir.clone(), Arc::clone(&overlay));

    let numa_topology = heartbeat::detect_numa_topology();
    let monitor = ResourceMonitor::new();
    let gpu_inventory = detect_gpu_inventory(&monitor).await;

    let shared_paths = SharedPaths {
        shared_dir: config.shared_dir.clone(),
        log_dir: config.log_dir.clone(),
        local_temp_dir: config.local_temp_dir.clone(),
        tunnel_client_binary: config.tunnel_client_binary.clone(),
    };

    Ok(Arc::new(AppState {
        config,
        local_store: LocalStore::new(),
        monitor,
        overlay,
        vm_manager,
        vps,
        tunnels: Arc::new(TunnelRegistry::new()),
        http_client: reqwest::Client::new(),
        shared_paths,
        numa_topology,
        gpu_inventory,
        killed_since_last_heartbeat: tokio::sync::Mutex::new(Vec::new()),
    }))
}

/// Sample once at startup to enumerate GPUs, then enrich each entry with
/// its IOMMU group and sibling device addresses (§4.6) — the heartbeat
/// loop's own samples don't need this since it's static per boot.
async fn detect_gpu_inventory(monitor: &ResourceMonitor) -> Vec<kr_common::model::GpuInfo> {
    let sample = monitor.sample().await;
    sample
        .gpus
        .into_iter()
        .map(|mut gpu| {
            if let Some(address) = &gpu.pci_address {
                if let Some((group, siblings)) = vfio::discover_iommu_group(address) {
                    gpu.iommu_group = Some(group);
                    gpu.companion_devices = siblings;
                }
            }
            gpu
        })
        .collect()
}

/// On startup, adopt whatever the Docker and VM backends report as already
/// running, and reconcile it against the (always-empty-at-boot) local
/// store (§4.4, §4.5 recovery passes).
async fn recover_local_state(state: &AppState) {
    match state.vps.list_tracked_containers().await {
        Ok(containers) => {
            for (task_id, running) in containers {
                if !running {
                    info!(task_id, "recovered vps container not running, reporting stopped");
                    continue;
                }
                state.local_store.insert(LocalTaskRecord {
                    task_id,
                    kind: kr_common::model::TaskKind::Vps,
                    backend: Some(kr_common::model::VpsBackend::Docker),
                    container_id: Some(format!("kohakuriver-vps-{task_id}")),
                    qemu_pid: None,
                    ssh_port: state.vps.discover_ssh_port(&format!("kohakuriver-vps-{task_id}")).await.ok(),
                });
                info!(task_id, "recovered running vps container");
            }
        }
        Err(err) => warn!(error = %err, "failed to list tracked containers during recovery"),
    }

    for (task_id, alive) in state.vm_manager.recover().await {
        if !alive {
            info!(task_id, "recovered vm instance not alive, reporting stopped");
            continue;
        }
        state.local_store.insert(LocalTaskRecord {
            task_id,
            kind: kr_common::model::TaskKind::Vps,
            backend: Some(kr_common::model::VpsBackend::Qemu),
            container_id: None,
            qemu_pid: None,
            ssh_port: None,
        });
        info!(task_id, "recovered running vm instance");
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", routes::router().with_state(Arc::clone(&state)))
        .merge(tunnel_server::router(Arc::clone(&state.tunnels)))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
