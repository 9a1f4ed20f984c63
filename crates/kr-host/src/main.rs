//! KohakuRiver Host entry point.
//!
//! Bootstraps the storage backend and every durable subsystem, then starts
//! the Axum HTTP server and the SSH proxy listener side by side, with
//! graceful shutdown coordinated through a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use kr_core::auth::AuthCore;
use kr_core::ip_reservation::IpReservationSigner;
use kr_core::overlay::{OverlayManager, OverlayPlan};
use kr_core::registry::NodeRegistry;
use kr_core::scheduler::Scheduler;
use kr_core::store::Store;
use kr_core::task::TaskRepository;
use kr_storage::MemoryBackend;

use kr_host::config::{HostConfig, StorageBackendType};
use kr_host::middleware::auth_middleware;
use kr_host::state::AppState;
use kr_host::{dispatcher, routes, ssh_proxy};

use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

const DISPATCH_TICK_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HostConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = ?config.storage_backend, "KohakuRiver Host starting");

    let state = build_app_state(config.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor_handle = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        let interval_secs = config.monitor_interval_secs;
        tokio::spawn(async move {
            heartbeat_monitor_worker(state, &mut rx, interval_secs).await;
        })
    };

    let dispatch_handle = dispatcher::spawn(Arc::clone(&state), DISPATCH_TICK_INTERVAL);

    let ssh_proxy_handle = {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = ssh_proxy::run(state).await {
                warn!(error = %err, "ssh proxy listener stopped");
            }
        })
    };

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "KohakuRiver Host listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    dispatch_handle.abort();
    ssh_proxy_handle.abort();
    let _ = tokio::time::timeout(Duration::from_secs(10), monitor_handle).await;

    info!("KohakuRiver Host stopped");
    Ok(())
}

async fn build_app_state(config: HostConfig) -> anyhow::Result<Arc<AppState>> {
    let storage: Arc<dyn kr_storage::StorageBackend> = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackendType::RocksDb { path } => {
            info!(path = %path, "using RocksDB storage");
            Arc::new(kr_storage::RocksDbBackend::open(path).context("failed to open RocksDB storage")?)
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackendType::RocksDb { .. } => {
            anyhow::bail!("RocksDB backend requested but feature 'rocksdb-backend' is not enabled");
        }
    };

    let store = Store::new(storage);

    let tasks = TaskRepository::new(store.clone());
    let registry = Arc::new(
        NodeRegistry::load(
            store.clone(),
            config.heartbeat_interval_secs,
            config.heartbeat_timeout_factor,
        )
        .await
        .context("failed to load node registry")?,
    );

    // Snowflake node id derived from the bind port; distinct Host
    // deployments on different ports won't collide in a shared store.
    let node_id = u64::from(config.bind_addr.port());
    let scheduler = Arc::new(Scheduler::new(tasks.clone(), Arc::clone(&registry), node_id));

    let overlay_plan = OverlayPlan {
        base_network: config.overlay_base_network,
        base_prefix_len: config.overlay_base_prefix_len,
        runner_prefix_len: config.overlay_runner_prefix_len,
        vxlan_base_id: config.overlay_vxlan_base_id,
    };
    let overlay = Arc::new(
        OverlayManager::load(store.clone(), overlay_plan)
            .await
            .context("failed to load overlay allocations")?,
    );

    let ip_reservation_signer = Arc::new(IpReservationSigner::new(config.ip_reservation_key.clone()));

    let auth = Arc::new(
        AuthCore::load(store)
            .await
            .context("failed to load auth core")?,
    );

    Ok(Arc::new(AppState {
        tasks,
        registry,
        scheduler,
        overlay,
        ip_reservation_signer,
        auth,
        config,
    }))
}

fn build_router(state: Arc<AppState>) -> Router {
    let authenticated_routes = Router::new()
        .merge(routes::tasks::router())
        .merge(routes::nodes::router())
        .merge(routes::overlay::router())
        .merge(routes::vps::router())
        .merge(routes::auth_routes::router())
        .merge(kr_host::ws::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-kohakuriver-admin-secret"),
        ]);

    Router::new()
        .nest("/api", authenticated_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .with_state(state)
}

/// Background worker driving both the offline-detection monitor tick and
/// the suspicion-counter aging that lives alongside it — the heartbeat
/// analogue of the teacher's `lease_expiry_worker`.
async fn heartbeat_monitor_worker(
    state: Arc<AppState>,
    shutdown: &mut watch::Receiver<bool>,
    interval_secs: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    info!(interval_secs, "heartbeat monitor worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = state.registry.monitor_tick(&state.tasks).await {
                    warn!(error = %err, "heartbeat monitor tick failed");
                }
            }
            _ = shutdown.changed() => {
                info!("heartbeat monitor worker shutting down");
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
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
