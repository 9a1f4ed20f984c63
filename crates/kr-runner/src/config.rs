//! Runner configuration, loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Runner process configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// This Runner's hostname, as reported to the Host at register time.
    pub hostname: String,
    /// Address to bind the HTTP+WS listener to.
    pub bind_addr: SocketAddr,
    /// URL the Host (and other Runners' forward chains) can reach this
    /// Runner at — distinct from `bind_addr` when behind NAT or a
    /// reverse proxy.
    pub reachable_url: String,
    /// Base URL of the Host to register and heartbeat against.
    pub host_url: String,
    /// Seconds between heartbeats (§4.2, default ≈ 5s).
    pub heartbeat_interval_secs: u64,
    /// Directory holding VM instance sub-directories, one per task-id.
    pub vm_instances_dir: PathBuf,
    /// Directory holding cached VM base images.
    pub vm_images_dir: PathBuf,
    /// Scratch directory for task-local temp files.
    pub local_temp_dir: PathBuf,
    /// Directory mounted into every COMMAND container as `/shared`.
    pub shared_dir: PathBuf,
    /// Directory holding per-task stdout/stderr logs.
    pub log_dir: PathBuf,
    /// Path to the `kr-tunnel-client` binary bind-mounted into containers.
    pub tunnel_client_binary: PathBuf,
    /// Whether this Runner advertises VM capability at register time.
    pub vm_capable: bool,
    /// Runner build version, reported in register/heartbeat.
    pub runner_version: String,
    /// Log level filter.
    pub log_level: String,
}

impl RunnerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `KOHAKURIVER_RUNNER_HOSTNAME` — this Runner's hostname (default: OS hostname)
    /// - `KOHAKURIVER_RUNNER_BIND_ADDR` — HTTP bind address (default `0.0.0.0:8001`)
    /// - `KOHAKURIVER_RUNNER_REACHABLE_URL` — URL others use to reach this Runner
    /// - `KOHAKURIVER_HOST_URL` — base URL of the Host (default `http://127.0.0.1:8000`)
    /// - `KOHAKURIVER_HEARTBEAT_INTERVAL` — heartbeat period in seconds (default `5`)
    /// - `KOHAKURIVER_VM_INSTANCES_DIR`, `KOHAKURIVER_VM_IMAGES_DIR`, `KOHAKURIVER_LOCAL_TEMP_DIR`
    /// - `KOHAKURIVER_SHARED_DIR`, `KOHAKURIVER_LOG_DIR`, `KOHAKURIVER_TUNNEL_CLIENT_BINARY`
    /// - `KOHAKURIVER_VM_CAPABLE` — `true`/`false` (default `false`)
    /// - `KOHAKURIVER_LOG_LEVEL`
    #[must_use]
    pub fn from_env() -> Self {
        let hostname = std::env::var("KOHAKURIVER_RUNNER_HOSTNAME")
            .ok()
            .or_else(|| {
                hostname_fallback()
            })
            .unwrap_or_else(|| "runner".to_owned());

        let bind_addr = std::env::var("KOHAKURIVER_RUNNER_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8001)));

        let reachable_url = std::env::var("KOHAKURIVER_RUNNER_REACHABLE_URL")
            .unwrap_or_else(|_| format!("http://{hostname}:8001"));

        let host_url = std::env::var("KOHAKURIVER_HOST_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8000".to_owned());

        let heartbeat_interval_secs = std::env::var("KOHAKURIVER_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let vm_instances_dir = std::env::var("KOHAKURIVER_VM_INSTANCES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/vm-instances"));

        let vm_images_dir = std::env::var("KOHAKURIVER_VM_IMAGES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/vm-images"));

        let local_temp_dir = std::env::var("KOHAKURIVER_LOCAL_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/tmp"));

        let shared_dir = std::env::var("KOHAKURIVER_SHARED_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/shared"));

        let log_dir = std::env::var("KOHAKURIVER_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/logs"));

        let tunnel_client_binary = std::env::var("KOHAKURIVER_TUNNEL_CLIENT_BINARY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/local/bin/kr-tunnel-client"));

        let vm_capable = std::env::var("KOHAKURIVER_VM_CAPABLE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);

        let runner_version = std::env::var("KOHAKURIVER_RUNNER_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_owned());

        let log_level = std::env::var("KOHAKURIVER_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        Self {
            hostname,
            bind_addr,
            reachable_url,
            host_url,
            heartbeat_interval_secs,
            vm_instances_dir,
            vm_images_dir,
            local_temp_dir,
            shared_dir,
            log_dir,
            tunnel_client_binary,
            vm_capable,
            runner_version,
            log_level,
        }
    }
}

fn hostname_fallback() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}
