//! Host configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `KOHAKURIVER_*` environment variables.

use std::net::{Ipv4Addr, SocketAddr};

/// Host process configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Address to bind the SSH proxy listener to (§4.9).
    pub ssh_proxy_addr: SocketAddr,
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Seconds between heartbeat-offline monitor ticks.
    pub monitor_interval_secs: u64,
    /// Expected Runner heartbeat interval, used to derive the offline
    /// timeout (§4.2: `interval × timeout_factor`).
    pub heartbeat_interval_secs: i64,
    /// Heartbeat timeout multiplier.
    pub heartbeat_timeout_factor: u32,
    /// Base CIDR for the overlay network plan (§4.7).
    pub overlay_base_network: Ipv4Addr,
    pub overlay_base_prefix_len: u8,
    /// Prefix length handed to each Runner's subnet.
    pub overlay_runner_prefix_len: u8,
    pub overlay_vxlan_base_id: u32,
    /// HMAC signing key for IP reservation tokens.
    pub ip_reservation_key: Vec<u8>,
    /// Shared secret accepted as an admin bypass credential (§4.10).
    pub admin_secret: Option<String>,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `RocksDB` persistent storage.
    RocksDb { path: String },
}

impl HostConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `KOHAKURIVER_BIND_ADDR` — HTTP bind address (default `127.0.0.1:8000`)
    /// - `KOHAKURIVER_SSH_PROXY_ADDR` — SSH proxy bind address (default `127.0.0.1:8002`)
    /// - `KOHAKURIVER_STORAGE` — `memory` or `rocksdb` (default `memory`)
    /// - `KOHAKURIVER_STORAGE_PATH` — path for the RocksDB backend (default `./data`)
    /// - `KOHAKURIVER_LOG_LEVEL` — log filter (default `info`)
    /// - `KOHAKURIVER_HEARTBEAT_INTERVAL` — expected Runner heartbeat period in seconds (default `10`)
    /// - `KOHAKURIVER_HEARTBEAT_TIMEOUT_FACTOR` — offline-detection multiplier (default `6`)
    /// - `KOHAKURIVER_OVERLAY_CIDR` — base overlay network in `a.b.c.d/n` form (default `10.200.0.0/16`)
    /// - `KOHAKURIVER_OVERLAY_RUNNER_PREFIX` — per-Runner subnet prefix length (default `24`)
    /// - `KOHAKURIVER_OVERLAY_VXLAN_BASE` — first VXLAN VNI handed out (default `10000`)
    /// - `KOHAKURIVER_IP_RESERVATION_KEY` — hex-encoded HMAC key (generated randomly if unset)
    /// - `KOHAKURIVER_ADMIN_SECRET` — shared secret accepted as an admin bypass header
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("KOHAKURIVER_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8000)));

        let ssh_proxy_addr = std::env::var("KOHAKURIVER_SSH_PROXY_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8002)));

        let storage_path =
            std::env::var("KOHAKURIVER_STORAGE_PATH").unwrap_or_else(|_| "./data".to_owned());

        let storage_backend = match std::env::var("KOHAKURIVER_STORAGE")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "rocksdb" => StorageBackendType::RocksDb { path: storage_path },
            _ => StorageBackendType::Memory,
        };

        let log_level = std::env::var("KOHAKURIVER_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let heartbeat_interval_secs = std::env::var("KOHAKURIVER_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let heartbeat_timeout_factor = std::env::var("KOHAKURIVER_HEARTBEAT_TIMEOUT_FACTOR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(kr_core::registry::DEFAULT_TIMEOUT_FACTOR);

        let (overlay_base_network, overlay_base_prefix_len) =
            parse_cidr(&std::env::var("KOHAKURIVER_OVERLAY_CIDR").unwrap_or_else(|_| "10.200.0.0/16".to_owned()))
                .unwrap_or((Ipv4Addr::new(10, 200, 0, 0), 16));

        let overlay_runner_prefix_len = std::env::var("KOHAKURIVER_OVERLAY_RUNNER_PREFIX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24);

        let overlay_vxlan_base_id = std::env::var("KOHAKURIVER_OVERLAY_VXLAN_BASE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10000);

        let ip_reservation_key = std::env::var("KOHAKURIVER_IP_RESERVATION_KEY")
            .ok()
            .and_then(|v| hex::decode(v).ok())
            .unwrap_or_else(random_key);

        let admin_secret = std::env::var("KOHAKURIVER_ADMIN_SECRET").ok();

        Self {
            bind_addr,
            ssh_proxy_addr,
            storage_backend,
            log_level,
            monitor_interval_secs: 5,
            heartbeat_interval_secs,
            heartbeat_timeout_factor,
            overlay_base_network,
            overlay_base_prefix_len,
            overlay_runner_prefix_len,
            overlay_vxlan_base_id,
            ip_reservation_key,
            admin_secret,
        }
    }
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    Some((addr.parse().ok()?, prefix.parse().ok()?))
}

fn random_key() -> Vec<u8> {
    use rand::RngCore;
    let mut key = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
