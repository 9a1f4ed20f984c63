//! Shared application state for the Host server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It holds the scheduler, node registry, overlay
//! manager, IP reservation signer, and auth core — every durable subsystem
//! the HTTP and WebSocket layers drive.

use std::sync::Arc;

use kr_core::auth::AuthCore;
use kr_core::ip_reservation::IpReservationSigner;
use kr_core::overlay::OverlayManager;
use kr_core::registry::NodeRegistry;
use kr_core::scheduler::Scheduler;
use kr_core::task::TaskRepository;

use crate::config::HostConfig;

/// Shared application state passed to all HTTP and WebSocket handlers.
pub struct AppState {
    pub tasks: TaskRepository,
    pub registry: Arc<NodeRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub overlay: Arc<OverlayManager>,
    pub ip_reservation_signer: Arc<IpReservationSigner>,
    pub auth: Arc<AuthCore>,
    pub config: HostConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
