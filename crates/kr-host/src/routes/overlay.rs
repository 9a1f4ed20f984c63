//! Overlay and IP-reservation routes: `/api/overlay/*`,
//! `/api/nodes/overlay/ip/*` (§4.7, §6).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use kr_core::auth::Role;
use kr_core::ip_reservation::reserve_ip;
use kr_core::overlay::OverlayAllocation;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

const DEFAULT_RESERVATION_TTL_MINUTES: i64 = 10;

/// Build the overlay routes router, mounted at `/api/overlay` and
/// `/api/nodes/overlay/ip` by the caller.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/overlay/status", get(status))
        .route("/overlay/release/{runner}", post(release))
        .route("/overlay/cleanup", post(cleanup))
        .route("/nodes/overlay/ip/reserve", post(reserve))
        .route("/nodes/overlay/ip/release", post(ip_release))
        .route("/nodes/overlay/ip/validate", post(validate))
        .route("/nodes/overlay/ip/available", get(available))
        .route("/nodes/overlay/ip/info", get(info))
        .route("/nodes/overlay/ip/reservations", get(reservations))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<OverlayAllocation>>, AppError> {
    auth.require(Role::Viewer)?;
    Ok(Json(state.overlay.list().await))
}

async fn release(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(runner): Path<String>,
) -> Result<(), AppError> {
    auth.require(Role::Operator)?;
    state.overlay.release(&runner).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub released: Vec<String>,
}

/// Release every allocation belonging to a Runner the registry no longer
/// knows about (invariant 4: allocations must track live Runners).
async fn cleanup(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<CleanupResponse>, AppError> {
    auth.require(Role::Operator)?;
    let known_nodes = state.registry.list().await;
    let known: std::collections::HashSet<String> =
        known_nodes.into_iter().map(|n| n.hostname).collect();

    let mut released = Vec::new();
    for allocation in state.overlay.list().await {
        if !known.contains(&allocation.hostname) {
            state.overlay.release(&allocation.hostname).await?;
            released.push(allocation.hostname);
        }
    }
    Ok(Json(CleanupResponse { released }))
}

#[derive(Debug, Deserialize)]
pub struct ReserveIpRequest {
    pub hostname: String,
    pub host_offset: u32,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReserveIpResponse {
    pub ip: String,
    pub token: String,
    pub expiry: chrono::DateTime<chrono::Utc>,
}

async fn reserve(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<ReserveIpRequest>,
) -> Result<Json<ReserveIpResponse>, AppError> {
    auth.require(Role::User)?;
    let ttl = Duration::minutes(req.ttl_minutes.unwrap_or(DEFAULT_RESERVATION_TTL_MINUTES));
    let (reservation, token) = reserve_ip(
        &state.overlay,
        &state.ip_reservation_signer,
        &req.hostname,
        req.host_offset,
        ttl,
    )
    .await?;
    Ok(Json(ReserveIpResponse {
        ip: reservation.ip,
        token,
        expiry: reservation.expiry,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseIpRequest {
    pub token: String,
    pub hostname: String,
}

/// Tokens are single-logical-use by convention only (§4.7); this endpoint
/// exists for Runner bookkeeping symmetry but there is no server-side
/// reservation table to remove an entry from.
async fn ip_release(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<ReleaseIpRequest>,
) -> Result<(), AppError> {
    auth.require(Role::User)?;
    state
        .ip_reservation_signer
        .verify(&req.token, &req.hostname)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ValidateIpRequest {
    pub token: String,
    pub hostname: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateIpResponse {
    pub ip: String,
    pub expiry: chrono::DateTime<chrono::Utc>,
}

async fn validate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateIpRequest>,
) -> Result<Json<ValidateIpResponse>, AppError> {
    let reservation = state
        .ip_reservation_signer
        .verify(&req.token, &req.hostname)?;
    Ok(Json(ValidateIpResponse {
        ip: reservation.ip,
        expiry: reservation.expiry,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HostnameQuery {
    pub hostname: String,
}

#[derive(Debug, Serialize)]
pub struct AvailableResponse {
    pub subnet_cidr: String,
}

async fn available(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(q): Query<HostnameQuery>,
) -> Result<Json<AvailableResponse>, AppError> {
    auth.require(Role::Viewer)?;
    let allocation = state.overlay.get(&q.hostname).await?;
    Ok(Json(AvailableResponse {
        subnet_cidr: allocation.subnet_cidr,
    }))
}

async fn info(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(q): Query<HostnameQuery>,
) -> Result<Json<OverlayAllocation>, AppError> {
    auth.require(Role::Viewer)?;
    let allocation = state.overlay.get(&q.hostname).await?;
    Ok(Json(allocation))
}

/// There is no durable reservation ledger (§4.7: tokens are stateless and
/// self-verifying), so this simply reports every live overlay allocation as
/// the set of known reservation scopes.
async fn reservations(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<OverlayAllocation>>, AppError> {
    auth.require(Role::Viewer)?;
    Ok(Json(state.overlay.list().await))
}
