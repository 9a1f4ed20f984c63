//! Authentication routes: `/api/auth/*` (§4.10, §6).

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use kr_core::auth::Role;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

const SESSION_COOKIE: &str = "kr_session";

/// Build the auth routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/status", get(status))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/register", post(register))
        .route("/auth/me", get(me))
        .route("/auth/tokens", post(issue_token))
        .route("/auth/tokens", delete(revoke_token))
        .route("/auth/invitations", post(create_invitation))
}

#[derive(Debug, Serialize)]
pub struct AuthStatusResponse {
    pub authenticated: bool,
    pub username: Option<String>,
    pub role: Role,
}

async fn status(Extension(auth): Extension<AuthContext>) -> Json<AuthStatusResponse> {
    Json(AuthStatusResponse {
        authenticated: auth.username.is_some(),
        username: auth.username,
        role: auth.role,
    })
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[allow(clippy::expect_used)]
async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, AppError> {
    let session = state.auth.login(&req.username, &req.password).await?;
    let role = state
        .auth
        .get_user(&req.username)
        .await
        .map_or(Role::User, |user| user.role);
    let cookie = format!(
        "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Strict",
        session.id
    );
    let mut response = Json(AuthStatusResponse {
        authenticated: true,
        username: Some(req.username),
        role,
    })
    .into_response();
    response
        .headers_mut()
        .insert(SET_COOKIE, cookie.parse().expect("cookie header is valid ascii"));
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub session_id: String,
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LogoutRequest>,
) -> Result<(), AppError> {
    state.auth.logout(&req.session_id).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub invitation_token: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<AuthStatusResponse>, AppError> {
    let user = state
        .auth
        .register(&req.username, &req.password, &req.invitation_token)
        .await?;
    Ok(Json(AuthStatusResponse {
        authenticated: true,
        username: Some(user.username),
        role: user.role,
    }))
}

async fn me(Extension(auth): Extension<AuthContext>) -> Result<Json<AuthStatusResponse>, AppError> {
    auth.require(Role::Viewer)?;
    Ok(Json(AuthStatusResponse {
        authenticated: true,
        username: auth.username,
        role: auth.role,
    }))
}

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct IssueTokenResponse {
    pub token: String,
}

async fn issue_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<Json<IssueTokenResponse>, AppError> {
    auth.require(Role::User)?;
    let username = auth
        .username
        .ok_or_else(|| AppError::new(kr_common::ErrorKind::Unauthorized, "no session user"))?;
    let token = state.auth.issue_token(&username, &req.name).await?;
    Ok(Json(IssueTokenResponse { token }))
}

#[derive(Debug, Deserialize)]
pub struct RevokeTokenRequest {
    pub token: String,
}

async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<RevokeTokenRequest>,
) -> Result<(), AppError> {
    auth.require(Role::User)?;
    state.auth.revoke_token(&req.token).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateInvitationRequest {
    pub role: Role,
    pub group: Option<String>,
    pub max_uses: u32,
    pub ttl_hours: i64,
}

#[derive(Debug, Serialize)]
pub struct InvitationResponse {
    pub token: String,
    pub role: Role,
}

async fn create_invitation(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateInvitationRequest>,
) -> Result<Json<InvitationResponse>, AppError> {
    auth.require(Role::Operator)?;
    let invitation = state
        .auth
        .create_invitation(
            auth.role,
            req.role,
            req.group,
            req.max_uses,
            chrono::Duration::hours(req.ttl_hours),
        )
        .await?;
    Ok(Json(InvitationResponse {
        token: invitation.token,
        role: invitation.role,
    }))
}
