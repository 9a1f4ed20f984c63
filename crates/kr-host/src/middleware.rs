//! Auth middleware: resolves a request's credentials into an [`AuthContext`]
//! and attaches it as a request extension (§4.10).
//!
//! Resolution order: a configured admin-secret header, then a session
//! cookie, then a bearer token; anything that fails to resolve falls back
//! to anonymous rather than rejecting the request outright — route
//! handlers enforce the role floor they need via [`AuthContext::require`].

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;

use kr_core::auth::Role;

use crate::error::AppError;
use crate::state::AppState;

const ADMIN_SECRET_HEADER: &str = "x-kohakuriver-admin-secret";
const SESSION_COOKIE: &str = "kr_session";

/// The caller's resolved identity and role for this request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub username: Option<String>,
    pub role: Role,
}

impl AuthContext {
    fn anonymous() -> Self {
        Self {
            username: None,
            role: Role::Anony,
        }
    }

    /// Reject the request unless the resolved role meets `minimum`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] with `Unauthorized` if no credentials resolved
    /// at all, or `Forbidden` if credentials resolved below `minimum`.
    pub fn require(&self, minimum: Role) -> Result<(), AppError> {
        if self.role.satisfies(minimum) {
            return Ok(());
        }
        if self.role == Role::Anony {
            Err(AppError::new(
                kr_common::ErrorKind::Unauthorized,
                "authentication required",
            ))
        } else {
            Err(AppError::new(
                kr_common::ErrorKind::Forbidden,
                "caller's role is insufficient",
            ))
        }
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let cookie_header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookie_header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Resolve credentials and attach an [`AuthContext`] extension.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let headers = req.headers();

    let ctx = if let Some(secret) = headers.get(ADMIN_SECRET_HEADER).and_then(|v| v.to_str().ok())
        && state.config.admin_secret.as_deref() == Some(secret)
    {
        AuthContext {
            username: None,
            role: Role::Admin,
        }
    } else if let Some(session_id) = cookie_value(headers, SESSION_COOKIE) {
        match state.auth.validate_session(session_id).await {
            Ok(user) => AuthContext {
                username: Some(user.username),
                role: user.role,
            },
            Err(_) => AuthContext::anonymous(),
        }
    } else if let Some(token) = bearer_token(headers) {
        match state.auth.validate_token(token).await {
            Ok(user) => AuthContext {
                username: Some(user.username),
                role: user.role,
            },
            Err(_) => AuthContext::anonymous(),
        }
    } else {
        AuthContext::anonymous()
    };

    req.extensions_mut().insert(ctx);
    next.run(req).await
}
