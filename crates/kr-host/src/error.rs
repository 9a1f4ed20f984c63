//! HTTP error types for the Host API.
//!
//! Maps domain errors from `kr-core` into HTTP responses carrying the
//! `ErrorKind` taxonomy from §7. Every error variant produces a JSON body
//! with a machine-readable `error` field and a human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kr_common::ErrorKind;
use serde::Serialize;

use kr_core::error::{
    AuthError, IpReservationError, OverlayError, RegistryError, SchedulerError, StoreError,
};

/// Application-level error returned from HTTP handlers, carrying the
/// `ErrorKind` used for both the HTTP status and the WebSocket close code.
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let error_type = match self.kind {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::RunnerUnavailable => "runner_unavailable",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::InternalError => "internal_error",
        };
        let body = ErrorBody {
            error: error_type,
            message: self.message,
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        let kind = err.kind();
        Self::new(kind, err.to_string())
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        let kind = err.kind();
        Self::new(kind, err.to_string())
    }
}

impl From<OverlayError> for AppError {
    fn from(err: OverlayError) -> Self {
        let kind = err.kind();
        Self::new(kind, err.to_string())
    }
}

impl From<IpReservationError> for AppError {
    fn from(err: IpReservationError) -> Self {
        let kind = err.kind();
        Self::new(kind, err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let kind = err.kind();
        Self::new(kind, err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let kind = err.kind();
        Self::new(kind, err.to_string())
    }
}
