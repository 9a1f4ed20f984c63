//! Domain errors for the Runner, and their mapping to HTTP responses.
//!
//! Mirrors `kr-host::error`: each subsystem gets its own `thiserror` enum
//! with a `kind() -> ErrorKind`, and `AppError` is the single type handlers
//! return, implementing `IntoResponse` by way of that kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kr_common::ErrorKind;
use serde::Serialize;
use thiserror::Error;

/// Errors from the task executor (§4.3).
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task {task_id} is not tracked locally")]
    NotTracked { task_id: u64 },
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),
    #[error("subprocess failed: {0}")]
    Subprocess(String),
    #[error("numa node {0} does not exist in local topology")]
    UnknownNuma(u32),
}

impl ExecutorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotTracked { .. } => ErrorKind::NotFound,
            Self::UnknownNuma(_) => ErrorKind::BadRequest,
            Self::Runtime(_) | Self::Subprocess(_) => ErrorKind::InternalError,
        }
    }
}

/// Errors from the VM VPS manager (§4.5) and QMP client.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("vm instance {task_id} not found")]
    NotFound { task_id: u64 },
    #[error("qmp socket error: {0}")]
    Qmp(String),
    #[error("qemu-img failed: {0}")]
    QemuImg(String),
    #[error("cloud-init watchdog timed out after {secs}s")]
    CloudInitTimeout { secs: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::CloudInitTimeout { .. } => ErrorKind::UpstreamTimeout,
            Self::Qmp(_) | Self::QemuImg(_) | Self::Io(_) => ErrorKind::InternalError,
        }
    }
}

/// Errors from the VFIO binder (§4.6).
#[derive(Debug, Error)]
pub enum VfioError {
    #[error("gpu index {0} not found")]
    UnknownGpu(u32),
    #[error("device {address} did not report the expected driver after bind/unbind")]
    BindVerifyFailed { address: String },
    #[error("sysfs io error on {path}: {source}")]
    Sysfs {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl VfioError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownGpu(_) => ErrorKind::BadRequest,
            Self::BindVerifyFailed { .. } | Self::Sysfs { .. } => ErrorKind::InternalError,
        }
    }
}

/// Errors from the overlay agent (§4.7 Runner side).
#[derive(Debug, Error)]
pub enum OverlayAgentError {
    #[error("netlink tool '{tool}' failed: {detail}")]
    ToolFailed { tool: String, detail: String },
    #[error("no overlay configuration has been applied yet")]
    NotConfigured,
}

impl OverlayAgentError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolFailed { .. } => ErrorKind::InternalError,
            Self::NotConfigured => ErrorKind::Conflict,
        }
    }
}

/// Errors from the tunnel server (§4.8 Runner side).
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("container tunnel {0} not found")]
    UnknownContainer(String),
    #[error("client id {0} not registered on this tunnel")]
    UnknownClientId(u32),
}

impl TunnelError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownContainer(_) | Self::UnknownClientId(_) => ErrorKind::NotFound,
        }
    }
}

/// Application-level error returned from HTTP handlers.
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

impl From<ExecutorError> for AppError {
    fn from(err: ExecutorError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<VmError> for AppError {
    fn from(err: VmError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<VfioError> for AppError {
    fn from(err: VfioError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<OverlayAgentError> for AppError {
    fn from(err: OverlayAgentError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<TunnelError> for AppError {
    fn from(err: TunnelError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}
