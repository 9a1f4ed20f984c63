//! Shared error taxonomy.
//!
//! Every domain error in the Host and Runner maps to one of these kinds so
//! HTTP responses and WebSocket close codes can be derived uniformly instead
//! of ad-hoc per-handler logic.

use serde::{Deserialize, Serialize};

/// The error taxonomy used across the Host and Runner.
///
/// Domain error enums (`SchedulerError`, `RegistryError`, `OverlayError`, ...)
/// each implement a `kind() -> ErrorKind` method so the HTTP and WebSocket
/// layers can map them to a status code or close code without matching on
/// every concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input — request failed schema or semantic validation.
    BadRequest,
    /// No credentials, or credentials that do not resolve to any role above anonymous.
    Unauthorized,
    /// Credentials resolved but the caller's role is insufficient.
    Forbidden,
    /// Referenced entity does not exist.
    NotFound,
    /// The target resource is in the wrong state for the requested operation.
    Conflict,
    /// Insufficient cores, memory, or GPUs to satisfy the request.
    ResourceExhausted,
    /// The target Runner could not be reached.
    RunnerUnavailable,
    /// An upstream call (Runner dispatch, QMP, subprocess) exceeded its deadline.
    UpstreamTimeout,
    /// An unexpected internal failure; detail is not surfaced to the caller.
    InternalError,
}

impl ErrorKind {
    /// Map to the HTTP status code used by the Host and Runner APIs.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::ResourceExhausted => 429,
            Self::RunnerUnavailable | Self::UpstreamTimeout => 502,
            Self::InternalError => 500,
        }
    }

    /// Map to the WebSocket close code used by the tunnel proxy (§7: "a
    /// tunnel chain failure closes all participating WebSockets with a
    /// WebSocket close code encoding the kind").
    #[must_use]
    pub fn ws_close_code(self) -> u16 {
        match self {
            Self::Unauthorized | Self::Forbidden => 1008,
            Self::UpstreamTimeout | Self::RunnerUnavailable => 1011,
            _ => 1011,
        }
    }
}
