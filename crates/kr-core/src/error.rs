//! Error types for `kr-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Every enum exposes a `kind()` method so the Host's HTTP layer
//! can map it to a status code without matching on every variant.

use kr_common::ErrorKind;
use kr_storage::StorageError;

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage backend returned an error.
    #[error("store storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stored value failed to deserialize into the expected type.
    #[error("corrupt record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InternalError
    }
}

/// Errors from task submission, dispatch, and the state machine.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The requested target hostname does not name a registered Node.
    #[error("unknown or malformed target '{target}'")]
    BadTarget { target: String },

    /// No online Node has enough free cores/memory to satisfy the request.
    #[error("no Node available to satisfy the request")]
    NodeUnavailable,

    /// A requested GPU is already held by another non-terminal task.
    #[error("GPU {gpu} on '{hostname}' already held by a non-terminal task")]
    ResourceConflict { hostname: String, gpu: u32 },

    /// The NUMA node id does not exist in the target Node's topology.
    #[error("NUMA node {numa_node} not present on '{hostname}'")]
    UnknownNuma { hostname: String, numa_node: u32 },

    /// The caller's role does not permit this operation.
    #[error("caller lacks the role required for this operation")]
    Unauthorized,

    /// The task does not exist.
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: u64 },

    /// A requested state transition is not valid from the task's current state.
    #[error("invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: u64,
        from: kr_common::model::TaskStatus,
        to: kr_common::model::TaskStatus,
    },

    /// The store returned an error.
    #[error("scheduler store error: {0}")]
    Store(#[from] StoreError),
}

impl SchedulerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadTarget { .. } => ErrorKind::BadRequest,
            Self::NodeUnavailable => ErrorKind::ResourceExhausted,
            Self::ResourceConflict { .. } => ErrorKind::Conflict,
            Self::UnknownNuma { .. } => ErrorKind::BadRequest,
            Self::Unauthorized => ErrorKind::Forbidden,
            Self::TaskNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::Store(_) => ErrorKind::InternalError,
        }
    }
}

/// Errors from the Node registry and heartbeat monitor.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The Node does not exist.
    #[error("node '{hostname}' not found")]
    NotFound { hostname: String },

    /// The store returned an error.
    #[error("registry store error: {0}")]
    Store(#[from] StoreError),
}

impl RegistryError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::InternalError,
        }
    }
}

/// Errors from overlay subnet allocation.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// The overlay CIDR plan has no free slots remaining.
    #[error("overlay CIDR exhausted, no free subnet for '{hostname}'")]
    SubnetExhausted { hostname: String },

    /// No overlay allocation exists for the given Runner.
    #[error("no overlay allocation for '{hostname}'")]
    NotFound { hostname: String },

    /// The store returned an error.
    #[error("overlay store error: {0}")]
    Store(#[from] StoreError),
}

impl OverlayError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SubnetExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::InternalError,
        }
    }
}

/// Errors from IP reservation token issuance and validation.
#[derive(Debug, thiserror::Error)]
pub enum IpReservationError {
    /// The token's signature does not verify against the current key.
    #[error("IP reservation token signature invalid")]
    BadSignature,

    /// The token has expired.
    #[error("IP reservation token expired")]
    Expired,

    /// The token's embedded Runner does not match the target.
    #[error("IP reservation token is bound to a different runner")]
    RunnerMismatch,

    /// The token is malformed (wrong field count, bad hex, etc.)
    #[error("malformed IP reservation token: {reason}")]
    Malformed { reason: String },

    /// No free IP remains in the Runner's subnet.
    #[error("no free IP remaining in '{hostname}' subnet")]
    AddressesExhausted { hostname: String },

    /// The overlay layer returned an error.
    #[error("ip reservation overlay error: {0}")]
    Overlay(#[from] OverlayError),
}

impl IpReservationError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadSignature | Self::Expired | Self::RunnerMismatch | Self::Malformed { .. } => {
                ErrorKind::Conflict
            }
            Self::AddressesExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Overlay(e) => e.kind(),
        }
    }
}

/// Errors from the authentication core.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credentials, or credentials resolve to anonymous, for an operation
    /// that requires at least `viewer`.
    #[error("authentication required")]
    Unauthorized,

    /// The caller's role is insufficient for the requested operation.
    #[error("caller's role is insufficient")]
    Forbidden,

    /// Username already registered.
    #[error("username '{username}' already registered")]
    UsernameTaken { username: String },

    /// No such user, session, token, or invitation.
    #[error("{what} not found")]
    NotFound { what: String },

    /// Password does not match the stored hash.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The invitation has expired or exhausted its usage count.
    #[error("invitation is no longer valid")]
    InvitationInvalid,

    /// An admin attempted to demote, disable, or delete themselves.
    #[error("admins may not {action} themselves")]
    SelfProtection { action: &'static str },

    /// The store returned an error.
    #[error("auth store error: {0}")]
    Store(#[from] StoreError),

    /// bcrypt hashing or verification failed.
    #[error("password hashing error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

impl AuthError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Forbidden | Self::SelfProtection { .. } => ErrorKind::Forbidden,
            Self::UsernameTaken { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidCredentials => ErrorKind::Unauthorized,
            Self::InvitationInvalid => ErrorKind::Conflict,
            Self::Store(_) | Self::Bcrypt(_) => ErrorKind::InternalError,
        }
    }
}
