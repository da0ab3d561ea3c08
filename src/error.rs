//! Error types for the pool orchestrator and its collaborators.
//!
//! Capacity errors (`PoolFull`, `PoolExhausted`) are retryable signals for
//! callers; `NotFound` and `InvalidConfig` are client errors that leave pool
//! state untouched. Backend and store failures abort the triggering request
//! but never the process.

use thiserror::Error;
use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors surfaced by pool orchestrator operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool is at `max_size`; no new container can be created.
    #[error("pool is at capacity ({current}/{max})")]
    PoolFull { current: u32, max: u32 },

    /// An allocation could not be satisfied (capacity or a failed start).
    #[error("no container available for owner '{owner_key}': {reason}")]
    PoolExhausted { owner_key: String, reason: String },

    /// The referenced container does not exist.
    #[error("unknown container {id}")]
    NotFound { id: Uuid },

    /// A configuration update failed validation; no fields were applied.
    #[error("invalid pool configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The orchestrator task is no longer running.
    #[error("pool orchestrator is shut down")]
    Shutdown,
}

/// Errors from the durable store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {reason}")]
    Connection { reason: String },

    #[error("store query failed: {reason}")]
    Query { reason: String },

    #[error("corrupt row in table '{table}': {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// Errors from the container backend collaborator.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to start container {id}: {reason}")]
    StartFailed { id: Uuid, reason: String },

    #[error("failed to kill container {id}: {reason}")]
    KillFailed { id: Uuid, reason: String },

    #[error("failed to forward request to container {id}: {reason}")]
    ForwardFailed { id: Uuid, reason: String },

    #[error("container backend unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors while resolving configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

impl PoolError {
    /// Stable machine-readable tag used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoolFull { .. } => "pool_full",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::NotFound { .. } => "not_found",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::Store(_) => "store_error",
            Self::Backend(_) => "backend_error",
            Self::Shutdown => "shutdown",
        }
    }
}
