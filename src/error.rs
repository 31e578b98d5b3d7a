//! Unified error handling for the predio crate
//!
//! Domain-specific errors (`RegistryError`, `CheckpointError`,
//! `DispatchError`) are consolidated into a single [`Error`] enum so they can
//! cross module boundaries without losing detail. Commands and `main` work in
//! `anyhow::Result` and attach context; library code returns these types.
//!
//! Two taxonomy notes that shape the rest of the crate:
//!
//! - A denied resource admission is a *deferral*, not an error. The monitor
//!   returns `false` and the dispatcher skips the cycle; no `Err` is ever
//!   produced for it.
//! - Executor failures are *data*: a failed attempt comes back as an
//!   `ExecutionReport` carrying an [`crate::models::ErrorKind`], feeding the
//!   retry ladder. Even spawn faults fold into a failed report so the worker
//!   pool forwards exactly one shape.

use std::io;
use thiserror::Error;

use crate::models::TaskStatus;

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Errors from the task registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Task id does not exist in the registry
    #[error("task not found: {task_id}")]
    NotFound { task_id: String },

    /// Requested status change is not allowed by the state machine
    #[error("invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Persisted store exists but cannot be trusted; fatal at startup
    #[error("registry corrupted: {reason}")]
    Corruption { reason: String },

    /// Underlying SQLite failure
    #[error("registry database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl RegistryError {
    pub fn corruption(reason: impl Into<String>) -> Self {
        Self::Corruption {
            reason: reason.into(),
        }
    }

    /// Corruption and database faults must abort startup; the rest are
    /// per-task conditions the dispatcher handles inline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::Database(_))
    }
}

/// Errors from checkpoint persistence
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Document exists but its version or shape is unusable
    #[error("unreadable checkpoint: {reason}")]
    Unreadable { reason: String },
}

impl CheckpointError {
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

/// Errors raised inside the dispatcher loop
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Child-task enqueue failed after a successful parent; logged, never
    /// fails the parent
    #[error("dependency enqueue failed for parent {parent_id}: {reason}")]
    Dependency { parent_id: String, reason: String },

    /// Worker completion channel closed unexpectedly
    #[error("worker completion channel closed")]
    ChannelClosed,
}

/// Unified error type for the predio crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Registry and checkpoint persistence
    Storage,
    /// Scheduling and worker coordination
    Dispatch,
    /// Configuration and validation
    Config,
    /// Everything else
    Other,
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is recoverable (the operation can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Registry(e) => !e.is_fatal(),
            Self::Checkpoint(_) => true, // next cycle overwrites the document
            Self::Dispatch(e) => !matches!(e, DispatchError::ChannelClosed),
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Config(_) => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Registry(_) | Self::Checkpoint(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Dispatch(_) => ErrorCategory::Dispatch,
            Self::Config(_) => ErrorCategory::Config,
            Self::Json(_) => ErrorCategory::Other,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
