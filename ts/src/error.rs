//! Store error taxonomy
//!
//! Conflict and InvalidState are caller mistakes or lost races; Unavailable
//! wraps transport/transaction failures talking to SQLite.

use thiserror::Error;

use crate::task::{TaskId, TaskState};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} already exists")]
    Conflict(TaskId),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {task_id} cannot transition from {state}")]
    InvalidState { task_id: TaskId, state: TaskState },

    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
}

/// Result from store operations
pub type StoreResult<T> = Result<T, StoreError>;
