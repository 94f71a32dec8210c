use std::sync::Arc;
use std::time::Duration;

use taskmill_watchdog::WatchdogError;
use thiserror::Error;

use crate::model::{CancelReason, TaskId};

/// Errors surfaced by the task manager API.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("task manager is not running")]
    NotRunning,

    #[error("invalid task config: {0}")]
    InvalidConfig(String),

    #[error("task id already in use: {0}")]
    DuplicateId(TaskId),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} failed: {error:#}")]
    Failed {
        id: TaskId,
        error: Arc<anyhow::Error>,
    },

    #[error("task {id} cancelled: {reason}")]
    Cancelled { id: TaskId, reason: CancelReason },

    #[error("timed out after {timeout:?} waiting for task {id}")]
    WaitTimeout { id: TaskId, timeout: Duration },

    #[error("task {0} is not terminal and cannot be evicted")]
    NotTerminal(TaskId),

    #[error("watchdog error: {0}")]
    Watchdog(#[from] WatchdogError),

    #[error("global task manager already initialized")]
    AlreadyInitialized,
}
