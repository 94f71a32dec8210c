//! In-process task scheduling and execution.
//!
//! Submit async work units to a [`TaskManager`]; it orders them by
//! [`Priority`], holds back tasks whose dependencies have not completed,
//! runs at most `max_concurrent_tasks` at once, retries failures, and cancels
//! tasks the watchdog reports as overrunning their timeout.

pub mod callbacks;
pub mod dependency;
pub mod error;
pub mod executor;
pub mod global;
pub mod manager;
pub mod model;
pub mod queue;
pub mod stats;
pub mod table;

pub use callbacks::{CallbackKind, CallbackRegistry, Observer};
pub use dependency::{DependencyTracker, Readiness, Resolution};
pub use error::TaskError;
pub use executor::{ExecutionHooks, Launch, Outcome, TaskExecutor};
pub use manager::{ManagerState, TaskManager};
pub use model::{
    work_unit, CancelReason, Cancelled, ManagedTask, Priority, TaskConfig, TaskContext, TaskId,
    TaskOutcome, TaskRequest, TaskSnapshot, TaskState, WorkUnit,
};
pub use queue::PriorityScheduler;
pub use stats::ManagerStats;
pub use table::TaskTable;
