//! The task manager: public entry point that owns every other component.
//!
//! Split into focused submodules:
//! - `core`: shared state, construction, submission and read APIs
//! - `lifecycle`: start/stop and the scheduling loop
//! - `outcome`: executor hooks, retry policy and dependent resolution
//! - `control`: cancel and wait
//! - `supervision`: watchdog notification handlers
//! - `report`: human-readable status report

mod control;
mod core;
mod lifecycle;
mod outcome;
mod report;
mod supervision;

pub use self::core::{ManagerState, TaskManager};
