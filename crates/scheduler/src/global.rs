//! Optional process-wide manager for callers that do not thread one through.
//!
//! Nothing is created implicitly: call [`init`] (or [`install`]) once at
//! startup, then [`get`] anywhere.

use std::sync::OnceLock;

use taskmill_core::TaskmillConfig;
use tracing::info;

use crate::error::TaskError;
use crate::manager::TaskManager;

static GLOBAL: OnceLock<TaskManager> = OnceLock::new();

/// Build the global manager from config. Errors if one already exists.
pub fn init(config: &TaskmillConfig) -> Result<&'static TaskManager, TaskError> {
    let manager = TaskManager::new(config)?;
    install(manager)
}

/// Install an already constructed manager as the global one.
pub fn install(manager: TaskManager) -> Result<&'static TaskManager, TaskError> {
    let mut installed = false;
    let global = GLOBAL.get_or_init(|| {
        installed = true;
        manager
    });
    if !installed {
        return Err(TaskError::AlreadyInitialized);
    }
    info!("global task manager initialized");
    Ok(global)
}

/// The global manager, if [`init`] has run.
pub fn get() -> Option<&'static TaskManager> {
    GLOBAL.get()
}
