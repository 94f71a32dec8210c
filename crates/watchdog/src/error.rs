use thiserror::Error;

/// Errors surfaced by watchdog implementations.
#[derive(Debug, Clone, Error)]
pub enum WatchdogError {
    #[error("watchdog is already running")]
    AlreadyRunning,

    #[error("watchdog supervision loop failed: {0}")]
    Loop(String),
}
