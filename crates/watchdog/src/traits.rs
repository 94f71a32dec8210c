use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WatchdogError;
use crate::handle::TaskHandle;

/// Free-form metadata attached to a registration.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Opaque id returned by [`Watchdog::register`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchdogId(Uuid);

impl WatchdogId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WatchdogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WatchdogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd-{}", self.0)
    }
}

/// Diagnostics delivered to timeout and error callbacks.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogEvent {
    pub id: WatchdogId,
    pub name: String,
    /// Time since registration when the event was raised.
    pub elapsed: Duration,
    pub timeout: Option<Duration>,
    /// Failure message, for error events.
    pub error: Option<String>,
    pub metadata: Metadata,
}

/// Callback invoked for watchdog events. Runs on the supervision task, so it
/// must not block.
pub type WatchdogCallback = Arc<dyn Fn(&WatchdogEvent) + Send + Sync>;

/// The supervision contract a task executor talks to.
///
/// Executors are clients of `register`/`unregister`; task managers are the
/// server side of the two callback kinds.
#[async_trait]
pub trait Watchdog: Send + Sync {
    /// Begin supervising. Registrations made before `start` are kept.
    async fn start(&self) -> Result<(), WatchdogError>;

    /// Stop supervising. Registrations and callbacks are kept.
    async fn stop(&self) -> Result<(), WatchdogError>;

    /// Track a running handle. `timeout = None` disables overrun detection.
    fn register(
        &self,
        handle: TaskHandle,
        name: &str,
        timeout: Option<Duration>,
        metadata: &Metadata,
    ) -> WatchdogId;

    /// Forget a registration. Returns false if it was unknown.
    ///
    /// A failure the handle reported that no error callback has seen yet is
    /// delivered to the error callbacks before the registration is dropped.
    fn unregister(&self, id: &WatchdogId) -> bool;

    fn add_timeout_callback(&self, callback: WatchdogCallback);

    fn add_error_callback(&self, callback: WatchdogCallback);
}
