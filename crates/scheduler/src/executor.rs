use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use taskmill_core::panic_message;
use taskmill_watchdog::{HandleStatus, Metadata, TaskHandle, Watchdog, WatchdogId};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{Cancelled, TaskContext, TaskId, WorkUnit};

/// Everything the executor needs to run one attempt, handed out by
/// [`ExecutionHooks::begin`] once the task is RUNNING.
pub struct Launch {
    pub name: String,
    pub work: WorkUnit,
    pub context: TaskContext,
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
    /// Register the handle with the watchdog.
    pub observe: bool,
}

/// How one attempt ended.
#[derive(Debug)]
pub enum Outcome {
    Succeeded(Value),
    Failed(anyhow::Error),
    Cancelled,
}

impl Outcome {
    fn handle_status(&self) -> HandleStatus {
        match self {
            Outcome::Succeeded(_) => HandleStatus::Finished,
            Outcome::Failed(e) => HandleStatus::Failed(format!("{e:#}")),
            Outcome::Cancelled => HandleStatus::Cancelled,
        }
    }
}

/// The manager side of an execution. The executor drives these in order:
/// `begin`, optionally `attach_watchdog`, then exactly one of the outcome
/// hooks.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    /// Move a QUEUED task to RUNNING. `None` if it is no longer QUEUED.
    fn begin(&self, id: &TaskId, handle: &TaskHandle) -> Option<Launch>;

    fn attach_watchdog(&self, id: &TaskId, watchdog_id: WatchdogId);

    async fn on_success(&self, id: &TaskId, output: Value);

    async fn on_error(&self, id: &TaskId, error: anyhow::Error);

    async fn on_cancelled(&self, id: &TaskId);
}

/// Slot and watchdog registration held for the lifetime of one attempt.
struct RunGuard {
    id: TaskId,
    _permit: OwnedSemaphorePermit,
    watchdog: Option<(Arc<dyn Watchdog>, WatchdogId)>,
}

impl RunGuard {
    fn unregister(&mut self) {
        if let Some((watchdog, watchdog_id)) = self.watchdog.take() {
            if !watchdog.unregister(&watchdog_id) {
                debug!(task_id = %self.id, watchdog_id = %watchdog_id, "watchdog registration already gone");
            }
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Runs single task attempts. The caller acquires the gate slot and hands
/// its permit over, so a task only leaves the ready queue once it can start.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskExecutor;

impl TaskExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run the attempt on `permit` and report its outcome through `hooks`.
    ///
    /// The watchdog registration is dropped as soon as the work ends and the
    /// slot when this returns, whatever the hooks do.
    pub async fn run(
        &self,
        id: TaskId,
        permit: OwnedSemaphorePermit,
        hooks: Arc<dyn ExecutionHooks>,
        watchdog: Option<Arc<dyn Watchdog>>,
    ) {
        let (handle, reporter) = TaskHandle::new();
        let Some(launch) = hooks.begin(&id, &handle) else {
            debug!(task_id = %id, "task no longer queued, skipping");
            return;
        };

        let mut guard = RunGuard {
            id: id.clone(),
            _permit: permit,
            watchdog: None,
        };
        if launch.observe {
            if let Some(watchdog) = watchdog {
                let watchdog_id =
                    watchdog.register(handle.clone(), &launch.name, launch.timeout, &launch.metadata);
                hooks.attach_watchdog(&id, watchdog_id.clone());
                guard.watchdog = Some((watchdog, watchdog_id));
            }
        }

        let outcome = Self::drive(launch.work, launch.context, handle.token().clone()).await;
        reporter.report(outcome.handle_status());
        // Before the hooks, so a failure reaches the watchdog's error
        // callbacks while the task still carries its registration.
        guard.unregister();

        match outcome {
            Outcome::Succeeded(output) => hooks.on_success(&id, output).await,
            Outcome::Failed(error) => hooks.on_error(&id, error).await,
            Outcome::Cancelled => hooks.on_cancelled(&id).await,
        }
        drop(guard);
    }

    /// Run the work on its own tokio task and race it against cancellation.
    async fn drive(work: WorkUnit, context: TaskContext, token: CancellationToken) -> Outcome {
        let mut join = tokio::spawn(async move { work(context).await });

        tokio::select! {
            biased;
            joined = &mut join => match joined {
                Ok(Ok(output)) => Outcome::Succeeded(output),
                Ok(Err(e)) if e.is::<Cancelled>() || token.is_cancelled() => Outcome::Cancelled,
                Ok(Err(e)) => Outcome::Failed(e),
                Err(e) if e.is_cancelled() => Outcome::Cancelled,
                Err(e) => {
                    let message = panic_message(e.into_panic().as_ref());
                    warn!(panic = %message, "work unit panicked");
                    Outcome::Failed(anyhow::anyhow!("work panicked: {message}"))
                }
            },
            _ = token.cancelled() => {
                join.abort();
                let _ = join.await;
                Outcome::Cancelled
            }
        }
    }
}
