use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use taskmill_core::panic_message;
use taskmill_watchdog::WatchdogError;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::executor::ExecutionHooks;
use crate::model::{CancelReason, TaskId, TaskState};

use super::core::{Inner, Runtime};
use super::TaskManager;

/// Upper bound on waiting for executors to observe a forced cancellation.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

impl TaskManager {
    /// Start the watchdog and spawn the scheduling loop. Logs and returns if
    /// already running.
    pub async fn start(&self) -> Result<(), TaskError> {
        if self.inner.is_running() {
            warn!("task manager already running");
            return Ok(());
        }

        if let Some(watchdog) = &self.inner.watchdog {
            match watchdog.start().await {
                Ok(()) | Err(WatchdogError::AlreadyRunning) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let max_concurrent = self.inner.config.max_concurrent_tasks;
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut runtime = self.inner.runtime();
        if runtime.is_some() {
            warn!("task manager already running");
            return Ok(());
        }
        let scheduling_loop = tokio::spawn(Inner::scheduling_loop(
            Arc::clone(&self.inner),
            shutdown.clone(),
            tracker.clone(),
        ));
        *runtime = Some(Runtime {
            shutdown,
            tracker,
            scheduling_loop,
        });
        drop(runtime);

        info!(
            max_concurrent,
            watchdog = self.inner.watchdog.is_some(),
            "task manager started"
        );
        Ok(())
    }

    /// Stop the scheduling loop.
    ///
    /// With `force`, running tasks are cancelled right away. Otherwise they
    /// get `stop_grace_period` to finish before being cancelled. Queued tasks
    /// stay queued and run after the next `start()`. Idempotent.
    pub async fn stop(&self, force: bool) {
        let Some(runtime) = self.inner.runtime().take() else {
            debug!("task manager already stopped");
            return;
        };
        info!(force, "stopping task manager");

        runtime.shutdown.cancel();
        if let Err(e) = runtime.scheduling_loop.await {
            error!(error = %e, "scheduling loop ended abnormally");
        }
        runtime.tracker.close();

        if force {
            self.inner.cancel_running(CancelReason::Shutdown);
        } else {
            let grace = self.inner.config.stop_grace_period();
            if tokio::time::timeout(grace, runtime.tracker.wait())
                .await
                .is_err()
            {
                warn!(
                    grace_secs = grace.as_secs(),
                    running = runtime.tracker.len(),
                    "grace period elapsed, cancelling remaining tasks"
                );
                self.inner.cancel_running(CancelReason::Shutdown);
            }
        }

        if tokio::time::timeout(SETTLE_TIMEOUT, runtime.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = runtime.tracker.len(),
                "executors did not settle after cancellation, their slots stay taken"
            );
        }

        if let Some(watchdog) = &self.inner.watchdog {
            if let Err(e) = watchdog.stop().await {
                warn!(error = %e, "failed to stop watchdog");
            }
        }
        info!("task manager stopped");
    }
}

impl Inner {
    /// Pull ready ids and dispatch them until shutdown. A panicking
    /// iteration is logged and the loop carries on.
    pub(super) async fn scheduling_loop(
        self: Arc<Self>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) {
        debug!("scheduling loop started");
        loop {
            let iteration =
                AssertUnwindSafe(self.schedule_once(&shutdown, &tracker)).catch_unwind();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = iteration => {
                    if let Err(payload) = result {
                        error!(panic = %panic_message(payload.as_ref()), "scheduling iteration panicked");
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        debug!("scheduling loop exited");
    }

    /// Take a free slot, then the highest-priority ready id. Ids stay in the
    /// queue while every slot is busy, so priority decides who starts next.
    async fn schedule_once(&self, shutdown: &CancellationToken, tracker: &TaskTracker) {
        let wait = self.config.dequeue_timeout();
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            permit = Arc::clone(&self.gate).acquire_owned() => permit.ok(),
            _ = tokio::time::sleep(wait) => None,
        };
        if let Some(permit) = permit {
            if let Some(id) = self.queue.dequeue(wait).await {
                self.dispatch(id, permit, tracker);
            }
        }

        let resolution = {
            let mut table = self.table();
            self.dependencies.sweep(&mut table, &self.queue)
        };
        if !resolution.cancelled.is_empty() {
            self.counters().cancelled += resolution.cancelled.len() as u64;
        }
        if !resolution.is_empty() {
            debug!(
                promoted = resolution.promoted.len(),
                cancelled = resolution.cancelled.len(),
                "dependency sweep"
            );
        }
    }

    /// Hand a dequeued id and its slot to an executor on its own tokio task.
    fn dispatch(&self, id: TaskId, permit: OwnedSemaphorePermit, tracker: &TaskTracker) {
        let queued = matches!(
            self.table().get(&id).map(|t| t.state()),
            Some(TaskState::Queued)
        );
        if !queued {
            debug!(task_id = %id, "dropping stale queue entry");
            return;
        }
        let Some(inner) = self.me.upgrade() else {
            return;
        };

        let hooks: Arc<dyn ExecutionHooks> = inner;
        let executor = self.executor;
        let watchdog = self.watchdog.clone();
        debug!(task_id = %id, "dispatching task");
        tracker.spawn(async move {
            executor.run(id, permit, hooks, watchdog).await;
        });
    }

    /// Signal every RUNNING task's handle.
    pub(super) fn cancel_running(&self, reason: CancelReason) -> usize {
        let mut table = self.table();
        let mut cancelled = 0;
        for id in table.ids_in(TaskState::Running) {
            if let Some(task) = table.get_mut(&id) {
                if let Some(handle) = &task.handle {
                    task.cancel_reason.get_or_insert_with(|| reason.clone());
                    handle.cancel();
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            info!(count = cancelled, reason = %reason, "cancelling running tasks");
        }
        cancelled
    }
}
