use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use taskmill_watchdog::{TaskHandle, WatchdogId};
use tracing::{debug, error, info, warn};

use crate::callbacks::CallbackKind;
use crate::executor::{ExecutionHooks, Launch};
use crate::model::{CancelReason, TaskContext, TaskId, TaskOutcome, TaskState};

use super::core::Inner;

/// What to do after an attempt failed.
enum AfterError {
    Retry { attempt: u32, delay: Duration },
    Fail,
}

#[async_trait]
impl ExecutionHooks for Inner {
    fn begin(&self, id: &TaskId, handle: &TaskHandle) -> Option<Launch> {
        let mut table = self.table();
        let task = table.get_mut(id)?;
        if task.state() != TaskState::Queued || !task.transition(TaskState::Running) {
            return None;
        }
        task.started_at = Some(Utc::now());
        task.ended_at = None;
        task.handle = Some(handle.clone());

        let attempt = task.retry_count + 1;
        debug!(task_id = %id, name = %task.name, attempt, "task started");
        Some(Launch {
            name: task.name.clone(),
            work: Arc::clone(&task.work),
            context: TaskContext::new(id.clone(), attempt, handle.token().clone()),
            timeout: task.config.timeout,
            metadata: task.config.metadata.clone(),
            observe: task.config.enable_watchdog,
        })
    }

    fn attach_watchdog(&self, id: &TaskId, watchdog_id: WatchdogId) {
        if let Some(task) = self.table().get_mut(id) {
            task.watchdog_id = Some(watchdog_id);
        }
    }

    async fn on_success(&self, id: &TaskId, output: Value) {
        let finished = {
            let mut table = self.table();
            table.get_mut(id).and_then(|task| {
                task.cancel_reason = None;
                task.finish(TaskOutcome::Completed(output))
                    .then(|| (task.snapshot(), task.duration().unwrap_or_default()))
            })
        };
        let Some((snapshot, duration)) = finished else {
            return;
        };

        {
            let mut counters = self.counters();
            counters.completed += 1;
            counters.record_run(duration);
        }
        debug!(
            task_id = %id,
            name = %snapshot.name,
            duration_ms = duration.as_millis() as u64,
            "task completed"
        );

        self.callbacks.notify(CallbackKind::Complete, &snapshot).await;
        self.settle_dependents(id);
    }

    async fn on_error(&self, id: &TaskId, error: anyhow::Error) {
        let error = Arc::new(error);
        let decision = {
            let mut table = self.table();
            let Some(task) = table.get_mut(id) else {
                return;
            };
            if task.can_retry() && task.state() == TaskState::Running {
                task.retry_count += 1;
                task.error = Some(Arc::clone(&error));
                task.ended_at = Some(Utc::now());
                task.handle = None;
                task.transition(TaskState::Retrying);
                AfterError::Retry {
                    attempt: task.retry_count,
                    delay: task.config.retry_delay,
                }
            } else if task.finish(TaskOutcome::Failed(Arc::clone(&error))) {
                AfterError::Fail
            } else {
                return;
            }
        };

        match decision {
            AfterError::Retry { attempt, delay } => {
                self.counters().retried += 1;
                warn!(
                    task_id = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{error:#}"),
                    "task failed, retrying"
                );
                self.schedule_retry(id.clone(), delay);
            }
            AfterError::Fail => {
                self.counters().failed += 1;
                error!(task_id = %id, error = %format!("{error:#}"), "task failed");
                let snapshot = self.table().get(id).map(|t| t.snapshot());
                if let Some(snapshot) = snapshot {
                    self.callbacks.notify(CallbackKind::Failed, &snapshot).await;
                }
                self.settle_dependents(id);
            }
        }
    }

    async fn on_cancelled(&self, id: &TaskId) {
        let reason = {
            let mut table = self.table();
            let Some(task) = table.get_mut(id) else {
                return;
            };
            let reason = task
                .cancel_reason
                .clone()
                .unwrap_or(CancelReason::Requested);
            if !task.finish(TaskOutcome::Cancelled(reason.clone())) {
                return;
            }
            reason
        };
        self.counters().cancelled += 1;
        info!(task_id = %id, reason = %reason, "task cancelled");
        self.settle_dependents(id);
    }
}

impl Inner {
    /// Re-evaluate dependents of a task that just reached a terminal state.
    pub(super) fn settle_dependents(&self, id: &TaskId) {
        let resolution = {
            let mut table = self.table();
            self.dependencies
                .notify_dependents(&mut table, &self.queue, id)
        };
        if !resolution.cancelled.is_empty() {
            self.counters().cancelled += resolution.cancelled.len() as u64;
            info!(
                task_id = %id,
                cancelled = resolution.cancelled.len(),
                "dependents cancelled"
            );
        }
        if !resolution.promoted.is_empty() {
            debug!(task_id = %id, promoted = resolution.promoted.len(), "dependents queued");
        }
    }

    /// Put a RETRYING task back on the queue after `delay`, without holding a
    /// gate slot while waiting. Shutdown cuts the delay short.
    fn schedule_retry(&self, id: TaskId, delay: Duration) {
        let handles = self
            .runtime()
            .as_ref()
            .map(|rt| (rt.tracker.clone(), rt.shutdown.clone()));
        let Some(inner) = self.me.upgrade() else {
            return;
        };

        match handles {
            Some((tracker, shutdown)) if !delay.is_zero() => {
                tracker.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {}
                    }
                    inner.requeue(&id);
                });
            }
            _ => inner.requeue(&id),
        }
    }

    fn requeue(&self, id: &TaskId) {
        let mut table = self.table();
        if let Some(task) = table.get_mut(id) {
            if task.reset_for_retry() {
                task.cancel_reason = None;
                self.queue.enqueue(id.clone(), task.config.priority);
            }
        }
    }
}
