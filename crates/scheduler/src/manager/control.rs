use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::TaskError;
use crate::model::{CancelReason, TaskId, TaskOutcome, TaskState};

use super::core::Inner;
use super::TaskManager;

impl TaskManager {
    /// Cancel a task.
    ///
    /// QUEUED, WAITING and RETRYING tasks become CANCELLED immediately. A
    /// RUNNING task is signalled and becomes CANCELLED once its executor
    /// observes the signal. Returns false for unknown or terminal tasks.
    pub fn cancel(&self, id: &TaskId) -> bool {
        self.inner.cancel_with_reason(id, CancelReason::Requested)
    }

    /// Wait for a task to reach a terminal state and return its result.
    ///
    /// `timeout = None` waits indefinitely. A timeout only abandons the wait;
    /// the task keeps running.
    pub async fn wait(&self, id: &TaskId, timeout: Option<Duration>) -> Result<Value, TaskError> {
        let mut terminal = match self.inner.table().get(id) {
            Some(task) => task.subscribe(),
            None => return Err(TaskError::NotFound(id.clone())),
        };

        let outcome = {
            let settled = terminal.wait_for(Option::is_some);
            let settled = match timeout {
                Some(limit) => tokio::time::timeout(limit, settled).await.map_err(|_| {
                    TaskError::WaitTimeout {
                        id: id.clone(),
                        timeout: limit,
                    }
                })?,
                None => settled.await,
            };
            settled
                .map_err(|_| TaskError::NotFound(id.clone()))?
                .clone()
        };

        match outcome {
            Some(TaskOutcome::Completed(value)) => Ok(value),
            Some(TaskOutcome::Failed(error)) => Err(TaskError::Failed {
                id: id.clone(),
                error,
            }),
            Some(TaskOutcome::Cancelled(reason)) => Err(TaskError::Cancelled {
                id: id.clone(),
                reason,
            }),
            None => Err(TaskError::NotFound(id.clone())),
        }
    }
}

impl Inner {
    pub(super) fn cancel_with_reason(&self, id: &TaskId, reason: CancelReason) -> bool {
        {
            let mut table = self.table();
            let Some(task) = table.get_mut(id) else {
                debug!(task_id = %id, "cancel for unknown task");
                return false;
            };

            match task.state() {
                TaskState::Running => {
                    let Some(handle) = &task.handle else {
                        return false;
                    };
                    task.cancel_reason.get_or_insert(reason.clone());
                    handle.cancel();
                    info!(task_id = %id, reason = %reason, "cancellation requested");
                    return true;
                }
                TaskState::Queued | TaskState::Waiting | TaskState::Retrying => {
                    if !task.finish(TaskOutcome::Cancelled(reason.clone())) {
                        return false;
                    }
                }
                TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {
                    debug!(task_id = %id, state = %task.state(), "cancel on terminal task ignored");
                    return false;
                }
            }
        }

        self.queue.remove(id);
        self.counters().cancelled += 1;
        info!(task_id = %id, reason = %reason, "task cancelled");
        self.settle_dependents(id);
        true
    }
}
