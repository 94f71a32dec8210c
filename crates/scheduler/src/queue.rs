use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::model::{Priority, TaskId};

/// One FIFO ready-queue per priority level.
///
/// Dequeue is strict priority: a lower level is only served when every
/// higher level is empty. An id is queued at most once at a time.
#[derive(Debug, Default)]
pub struct PriorityScheduler {
    lanes: Mutex<Lanes>,
    ready: Notify,
}

#[derive(Debug, Default)]
struct Lanes {
    queues: [VecDeque<TaskId>; 4],
    queued: HashSet<TaskId>,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an id. Returns false if it is already queued.
    pub fn enqueue(&self, id: TaskId, priority: Priority) -> bool {
        {
            let mut lanes = self.lanes();
            if !lanes.queued.insert(id.clone()) {
                return false;
            }
            lanes.queues[priority.index()].push_back(id);
        }
        self.ready.notify_one();
        true
    }

    /// Pop the next id without waiting.
    pub fn try_dequeue(&self) -> Option<TaskId> {
        let mut lanes = self.lanes();
        for priority in Priority::ALL.iter().rev() {
            if let Some(id) = lanes.queues[priority.index()].pop_front() {
                lanes.queued.remove(&id);
                return Some(id);
            }
        }
        None
    }

    /// Pop the next id, waiting up to `timeout` for one to arrive.
    pub async fn dequeue(&self, timeout: Duration) -> Option<TaskId> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_dequeue() {
                return Some(id);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_dequeue();
            }
        }
    }

    /// Drop a queued id. Returns false if it was not queued.
    pub fn remove(&self, id: &TaskId) -> bool {
        let mut lanes = self.lanes();
        if !lanes.queued.remove(id) {
            return false;
        }
        for queue in lanes.queues.iter_mut() {
            queue.retain(|queued| queued != id);
        }
        true
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.lanes().queued.contains(id)
    }

    pub fn len(&self) -> usize {
        self.lanes().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, priority: Priority) -> usize {
        self.lanes().queues[priority.index()].len()
    }
}
