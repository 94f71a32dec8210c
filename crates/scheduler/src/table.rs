use std::collections::HashMap;

use taskmill_watchdog::WatchdogId;

use crate::model::{ManagedTask, TaskId, TaskSnapshot, TaskState};

/// Owned store of every managed task, keyed by id.
///
/// The manager keeps it behind one mutex; nothing hands out references that
/// outlive the lock, callers get [`TaskSnapshot`]s instead.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<TaskId, ManagedTask>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task. Returns the task back if the id is taken.
    pub fn insert(&mut self, task: ManagedTask) -> Result<(), ManagedTask> {
        if self.tasks.contains_key(task.id()) {
            return Err(task);
        }
        self.tasks.insert(task.id().clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&ManagedTask> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut ManagedTask> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<ManagedTask> {
        self.tasks.remove(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedTask> {
        self.tasks.values()
    }

    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state == state).count()
    }

    /// Ids currently in `state`, sorted for a stable visiting order.
    pub fn ids_in(&self, state: TaskState) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Resolve a watchdog registration back to its task.
    pub fn find_by_watchdog_id(&mut self, watchdog_id: &WatchdogId) -> Option<&mut ManagedTask> {
        self.tasks
            .values_mut()
            .find(|t| t.watchdog_id.as_ref() == Some(watchdog_id))
    }

    /// Snapshots ordered by creation time.
    pub fn snapshots(&self, state: Option<TaskState>) -> Vec<TaskSnapshot> {
        let mut snaps: Vec<TaskSnapshot> = self
            .tasks
            .values()
            .filter(|t| state.map_or(true, |s| t.state == s))
            .map(ManagedTask::snapshot)
            .collect();
        snaps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snaps
    }
}
