use tracing::{debug, info, warn};

use crate::model::{CancelReason, TaskId, TaskOutcome, TaskState};
use crate::queue::PriorityScheduler;
use crate::table::TaskTable;

/// Result of checking one task's dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency is COMPLETED.
    Ready,
    /// At least one dependency is missing or still in flight.
    Blocked,
    /// A dependency died and the task was cascade-cancelled.
    Cancelled { dependency: TaskId },
}

/// What a round of dependency resolution changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// WAITING tasks moved to QUEUED and enqueued.
    pub promoted: Vec<TaskId>,
    /// Tasks cascade-cancelled because a dependency failed.
    pub cancelled: Vec<TaskId>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.cancelled.is_empty()
    }

    fn absorb(&mut self, other: Resolution) {
        self.promoted.extend(other.promoted);
        self.cancelled.extend(other.cancelled);
    }
}

/// Decides when blocked tasks may run.
///
/// The dependency relation itself lives on the tasks (`dependencies` in the
/// config, `dependents` filled in lazily), so the tracker works directly on
/// the locked [`TaskTable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyTracker;

impl DependencyTracker {
    pub fn new() -> Self {
        Self
    }

    /// True iff every dependency of `id` is COMPLETED. May cascade-cancel `id`.
    pub fn is_runnable(&self, table: &mut TaskTable, id: &TaskId) -> bool {
        self.check(table, id) == Readiness::Ready
    }

    /// Evaluate `id` against its dependencies, registering it as a dependent
    /// of each one that exists.
    pub fn check(&self, table: &mut TaskTable, id: &TaskId) -> Readiness {
        let Some(task) = table.get(id) else {
            return Readiness::Blocked;
        };
        let dependencies = task.config.dependencies.clone();
        let cascade = task.config.cancel_on_dependency_failure;

        let mut readiness = Readiness::Ready;
        for dep_id in &dependencies {
            let Some(dep) = table.get_mut(dep_id) else {
                debug!(task_id = %id, dependency = %dep_id, "dependency not submitted yet");
                readiness = Readiness::Blocked;
                continue;
            };
            dep.dependents.insert(id.clone());
            let dep_state = dep.state;

            match dep_state {
                TaskState::Completed => {}
                TaskState::Failed | TaskState::Cancelled if cascade => {
                    if let Some(task) = table.get_mut(id) {
                        task.finish(TaskOutcome::Cancelled(CancelReason::DependencyFailed(
                            dep_id.clone(),
                        )));
                    }
                    info!(
                        task_id = %id,
                        dependency = %dep_id,
                        dependency_state = %dep_state,
                        "cancelling task after dependency failure"
                    );
                    return Readiness::Cancelled {
                        dependency: dep_id.clone(),
                    };
                }
                TaskState::Failed | TaskState::Cancelled => {
                    if let Some(task) = table.get_mut(id) {
                        if !task.stalled {
                            task.stalled = true;
                            warn!(
                                task_id = %id,
                                dependency = %dep_id,
                                dependency_state = %dep_state,
                                "dependency will never complete; task stays waiting until cancelled"
                            );
                        }
                    }
                    readiness = Readiness::Blocked;
                }
                _ => readiness = Readiness::Blocked,
            }
        }
        readiness
    }

    /// Re-evaluate the WAITING dependents of `id` after it reached a terminal
    /// state. Cascaded cancellations propagate to their own dependents.
    pub fn notify_dependents(
        &self,
        table: &mut TaskTable,
        queue: &PriorityScheduler,
        id: &TaskId,
    ) -> Resolution {
        let mut resolution = Resolution::default();
        let mut pending = vec![id.clone()];

        while let Some(current) = pending.pop() {
            let Some(task) = table.get(&current) else {
                continue;
            };
            let mut dependents: Vec<TaskId> = task.dependents.iter().cloned().collect();
            dependents.sort();

            for dependent in dependents {
                let step = self.resolve_waiting(table, queue, &dependent);
                pending.extend(step.cancelled.iter().cloned());
                resolution.absorb(step);
            }
        }
        resolution
    }

    /// Periodic pass over every WAITING task.
    pub fn sweep(&self, table: &mut TaskTable, queue: &PriorityScheduler) -> Resolution {
        let mut resolution = Resolution::default();
        for id in table.ids_in(TaskState::Waiting) {
            let step = self.resolve_waiting(table, queue, &id);
            for cancelled in &step.cancelled {
                let cascaded = self.notify_dependents(table, queue, cancelled);
                resolution.absorb(cascaded);
            }
            resolution.absorb(step);
        }
        resolution
    }

    fn resolve_waiting(
        &self,
        table: &mut TaskTable,
        queue: &PriorityScheduler,
        id: &TaskId,
    ) -> Resolution {
        let mut resolution = Resolution::default();
        match table.get(id) {
            Some(task) if task.state == TaskState::Waiting => {}
            _ => return resolution,
        }

        match self.check(table, id) {
            Readiness::Ready => {
                if let Some(task) = table.get_mut(id) {
                    if task.transition(TaskState::Queued) {
                        queue.enqueue(id.clone(), task.config.priority);
                        debug!(task_id = %id, "dependencies satisfied, task queued");
                        resolution.promoted.push(id.clone());
                    }
                }
            }
            Readiness::Cancelled { .. } => resolution.cancelled.push(id.clone()),
            Readiness::Blocked => {}
        }
        resolution
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;

    use super::*;
    use crate::model::{work_unit, ManagedTask, TaskConfig};

    fn insert(table: &mut TaskTable, id: &str, config: TaskConfig) {
        let mut task = ManagedTask::new(
            id.into(),
            id.to_string(),
            work_unit(|_ctx| async { Ok(Value::Null) }),
            config,
        );
        if !task.config.dependencies.is_empty() {
            task.transition(TaskState::Waiting);
        }
        table.insert(task).unwrap();
    }

    fn finish(table: &mut TaskTable, id: &str, outcome: TaskOutcome) {
        table.get_mut(&id.into()).unwrap().finish(outcome);
    }

    fn state(table: &TaskTable, id: &str) -> TaskState {
        table.get(&id.into()).unwrap().state()
    }

    #[test]
    fn missing_dependency_blocks() {
        let mut table = TaskTable::new();
        insert(&mut table, "t", TaskConfig::default().with_dependency("d"));
        let tracker = DependencyTracker::new();
        assert_eq!(tracker.check(&mut table, &"t".into()), Readiness::Blocked);
        assert_eq!(state(&table, "t"), TaskState::Waiting);
    }

    #[test]
    fn check_registers_dependents() {
        let mut table = TaskTable::new();
        insert(&mut table, "d1", TaskConfig::default());
        insert(&mut table, "d2", TaskConfig::default());
        insert(&mut table, "t", TaskConfig::default().with_dependencies(["d1", "d2"]));
        let tracker = DependencyTracker::new();
        assert!(!tracker.is_runnable(&mut table, &"t".into()));
        assert!(table.get(&"d1".into()).unwrap().dependents.contains(&"t".into()));
        assert!(table.get(&"d2".into()).unwrap().dependents.contains(&"t".into()));

        finish(&mut table, "d1", TaskOutcome::Completed(Value::Null));
        finish(&mut table, "d2", TaskOutcome::Completed(Value::Null));
        assert!(tracker.is_runnable(&mut table, &"t".into()));
    }

    #[test]
    fn completion_promotes_waiting_dependent() {
        let mut table = TaskTable::new();
        let queue = PriorityScheduler::new();
        let tracker = DependencyTracker::new();
        insert(&mut table, "d", TaskConfig::default());
        insert(&mut table, "t", TaskConfig::default().with_dependency("d"));
        tracker.check(&mut table, &"t".into());

        finish(&mut table, "d", TaskOutcome::Completed(Value::Null));
        let resolution = tracker.notify_dependents(&mut table, &queue, &"d".into());
        assert_eq!(resolution.promoted, vec![TaskId::from("t")]);
        assert_eq!(state(&table, "t"), TaskState::Queued);
        assert_eq!(queue.try_dequeue(), Some("t".into()));
    }

    #[test]
    fn failure_cascades_through_chain() {
        let mut table = TaskTable::new();
        let queue = PriorityScheduler::new();
        let tracker = DependencyTracker::new();
        insert(&mut table, "a", TaskConfig::default());
        insert(&mut table, "b", TaskConfig::default().with_dependency("a"));
        insert(&mut table, "c", TaskConfig::default().with_dependency("b"));
        tracker.check(&mut table, &"b".into());
        tracker.check(&mut table, &"c".into());

        finish(
            &mut table,
            "a",
            TaskOutcome::Failed(Arc::new(anyhow::anyhow!("boom"))),
        );
        let resolution = tracker.notify_dependents(&mut table, &queue, &"a".into());
        assert_eq!(resolution.cancelled, vec![TaskId::from("b"), TaskId::from("c")]);
        assert_eq!(state(&table, "c"), TaskState::Cancelled);
        assert_eq!(
            table.get(&"c".into()).unwrap().cancel_reason,
            Some(CancelReason::DependencyFailed("b".into()))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn non_cascading_dependent_stays_waiting() {
        let mut table = TaskTable::new();
        let queue = PriorityScheduler::new();
        let tracker = DependencyTracker::new();
        insert(&mut table, "d", TaskConfig::default());
        insert(
            &mut table,
            "t",
            TaskConfig::default()
                .with_dependency("d")
                .with_cancel_on_dependency_failure(false),
        );
        tracker.check(&mut table, &"t".into());

        finish(&mut table, "d", TaskOutcome::Cancelled(CancelReason::Requested));
        let resolution = tracker.notify_dependents(&mut table, &queue, &"d".into());
        assert!(resolution.is_empty());
        assert_eq!(state(&table, "t"), TaskState::Waiting);
        assert!(table.get(&"t".into()).unwrap().stalled);
    }

    #[test]
    fn sweep_picks_up_late_dependency() {
        let mut table = TaskTable::new();
        let queue = PriorityScheduler::new();
        let tracker = DependencyTracker::new();
        insert(&mut table, "t", TaskConfig::default().with_dependency("d"));
        assert!(tracker.sweep(&mut table, &queue).is_empty());

        insert(&mut table, "d", TaskConfig::default());
        finish(&mut table, "d", TaskOutcome::Completed(Value::Null));
        let resolution = tracker.sweep(&mut table, &queue);
        assert_eq!(resolution.promoted, vec![TaskId::from("t")]);
        assert_eq!(queue.len(), 1);
    }
}
