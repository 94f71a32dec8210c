use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use serde_json::Value;
use taskmill_core::{ManagerConfig, TaskmillConfig};
use taskmill_watchdog::{IntervalWatchdog, Watchdog};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::callbacks::{CallbackKind, CallbackRegistry, Observer};
use crate::dependency::{DependencyTracker, Readiness};
use crate::error::TaskError;
use crate::executor::TaskExecutor;
use crate::model::{
    ManagedTask, TaskConfig, TaskContext, TaskId, TaskRequest, TaskSnapshot, TaskState,
};
use crate::queue::PriorityScheduler;
use crate::stats::{Counters, ManagerStats};
use crate::table::TaskTable;

/// Whether the scheduling loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    Stopped,
    Running,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Stopped => f.write_str("stopped"),
            ManagerState::Running => f.write_str("running"),
        }
    }
}

/// Handles owned by one start/stop cycle.
pub(super) struct Runtime {
    pub(super) shutdown: CancellationToken,
    /// Dispatched executors and pending retry timers.
    pub(super) tracker: TaskTracker,
    pub(super) scheduling_loop: JoinHandle<()>,
}

/// State shared by the public handle, the scheduling loop, executors and
/// watchdog callbacks.
pub(super) struct Inner {
    pub(super) me: Weak<Inner>,
    pub(super) config: ManagerConfig,
    /// Concurrency gate. Shared by every start/stop cycle so executors left
    /// over from a previous cycle still count against the limit.
    pub(super) gate: Arc<Semaphore>,
    pub(super) table: Mutex<TaskTable>,
    pub(super) queue: PriorityScheduler,
    pub(super) dependencies: DependencyTracker,
    pub(super) executor: TaskExecutor,
    pub(super) callbacks: CallbackRegistry,
    pub(super) counters: Mutex<Counters>,
    pub(super) watchdog: Option<Arc<dyn Watchdog>>,
    pub(super) runtime: Mutex<Option<Runtime>>,
    next_id: AtomicU64,
}

impl Inner {
    pub(super) fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn is_running(&self) -> bool {
        self.runtime().is_some()
    }

    fn next_counter(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-process task manager.
///
/// Cheap to clone; every clone drives the same tasks. Construct it, call
/// [`start`](TaskManager::start), then submit work:
///
/// ```no_run
/// # async fn demo() -> Result<(), taskmill_scheduler::TaskError> {
/// use taskmill_scheduler::{TaskConfig, TaskManager};
///
/// let manager = TaskManager::new(&Default::default())?;
/// manager.start().await?;
/// let id = manager.submit(
///     |_ctx| async { Ok(serde_json::json!({ "rows": 42 })) },
///     Some("count rows"),
///     TaskConfig::default(),
/// )?;
/// let rows = manager.wait(&id, None).await?;
/// manager.stop(false).await;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct TaskManager {
    pub(super) inner: Arc<Inner>,
}

impl TaskManager {
    /// Build a manager from config. An [`IntervalWatchdog`] is created when
    /// `manager.enable_watchdog` is set.
    pub fn new(config: &TaskmillConfig) -> Result<Self, TaskError> {
        config
            .validate()
            .map_err(|e| TaskError::InvalidConfig(e.to_string()))?;
        let watchdog = config.manager.enable_watchdog.then(|| {
            Arc::new(IntervalWatchdog::new(&config.watchdog)) as Arc<dyn Watchdog>
        });
        Self::with_watchdog(config.manager.clone(), watchdog)
    }

    /// Build a manager around an injected watchdog (or none).
    pub fn with_watchdog(
        config: ManagerConfig,
        watchdog: Option<Arc<dyn Watchdog>>,
    ) -> Result<Self, TaskError> {
        config
            .validate()
            .map_err(|e| TaskError::InvalidConfig(e.to_string()))?;

        let inner = Arc::new_cyclic(|me: &Weak<Inner>| {
            if let Some(watchdog) = &watchdog {
                Inner::install_watchdog_callbacks(me, watchdog.as_ref());
            }
            Inner {
                me: me.clone(),
                gate: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
                config,
                table: Mutex::new(TaskTable::new()),
                queue: PriorityScheduler::new(),
                dependencies: DependencyTracker::new(),
                executor: TaskExecutor::new(),
                callbacks: CallbackRegistry::new(),
                counters: Mutex::new(Counters::default()),
                watchdog,
                runtime: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }
        });
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn watchdog(&self) -> Option<&Arc<dyn Watchdog>> {
        self.inner.watchdog.as_ref()
    }

    pub fn state(&self) -> ManagerState {
        if self.inner.is_running() {
            ManagerState::Running
        } else {
            ManagerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Submit a work unit. Returns its id without waiting for it to run.
    pub fn submit<F, Fut>(
        &self,
        work: F,
        name: Option<&str>,
        config: TaskConfig,
    ) -> Result<TaskId, TaskError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let mut request = TaskRequest::new(work).with_config(config);
        if let Some(name) = name {
            request = request.with_name(name);
        }
        self.submit_request(request)
    }

    /// Submit a fully described request, optionally with an explicit id.
    pub fn submit_request(&self, request: TaskRequest) -> Result<TaskId, TaskError> {
        if !self.inner.is_running() {
            return Err(TaskError::NotRunning);
        }

        let counter = self.inner.next_counter();
        let TaskRequest {
            id,
            name,
            config,
            work,
        } = request;
        let id = id.unwrap_or_else(|| TaskId::generate(counter));
        let name = name.unwrap_or_else(|| format!("Task-{counter}"));
        config.validate(&id).map_err(TaskError::InvalidConfig)?;

        let priority = config.priority;
        let has_dependencies = !config.dependencies.is_empty();

        let initial = {
            let mut table = self.inner.table();
            if table.contains(&id) {
                return Err(TaskError::DuplicateId(id));
            }
            if table
                .insert(ManagedTask::new(id.clone(), name.clone(), work, config))
                .is_err()
            {
                return Err(TaskError::DuplicateId(id));
            }

            let readiness = if has_dependencies {
                self.inner.dependencies.check(&mut table, &id)
            } else {
                Readiness::Ready
            };
            match readiness {
                Readiness::Ready => {
                    self.inner.queue.enqueue(id.clone(), priority);
                    TaskState::Queued
                }
                Readiness::Blocked => {
                    if let Some(task) = table.get_mut(&id) {
                        task.transition(TaskState::Waiting);
                    }
                    TaskState::Waiting
                }
                Readiness::Cancelled { .. } => TaskState::Cancelled,
            }
        };

        {
            let mut counters = self.inner.counters();
            counters.submitted += 1;
            if initial == TaskState::Cancelled {
                counters.cancelled += 1;
            }
        }
        debug!(task_id = %id, name = %name, priority = %priority, state = %initial, "task submitted");
        Ok(id)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn get_task(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.inner.table().get(id).map(ManagedTask::snapshot)
    }

    pub fn list_all(&self) -> Vec<TaskSnapshot> {
        self.inner.table().snapshots(None)
    }

    pub fn list_by_state(&self, state: TaskState) -> Vec<TaskSnapshot> {
        self.inner.table().snapshots(Some(state))
    }

    pub fn stats(&self) -> ManagerStats {
        let counters = self.inner.counters().clone();
        let table = self.inner.table();
        ManagerStats::from_counters(
            &counters,
            table.count_in(TaskState::Running),
            table.count_in(TaskState::Queued),
            table.count_in(TaskState::Waiting),
            self.inner.config.max_concurrent_tasks,
        )
    }

    /// Drop a terminal task from the table. Waiters already holding its
    /// outcome are unaffected.
    pub fn evict(&self, id: &TaskId) -> Result<TaskSnapshot, TaskError> {
        let mut table = self.inner.table();
        match table.get(id) {
            None => return Err(TaskError::NotFound(id.clone())),
            Some(task) if !task.is_terminal() => return Err(TaskError::NotTerminal(id.clone())),
            Some(_) => {}
        }
        let task = table
            .remove(id)
            .ok_or_else(|| TaskError::NotFound(id.clone()))?;
        info!(task_id = %id, state = %task.state(), "task evicted");
        Ok(task.snapshot())
    }

    // ── Observers ───────────────────────────────────────────────────

    pub fn on_complete<F>(&self, observer: F)
    where
        F: Fn(&TaskSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .register(CallbackKind::Complete, Observer::sync(observer));
    }

    pub fn on_complete_async<F, Fut>(&self, observer: F)
    where
        F: Fn(TaskSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .callbacks
            .register(CallbackKind::Complete, Observer::from_async(observer));
    }

    pub fn on_failed<F>(&self, observer: F)
    where
        F: Fn(&TaskSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .register(CallbackKind::Failed, Observer::sync(observer));
    }

    pub fn on_failed_async<F, Fut>(&self, observer: F)
    where
        F: Fn(TaskSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .callbacks
            .register(CallbackKind::Failed, Observer::from_async(observer));
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .field("watchdog", &self.inner.watchdog.is_some())
            .finish_non_exhaustive()
    }
}
