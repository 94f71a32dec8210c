use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskmill_watchdog::{Metadata, TaskHandle, WatchdogId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ── Identity ────────────────────────────────────────────────────────

/// Task identifier. Generated as `task_{counter}_{unix_millis}` unless the
/// caller supplies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub(crate) fn generate(counter: u64) -> Self {
        Self(format!("task_{}_{}", counter, Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ── Priority & state ────────────────────────────────────────────────

/// Scheduling priority. Higher variants are always dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// All levels, lowest first.
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a managed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Waiting,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended up CANCELLED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "dependency", rename_all = "snake_case")]
pub enum CancelReason {
    /// `cancel()` was called.
    Requested,
    /// The watchdog reported an overrun and auto-cancel is on.
    Timeout,
    /// The manager was stopped while the task was running.
    Shutdown,
    /// A dependency ended FAILED or CANCELLED.
    DependencyFailed(TaskId),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancel requested"),
            CancelReason::Timeout => f.write_str("timed out"),
            CancelReason::Shutdown => f.write_str("manager shutdown"),
            CancelReason::DependencyFailed(id) => write!(f, "dependency {id} did not complete"),
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Per-submission task configuration. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub priority: Priority,
    /// Wall-clock budget enforced by the watchdog. `None` = unbounded.
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Cancel this task when a dependency fails or is cancelled.
    #[serde(default = "default_true")]
    pub cancel_on_dependency_failure: bool,
    /// Register the running handle with the watchdog.
    #[serde(default = "default_true")]
    pub enable_watchdog: bool,
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_true() -> bool {
    true
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            priority: Priority::default(),
            timeout: None,
            max_retries: 0,
            retry_delay: default_retry_delay(),
            dependencies: Vec::new(),
            metadata: Metadata::new(),
            cancel_on_dependency_failure: true,
            enable_watchdog: true,
        }
    }
}

impl TaskConfig {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_dependency(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_dependencies<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_cancel_on_dependency_failure(mut self, enabled: bool) -> Self {
        self.cancel_on_dependency_failure = enabled;
        self
    }

    pub fn with_watchdog(mut self, enabled: bool) -> Self {
        self.enable_watchdog = enabled;
        self
    }

    /// Reject self-dependencies and repeated dependency entries.
    pub fn validate(&self, id: &TaskId) -> Result<(), String> {
        let mut seen = HashSet::with_capacity(self.dependencies.len());
        for dep in &self.dependencies {
            if dep == id {
                return Err(format!("task {id} cannot depend on itself"));
            }
            if !seen.insert(dep) {
                return Err(format!("dependency {dep} listed more than once"));
            }
        }
        Ok(())
    }
}

// ── Work unit ───────────────────────────────────────────────────────

/// What a running work unit can see about itself.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    attempt: u32,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(task_id: TaskId, attempt: u32, token: CancellationToken) -> Self {
        Self {
            task_id,
            attempt,
            token,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// 1 on the first run, incremented by every retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Returned (as `Err(Cancelled.into())`) by work that stopped because it
/// observed cancellation.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("task cancelled")]
pub struct Cancelled;

pub type WorkFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A deferred unit of work. Re-invoked once per attempt.
pub type WorkUnit = Arc<dyn Fn(TaskContext) -> WorkFuture + Send + Sync>;

/// Box an async closure into a [`WorkUnit`].
pub fn work_unit<F, Fut>(work: F) -> WorkUnit
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(work(ctx)) as WorkFuture)
}

/// Everything needed to submit one task.
pub struct TaskRequest {
    pub(crate) id: Option<TaskId>,
    pub(crate) name: Option<String>,
    pub(crate) config: TaskConfig,
    pub(crate) work: WorkUnit,
}

impl TaskRequest {
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::from_unit(work_unit(work))
    }

    pub fn from_unit(work: WorkUnit) -> Self {
        Self {
            id: None,
            name: None,
            config: TaskConfig::default(),
            work,
        }
    }

    /// Use an explicit id, e.g. one a dependent already refers to.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.config.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.config.dependencies.push(id.into());
        self
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ── Managed task ────────────────────────────────────────────────────

/// How a task ended. Published once through the terminal notifier.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(Arc<anyhow::Error>),
    Cancelled(CancelReason),
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled(_) => TaskState::Cancelled,
        }
    }
}

/// A submitted task plus its mutable runtime state. Lives in the task table
/// and is only touched with the table lock held.
pub struct ManagedTask {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) work: WorkUnit,
    pub(crate) config: TaskConfig,
    pub(crate) state: TaskState,
    pub(crate) handle: Option<TaskHandle>,
    pub(crate) watchdog_id: Option<WatchdogId>,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<Arc<anyhow::Error>>,
    pub(crate) cancel_reason: Option<CancelReason>,
    pub(crate) retry_count: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) dependents: HashSet<TaskId>,
    /// Set once a non-cascading dependent has been warned about a dead dependency.
    pub(crate) stalled: bool,
    terminal: watch::Sender<Option<TaskOutcome>>,
}

impl ManagedTask {
    pub fn new(id: TaskId, name: String, work: WorkUnit, config: TaskConfig) -> Self {
        let (terminal, _) = watch::channel(None);
        Self {
            id,
            name,
            work,
            config,
            state: TaskState::Queued,
            handle: None,
            watchdog_id: None,
            result: None,
            error: None,
            cancel_reason: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            dependents: HashSet::new(),
            stalled: false,
            terminal,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.config.max_retries
    }

    /// Start to end, or start to now while running. `None` if never started.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let ended = self.ended_at.unwrap_or_else(Utc::now);
        Some((ended - started).to_std().unwrap_or_default())
    }

    /// Move to a non-terminal state. Refused once the task is terminal.
    pub(crate) fn transition(&mut self, next: TaskState) -> bool {
        if self.state.is_terminal() || next.is_terminal() {
            debug!(task_id = %self.id, from = %self.state, to = %next, "transition refused");
            return false;
        }
        debug!(task_id = %self.id, from = %self.state, to = %next, "task transition");
        self.state = next;
        true
    }

    /// Enter a terminal state, record the outcome and wake every waiter.
    /// Returns false (and changes nothing) if the task already ended.
    pub(crate) fn finish(&mut self, outcome: TaskOutcome) -> bool {
        if self.state.is_terminal() {
            debug!(task_id = %self.id, state = %self.state, "task already terminal");
            return false;
        }
        let next = outcome.state();
        debug!(task_id = %self.id, from = %self.state, to = %next, "task transition");
        self.state = next;
        self.ended_at = Some(Utc::now());
        self.handle = None;
        match &outcome {
            TaskOutcome::Completed(value) => self.result = Some(value.clone()),
            TaskOutcome::Failed(error) => self.error = Some(Arc::clone(error)),
            TaskOutcome::Cancelled(reason) => self.cancel_reason = Some(reason.clone()),
        }
        self.terminal.send_replace(Some(outcome));
        true
    }

    /// RETRYING → QUEUED with a clean slate for the next attempt.
    pub(crate) fn reset_for_retry(&mut self) -> bool {
        if self.state != TaskState::Retrying {
            return false;
        }
        self.state = TaskState::Queued;
        self.handle = None;
        self.watchdog_id = None;
        self.error = None;
        self.started_at = None;
        self.ended_at = None;
        debug!(task_id = %self.id, attempt = self.retry_count + 1, "task requeued for retry");
        true
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<TaskOutcome>> {
        self.terminal.subscribe()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let mut dependents: Vec<TaskId> = self.dependents.iter().cloned().collect();
        dependents.sort();
        TaskSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            config: self.config.clone(),
            retry_count: self.retry_count,
            result: self.result.clone(),
            error: self.error.as_ref().map(|e| format!("{e:#}")),
            cancel_reason: self.cancel_reason.clone(),
            watchdog_id: self.watchdog_id.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration: self.duration(),
            dependents,
        }
    }
}

impl fmt::Debug for ManagedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

/// Read-only copy of a managed task, handed to callers and observers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub config: TaskConfig,
    pub retry_count: u32,
    pub result: Option<Value>,
    /// Rendered error chain of the last failure.
    pub error: Option<String>,
    pub cancel_reason: Option<CancelReason>,
    pub watchdog_id: Option<WatchdogId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub dependents: Vec<TaskId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> WorkUnit {
        work_unit(|_ctx| async { Ok(Value::Null) })
    }

    fn task(id: &str, config: TaskConfig) -> ManagedTask {
        ManagedTask::new(id.into(), id.to_string(), noop(), config)
    }

    #[test]
    fn priority_orders_critical_highest() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn states_serialize_lowercase() {
        assert_eq!(serde_json::to_value(TaskState::Retrying).unwrap(), "retrying");
        assert_eq!(serde_json::to_value(Priority::Critical).unwrap(), "critical");
    }

    #[test]
    fn config_defaults() {
        let config = TaskConfig::default();
        assert_eq!(config.priority, Priority::Normal);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert!(config.cancel_on_dependency_failure);
        assert!(config.enable_watchdog);
        assert!(config.timeout.is_none());
    }

    #[test]
    fn config_rejects_self_and_repeated_dependencies() {
        let id = TaskId::from("a");
        assert!(TaskConfig::default().with_dependency("a").validate(&id).is_err());
        let repeated = TaskConfig::default().with_dependencies(["b", "b"]);
        assert!(repeated.validate(&id).is_err());
        let fine = TaskConfig::default().with_dependencies(["b", "c"]);
        assert!(fine.validate(&id).is_ok());
    }

    #[test]
    fn generated_ids_carry_counter() {
        let id = TaskId::generate(7);
        assert!(id.as_str().starts_with("task_7_"));
    }

    #[test]
    fn finish_is_one_shot() {
        let mut t = task("a", TaskConfig::default());
        let rx = t.subscribe();
        assert!(t.finish(TaskOutcome::Completed(Value::from(1))));
        assert!(!t.finish(TaskOutcome::Cancelled(CancelReason::Requested)));
        assert_eq!(t.state(), TaskState::Completed);
        assert!(t.cancel_reason.is_none());
        assert!(matches!(&*rx.borrow(), Some(TaskOutcome::Completed(v)) if v == &Value::from(1)));
    }

    #[test]
    fn terminal_states_refuse_transitions() {
        let mut t = task("a", TaskConfig::default());
        t.finish(TaskOutcome::Failed(Arc::new(anyhow::anyhow!("boom"))));
        assert!(!t.transition(TaskState::Queued));
        assert!(!t.reset_for_retry());
        assert_eq!(t.state(), TaskState::Failed);
    }

    #[test]
    fn retry_reset_clears_attempt_state() {
        let mut t = task("a", TaskConfig::default().with_max_retries(2));
        t.transition(TaskState::Running);
        t.started_at = Some(Utc::now());
        t.error = Some(Arc::new(anyhow::anyhow!("boom")));
        t.retry_count = 1;
        assert!(t.transition(TaskState::Retrying));
        assert!(t.reset_for_retry());
        assert_eq!(t.state(), TaskState::Queued);
        assert!(t.error.is_none());
        assert!(t.started_at.is_none());
        assert!(t.duration().is_none());
        assert!(t.can_retry());
    }

    #[test]
    fn can_retry_respects_limit() {
        let mut t = task("a", TaskConfig::default().with_max_retries(1));
        assert!(t.can_retry());
        t.retry_count = 1;
        assert!(!t.can_retry());
    }

    #[test]
    fn snapshot_renders_error_and_sorts_dependents() {
        let mut t = task("a", TaskConfig::default());
        t.dependents.insert("z".into());
        t.dependents.insert("b".into());
        t.finish(TaskOutcome::Failed(Arc::new(anyhow::anyhow!("boom"))));
        let snap = t.snapshot();
        assert_eq!(snap.state, TaskState::Failed);
        assert_eq!(snap.error.as_deref(), Some("boom"));
        assert_eq!(snap.dependents, vec![TaskId::from("b"), TaskId::from("z")]);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "failed");
    }
}
