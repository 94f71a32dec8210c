use std::time::Duration;

use serde::Serialize;

/// Lifetime counters kept by the manager. Read them through [`ManagerStats`].
#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    pub(crate) submitted: u64,
    pub(crate) completed: u64,
    pub(crate) failed: u64,
    pub(crate) cancelled: u64,
    pub(crate) retried: u64,
    pub(crate) timeout_cancelled: u64,
    /// Completed runs folded into `avg_run_duration`.
    runs: u64,
    avg_run_duration: Duration,
}

impl Counters {
    /// Fold one successful run into the rolling average.
    pub(crate) fn record_run(&mut self, duration: Duration) {
        self.runs += 1;
        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_run_duration = if self.runs == 1 {
            duration
        } else {
            let prev = self.avg_run_duration.as_nanos() as f64;
            let cur = duration.as_nanos() as f64;
            let avg = prev + (cur - prev) / self.runs as f64;
            Duration::from_nanos(avg.max(0.0) as u64)
        };
    }

    pub(crate) fn avg_run_duration(&self) -> Duration {
        self.avg_run_duration
    }
}

/// Point-in-time view of the manager, returned by `TaskManager::stats`.
///
/// The raw counters behind it stay internal:
///
/// ```compile_fail
/// let _ = taskmill_scheduler::stats::Counters::default();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub timeout_cancelled: u64,
    pub running: usize,
    pub queued: usize,
    pub waiting: usize,
    pub max_concurrency: usize,
    pub avg_run_duration: Duration,
}

impl ManagerStats {
    pub(crate) fn from_counters(
        counters: &Counters,
        running: usize,
        queued: usize,
        waiting: usize,
        max_concurrency: usize,
    ) -> Self {
        Self {
            submitted: counters.submitted,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            retried: counters.retried,
            timeout_cancelled: counters.timeout_cancelled,
            running,
            queued,
            waiting,
            max_concurrency,
            avg_run_duration: counters.avg_run_duration,
        }
    }

    /// Tasks that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}
