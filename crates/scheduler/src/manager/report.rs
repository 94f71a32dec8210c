use std::fmt::Write;

use crate::model::TaskState;

use super::TaskManager;

impl TaskManager {
    /// Multi-line human-readable summary of stats and running tasks.
    pub fn status_report(&self) -> String {
        let stats = self.stats();
        let running = self.list_by_state(TaskState::Running);

        let mut out = String::new();
        let _ = writeln!(out, "Task manager: {}", self.state());
        let _ = writeln!(
            out,
            "  tasks:     submitted={} completed={} failed={} cancelled={} retried={} timeout_cancelled={}",
            stats.submitted,
            stats.completed,
            stats.failed,
            stats.cancelled,
            stats.retried,
            stats.timeout_cancelled
        );
        let _ = writeln!(
            out,
            "  now:       running={}/{} queued={} waiting={}",
            stats.running, stats.max_concurrency, stats.queued, stats.waiting
        );
        let _ = writeln!(out, "  avg run:   {:?}", stats.avg_run_duration);

        if running.is_empty() {
            let _ = writeln!(out, "  no running tasks");
        } else {
            let _ = writeln!(out, "  running tasks:");
            for task in running {
                let _ = writeln!(
                    out,
                    "    {} ({}) priority={} attempt={} elapsed={:?}",
                    task.id,
                    task.name,
                    task.config.priority,
                    task.retry_count + 1,
                    task.duration.unwrap_or_default()
                );
            }
        }
        out
    }
}
