use std::sync::{Arc, Weak};

use taskmill_watchdog::{Watchdog, WatchdogEvent};
use tracing::{debug, error, info, warn};

use crate::model::{CancelReason, TaskState};

use super::core::Inner;

impl Inner {
    /// Route watchdog notifications to this manager. The callbacks hold a
    /// weak reference so the watchdog never keeps the manager alive.
    pub(super) fn install_watchdog_callbacks(me: &Weak<Inner>, watchdog: &dyn Watchdog) {
        let weak = Weak::clone(me);
        watchdog.add_timeout_callback(Arc::new(move |event: &WatchdogEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_watchdog_timeout(event);
            }
        }));

        let weak = Weak::clone(me);
        watchdog.add_error_callback(Arc::new(move |event: &WatchdogEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_watchdog_error(event);
            }
        }));
    }

    fn on_watchdog_timeout(&self, event: &WatchdogEvent) {
        let cancelled = {
            let mut table = self.table();
            let Some(task) = table.find_by_watchdog_id(&event.id) else {
                debug!(watchdog_id = %event.id, "timeout for unknown registration");
                return;
            };
            warn!(
                task_id = %task.id,
                name = %task.name,
                elapsed_ms = event.elapsed.as_millis() as u64,
                timeout_ms = event.timeout.map(|t| t.as_millis() as u64),
                "watchdog timeout notification"
            );

            if !self.config.auto_cancel_on_timeout || task.state() != TaskState::Running {
                return;
            }
            match &task.handle {
                Some(handle) if !handle.is_cancelled() => {
                    task.cancel_reason = Some(CancelReason::Timeout);
                    handle.cancel();
                    Some(task.id.clone())
                }
                _ => None,
            }
        };

        if let Some(id) = cancelled {
            self.counters().timeout_cancelled += 1;
            info!(task_id = %id, "auto-cancelling timed-out task");
        }
    }

    fn on_watchdog_error(&self, event: &WatchdogEvent) {
        let table = self.table();
        let task_id = table
            .iter()
            .find(|t| t.watchdog_id.as_ref() == Some(&event.id))
            .map(|t| t.id.to_string());
        error!(
            watchdog_id = %event.id,
            task_id = task_id.as_deref().unwrap_or("unknown"),
            name = %event.name,
            error = event.error.as_deref().unwrap_or("unknown"),
            "watchdog reported task error"
        );
    }
}
