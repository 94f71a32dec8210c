use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Last known condition of a running work unit, as reported by its executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleStatus {
    Running,
    Finished,
    /// The work unit returned an error or panicked.
    Failed(String),
    Cancelled,
}

impl HandleStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, HandleStatus::Running)
    }
}

/// Shared handle onto one running work unit.
///
/// Cloning is cheap. Every clone can cancel the work (cooperatively, through
/// the [`CancellationToken`]) and observe the status published by the
/// matching [`HandleReporter`].
#[derive(Debug, Clone)]
pub struct TaskHandle {
    token: CancellationToken,
    status: watch::Receiver<HandleStatus>,
}

/// Write side of a [`TaskHandle`], held by whoever drives the work unit.
#[derive(Debug)]
pub struct HandleReporter {
    status: watch::Sender<HandleStatus>,
}

impl TaskHandle {
    /// Create a handle with a fresh cancellation token.
    pub fn new() -> (Self, HandleReporter) {
        Self::with_token(CancellationToken::new())
    }

    /// Create a handle around an existing token (e.g. a child of a shutdown token).
    pub fn with_token(token: CancellationToken) -> (Self, HandleReporter) {
        let (tx, rx) = watch::channel(HandleStatus::Running);
        (
            Self { token, status: rx },
            HandleReporter { status: tx },
        )
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn status(&self) -> HandleStatus {
        self.status.borrow().clone()
    }

    /// True once the reporter published anything but `Running`.
    pub fn is_finished(&self) -> bool {
        !self.status.borrow().is_running()
    }
}

impl HandleReporter {
    /// Publish a new status. Never fails, even with no live handles.
    pub fn report(&self, status: HandleStatus) {
        self.status.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let (handle, _reporter) = TaskHandle::new();
        assert_eq!(handle.status(), HandleStatus::Running);
        assert!(!handle.is_finished());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn reporter_updates_every_clone() {
        let (handle, reporter) = TaskHandle::new();
        let other = handle.clone();
        reporter.report(HandleStatus::Failed("boom".into()));
        assert_eq!(handle.status(), HandleStatus::Failed("boom".into()));
        assert!(other.is_finished());
    }

    #[test]
    fn cancel_is_shared() {
        let parent = CancellationToken::new();
        let (handle, _reporter) = TaskHandle::with_token(parent.child_token());
        let other = handle.clone();
        other.cancel();
        assert!(handle.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn report_after_handles_dropped() {
        let (handle, reporter) = TaskHandle::new();
        drop(handle);
        reporter.report(HandleStatus::Finished);
    }
}
