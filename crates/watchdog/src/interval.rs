use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskmill_core::{panic_message, WatchdogConfig};

use crate::error::WatchdogError;
use crate::handle::{HandleStatus, TaskHandle};
use crate::traits::{Metadata, Watchdog, WatchdogCallback, WatchdogEvent, WatchdogId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One supervised handle.
struct Entry {
    handle: TaskHandle,
    name: String,
    timeout: Option<Duration>,
    metadata: Metadata,
    registered_at: Instant,
    timeout_reported: bool,
    error_reported: bool,
}

/// Events raised by one supervision pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub timeouts: usize,
    pub errors: usize,
}

#[derive(Default)]
struct Shared {
    entries: Mutex<HashMap<WatchdogId, Entry>>,
    timeout_callbacks: RwLock<Vec<WatchdogCallback>>,
    error_callbacks: RwLock<Vec<WatchdogCallback>>,
}

impl Shared {
    /// Scan every registration once. Each registration raises at most one
    /// timeout event and one error event over its lifetime.
    fn check(&self) -> CheckReport {
        let now = Instant::now();
        let mut timeouts = Vec::new();
        let mut errors = Vec::new();

        {
            let mut entries = lock(&self.entries);
            for (id, entry) in entries.iter_mut() {
                let elapsed = now.saturating_duration_since(entry.registered_at);
                match entry.handle.status() {
                    HandleStatus::Running => {
                        let overran = entry.timeout.is_some_and(|t| elapsed > t);
                        if overran && !entry.timeout_reported {
                            entry.timeout_reported = true;
                            warn!(
                                watchdog_id = %id,
                                name = %entry.name,
                                elapsed = ?elapsed,
                                timeout = ?entry.timeout,
                                "task exceeded its timeout"
                            );
                            timeouts.push(entry.event(id, elapsed, None));
                        }
                    }
                    HandleStatus::Failed(message) if !entry.error_reported => {
                        entry.error_reported = true;
                        error!(
                            watchdog_id = %id,
                            name = %entry.name,
                            error = %message,
                            "task reported a failure"
                        );
                        errors.push(entry.event(id, elapsed, Some(message)));
                    }
                    _ => {}
                }
            }
        }

        fire(&self.timeout_callbacks, &timeouts, "timeout");
        fire(&self.error_callbacks, &errors, "error");

        CheckReport {
            timeouts: timeouts.len(),
            errors: errors.len(),
        }
    }
}

impl Entry {
    fn event(&self, id: &WatchdogId, elapsed: Duration, error: Option<String>) -> WatchdogEvent {
        WatchdogEvent {
            id: id.clone(),
            name: self.name.clone(),
            elapsed,
            timeout: self.timeout,
            error,
            metadata: self.metadata.clone(),
        }
    }
}

/// Invoke every callback for every event, outside of the entries lock.
/// A panicking callback is logged and skipped.
fn fire(callbacks: &RwLock<Vec<WatchdogCallback>>, events: &[WatchdogEvent], kind: &str) {
    if events.is_empty() {
        return;
    }
    let callbacks: Vec<WatchdogCallback> = callbacks
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    for event in events {
        for callback in &callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                error!(
                    kind,
                    watchdog_id = %event.id,
                    panic = %panic_message(payload.as_ref()),
                    "watchdog callback panicked"
                );
            }
        }
    }
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// In-process watchdog that polls every registration on a fixed interval.
pub struct IntervalWatchdog {
    check_interval: Duration,
    shared: Arc<Shared>,
    runtime: Mutex<Option<Running>>,
}

impl IntervalWatchdog {
    pub fn new(config: &WatchdogConfig) -> Self {
        Self::with_interval(config.check_interval())
    }

    pub fn with_interval(check_interval: Duration) -> Self {
        Self {
            check_interval,
            shared: Arc::new(Shared::default()),
            runtime: Mutex::new(None),
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn is_running(&self) -> bool {
        lock(&self.runtime).is_some()
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        lock(&self.shared.entries).len()
    }

    /// Run one supervision pass immediately, independent of the loop.
    pub fn check_now(&self) -> CheckReport {
        self.shared.check()
    }

    async fn supervise(shared: Arc<Shared>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = shared.check();
                    if report.timeouts + report.errors > 0 {
                        debug!(timeouts = report.timeouts, errors = report.errors, "watchdog pass");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}

#[async_trait]
impl Watchdog for IntervalWatchdog {
    async fn start(&self) -> Result<(), WatchdogError> {
        let mut runtime = lock(&self.runtime);
        if runtime.is_some() {
            return Err(WatchdogError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Self::supervise(
            Arc::clone(&self.shared),
            self.check_interval,
            shutdown.clone(),
        ));
        *runtime = Some(Running { shutdown, handle });

        info!(interval = ?self.check_interval, "watchdog started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), WatchdogError> {
        let running = lock(&self.runtime).take();
        let Some(running) = running else {
            return Ok(());
        };

        running.shutdown.cancel();
        running
            .handle
            .await
            .map_err(|e| WatchdogError::Loop(e.to_string()))?;

        info!("watchdog stopped");
        Ok(())
    }

    fn register(
        &self,
        handle: TaskHandle,
        name: &str,
        timeout: Option<Duration>,
        metadata: &Metadata,
    ) -> WatchdogId {
        let id = WatchdogId::new();
        lock(&self.shared.entries).insert(
            id.clone(),
            Entry {
                handle,
                name: name.to_string(),
                timeout,
                metadata: metadata.clone(),
                registered_at: Instant::now(),
                timeout_reported: false,
                error_reported: false,
            },
        );
        debug!(watchdog_id = %id, name, timeout = ?timeout, "registered with watchdog");
        id
    }

    fn unregister(&self, id: &WatchdogId) -> bool {
        let Some(entry) = lock(&self.shared.entries).remove(id) else {
            return false;
        };
        debug!(watchdog_id = %id, "unregistered from watchdog");

        // Executors unregister as soon as they publish the final status, usually
        // before the next pass. Flush a failure no pass has reported yet.
        if let HandleStatus::Failed(message) = entry.handle.status() {
            if !entry.error_reported {
                let elapsed = Instant::now().saturating_duration_since(entry.registered_at);
                error!(
                    watchdog_id = %id,
                    name = %entry.name,
                    error = %message,
                    "task reported a failure"
                );
                let event = entry.event(id, elapsed, Some(message));
                fire(&self.shared.error_callbacks, &[event], "error");
            }
        }
        true
    }

    fn add_timeout_callback(&self, callback: WatchdogCallback) {
        self.shared
            .timeout_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn add_error_callback(&self, callback: WatchdogCallback) {
        self.shared
            .error_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::handle::HandleStatus;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> WatchdogCallback {
        let counter = Arc::clone(counter);
        Arc::new(move |_event: &WatchdogEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let wd = IntervalWatchdog::with_interval(Duration::from_millis(10));
        let (handle, _reporter) = TaskHandle::new();

        let id = wd.register(handle, "job", None, &Metadata::new());
        assert_eq!(wd.registered(), 1);
        assert!(wd.unregister(&id));
        assert!(!wd.unregister(&id));
        assert_eq!(wd.registered(), 0);
    }

    #[tokio::test]
    async fn timeout_fires_once() {
        let wd = IntervalWatchdog::with_interval(Duration::from_secs(60));
        let fired = Arc::new(AtomicUsize::new(0));
        wd.add_timeout_callback(counter_callback(&fired));

        let (handle, _reporter) = TaskHandle::new();
        wd.register(handle, "slow", Some(Duration::from_millis(10)), &Metadata::new());

        assert_eq!(wd.check_now(), CheckReport::default());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(wd.check_now().timeouts, 1);
        assert_eq!(wd.check_now().timeouts, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_timeout_means_no_overrun() {
        let wd = IntervalWatchdog::with_interval(Duration::from_secs(60));
        let (handle, _reporter) = TaskHandle::new();
        wd.register(handle, "unbounded", None, &Metadata::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(wd.check_now().timeouts, 0);
    }

    #[tokio::test]
    async fn finished_handle_does_not_time_out() {
        let wd = IntervalWatchdog::with_interval(Duration::from_secs(60));
        let (handle, reporter) = TaskHandle::new();
        wd.register(handle, "done", Some(Duration::from_millis(5)), &Metadata::new());
        reporter.report(HandleStatus::Finished);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(wd.check_now(), CheckReport::default());
    }

    #[tokio::test]
    async fn failure_reported_with_message() {
        let wd = IntervalWatchdog::with_interval(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();
        wd.add_error_callback(Arc::new(move |event: &WatchdogEvent| {
            let _ = tx.send(event.clone());
        }));

        let mut metadata = Metadata::new();
        metadata.insert("owner".into(), serde_json::json!("ingest"));
        let (handle, reporter) = TaskHandle::new();
        let id = wd.register(handle, "crashy", None, &metadata);
        reporter.report(HandleStatus::Failed("disk full".into()));

        assert_eq!(wd.check_now().errors, 1);
        assert_eq!(wd.check_now().errors, 0);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.name, "crashy");
        assert_eq!(event.error.as_deref(), Some("disk full"));
        assert_eq!(event.metadata["owner"], "ingest");
    }

    #[tokio::test]
    async fn unregister_flushes_unreported_failure() {
        let wd = IntervalWatchdog::with_interval(Duration::from_secs(60));
        let fired = Arc::new(AtomicUsize::new(0));
        wd.add_error_callback(counter_callback(&fired));

        let (handle, reporter) = TaskHandle::new();
        let id = wd.register(handle, "short-lived", None, &Metadata::new());
        reporter.report(HandleStatus::Failed("bad row".into()));
        assert!(wd.unregister(&id));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(wd.check_now(), CheckReport::default());

        // already reported by a pass: not fired again
        let (handle, reporter) = TaskHandle::new();
        let id = wd.register(handle, "seen", None, &Metadata::new());
        reporter.report(HandleStatus::Failed("bad row".into()));
        assert_eq!(wd.check_now().errors, 1);
        assert!(wd.unregister(&id));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // finished cleanly: nothing to flush
        let (handle, reporter) = TaskHandle::new();
        let id = wd.register(handle, "ok", None, &Metadata::new());
        reporter.report(HandleStatus::Finished);
        assert!(wd.unregister(&id));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_callback_is_isolated() {
        let wd = IntervalWatchdog::with_interval(Duration::from_secs(60));
        let fired = Arc::new(AtomicUsize::new(0));
        wd.add_timeout_callback(Arc::new(|_event: &WatchdogEvent| panic!("observer bug")));
        wd.add_timeout_callback(counter_callback(&fired));

        let (handle, _reporter) = TaskHandle::new();
        wd.register(handle, "slow", Some(Duration::from_millis(1)), &Metadata::new());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(wd.check_now().timeouts, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_loop_detects_overrun() {
        let wd = IntervalWatchdog::with_interval(Duration::from_millis(10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        wd.add_timeout_callback(Arc::new(move |event: &WatchdogEvent| {
            let _ = tx.send(event.name.clone());
        }));

        wd.start().await.unwrap();
        assert!(wd.is_running());

        let (handle, _reporter) = TaskHandle::new();
        wd.register(handle, "overrun", Some(Duration::from_millis(20)), &Metadata::new());

        let name = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout callback not fired")
            .unwrap();
        assert_eq!(name, "overrun");

        wd.stop().await.unwrap();
        assert!(!wd.is_running());
    }

    #[tokio::test]
    async fn start_twice_and_stop_twice() {
        let wd = IntervalWatchdog::new(&WatchdogConfig::default());
        assert_eq!(wd.check_interval(), Duration::from_secs(1));

        wd.start().await.unwrap();
        assert!(matches!(wd.start().await, Err(WatchdogError::AlreadyRunning)));
        wd.stop().await.unwrap();
        wd.stop().await.unwrap();

        // restartable
        wd.start().await.unwrap();
        wd.stop().await.unwrap();
    }
}
