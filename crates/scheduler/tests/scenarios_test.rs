//! End-to-end scenarios through the public `TaskManager` API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use taskmill_core::TaskmillConfig;
use taskmill_scheduler::{
    CancelReason, Priority, TaskConfig, TaskContext, TaskError, TaskManager, TaskRequest,
    TaskState,
};
use taskmill_watchdog::WatchdogEvent;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn config(max_concurrent: usize) -> TaskmillConfig {
    let mut config = TaskmillConfig::default();
    config.manager.max_concurrent_tasks = max_concurrent;
    config.manager.dequeue_timeout_ms = 10;
    config.manager.stop_grace_period_secs = 5;
    config.watchdog.check_interval_ms = 20;
    config
}

async fn started(max_concurrent: usize) -> TaskManager {
    let manager = TaskManager::new(&config(max_concurrent)).unwrap();
    manager.start().await.unwrap();
    manager
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_task_overtakes_normal_one() {
    for _ in 0..3 {
        let manager = started(1).await;
        let finished = Arc::new(Mutex::new(Vec::new()));

        // Occupy the only slot so A and B are both queued when it frees up,
        // however the runtime interleaves the submissions with the loop.
        let mut ids = Vec::new();
        for (label, priority, ms) in [
            ("hold", Priority::Low, 100),
            ("A", Priority::Normal, 10),
            ("B", Priority::Critical, 10),
        ] {
            let finished = Arc::clone(&finished);
            let id = manager
                .submit(
                    move |_ctx| {
                        let finished = Arc::clone(&finished);
                        async move {
                            tokio::time::sleep(Duration::from_millis(ms)).await;
                            finished.lock().unwrap().push(label);
                            Ok(Value::Null)
                        }
                    },
                    Some(label),
                    TaskConfig::default().with_priority(priority),
                )
                .unwrap();
            if label == "hold" {
                for _ in 0..200 {
                    if manager.get_task(&id).unwrap().state == TaskState::Running {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            ids.push(id);
        }

        for id in &ids {
            manager.wait(id, WAIT).await.unwrap();
        }
        assert_eq!(*finished.lock().unwrap(), vec!["hold", "B", "A"]);
        manager.stop(false).await;
    }
}

#[tokio::test]
async fn dependent_submitted_before_its_dependency() {
    let manager = started(2).await;

    let t = manager
        .submit_request(
            TaskRequest::new(|_ctx| async { Ok(json!("t done")) })
                .with_name("T")
                .depends_on("D"),
        )
        .unwrap();
    assert_eq!(manager.get_task(&t).unwrap().state, TaskState::Waiting);

    let d = manager
        .submit_request(
            TaskRequest::new(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!("d done"))
            })
            .with_id("D")
            .with_name("D"),
        )
        .unwrap();

    assert_eq!(manager.wait(&d, WAIT).await.unwrap(), json!("d done"));
    assert_eq!(manager.wait(&t, WAIT).await.unwrap(), json!("t done"));

    let d_snap = manager.get_task(&d).unwrap();
    let t_snap = manager.get_task(&t).unwrap();
    assert_eq!(t_snap.state, TaskState::Completed);
    assert!(t_snap.started_at.unwrap() >= d_snap.ended_at.unwrap());
    assert_eq!(d_snap.dependents, vec![t.clone()]);
    manager.stop(false).await;
}

#[tokio::test]
async fn always_failing_task_runs_three_times() {
    let manager = started(1).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let failures = Arc::new(AtomicUsize::new(0));
    let failed_seen = Arc::clone(&failures);
    manager.on_failed(move |_snap| {
        failed_seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let id = manager
        .submit(
            move |ctx: TaskContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { anyhow::bail!("attempt {} failed", ctx.attempt()) }
            },
            Some("flaky"),
            TaskConfig::default()
                .with_max_retries(2)
                .with_retry_delay(Duration::ZERO),
        )
        .unwrap();

    match manager.wait(&id, WAIT).await {
        Err(TaskError::Failed { error, .. }) => assert_eq!(error.to_string(), "attempt 3 failed"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let snapshot = manager.get_task(&id).unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.retry_count, 2);

    let stats = manager.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.failed, 1);
    manager.stop(false).await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn overrunning_task_is_cancelled_by_watchdog() {
    let manager = TaskManager::new(&config(1)).unwrap();
    let timeouts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&timeouts);
    manager
        .watchdog()
        .unwrap()
        .add_timeout_callback(Arc::new(move |event: &WatchdogEvent| {
            sink.lock().unwrap().push(event.name.clone());
        }));
    manager.start().await.unwrap();

    let id = manager
        .submit(
            |ctx: TaskContext| async move {
                tokio::select! {
                    _ = ctx.cancelled() => Err(taskmill_scheduler::Cancelled.into()),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(Value::Null),
                }
            },
            Some("overrun"),
            TaskConfig::default().with_timeout(Duration::from_millis(50)),
        )
        .unwrap();

    match manager.wait(&id, WAIT).await {
        Err(TaskError::Cancelled { reason, .. }) => assert_eq!(reason, CancelReason::Timeout),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(*timeouts.lock().unwrap(), vec!["overrun".to_string()]);
    assert_eq!(manager.stats().timeout_cancelled, 1);
    assert_eq!(manager.get_task(&id).unwrap().state, TaskState::Cancelled);
    manager.stop(false).await;
}

#[tokio::test]
async fn stop_twice_and_cancel_terminal_are_noops() {
    let manager = started(1).await;
    let id = manager
        .submit(|_ctx| async { Ok(json!(1)) }, None, TaskConfig::default())
        .unwrap();
    manager.wait(&id, WAIT).await.unwrap();

    assert!(!manager.cancel(&id));
    manager.stop(false).await;
    manager.stop(true).await;
    assert!(!manager.is_running());
    assert_eq!(manager.get_task(&id).unwrap().state, TaskState::Completed);
}
