//! taskmill-demo: drives a synthetic workload through a `TaskManager`.
//!
//! Submits:
//! - a three-step dependency chain (extract → transform → load)
//! - a flaky task that succeeds on its third attempt
//! - a task that overruns its timeout and is cancelled by the watchdog
//! - a batch of mixed-priority tasks, every `--fail-every`th one failing
//!
//! then waits for all of them and logs the status report and stats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};

use taskmill_core::{load_dotenv, TaskmillConfig};
use taskmill_scheduler::{
    Cancelled, Priority, TaskConfig, TaskContext, TaskError, TaskId, TaskManager, TaskRequest,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Run a demo workload through the task manager.
#[derive(Parser, Debug)]
#[command(name = "taskmill-demo", version, about)]
struct Cli {
    /// Path to a taskmill.toml config file. Defaults come from the environment.
    #[arg(long, env = "TASKMILL_CONFIG")]
    config: Option<String>,

    /// Number of tasks in the mixed-priority batch.
    #[arg(long, default_value_t = 12)]
    tasks: usize,

    /// Override `manager.max_concurrent_tasks`.
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Every n-th batch task fails permanently (0 disables failures).
    #[arg(long, default_value_t = 4)]
    fail_every: usize,

    /// Timeout of the overrunning task, in milliseconds.
    #[arg(long, default_value_t = 300)]
    timeout_ms: u64,
}

fn load_config(cli: &Cli) -> anyhow::Result<TaskmillConfig> {
    let mut config = match &cli.config {
        Some(path) => match TaskmillConfig::from_file(path) {
            Ok(cfg) => {
                info!(path = %path, "loaded taskmill config");
                cfg
            }
            Err(e) => {
                warn!(error = %e, path = %path, "failed to load config, using environment defaults");
                TaskmillConfig::from_env()?
            }
        },
        None => TaskmillConfig::from_env()?,
    };
    if let Some(max) = cli.max_concurrent {
        config.manager.max_concurrent_tasks = max;
    }
    config.validate()?;
    Ok(config)
}

// ── Workload ────────────────────────────────────────────────────────

fn submit_chain(manager: &TaskManager) -> Result<Vec<TaskId>, TaskError> {
    let steps = [("extract", None), ("transform", Some("extract")), ("load", Some("transform"))];
    let mut ids = Vec::new();
    // Submitted in reverse so the later steps wait on ids that do not exist yet.
    for (step, dependency) in steps.into_iter().rev() {
        let mut request = TaskRequest::new(move |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({ "step": step }))
        })
        .with_id(format!("chain-{step}"))
        .with_name(step)
        .with_priority(Priority::High);
        if let Some(dependency) = dependency {
            request = request.depends_on(format!("chain-{dependency}"));
        }
        ids.push(manager.submit_request(request)?);
    }
    Ok(ids)
}

fn submit_flaky(manager: &TaskManager) -> Result<TaskId, TaskError> {
    manager.submit(
        |ctx: TaskContext| async move {
            if ctx.attempt() < 3 {
                anyhow::bail!("transient failure on attempt {}", ctx.attempt());
            }
            Ok(json!({ "attempts": ctx.attempt() }))
        },
        Some("flaky"),
        TaskConfig::default()
            .with_max_retries(3)
            .with_retry_delay(Duration::from_millis(100)),
    )
}

fn submit_overrun(manager: &TaskManager, timeout: Duration) -> Result<TaskId, TaskError> {
    manager.submit(
        move |ctx: TaskContext| async move {
            tokio::select! {
                _ = ctx.cancelled() => Err(Cancelled.into()),
                _ = tokio::time::sleep(timeout * 4) => Ok(json!("finished late")),
            }
        },
        Some("overrun"),
        TaskConfig::default()
            .with_timeout(timeout)
            .with_metadata("kind", "overrun"),
    )
}

fn submit_batch(manager: &TaskManager, count: usize, fail_every: usize) -> Result<Vec<TaskId>, TaskError> {
    (1..=count)
        .map(|n| {
            let priority = Priority::ALL[n % Priority::ALL.len()];
            let fails = fail_every > 0 && n % fail_every == 0;
            let sleep = Duration::from_millis(20 + (n as u64 * 7) % 50);
            manager.submit(
                move |_ctx| async move {
                    tokio::time::sleep(sleep).await;
                    if fails {
                        anyhow::bail!("batch item {n} rejected");
                    }
                    Ok(json!({ "item": n }))
                },
                Some(&format!("batch-{n}")),
                TaskConfig::default().with_priority(priority),
            )
        })
        .collect()
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    config.log_summary();

    let manager = TaskManager::new(&config)?;
    let completed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&completed);
    manager.on_complete(move |snap| {
        seen.fetch_add(1, Ordering::Relaxed);
        info!(task_id = %snap.id, name = %snap.name, result = %snap.result.clone().unwrap_or_default(), "task completed");
        Ok(())
    });
    manager.on_failed(|snap| {
        warn!(task_id = %snap.id, name = %snap.name, error = snap.error.as_deref().unwrap_or("unknown"), "task failed");
        Ok(())
    });
    manager.start().await?;

    let mut ids = submit_chain(&manager)?;
    ids.push(submit_flaky(&manager)?);
    ids.push(submit_overrun(&manager, Duration::from_millis(cli.timeout_ms))?);
    ids.extend(submit_batch(&manager, cli.tasks, cli.fail_every)?);
    info!(submitted = ids.len(), "workload submitted");
    info!("\n{}", manager.status_report());

    for id in &ids {
        match manager.wait(id, Some(Duration::from_secs(60))).await {
            Ok(_) => {}
            Err(TaskError::Cancelled { id, reason }) => info!(task_id = %id, reason = %reason, "task cancelled"),
            Err(TaskError::Failed { id, .. }) => info!(task_id = %id, "task ended failed"),
            Err(e) => error!(task_id = %id, error = %e, "wait failed"),
        }
    }

    info!(observed_completions = completed.load(Ordering::Relaxed), "workload finished");
    info!("\n{}", manager.status_report());
    info!(stats = %serde_json::to_string(&manager.stats())?, "final stats");

    manager.stop(false).await;
    Ok(())
}
