use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use taskmill_core::panic_message;
use tracing::error;

use crate::model::TaskSnapshot;

pub type SyncObserver = Arc<dyn Fn(&TaskSnapshot) -> anyhow::Result<()> + Send + Sync>;
pub type AsyncObserver =
    Arc<dyn Fn(TaskSnapshot) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A completion or failure observer.
#[derive(Clone)]
pub enum Observer {
    Sync(SyncObserver),
    Async(AsyncObserver),
}

impl Observer {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&TaskSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Observer::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Observer::Async(Arc::new(move |snapshot| f(snapshot).boxed()))
    }

    async fn invoke(&self, snapshot: &TaskSnapshot) -> anyhow::Result<()> {
        match self {
            Observer::Sync(f) => catch_unwind(AssertUnwindSafe(|| f(snapshot)))
                .unwrap_or_else(|payload| Err(panicked(payload.as_ref()))),
            Observer::Async(f) => AssertUnwindSafe(async { f(snapshot.clone()).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(panicked(payload.as_ref()))),
        }
    }
}

fn panicked(payload: &(dyn std::any::Any + Send)) -> anyhow::Error {
    anyhow::anyhow!("observer panicked: {}", panic_message(payload))
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observer::Sync(_) => f.write_str("Observer::Sync"),
            Observer::Async(_) => f.write_str("Observer::Async"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Complete,
    Failed,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackKind::Complete => f.write_str("complete"),
            CallbackKind::Failed => f.write_str("failed"),
        }
    }
}

/// Ordered observer lists for task completion and failure.
///
/// Each observer runs in isolation: an error or panic is logged and the
/// remaining observers still run.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    complete: RwLock<Vec<Observer>>,
    failed: RwLock<Vec<Observer>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, kind: CallbackKind) -> &RwLock<Vec<Observer>> {
        match kind {
            CallbackKind::Complete => &self.complete,
            CallbackKind::Failed => &self.failed,
        }
    }

    pub fn register(&self, kind: CallbackKind, observer: Observer) {
        self.list(kind)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn count(&self, kind: CallbackKind) -> usize {
        self.list(kind)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run every observer of `kind` in registration order. Returns how many
    /// of them failed.
    pub async fn notify(&self, kind: CallbackKind, snapshot: &TaskSnapshot) -> usize {
        let observers = self
            .list(kind)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failures = 0;
        for (index, observer) in observers.iter().enumerate() {
            if let Err(e) = observer.invoke(snapshot).await {
                failures += 1;
                error!(
                    kind = %kind,
                    observer = index,
                    task_id = %snapshot.id,
                    name = %snapshot.name,
                    error = %e,
                    "task callback failed"
                );
            }
        }
        failures
    }
}
