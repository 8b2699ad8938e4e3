//! Registry of in-flight dispatch tasks
//!
//! Every dispatch runs as its own tokio task. The registry keeps their join
//! handles so shutdown can wait for them with a deadline and abort the rest.
//! A task removes its own entry when it ends, however it ends.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

/// Identifier of a tracked task
pub type TaskId = u64;

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a task's entry when the task future is dropped
struct Deregister {
    registry: Weak<Inner>,
    id: TaskId,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.tasks().remove(&self.id);
        }
    }
}

/// Handle to a scheduled dispatch
#[derive(Debug)]
pub struct DispatchTask {
    id: TaskId,
    abort: AbortHandle,
}

impl DispatchTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }
}

/// Outcome of [`TaskRegistry::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that ended before the deadline
    pub completed: usize,
    /// Tasks aborted after the deadline
    pub cancelled: usize,
}

/// Set of outstanding tasks, shared by cloning
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Inner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` on the runtime and track it until it ends
    pub fn spawn<F>(&self, future: F) -> DispatchTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = Deregister {
            registry: Arc::downgrade(&self.inner),
            id,
        };

        // The task waits until its handle is registered, so it can never
        // deregister before it was inserted.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            if registered_rx.await.is_ok() {
                future.await;
            }
        });

        let abort = handle.abort_handle();
        self.inner.tasks().insert(id, handle);
        let _ = registered_tx.send(());

        DispatchTask { id, abort }
    }

    /// Number of tasks still running
    pub fn len(&self) -> usize {
        self.inner.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `timeout` for outstanding tasks, then abort the rest
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let mut handles: Vec<JoinHandle<()>> =
            self.inner.tasks().drain().map(|(_, handle)| handle).collect();

        let outstanding = handles.len();
        if outstanding == 0 {
            return ShutdownReport::default();
        }

        warn!(
            "Waiting up to {}s for {} task(s) to finish.",
            timeout.as_secs_f32(),
            outstanding
        );

        let drained = tokio::time::timeout(timeout, async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!("Dispatch task panicked: {}", e);
                    }
                }
            }
        })
        .await
        .is_ok();

        if drained {
            debug!("All {} task(s) finished in time", outstanding);
            return ShutdownReport {
                completed: outstanding,
                cancelled: 0,
            };
        }

        let remaining: Vec<JoinHandle<()>> = handles
            .into_iter()
            .filter(|handle| !handle.is_finished())
            .collect();
        let mut report = ShutdownReport {
            completed: outstanding - remaining.len(),
            cancelled: 0,
        };

        warn!(
            "Some tasks did not finish in time. Forcing cancellation of {}.",
            remaining.len()
        );
        for handle in &remaining {
            handle.abort();
        }

        for handle in remaining {
            match handle.await {
                Ok(()) => report.completed += 1,
                Err(e) if e.is_cancelled() => report.cancelled += 1,
                Err(e) => {
                    error!("Dispatch task panicked: {}", e);
                    report.completed += 1;
                }
            }
        }

        report
    }
}
