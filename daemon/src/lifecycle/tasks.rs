//! Supervision of background units of work
//!
//! Every unit spawned through [`TaskSupervisor`] is registered under a name
//! until it finishes, is cancelled, or panics. Shutdown cancels everything
//! still registered and waits, within a grace period, for the set to empty.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Registered unit of work
struct Entry {
    name: String,
    /// `None` until the spawn has returned
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<u64, Entry>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    idle: Notify,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A poisoned registry still holds valid entries
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes the entry when the unit ends, whichever way it ends
struct TaskGuard {
    id: u64,
    name: String,
    inner: Arc<Inner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(task = %self.name, "task panicked");
        }
        let mut registry = self.inner.registry();
        registry.tasks.remove(&self.id);
        if registry.tasks.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Handle to a supervised unit
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: String,
    abort: AbortHandle,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation at the unit's next suspension point
    pub fn cancel(&self) {
        self.abort.abort();
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Tracks every background unit so shutdown can cancel and await them
#[derive(Clone, Default)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn and register a unit of work
    ///
    /// Returns `None` once shutdown has begun. Errors returned by the unit
    /// are logged; they never reach the caller.
    pub fn spawn<F>(&self, name: impl Into<String>, work: F) -> Option<TaskHandle>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.inner.registry();
            if registry.closed {
                debug!(task = %name, "skipping spawn, shutting down");
                return None;
            }
            // Registered first so a fast unit always finds its entry to remove
            registry.tasks.insert(
                id,
                Entry {
                    name: name.clone(),
                    abort: None,
                },
            );
        }

        let guard = TaskGuard {
            id,
            name: name.clone(),
            inner: Arc::clone(&self.inner),
        };
        let join = tokio::spawn(async move {
            let guard = guard;
            if let Err(e) = work.await {
                error!(task = %guard.name, error = ?e, "task failed");
            }
        });

        let abort = join.abort_handle();
        let closed = {
            let mut registry = self.inner.registry();
            if let Some(entry) = registry.tasks.get_mut(&id) {
                entry.abort = Some(abort.clone());
            }
            registry.closed
        };
        if closed {
            // Shutdown started while this unit was being spawned
            abort.abort();
        }
        Some(TaskHandle { name, abort })
    }

    /// Number of registered units
    pub fn len(&self) -> usize {
        self.inner.registry().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of registered units, for diagnostics
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .registry()
            .tasks
            .values()
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    #[cfg(test)]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.registry().closed
    }

    /// Wait until no units are registered
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new work, cancel everything registered and wait for it to end
    ///
    /// Returns how many units were still registered when `grace` ran out.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let pending: Vec<AbortHandle> = {
            let mut registry = self.inner.registry();
            registry.closed = true;
            registry
                .tasks
                .values()
                .filter_map(|e| e.abort.clone())
                .collect()
        };

        if !pending.is_empty() {
            info!(count = pending.len(), "cancelling background tasks");
        }
        for abort in &pending {
            abort.abort();
        }

        match tokio::time::timeout(grace, self.wait_idle()).await {
            Ok(()) => 0,
            Err(_) => {
                let remaining = self.names();
                warn!(?remaining, "tasks still running after grace period");
                remaining.len()
            }
        }
    }
}
