//! Deferred tasks keyed by owner, cancellable before they fire.
//!
//! Scheduling under a key that already has a pending task replaces it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;

#[derive(Clone, Default)]
pub struct DeferredTasks {
    pending: Arc<Mutex<HashMap<String, (u64, AbortHandle)>>>,
    next_ticket: Arc<AtomicU64>,
}

impl DeferredTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless [DeferredTasks::cancel] is called for `key` first.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut map) = pending.lock() {
                // A replacement may have been scheduled meanwhile; only drop our own entry.
                if map.get(&task_key).map(|(t, _)| *t) == Some(ticket) {
                    map.remove(&task_key);
                }
            }
            task.await;
        });

        let previous = match self.pending.lock() {
            // The task may already have run when the delay is zero.
            Ok(mut map) if handle.is_finished() => map.remove(&key),
            Ok(mut map) => map.insert(key, (ticket, handle.abort_handle())),
            Err(_) => {
                log::warn!("deferred_tasks registry poisoned, task runs untracked");
                None
            }
        };
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    /// Cancel the pending task for `key`. Returns true if one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = match self.pending.lock() {
            Ok(mut map) => map.remove(key),
            Err(_) => None,
        };
        match removed {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending
            .lock()
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|map| map.len()).unwrap_or(0)
    }
}
