//! Tracks per-connection handler tasks
//!
//! The accept loop registers every spawned handler here so shutdown can
//! abort whatever is still running after sessions were closed.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct TaskTracker {
    /// connection id -> handler task
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler; finished handlers are pruned on the way in
    pub fn register(&self, connection_id: Uuid, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|_, h| !h.is_finished());
            if let Some(old_handle) = tasks.insert(connection_id, handle) {
                old_handle.abort();
            }
        }
    }

    /// Forget a handler without aborting it
    pub fn finish(&self, connection_id: &Uuid) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.remove(connection_id);
        }
    }

    /// Unregister and abort a handler
    pub fn unregister(&self, connection_id: &Uuid) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(connection_id) {
                handle.abort();
            }
        }
    }

    /// Abort every tracked handler, returning how many were still running
    pub fn abort_all(&self) -> usize {
        let Ok(mut tasks) = self.tasks.lock() else {
            return 0;
        };
        let mut running = 0;
        for (_, handle) in tasks.drain() {
            if !handle.is_finished() {
                running += 1;
                handle.abort();
            }
        }
        running
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
