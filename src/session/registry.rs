//! Process-wide lookup of live session supervisors.

use dashmap::DashMap;

use super::supervisor::SessionHandle;

/// Registry mapping task IDs to their live supervisor handles.
///
/// Supervisors remove their own entry on exit.
#[derive(Default)]
pub struct SessionRegistry {
    inner: DashMap<i64, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the live supervisor for a task.
    pub fn get(&self, task_id: i64) -> Option<SessionHandle> {
        self.inner.get(&task_id).map(|entry| entry.clone())
    }

    pub(super) fn insert(&self, task_id: i64, handle: SessionHandle) {
        self.inner.insert(task_id, handle);
    }

    pub(super) fn remove(&self, task_id: i64) {
        self.inner.remove(&task_id);
    }

    /// IDs of every task with a live supervisor.
    pub fn live_task_ids(&self) -> Vec<i64> {
        self.inner.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of live supervisors.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
