use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::{TaskRecord, TaskStatus};

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, TaskRecord>,
    order: Vec<String>,
}

/// In-memory authoritative task state, guarded by a single lock.
///
/// The lock is only held for the duration of a read or a closure passed to
/// [`TaskStore::update`]; nothing awaits while holding it.
#[derive(Default)]
pub struct TaskStore {
    inner: Mutex<Inner>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, record: TaskRecord) {
        let mut inner = self.lock();
        if !inner.tasks.contains_key(&record.id) {
            inner.order.push(record.id.clone());
        }
        inner.tasks.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.lock().tasks.get(id).cloned()
    }

    /// All tasks in creation order.
    pub fn list(&self) -> Vec<TaskRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.lock().tasks.get(id).map(|task| task.status)
    }

    /// Runs `f` against the record under the lock.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut TaskRecord) -> R) -> Option<R> {
        self.lock().tasks.get_mut(id).map(f)
    }

    /// Raises progress of a downloading task. Returns the new snapshot only
    /// when the value actually moved forward; `on_change` sees that snapshot
    /// while the lock is still held.
    pub fn advance_progress(
        &self,
        id: &str,
        progress: u8,
        on_change: impl FnOnce(&TaskRecord),
    ) -> Option<TaskRecord> {
        let mut inner = self.lock();
        let task = inner.tasks.get_mut(id)?;
        let progress = progress.min(100);
        if task.status != TaskStatus::Downloading || progress <= task.progress {
            return None;
        }
        task.progress = progress;
        on_change(task);
        Some(task.clone())
    }
}
