use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use deblur_core::{EpochSecs, Task, TaskId, TaskItem, TaskStatus};

use crate::traits::{CreateOutcome, ItemUpdate, NewTask, StatusUpdate, TaskStore};
use crate::{StorageError, StorageResult};

/// Read-through cache for `get_task` in front of another store.
///
/// The wrapped store stays the only source of truth: entries are filled from
/// it and dropped on every write that touches the task.
pub struct CachedTaskStore<S> {
    inner: S,
    cache: Mutex<HashMap<TaskId, Task>>,
}

impl<S: TaskStore> CachedTaskStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cache(&self) -> StorageResult<MutexGuard<'_, HashMap<TaskId, Task>>> {
        self.cache.lock().map_err(|_| StorageError::Poisoned)
    }

    fn invalidate(&self, id: &TaskId) -> StorageResult<()> {
        self.cache()?.remove(id);
        Ok(())
    }

    /// Drops the entry even when the write fails; the row may have changed anyway.
    fn write<T>(&self, id: &TaskId, f: impl FnOnce(&S) -> StorageResult<T>) -> StorageResult<T> {
        let out = f(&self.inner);
        self.invalidate(id)?;
        out
    }
}

impl<S: TaskStore> TaskStore for CachedTaskStore<S> {
    fn find_by_idempotency_key(&self, key: &str) -> StorageResult<Option<Task>> {
        self.inner.find_by_idempotency_key(key)
    }

    fn get_task(&self, id: &TaskId) -> StorageResult<Option<Task>> {
        if let Some(task) = self.cache()?.get(id) {
            return Ok(Some(task.clone()));
        }
        let task = self.inner.get_task(id)?;
        if let Some(t) = &task {
            self.cache()?.insert(id.clone(), t.clone());
        }
        Ok(task)
    }

    fn list_tasks(&self, limit: usize) -> StorageResult<Vec<Task>> {
        self.inner.list_tasks(limit)
    }

    fn create_task(&self, new: NewTask) -> StorageResult<CreateOutcome> {
        // may retire the key of a row we cannot name up front
        let out = self.inner.create_task(new);
        self.cache()?.clear();
        out
    }

    fn update_status(&self, id: &TaskId, status: TaskStatus, update: StatusUpdate) -> StorageResult<Task> {
        self.write(id, |s| s.update_status(id, status, update))
    }

    fn heartbeat(&self, id: &TaskId) -> StorageResult<()> {
        self.write(id, |s| s.heartbeat(id))
    }

    fn increment_attempt(&self, id: &TaskId) -> StorageResult<u32> {
        self.write(id, |s| s.increment_attempt(id))
    }

    fn list_by_status(&self, statuses: &[TaskStatus]) -> StorageResult<Vec<Task>> {
        self.inner.list_by_status(statuses)
    }

    fn list_stale(&self, statuses: &[TaskStatus], timeout_secs: i64, now: EpochSecs) -> StorageResult<Vec<Task>> {
        self.inner.list_stale(statuses, timeout_secs, now)
    }

    fn mark_orphaned(&self, id: &TaskId) -> StorageResult<Task> {
        self.write(id, |s| s.mark_orphaned(id))
    }

    fn reopen(&self, id: &TaskId) -> StorageResult<Task> {
        self.write(id, |s| s.reopen(id))
    }

    fn cancel(&self, id: &TaskId) -> StorageResult<Task> {
        self.write(id, |s| s.cancel(id))
    }

    fn add_item(&self, task_id: &TaskId, original_path: &str, original_fingerprint: Option<&str>) -> StorageResult<TaskItem> {
        self.inner.add_item(task_id, original_path, original_fingerprint)
    }

    fn update_item(&self, task_id: &TaskId, original_path: &str, update: ItemUpdate) -> StorageResult<TaskItem> {
        self.inner.update_item(task_id, original_path, update)
    }

    fn list_items(&self, task_id: &TaskId) -> StorageResult<Vec<TaskItem>> {
        self.inner.list_items(task_id)
    }
}
