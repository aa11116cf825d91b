use std::sync::{Mutex, MutexGuard};

use deblur_core::{now_unix, EpochSecs, Task, TaskId, TaskItem, TaskStatus};
use tracing::debug;

use crate::rules;
use crate::traits::{CreateOutcome, ItemUpdate, NewTask, StatusUpdate, TaskStore};
use crate::{derive_keys, StorageError, StorageResult};

type Clock = Box<dyn Fn() -> EpochSecs + Send + Sync>;

/// In-memory store for tests and dry runs. Not durable.
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
    clock: Clock,
}

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as the tie-breaker for equal timestamps.
    tasks: Vec<Task>,
    items: Vec<TaskItem>,
    next_item_id: i64,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(now_unix)
    }

    /// Store whose timestamps come from `clock` instead of the system time.
    pub fn with_clock(clock: impl Fn() -> EpochSecs + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock: Box::new(clock),
        }
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }

    fn with_task<T>(&self, id: &TaskId, f: impl FnOnce(&mut Task, EpochSecs) -> StorageResult<T>) -> StorageResult<T> {
        let now = (self.clock)();
        let mut inner = self.lock()?;
        let task = inner.task_mut(id)?;
        // work on a copy so a rejected change leaves the row untouched
        let mut draft = task.clone();
        let out = f(&mut draft, now)?;
        *task = draft;
        Ok(out)
    }
}

impl Inner {
    fn task_mut(&mut self, id: &TaskId) -> StorageResult<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    fn ensure_task(&self, id: &TaskId) -> StorageResult<()> {
        if self.tasks.iter().any(|t| &t.id == id) {
            Ok(())
        } else {
            Err(StorageError::NotFound(id.clone()))
        }
    }

    fn item_mut(&mut self, task_id: &TaskId, path: &str) -> Option<&mut TaskItem> {
        self.items
            .iter_mut()
            .find(|i| &i.task_id == task_id && i.original_image_path == path)
    }

    /// Oldest first.
    fn sorted(&self, mut keep: impl FnMut(&Task) -> bool) -> Vec<Task> {
        let mut out: Vec<(usize, &Task)> = self.tasks.iter().enumerate().filter(|(_, t)| keep(t)).collect();
        out.sort_by_key(|(idx, t)| (t.created_at, *idx));
        out.into_iter().map(|(_, t)| t.clone()).collect()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn find_by_idempotency_key(&self, key: &str) -> StorageResult<Option<Task>> {
        let inner = self.lock()?;
        Ok(inner
            .sorted(|t| t.idempotency_key.as_deref() == Some(key))
            .pop())
    }

    fn get_task(&self, id: &TaskId) -> StorageResult<Option<Task>> {
        let inner = self.lock()?;
        Ok(inner.tasks.iter().find(|t| &t.id == id).cloned())
    }

    fn list_tasks(&self, limit: usize) -> StorageResult<Vec<Task>> {
        let inner = self.lock()?;
        Ok(inner.sorted(|_| true).into_iter().rev().take(limit).collect())
    }

    fn create_task(&self, new: NewTask) -> StorageResult<CreateOutcome> {
        let keys = derive_keys(&new)?;
        let now = (self.clock)();
        let id = new.task_id.clone().unwrap_or_default();
        let mut inner = self.lock()?;

        let id_taken = match inner.tasks.iter().find(|t| t.id == id) {
            Some(existing) => {
                rules::check_id_reuse(existing, &keys)?;
                true
            }
            None => false,
        };

        if let Some(holder) = inner
            .tasks
            .iter_mut()
            .find(|t| t.idempotency_key.as_deref() == Some(keys.idempotency_key.as_str()))
        {
            if holder.status == TaskStatus::Succeeded {
                return Ok(CreateOutcome {
                    task: holder.clone(),
                    created: false,
                    existing: true,
                    result_available: true,
                });
            }
            if holder.status.is_in_flight() {
                holder.updated_at = now;
                return Ok(CreateOutcome {
                    task: holder.clone(),
                    created: false,
                    existing: true,
                    result_available: false,
                });
            }
            if holder.id != id && !id_taken {
                debug!(old = %holder.id, new = %id, status = %holder.status, "retiring idempotency key");
                rules::retire_key(holder, &id, now);
            }
        }

        if let Some(task) = inner.tasks.iter_mut().find(|t| t.id == id) {
            rules::refresh_request_fields(task, &keys, &new, now);
            return Ok(CreateOutcome {
                task: task.clone(),
                created: false,
                existing: true,
                result_available: false,
            });
        }

        let task = rules::new_task(id, keys, &new, now);
        inner.tasks.push(task.clone());
        Ok(CreateOutcome {
            task,
            created: true,
            existing: false,
            result_available: false,
        })
    }

    fn update_status(&self, id: &TaskId, status: TaskStatus, update: StatusUpdate) -> StorageResult<Task> {
        self.with_task(id, |t, now| {
            rules::apply_status(t, status, &update, now)?;
            Ok(t.clone())
        })
    }

    fn heartbeat(&self, id: &TaskId) -> StorageResult<()> {
        self.with_task(id, |t, now| {
            rules::apply_heartbeat(t, now);
            Ok(())
        })
    }

    fn increment_attempt(&self, id: &TaskId) -> StorageResult<u32> {
        self.with_task(id, |t, now| {
            t.attempt_count += 1;
            t.updated_at = now;
            Ok(t.attempt_count)
        })
    }

    fn list_by_status(&self, statuses: &[TaskStatus]) -> StorageResult<Vec<Task>> {
        let inner = self.lock()?;
        Ok(inner.sorted(|t| statuses.contains(&t.status)))
    }

    fn list_stale(&self, statuses: &[TaskStatus], timeout_secs: i64, now: EpochSecs) -> StorageResult<Vec<Task>> {
        let inner = self.lock()?;
        Ok(inner.sorted(|t| statuses.contains(&t.status) && t.heartbeat_is_stale(timeout_secs, now)))
    }

    fn mark_orphaned(&self, id: &TaskId) -> StorageResult<Task> {
        self.with_task(id, |t, now| {
            rules::apply_orphaned(t, now)?;
            Ok(t.clone())
        })
    }

    fn reopen(&self, id: &TaskId) -> StorageResult<Task> {
        self.with_task(id, |t, now| {
            rules::apply_reopen(t, now)?;
            Ok(t.clone())
        })
    }

    fn cancel(&self, id: &TaskId) -> StorageResult<Task> {
        self.with_task(id, |t, now| {
            rules::apply_cancel(t, now)?;
            Ok(t.clone())
        })
    }

    fn add_item(&self, task_id: &TaskId, original_path: &str, original_fingerprint: Option<&str>) -> StorageResult<TaskItem> {
        let now = (self.clock)();
        let mut inner = self.lock()?;
        inner.ensure_task(task_id)?;
        if let Some(item) = inner.item_mut(task_id, original_path) {
            rules::restart_item(item, original_fingerprint, now);
            return Ok(item.clone());
        }
        inner.next_item_id += 1;
        let item = rules::new_item(inner.next_item_id, task_id, original_path, original_fingerprint, now);
        inner.items.push(item.clone());
        Ok(item)
    }

    fn update_item(&self, task_id: &TaskId, original_path: &str, update: ItemUpdate) -> StorageResult<TaskItem> {
        let now = (self.clock)();
        let mut inner = self.lock()?;
        let item = inner
            .item_mut(task_id, original_path)
            .ok_or_else(|| StorageError::ItemNotFound {
                task_id: task_id.clone(),
                path: original_path.to_string(),
            })?;
        rules::apply_item_update(item, update, now);
        Ok(item.clone())
    }

    fn list_items(&self, task_id: &TaskId) -> StorageResult<Vec<TaskItem>> {
        let inner = self.lock()?;
        Ok(inner.items.iter().filter(|i| &i.task_id == task_id).cloned().collect())
    }
}
