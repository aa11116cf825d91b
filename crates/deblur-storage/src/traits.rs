use deblur_core::{EpochSecs, ErrorCode, FailureInfo, ItemStatus, Task, TaskId, TaskItem, TaskStatus};

use crate::{StorageError, StorageResult};

/// Request to create (or find) a task for an input folder.
#[derive(Clone, Debug)]
pub struct NewTask {
    /// Generated when absent.
    pub task_id: Option<TaskId>,
    pub input_path: String,
    pub output_path: String,
    pub prompt: String,
    pub model: String,
    pub params: serde_json::Value,
    /// Derived from the input folder when absent.
    pub input_fingerprint: Option<String>,
    /// Derived from (fingerprint, prompt, params) when absent.
    pub idempotency_key: Option<String>,
}

impl NewTask {
    pub fn new(
        input_path: impl Into<String>,
        output_path: impl Into<String>,
        prompt: impl Into<String>,
        model: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            task_id: None,
            input_path: input_path.into(),
            output_path: output_path.into(),
            prompt: prompt.into(),
            model: model.into(),
            params,
            input_fingerprint: None,
            idempotency_key: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CreateOutcome {
    pub task: Task,
    /// A new row was inserted.
    pub created: bool,
    /// An earlier row was returned or updated instead.
    pub existing: bool,
    /// The returned task already succeeded; its outputs can be served as-is.
    pub result_available: bool,
}

/// Optional fields written together with a status change.
#[derive(Clone, Debug, Default)]
pub struct StatusUpdate {
    pub total_files: Option<u32>,
    pub processed_files: Option<u32>,
    pub failure: Option<FailureInfo>,
    pub output_path: Option<String>,
    pub output_fingerprint: Option<String>,
    pub output_size: Option<u64>,
}

impl StatusUpdate {
    pub fn total(mut self, n: u32) -> Self {
        self.total_files = Some(n);
        self
    }

    pub fn processed(mut self, n: u32) -> Self {
        self.processed_files = Some(n);
        self
    }

    pub fn failure(mut self, failure: FailureInfo) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn output(mut self, fingerprint: impl Into<String>, size: u64) -> Self {
        self.output_fingerprint = Some(fingerprint.into());
        self.output_size = Some(size);
        self
    }
}

/// Outcome of one image. Only a completed item carries an output path.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemUpdate {
    Completed {
        modified_path: String,
        fingerprint: String,
        size: u64,
    },
    Failed {
        reason: String,
        code: ErrorCode,
    },
}

impl ItemUpdate {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemUpdate::Completed { .. } => ItemStatus::Completed,
            ItemUpdate::Failed { .. } => ItemStatus::Failed,
        }
    }
}

/// Durable record of tasks and their items.
///
/// Every write validates against the status transition table and returns the
/// record as stored.
pub trait TaskStore: Send + Sync {
    /// Most recently created task holding `key`.
    fn find_by_idempotency_key(&self, key: &str) -> StorageResult<Option<Task>>;
    fn get_task(&self, id: &TaskId) -> StorageResult<Option<Task>>;
    /// Newest first.
    fn list_tasks(&self, limit: usize) -> StorageResult<Vec<Task>>;

    fn create_task(&self, new: NewTask) -> StorageResult<CreateOutcome>;

    /// Moves the task to `status`, refreshing `updated_at` and the heartbeat.
    fn update_status(&self, id: &TaskId, status: TaskStatus, update: StatusUpdate) -> StorageResult<Task>;
    fn heartbeat(&self, id: &TaskId) -> StorageResult<()>;
    /// Returns the new attempt count.
    fn increment_attempt(&self, id: &TaskId) -> StorageResult<u32>;

    /// Oldest first.
    fn list_by_status(&self, statuses: &[TaskStatus]) -> StorageResult<Vec<Task>>;
    /// Tasks in `statuses` whose heartbeat is absent or older than `now - timeout_secs`, oldest first.
    fn list_stale(&self, statuses: &[TaskStatus], timeout_secs: i64, now: EpochSecs) -> StorageResult<Vec<Task>>;

    /// ORPHANED with a heartbeat-timeout failure. The heartbeat is left as found.
    fn mark_orphaned(&self, id: &TaskId) -> StorageResult<Task>;
    /// ORPHANED or FAILED back to PENDING; bumps the attempt count and clears the failure.
    fn reopen(&self, id: &TaskId) -> StorageResult<Task>;
    fn cancel(&self, id: &TaskId) -> StorageResult<Task>;

    /// Starts (or restarts) work on one image: upserts it as `processing`
    /// and bumps its attempt count.
    fn add_item(&self, task_id: &TaskId, original_path: &str, original_fingerprint: Option<&str>) -> StorageResult<TaskItem>;
    fn update_item(&self, task_id: &TaskId, original_path: &str, update: ItemUpdate) -> StorageResult<TaskItem>;
    /// In insertion order.
    fn list_items(&self, task_id: &TaskId) -> StorageResult<Vec<TaskItem>>;

    fn require_task(&self, id: &TaskId) -> StorageResult<Task> {
        self.get_task(id)?.ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    fn list_unfinished(&self) -> StorageResult<Vec<Task>> {
        self.list_by_status(&TaskStatus::UNFINISHED)
    }

    fn list_orphaned(&self, timeout_secs: i64, now: EpochSecs) -> StorageResult<Vec<Task>> {
        self.list_stale(&[TaskStatus::Running], timeout_secs, now)
    }

    /// Items not yet completed or failed.
    fn list_pending_items(&self, task_id: &TaskId) -> StorageResult<Vec<TaskItem>> {
        Ok(self
            .list_items(task_id)?
            .into_iter()
            .filter(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::Processing))
            .collect())
    }
}
