use deblur_core::{TaskId, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("no item {path:?} in task {task_id}")]
    ItemNotFound { task_id: TaskId, path: String },

    #[error("task {task_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task id {task_id} belongs to a {status} task for a different request")]
    Conflict { task_id: TaskId, status: TaskStatus },

    #[error("fingerprint input folder {path}")]
    Fingerprint {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage backend error")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("storage lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StorageError::Backend(Box::new(err))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
