use serde::{Deserialize, Serialize};

use crate::{ids::*, model::*, time::EpochSecs};

/// Why a task or item stopped short of success.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub category: ErrorCategory,
    pub code: ErrorCode,
    pub message: String,
}

impl FailureInfo {
    pub fn new(category: ErrorCategory, code: ErrorCode, message: impl Into<String>) -> Self {
        Self { category, code, message: message.into() }
    }

    pub fn heartbeat_timeout() -> Self {
        Self::new(
            ErrorCategory::HeartbeatTimeout,
            ErrorCode::HeartbeatTimeout,
            "task heartbeat timed out; worker presumed lost",
        )
    }
}

/// One logical unit of work over an input folder under a fixed prompt/parameter set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// `None` once a newer task took over the key.
    pub idempotency_key: Option<String>,
    pub status: TaskStatus,
    pub input_path: String,
    pub input_fingerprint: String,
    pub output_path: String,
    pub output_fingerprint: Option<String>,
    pub output_size: Option<u64>,
    pub prompt: String,
    pub model: String,
    pub params_blob: String,
    pub attempt_count: u32,
    pub total_files: u32,
    pub processed_files: u32,
    pub last_heartbeat_at: Option<EpochSecs>,
    pub failure: Option<FailureInfo>,
    pub superseded_by: Option<TaskId>,
    pub created_at: EpochSecs,
    pub updated_at: EpochSecs,
    pub started_at: Option<EpochSecs>,
    pub finished_at: Option<EpochSecs>,
}

impl Task {
    /// Heartbeat absent or older than `now - timeout_secs`.
    pub fn heartbeat_is_stale(&self, timeout_secs: i64, now: EpochSecs) -> bool {
        match self.last_heartbeat_at {
            None => true,
            Some(at) => at < now - timeout_secs,
        }
    }
}

/// One image within a task's batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: i64,
    pub task_id: TaskId,
    pub original_image_path: String,
    pub original_fingerprint: Option<String>,
    /// Present iff `status == Completed`.
    pub modified_image_path: Option<String>,
    pub modified_fingerprint: Option<String>,
    pub output_size: Option<u64>,
    pub status: ItemStatus,
    pub error_reason: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub attempt_count: u32,
    pub created_at: EpochSecs,
    pub updated_at: EpochSecs,
    pub started_at: Option<EpochSecs>,
    pub finished_at: Option<EpochSecs>,
}
