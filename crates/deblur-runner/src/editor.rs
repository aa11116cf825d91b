use std::time::Duration;

use deblur_core::Task;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Everything that shapes a result besides the input images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditOptions {
    pub prompt: String,
    pub model: String,
    pub target: TargetSize,
    pub output_suffix: String,
    pub output_extension: String,
}

/// The part of `EditOptions` stored as the task's params blob.
#[derive(Serialize, Deserialize)]
struct StoredParams {
    model: String,
    width: u32,
    height: u32,
    output_suffix: String,
    output_extension: String,
}

impl EditOptions {
    /// Params that take part in the idempotency key. The prompt is keyed separately.
    pub fn params(&self) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "width": self.target.width,
            "height": self.target.height,
            "output_suffix": self.output_suffix,
            "output_extension": self.output_extension,
        })
    }

    /// Rebuilds the options a stored task was created with.
    pub fn from_task(task: &Task) -> Result<Self, serde_json::Error> {
        let p: StoredParams = serde_json::from_str(&task.params_blob)?;
        Ok(Self {
            prompt: task.prompt.clone(),
            model: p.model,
            target: TargetSize::new(p.width, p.height),
            output_suffix: p.output_suffix,
            output_extension: p.output_extension,
        })
    }
}

#[derive(Debug, Error)]
pub enum EditError {
    /// Non-2xx answer. Formatted so the status code reaches the classifier.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("editor request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("editor request failed")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("editor returned no image data")]
    EmptyResponse,

    #[error("invalid editor request: {0}")]
    InvalidRequest(String),
}

/// Remote (or local) image edit. Blocking; callers run it off the async runtime.
pub trait ImageEditor: Send + Sync {
    fn edit(&self, image: &[u8], target: TargetSize, prompt: &str) -> Result<Vec<u8>, EditError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use deblur_core::{TaskId, TaskStatus};

    fn options() -> EditOptions {
        EditOptions {
            prompt: "sharpen".into(),
            model: "m1".into(),
            target: TargetSize::new(1024, 1536),
            output_suffix: "_clear".into(),
            output_extension: "jpg".into(),
        }
    }

    #[test]
    fn options_survive_the_params_blob() {
        let opts = options();
        let task = Task {
            id: TaskId::from_str("t"),
            idempotency_key: None,
            status: TaskStatus::Orphaned,
            input_path: "/in".into(),
            input_fingerprint: "fp".into(),
            output_path: "/out".into(),
            output_fingerprint: None,
            output_size: None,
            prompt: opts.prompt.clone(),
            model: opts.model.clone(),
            params_blob: deblur_fingerprint::canonical_json(&opts.params()),
            attempt_count: 0,
            total_files: 0,
            processed_files: 0,
            last_heartbeat_at: None,
            failure: None,
            superseded_by: None,
            created_at: 0,
            updated_at: 0,
            started_at: None,
            finished_at: None,
        };
        assert_eq!(EditOptions::from_task(&task).unwrap(), opts);
    }

    #[test]
    fn http_error_text_carries_status() {
        let err = EditError::Http { status: 429, body: "slow down".into() };
        assert_eq!(err.to_string(), "HTTP 429: slow down");
        assert_eq!(EditError::Timeout(Duration::from_secs(300)).to_string(), "editor request timed out after 300s");
    }
}
