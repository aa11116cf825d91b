use serde::Serialize;

use crate::{engine::progress_percent, ItemStatus, Task, TaskItem, TaskStatus};

/// Human-facing progress view of a task, derived from stored records only.
#[derive(Clone, Debug, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub total_files: u32,
    pub processed_files: u32,
    pub completed_items: usize,
    pub failed_items: usize,
    pub progress_percent: u8,
    pub attempt_count: u32,
    pub summary: String,
    pub errors: Vec<String>,
}

impl TaskReport {
    pub fn build(task: &Task, items: &[TaskItem]) -> Self {
        let completed_items = items.iter().filter(|i| i.status == ItemStatus::Completed).count();
        let errors: Vec<String> = items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .map(|i| {
                let code = i.error_code.map(|c| c.as_str()).unwrap_or("UNKNOWN_ERROR");
                format!("{}: [{}] {}", i.original_image_path, code, i.error_reason.as_deref().unwrap_or(""))
            })
            .collect();

        let summary = match task.status {
            TaskStatus::Pending | TaskStatus::Submitted => "waiting to start".to_string(),
            // processed_files never goes down, so a resumed task would already
            // read as complete; count finished images instead
            TaskStatus::Running => format!("processing: {completed_items} of {} image(s) done", task.total_files),
            TaskStatus::Succeeded => format!("all {} image(s) processed", task.total_files),
            TaskStatus::Failed if task.processed_files > 0 => {
                format!("finished with {} error(s)", errors.len())
            }
            TaskStatus::Failed => match &task.failure {
                Some(f) => format!("failed: {}", f.message),
                None => "failed".to_string(),
            },
            TaskStatus::Orphaned => format!(
                "orphaned at {}/{}; resume to continue",
                task.processed_files, task.total_files
            ),
            TaskStatus::Canceled => "canceled".to_string(),
        };

        Self {
            task_id: task.id.as_str().to_string(),
            status: task.status,
            total_files: task.total_files,
            processed_files: task.processed_files,
            completed_items,
            failed_items: errors.len(),
            progress_percent: progress_percent(task.processed_files, task.total_files),
            attempt_count: task.attempt_count,
            summary,
            errors,
        }
    }
}
