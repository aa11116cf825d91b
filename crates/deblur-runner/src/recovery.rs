use std::sync::Arc;

use deblur_core::{now_unix, EpochSecs, TaskId, TaskStatus};
use deblur_storage::{StorageResult, TaskStore};
use tracing::{info, warn};

use crate::batch::{BatchError, BatchOutcome, BatchRequest, BatchRunner};

/// What one recovery pass did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Tasks whose worker was presumed lost.
    pub orphaned: Vec<TaskId>,
    pub resumed: Option<TaskId>,
    pub outcome: Option<BatchOutcome>,
    /// Candidates left for a later pass.
    pub queued: Vec<TaskId>,
}

/// Reclaims tasks whose worker stopped heartbeating.
pub struct RecoveryScanner {
    store: Arc<dyn TaskStore>,
    stale_timeout_secs: i64,
}

impl RecoveryScanner {
    pub fn new(store: Arc<dyn TaskStore>, stale_timeout_secs: i64) -> Self {
        Self {
            store,
            stale_timeout_secs,
        }
    }

    /// Marks SUBMITTED/RUNNING tasks with a stale heartbeat as ORPHANED.
    /// Tasks with a fresh heartbeat belong to a live worker and are left alone.
    pub fn mark_stale(&self, now: EpochSecs) -> StorageResult<Vec<TaskId>> {
        let stale = self.store.list_stale(
            &[TaskStatus::Submitted, TaskStatus::Running],
            self.stale_timeout_secs,
            now,
        )?;
        let mut orphaned = Vec::with_capacity(stale.len());
        for task in stale {
            match self.store.mark_orphaned(&task.id) {
                Ok(t) => {
                    info!(task = %t.id, last_heartbeat = ?task.last_heartbeat_at, "marked task orphaned");
                    orphaned.push(t.id);
                }
                Err(e) => warn!(task = %task.id, error = %e, "could not mark task orphaned"),
            }
        }
        Ok(orphaned)
    }

    pub async fn recover(&self, runner: &BatchRunner) -> Result<RecoveryReport, BatchError> {
        self.recover_at(runner, now_unix()).await
    }

    /// Orphans stale tasks, then resumes the oldest ORPHANED or PENDING task.
    /// At most one task is resumed per pass.
    pub async fn recover_at(&self, runner: &BatchRunner, now: EpochSecs) -> Result<RecoveryReport, BatchError> {
        let orphaned = self.mark_stale(now)?;
        let mut candidates = self
            .store
            .list_by_status(&[TaskStatus::Orphaned, TaskStatus::Pending])?
            .into_iter();

        let mut report = RecoveryReport {
            orphaned,
            ..Default::default()
        };
        if let Some(task) = candidates.next() {
            info!(task = %task.id, status = %task.status, "resuming task");
            let outcome = runner.run_batch(BatchRequest::resume_task(&task)?).await?;
            report.resumed = Some(task.id);
            report.outcome = Some(outcome);
        }
        report.queued = candidates.map(|t| t.id).collect();
        Ok(report)
    }
}
