use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use deblur_artifacts::{output_path_for, CommitError, CommittedArtifact, ResultCommitter};
use deblur_classify::{classify, classify_error, error_chain};
use deblur_core::{ErrorCategory, ErrorCode, FailureInfo, ItemStatus, Task, TaskId, TaskStatus};
use deblur_fingerprint::{fingerprint_bytes, fingerprint_folder, image_files};
use deblur_storage::{ItemUpdate, NewTask, StatusUpdate, StorageError, TaskStore};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::editor::{EditError, EditOptions, ImageEditor};
use crate::guard::BatchGuard;
use crate::heartbeat::HeartbeatTicker;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("another batch is already running")]
    Busy,

    #[error("resume requested without a task id")]
    ResumeWithoutTask,

    #[error("task {task_id} is {status} and cannot be run again")]
    NotResumable { task_id: TaskId, status: TaskStatus },

    #[error("enumerate input folder {path}")]
    Enumerate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored edit options are unreadable")]
    Options(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Clone, Debug)]
pub struct BatchRequest {
    pub input_folder: PathBuf,
    pub output_folder: PathBuf,
    pub options: EditOptions,
    pub task_id: Option<TaskId>,
    pub resume: bool,
}

impl BatchRequest {
    pub fn new(input_folder: impl Into<PathBuf>, output_folder: impl Into<PathBuf>, options: EditOptions) -> Self {
        Self {
            input_folder: input_folder.into(),
            output_folder: output_folder.into(),
            options,
            task_id: None,
            resume: false,
        }
    }

    /// Continue a stored task with the folders and options it was created with.
    pub fn resume_task(task: &Task) -> Result<Self, BatchError> {
        Ok(Self {
            input_folder: PathBuf::from(&task.input_path),
            output_folder: PathBuf::from(&task.output_path),
            options: EditOptions::from_task(task)?,
            task_id: Some(task.id.clone()),
            resume: true,
        })
    }
}

#[derive(Clone, Debug)]
pub struct BatchSummary {
    pub task: Task,
    /// Completed in this run.
    pub completed: u32,
    /// Failed in this run.
    pub failed: u32,
    /// Already completed by an earlier run.
    pub skipped: u32,
}

#[derive(Clone, Debug)]
pub enum BatchOutcome {
    /// An identical task already succeeded; nothing was redone.
    Reused(Task),
    /// An identical task is queued or running elsewhere.
    InFlight(Task),
    Finished(BatchSummary),
    Canceled(BatchSummary),
}

impl BatchOutcome {
    pub fn task(&self) -> &Task {
        match self {
            BatchOutcome::Reused(t) | BatchOutcome::InFlight(t) => t,
            BatchOutcome::Finished(s) | BatchOutcome::Canceled(s) => &s.task,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunnerSettings {
    pub heartbeat_interval: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
enum FileError {
    #[error("read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Edit(#[from] EditError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("image worker stopped: {0}")]
    Worker(String),
}

impl FileError {
    /// What went wrong, without the file paths. Camera names like
    /// `DSC_0401.jpg` would otherwise read as HTTP status codes.
    fn kind_text(&self) -> String {
        match self {
            FileError::Read { source, .. } => format!("read file: {source}"),
            FileError::Edit(e) => error_chain(e),
            FileError::Commit(CommitError::Io { op, source, .. }) => format!("{op} file: {source}"),
            FileError::Commit(CommitError::Empty(_)) => "write file: empty result".to_string(),
            FileError::Commit(CommitError::SizeMismatch { .. }) => "write file: size mismatch after rename".to_string(),
            FileError::Worker(msg) => msg.clone(),
        }
    }
}

enum Resolved {
    Run(Task),
    Done(BatchOutcome),
}

/// Drives one task over its input folder, one image at a time.
pub struct BatchRunner {
    store: Arc<dyn TaskStore>,
    editor: Arc<dyn ImageEditor>,
    committer: Arc<dyn ResultCommitter>,
    settings: RunnerSettings,
    guard: BatchGuard,
}

impl BatchRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        editor: Arc<dyn ImageEditor>,
        committer: Arc<dyn ResultCommitter>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            editor,
            committer,
            settings,
            guard: BatchGuard::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn guard(&self) -> &BatchGuard {
        &self.guard
    }

    pub async fn run_batch(&self, req: BatchRequest) -> Result<BatchOutcome, BatchError> {
        let _permit = self.guard.try_enter().ok_or(BatchError::Busy)?;

        let task = match self.resolve(&req)? {
            Resolved::Run(task) => task,
            Resolved::Done(outcome) => return Ok(outcome),
        };
        self.process(task).await
    }

    fn resolve(&self, req: &BatchRequest) -> Result<Resolved, BatchError> {
        if req.resume {
            let id = req.task_id.as_ref().ok_or(BatchError::ResumeWithoutTask)?;
            let task = self.store.require_task(id)?;
            return self.prepare(task);
        }

        let out = self.store.create_task(NewTask {
            task_id: req.task_id.clone(),
            input_path: req.input_folder.to_string_lossy().into_owned(),
            output_path: req.output_folder.to_string_lossy().into_owned(),
            prompt: req.options.prompt.clone(),
            model: req.options.model.clone(),
            params: req.options.params(),
            input_fingerprint: None,
            idempotency_key: None,
        })?;

        if out.result_available {
            info!(task = %out.task.id, "identical task already succeeded; reusing its result");
            return Ok(Resolved::Done(BatchOutcome::Reused(out.task)));
        }
        if !out.created && out.task.status.is_in_flight() {
            info!(task = %out.task.id, status = %out.task.status, "identical task already in flight");
            return Ok(Resolved::Done(BatchOutcome::InFlight(out.task)));
        }
        self.prepare(out.task)
    }

    /// Brings a task to PENDING, or explains why it should not run.
    fn prepare(&self, task: Task) -> Result<Resolved, BatchError> {
        match task.status {
            TaskStatus::Pending => Ok(Resolved::Run(task)),
            TaskStatus::Orphaned | TaskStatus::Failed => {
                let task = self.store.reopen(&task.id)?;
                info!(task = %task.id, attempt = task.attempt_count, "resuming task");
                Ok(Resolved::Run(task))
            }
            TaskStatus::Succeeded => Ok(Resolved::Done(BatchOutcome::Reused(task))),
            TaskStatus::Submitted | TaskStatus::Running => Ok(Resolved::Done(BatchOutcome::InFlight(task))),
            TaskStatus::Canceled => Err(BatchError::NotResumable {
                task_id: task.id,
                status: task.status,
            }),
        }
    }

    async fn process(&self, task: Task) -> Result<BatchOutcome, BatchError> {
        let id = task.id.clone();
        let options = EditOptions::from_task(&task)?;
        let input = PathBuf::from(&task.input_path);
        let output = PathBuf::from(&task.output_path);

        self.store.update_status(&id, TaskStatus::Submitted, StatusUpdate::default())?;

        let files = match image_files(&input) {
            Ok(files) => files,
            Err(source) => {
                let c = classify_error(&source);
                let failure = c.failure(format!("cannot read input folder {}: {source}", input.display()));
                self.store.update_status(&id, TaskStatus::Failed, StatusUpdate::default().failure(failure))?;
                return Err(BatchError::Enumerate { path: input, source });
            }
        };

        if files.is_empty() {
            let failure = FailureInfo::new(
                ErrorCategory::Validation,
                ErrorCode::NoFilesFound,
                format!("no image files in {}", input.display()),
            );
            warn!(task = %id, input = %input.display(), "no image files to process");
            let task = self
                .store
                .update_status(&id, TaskStatus::Failed, StatusUpdate::default().failure(failure))?;
            return Ok(BatchOutcome::Finished(BatchSummary {
                task,
                completed: 0,
                failed: 0,
                skipped: 0,
            }));
        }

        let total = files.len() as u32;
        let done_before: HashSet<String> = self
            .store
            .list_items(&id)?
            .into_iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .map(|i| i.original_image_path)
            .collect();
        let todo: Vec<PathBuf> = files
            .into_iter()
            .filter(|p| !done_before.contains(&item_key(p)))
            .collect();
        let skipped = total - todo.len() as u32;
        // the store keeps the larger of this and an earlier run's count
        let mut processed = skipped;

        self.store.update_status(
            &id,
            TaskStatus::Running,
            StatusUpdate::default().total(total).processed(processed),
        )?;
        info!(task = %id, total, skipped, "batch running");

        let _heartbeat = HeartbeatTicker::spawn(self.store.clone(), id.clone(), self.settings.heartbeat_interval);

        let mut completed = 0u32;
        let mut failures: Vec<FailureInfo> = Vec::new();

        for path in todo {
            if self.is_canceled(&id) {
                info!(task = %id, processed, total, "batch canceled");
                return self.canceled(&id, completed, failures.len() as u32, skipped);
            }

            match self.process_file(&id, &path, &output, &options).await {
                Ok(artifact) => {
                    completed += 1;
                    debug!(task = %id, output = %artifact.path.display(), size = artifact.size, "image done");
                }
                Err(failure) => failures.push(failure),
            }

            processed += 1;
            if let Err(e) = self
                .store
                .update_status(&id, TaskStatus::Running, StatusUpdate::default().processed(processed))
            {
                warn!(task = %id, error = %e, "failed to record progress");
            }
        }

        if self.is_canceled(&id) {
            info!(task = %id, "batch canceled after the last image");
            return self.canceled(&id, completed, failures.len() as u32, skipped);
        }

        let mut update = StatusUpdate::default().processed(processed);
        if let Some((fingerprint, size)) = self.output_identity(&id, &output) {
            update = update.output(fingerprint, size);
        }

        let task = if failures.is_empty() {
            self.store.update_status(&id, TaskStatus::Succeeded, update)?
        } else {
            let first = &failures[0];
            let failure = FailureInfo::new(
                first.category,
                first.code,
                format!(
                    "{} of {} image(s) failed; first error: {}",
                    failures.len(),
                    total,
                    first.message
                ),
            );
            self.store.update_status(&id, TaskStatus::Failed, update.failure(failure))?
        };
        info!(task = %id, status = %task.status, completed, failed = failures.len(), skipped, "batch finished");

        Ok(BatchOutcome::Finished(BatchSummary {
            task,
            completed,
            failed: failures.len() as u32,
            skipped,
        }))
    }

    /// Runs one image through read, edit and commit. Item bookkeeping
    /// failures are logged; the image outcome is what counts.
    async fn process_file(
        &self,
        id: &TaskId,
        path: &Path,
        output: &Path,
        options: &EditOptions,
    ) -> Result<CommittedArtifact, FailureInfo> {
        let key = item_key(path);

        let read = {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || std::fs::read(&path).map_err(|source| FileError::Read { path, source }))
                .await
                .unwrap_or_else(|e| Err(FileError::Worker(e.to_string())))
        };
        let fingerprint = read.as_ref().ok().map(|bytes| fingerprint_bytes(bytes));
        if let Err(e) = self.store.add_item(id, &key, fingerprint.as_deref()) {
            warn!(task = %id, image = %key, error = %e, "failed to record item start");
        }

        let result = match read {
            Ok(bytes) => {
                let editor = self.editor.clone();
                let committer = self.committer.clone();
                let target = output_path_for(path, output, &options.output_suffix, &options.output_extension);
                let size = options.target;
                let prompt = options.prompt.clone();
                tokio::task::spawn_blocking(move || -> Result<CommittedArtifact, FileError> {
                    let edited = editor.edit(&bytes, size, &prompt)?;
                    Ok(committer.commit_atomic(&edited, &target)?)
                })
                .await
                .unwrap_or_else(|e| Err(FileError::Worker(e.to_string())))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(artifact) => {
                let update = ItemUpdate::Completed {
                    modified_path: artifact.path.to_string_lossy().into_owned(),
                    fingerprint: artifact.fingerprint.clone(),
                    size: artifact.size,
                };
                if let Err(e) = self.store.update_item(id, &key, update) {
                    warn!(task = %id, image = %key, error = %e, "failed to record item completion");
                }
                Ok(artifact)
            }
            Err(err) => {
                let reason = error_chain(&err);
                let c = classify(&err.kind_text());
                warn!(task = %id, image = %key, code = %c.code, retriable = c.retriable, error = %reason, "image failed");

                let update = ItemUpdate::Failed {
                    reason: reason.clone(),
                    code: c.code,
                };
                if let Err(e) = self.store.update_item(id, &key, update) {
                    warn!(task = %id, image = %key, error = %e, "failed to record item failure");
                }
                if c.retriable {
                    if let Err(e) = self.store.increment_attempt(id) {
                        warn!(task = %id, error = %e, "failed to bump attempt count");
                    }
                }
                Err(c.failure(format!("{key}: {reason}")))
            }
        }
    }

    fn canceled(&self, id: &TaskId, completed: u32, failed: u32, skipped: u32) -> Result<BatchOutcome, BatchError> {
        let task = self.store.require_task(id)?;
        Ok(BatchOutcome::Canceled(BatchSummary {
            task,
            completed,
            failed,
            skipped,
        }))
    }

    fn is_canceled(&self, id: &TaskId) -> bool {
        match self.store.get_task(id) {
            Ok(Some(task)) => task.status == TaskStatus::Canceled,
            Ok(None) => false,
            Err(e) => {
                warn!(task = %id, error = %e, "could not check for cancellation");
                false
            }
        }
    }

    /// Folder fingerprint of the output plus the total size of every committed item.
    fn output_identity(&self, id: &TaskId, output: &Path) -> Option<(String, u64)> {
        let fingerprint = match fingerprint_folder(output) {
            Ok(fp) => fp,
            Err(e) => {
                debug!(task = %id, output = %output.display(), error = %e, "no output fingerprint");
                return None;
            }
        };
        let size = match self.store.list_items(id) {
            Ok(items) => items.iter().filter_map(|i| i.output_size).sum(),
            Err(e) => {
                warn!(task = %id, error = %e, "failed to sum output sizes");
                return None;
            }
        };
        Some((fingerprint, size))
    }
}

fn item_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
