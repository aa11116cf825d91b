//! Record mutations shared by every backend. Each backend loads the row,
//! applies one of these and writes it back under its own lock/transaction.

use deblur_core::{can_transition, EpochSecs, FailureInfo, ItemStatus, Task, TaskId, TaskItem, TaskStatus};

use crate::{DerivedKeys, ItemUpdate, NewTask, StatusUpdate, StorageError, StorageResult};

pub fn check_transition(task: &Task, to: TaskStatus) -> StorageResult<()> {
    if can_transition(task.status, to) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            task_id: task.id.clone(),
            from: task.status,
            to,
        })
    }
}

pub fn new_task(id: TaskId, keys: DerivedKeys, new: &NewTask, now: EpochSecs) -> Task {
    Task {
        id,
        idempotency_key: Some(keys.idempotency_key),
        status: TaskStatus::Pending,
        input_path: new.input_path.clone(),
        input_fingerprint: keys.input_fingerprint,
        output_path: new.output_path.clone(),
        output_fingerprint: None,
        output_size: None,
        prompt: new.prompt.clone(),
        model: new.model.clone(),
        params_blob: keys.params_blob,
        attempt_count: 0,
        total_files: 0,
        processed_files: 0,
        last_heartbeat_at: None,
        failure: None,
        superseded_by: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        finished_at: None,
    }
}

/// A caller-chosen id that already exists may only take a different request
/// while its task can still run again.
pub fn check_id_reuse(task: &Task, keys: &DerivedKeys) -> StorageResult<()> {
    let same_request = task.idempotency_key.as_deref() == Some(keys.idempotency_key.as_str());
    if !same_request && matches!(task.status, TaskStatus::Succeeded | TaskStatus::Canceled) {
        return Err(StorageError::Conflict {
            task_id: task.id.clone(),
            status: task.status,
        });
    }
    Ok(())
}

/// Id collision on insert: refresh the caller-supplied fields, keep status,
/// progress and the input fingerprint. A row taken over by a different request
/// stops answering for its old key.
pub fn refresh_request_fields(task: &mut Task, keys: &DerivedKeys, new: &NewTask, now: EpochSecs) {
    if task.idempotency_key.as_deref() != Some(keys.idempotency_key.as_str()) {
        task.idempotency_key = None;
    }
    task.input_path = new.input_path.clone();
    task.output_path = new.output_path.clone();
    task.prompt = new.prompt.clone();
    task.model = new.model.clone();
    task.params_blob = keys.params_blob.clone();
    task.updated_at = now;
}

/// The old row gives up its key so a fresh task can take it.
pub fn retire_key(task: &mut Task, successor: &TaskId, now: EpochSecs) {
    task.idempotency_key = None;
    task.superseded_by = Some(successor.clone());
    task.updated_at = now;
}

pub fn apply_status(task: &mut Task, to: TaskStatus, update: &StatusUpdate, now: EpochSecs) -> StorageResult<()> {
    check_transition(task, to)?;

    task.status = to;
    task.updated_at = now;
    task.last_heartbeat_at = Some(task.last_heartbeat_at.map_or(now, |at| at.max(now)));

    if to == TaskStatus::Running && task.started_at.is_none() {
        task.started_at = Some(now);
    }
    if to.is_terminal() {
        task.finished_at = Some(now);
    }

    if let Some(total) = update.total_files {
        if task.total_files == 0 {
            task.total_files = total;
        }
    }
    if let Some(processed) = update.processed_files {
        task.processed_files = task.processed_files.max(processed).min(task.total_files);
    }

    if to == TaskStatus::Succeeded {
        task.failure = None;
    }
    if let Some(failure) = &update.failure {
        task.failure = Some(failure.clone());
    }

    if let Some(path) = &update.output_path {
        task.output_path = path.clone();
    }
    if let Some(fp) = &update.output_fingerprint {
        task.output_fingerprint = Some(fp.clone());
    }
    if let Some(size) = update.output_size {
        task.output_size = Some(size);
    }
    Ok(())
}

pub fn apply_heartbeat(task: &mut Task, now: EpochSecs) {
    task.last_heartbeat_at = Some(task.last_heartbeat_at.map_or(now, |at| at.max(now)));
    task.updated_at = now;
}

pub fn apply_orphaned(task: &mut Task, now: EpochSecs) -> StorageResult<()> {
    check_transition(task, TaskStatus::Orphaned)?;
    task.status = TaskStatus::Orphaned;
    task.failure = Some(FailureInfo::heartbeat_timeout());
    task.updated_at = now;
    Ok(())
}

pub fn apply_reopen(task: &mut Task, now: EpochSecs) -> StorageResult<()> {
    if !task.status.is_resumable() {
        return Err(StorageError::InvalidTransition {
            task_id: task.id.clone(),
            from: task.status,
            to: TaskStatus::Pending,
        });
    }
    task.status = TaskStatus::Pending;
    task.attempt_count += 1;
    task.failure = None;
    task.finished_at = None;
    task.updated_at = now;
    Ok(())
}

pub fn apply_cancel(task: &mut Task, now: EpochSecs) -> StorageResult<()> {
    check_transition(task, TaskStatus::Canceled)?;
    task.status = TaskStatus::Canceled;
    task.finished_at = Some(now);
    task.updated_at = now;
    Ok(())
}

pub fn new_item(id: i64, task_id: &TaskId, path: &str, fingerprint: Option<&str>, now: EpochSecs) -> TaskItem {
    TaskItem {
        id,
        task_id: task_id.clone(),
        original_image_path: path.to_string(),
        original_fingerprint: fingerprint.map(str::to_string),
        modified_image_path: None,
        modified_fingerprint: None,
        output_size: None,
        status: ItemStatus::Processing,
        error_reason: None,
        error_code: None,
        attempt_count: 1,
        created_at: now,
        updated_at: now,
        started_at: Some(now),
        finished_at: None,
    }
}

/// Another attempt at an item that already has a row. Any earlier output is
/// forgotten until the new attempt completes.
pub fn restart_item(item: &mut TaskItem, fingerprint: Option<&str>, now: EpochSecs) {
    if let Some(fp) = fingerprint {
        item.original_fingerprint = Some(fp.to_string());
    }
    item.status = ItemStatus::Processing;
    item.modified_image_path = None;
    item.modified_fingerprint = None;
    item.output_size = None;
    item.attempt_count += 1;
    item.error_reason = None;
    item.error_code = None;
    item.started_at = Some(now);
    item.finished_at = None;
    item.updated_at = now;
}

pub fn apply_item_update(item: &mut TaskItem, update: ItemUpdate, now: EpochSecs) {
    item.status = update.status();
    item.updated_at = now;
    item.finished_at = Some(now);
    match update {
        ItemUpdate::Completed {
            modified_path,
            fingerprint,
            size,
        } => {
            item.modified_image_path = Some(modified_path);
            item.modified_fingerprint = Some(fingerprint);
            item.output_size = Some(size);
            item.error_reason = None;
            item.error_code = None;
        }
        ItemUpdate::Failed { reason, code } => {
            item.modified_image_path = None;
            item.modified_fingerprint = None;
            item.output_size = None;
            item.error_reason = Some(reason);
            item.error_code = Some(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deblur_core::{ErrorCategory, ErrorCode};
    use serde_json::json;

    fn task() -> Task {
        let new = NewTask::new("/in", "/out", "p", "m", json!({}));
        let keys = DerivedKeys {
            input_fingerprint: "fp".into(),
            idempotency_key: "k".into(),
            params_blob: "{}".into(),
        };
        new_task(TaskId::from_str("t"), keys, &new, 100)
    }

    fn running(total: u32) -> Task {
        let mut t = task();
        apply_status(&mut t, TaskStatus::Submitted, &StatusUpdate::default(), 101).unwrap();
        apply_status(&mut t, TaskStatus::Running, &StatusUpdate::default().total(total), 102).unwrap();
        t
    }

    #[test]
    fn running_sets_started_once() {
        let mut t = running(3);
        assert_eq!(t.started_at, Some(102));
        apply_status(&mut t, TaskStatus::Running, &StatusUpdate::default().processed(1), 110).unwrap();
        assert_eq!(t.started_at, Some(102));
        assert_eq!(t.last_heartbeat_at, Some(110));
    }

    #[test]
    fn total_is_fixed_by_first_enumeration() {
        let mut t = running(3);
        apply_status(&mut t, TaskStatus::Running, &StatusUpdate::default().total(9), 103).unwrap();
        assert_eq!(t.total_files, 3);
    }

    #[test]
    fn processed_never_decreases_or_exceeds_total() {
        let mut t = running(3);
        apply_status(&mut t, TaskStatus::Running, &StatusUpdate::default().processed(2), 103).unwrap();
        apply_status(&mut t, TaskStatus::Running, &StatusUpdate::default().processed(1), 104).unwrap();
        assert_eq!(t.processed_files, 2);
        apply_status(&mut t, TaskStatus::Running, &StatusUpdate::default().processed(7), 105).unwrap();
        assert_eq!(t.processed_files, 3);
    }

    #[test]
    fn success_clears_failure_and_finishes() {
        let mut t = running(1);
        t.failure = Some(FailureInfo::new(ErrorCategory::Timeout, ErrorCode::Timeout, "slow"));
        apply_status(&mut t, TaskStatus::Succeeded, &StatusUpdate::default().processed(1), 120).unwrap();
        assert!(t.failure.is_none());
        assert_eq!(t.finished_at, Some(120));
    }

    #[test]
    fn invalid_transition_is_rejected_untouched() {
        let mut t = task();
        let before = t.clone();
        let err = apply_status(&mut t, TaskStatus::Succeeded, &StatusUpdate::default(), 200).unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Succeeded,
                ..
            }
        ));
        assert_eq!(t, before);
    }

    #[test]
    fn heartbeat_never_goes_backwards() {
        let mut t = running(1);
        apply_heartbeat(&mut t, 500);
        apply_heartbeat(&mut t, 400);
        assert_eq!(t.last_heartbeat_at, Some(500));
    }

    #[test]
    fn orphan_then_reopen() {
        let mut t = running(2);
        apply_orphaned(&mut t, 300).unwrap();
        assert_eq!(t.status, TaskStatus::Orphaned);
        assert_eq!(t.failure.as_ref().map(|f| f.code), Some(ErrorCode::HeartbeatTimeout));
        assert_eq!(t.last_heartbeat_at, Some(102));

        apply_reopen(&mut t, 310).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempt_count, 1);
        assert!(t.failure.is_none());
    }

    #[test]
    fn succeeded_task_cannot_be_reopened_or_canceled() {
        let mut t = running(1);
        apply_status(&mut t, TaskStatus::Succeeded, &StatusUpdate::default(), 120).unwrap();
        assert!(apply_reopen(&mut t, 130).is_err());
        assert!(apply_cancel(&mut t, 130).is_err());
    }

    #[test]
    fn failed_item_drops_output_fields() {
        let mut item = new_item(1, &TaskId::from_str("t"), "a.jpg", None, 10);
        apply_item_update(
            &mut item,
            ItemUpdate::Completed {
                modified_path: "out/a_clear.jpg".into(),
                fingerprint: "ff".into(),
                size: 9,
            },
            11,
        );
        assert_eq!(item.status, ItemStatus::Completed);

        restart_item(&mut item, None, 12);
        apply_item_update(
            &mut item,
            ItemUpdate::Failed {
                reason: "boom".into(),
                code: ErrorCode::Timeout,
            },
            13,
        );
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.modified_image_path.is_none());
        assert_eq!(item.attempt_count, 2);
    }

    #[test]
    fn restarted_item_forgets_earlier_output() {
        let mut item = new_item(1, &TaskId::from_str("t"), "a.jpg", None, 10);
        apply_item_update(
            &mut item,
            ItemUpdate::Completed {
                modified_path: "out/a.jpg".into(),
                fingerprint: "ff".into(),
                size: 9,
            },
            11,
        );

        restart_item(&mut item, Some("fa2"), 12);
        assert_eq!(item.status, ItemStatus::Processing);
        assert!(item.modified_image_path.is_none());
        assert!(item.modified_fingerprint.is_none());
        assert!(item.output_size.is_none());
        assert_eq!(item.original_fingerprint.as_deref(), Some("fa2"));
    }

    fn other_keys() -> DerivedKeys {
        DerivedKeys {
            input_fingerprint: "fp-b".into(),
            idempotency_key: "k-b".into(),
            params_blob: "{}".into(),
        }
    }

    #[test]
    fn finished_task_id_cannot_take_another_request() {
        let mut done = running(1);
        apply_status(&mut done, TaskStatus::Succeeded, &StatusUpdate::default().processed(1), 120).unwrap();
        let err = check_id_reuse(&done, &other_keys()).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                status: TaskStatus::Succeeded,
                ..
            }
        ));

        let mut canceled = task();
        apply_cancel(&mut canceled, 130).unwrap();
        assert!(check_id_reuse(&canceled, &other_keys()).is_err());

        // same request is always fine
        let same = DerivedKeys {
            input_fingerprint: "fp".into(),
            idempotency_key: "k".into(),
            params_blob: "{}".into(),
        };
        assert!(check_id_reuse(&done, &same).is_ok());
    }

    #[test]
    fn refresh_keeps_fingerprint_and_releases_foreign_key() {
        let mut t = task();
        let mut new = NewTask::new("/in-b", "/out-b", "denoise", "m2", json!({}));
        new.task_id = Some(TaskId::from_str("t"));
        assert!(check_id_reuse(&t, &other_keys()).is_ok());

        refresh_request_fields(&mut t, &other_keys(), &new, 150);
        assert_eq!(t.input_path, "/in-b");
        assert_eq!(t.output_path, "/out-b");
        assert_eq!(t.prompt, "denoise");
        assert_eq!(t.input_fingerprint, "fp");
        assert_eq!(t.idempotency_key, None);
        assert_eq!(t.status, TaskStatus::Pending);
    }
}
