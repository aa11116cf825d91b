use deblur_core::{ErrorCategory, ErrorCode, FailureInfo, ItemStatus, TaskId, TaskStatus};
use deblur_storage::{ItemUpdate, NewTask, StatusUpdate, StorageError, TaskStore};
use deblur_storage_sqlite::SqliteTaskStore;
use serde_json::json;
use tempfile::tempdir;

fn request(input: &str, prompt: &str) -> NewTask {
    NewTask::new(input, "/out", prompt, "gpt-image-1.5", json!({"width": 1024, "height": 1536}))
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("in");
    std::fs::create_dir(&input).unwrap();
    std::fs::write(input.join("a.jpg"), b"jpeg").unwrap();
    let db = dir.path().join("state").join("deblur.db");

    let id = {
        let store = SqliteTaskStore::open(&db).unwrap();
        let task = store.create_task(request(input.to_str().unwrap(), "sharpen")).unwrap().task;
        store.update_status(&task.id, TaskStatus::Submitted, StatusUpdate::default()).unwrap();
        store.update_status(&task.id, TaskStatus::Running, StatusUpdate::default().total(1)).unwrap();
        store.add_item(&task.id, "a.jpg", Some("fa")).unwrap();
        task.id
    };

    let store = SqliteTaskStore::open(&db).unwrap();
    let task = store.require_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.total_files, 1);
    assert!(task.started_at.is_some());
    assert_eq!(store.list_unfinished().unwrap().len(), 1);
    assert_eq!(store.list_pending_items(&id).unwrap().len(), 1);
}

#[test]
fn test_same_input_prompt_params_reuses_succeeded_task() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.png"), b"png").unwrap();
    let input = dir.path().to_str().unwrap().to_string();
    let store = SqliteTaskStore::open(&dir.path().join("db.sqlite")).unwrap();

    let first = store.create_task(request(&input, "sharpen")).unwrap().task;
    store.update_status(&first.id, TaskStatus::Submitted, StatusUpdate::default()).unwrap();
    store.update_status(&first.id, TaskStatus::Running, StatusUpdate::default().total(1)).unwrap();
    store
        .update_status(&first.id, TaskStatus::Succeeded, StatusUpdate::default().processed(1).output("ofp", 10))
        .unwrap();

    let again = store.create_task(request(&input, "sharpen")).unwrap();
    assert!(again.result_available);
    assert_eq!(again.task.id, first.id);
    assert_eq!(again.task.output_size, Some(10));

    let other_prompt = store.create_task(request(&input, "denoise")).unwrap();
    assert!(other_prompt.created);
    assert_eq!(store.list_tasks(10).unwrap().len(), 2);
}

#[test]
fn test_failed_task_key_moves_to_new_task() {
    let dir = tempdir().unwrap();
    let store = SqliteTaskStore::open(&dir.path().join("db.sqlite")).unwrap();
    let mut req = request("/in", "sharpen");
    req.input_fingerprint = Some("fp".into());

    let first = store.create_task(req.clone()).unwrap().task;
    store.update_status(&first.id, TaskStatus::Submitted, StatusUpdate::default()).unwrap();
    let failure = FailureInfo::new(ErrorCategory::Validation, ErrorCode::NoFilesFound, "no images");
    store
        .update_status(&first.id, TaskStatus::Failed, StatusUpdate::default().failure(failure.clone()))
        .unwrap();

    let second = store.create_task(req).unwrap();
    assert!(second.created);
    let old = store.require_task(&first.id).unwrap();
    assert_eq!(old.idempotency_key, None);
    assert_eq!(old.superseded_by.as_ref(), Some(&second.task.id));
    assert_eq!(old.failure, Some(failure));
}

#[test]
fn test_rejected_transition_leaves_row_alone() {
    let dir = tempdir().unwrap();
    let store = SqliteTaskStore::open(&dir.path().join("db.sqlite")).unwrap();
    let mut req = request("/in", "sharpen");
    req.input_fingerprint = Some("fp".into());
    let task = store.create_task(req).unwrap().task;

    let err = store.update_status(&task.id, TaskStatus::Succeeded, StatusUpdate::default()).unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));
    assert_eq!(store.require_task(&task.id).unwrap().status, TaskStatus::Pending);
}

#[test]
fn test_orphan_and_reopen_round() {
    let dir = tempdir().unwrap();
    let store = SqliteTaskStore::open(&dir.path().join("db.sqlite")).unwrap();
    let mut req = request("/in", "sharpen");
    req.input_fingerprint = Some("fp".into());
    let task = store.create_task(req).unwrap().task;
    store.update_status(&task.id, TaskStatus::Submitted, StatusUpdate::default()).unwrap();
    store.update_status(&task.id, TaskStatus::Running, StatusUpdate::default().total(3)).unwrap();

    let orphan = store.mark_orphaned(&task.id).unwrap();
    assert_eq!(orphan.failure.as_ref().map(|f| f.category), Some(ErrorCategory::HeartbeatTimeout));
    assert_eq!(store.require_task(&task.id).unwrap().status, TaskStatus::Orphaned);

    let reopened = store.reopen(&task.id).unwrap();
    assert_eq!(reopened.status, TaskStatus::Pending);
    assert_eq!(reopened.attempt_count, 1);
    assert!(reopened.failure.is_none());
    assert_eq!(store.require_task(&task.id).unwrap(), reopened);
}

#[test]
fn test_item_lifecycle() {
    let dir = tempdir().unwrap();
    let store = SqliteTaskStore::open(&dir.path().join("db.sqlite")).unwrap();
    let mut req = request("/in", "sharpen");
    req.input_fingerprint = Some("fp".into());
    let task = store.create_task(req).unwrap().task;

    let first = store.add_item(&task.id, "/in/a.jpg", Some("fa")).unwrap();
    assert_eq!(first.status, ItemStatus::Processing);
    store
        .update_item(&task.id, "/in/a.jpg", ItemUpdate::Failed { reason: "HTTP 503".into(), code: ErrorCode::ServerError })
        .unwrap();
    let second = store.add_item(&task.id, "/in/a.jpg", None).unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempt_count, 2);
    assert!(second.error_code.is_none());

    let done = store
        .update_item(
            &task.id,
            "/in/a.jpg",
            ItemUpdate::Completed { modified_path: "/out/a_clear.jpg".into(), fingerprint: "ff".into(), size: 42 },
        )
        .unwrap();
    assert_eq!(done.output_size, Some(42));

    let items = store.list_items(&task.id).unwrap();
    assert_eq!(items, vec![done]);
    assert!(store.list_pending_items(&task.id).unwrap().is_empty());
}

fn with_id(input: &str, fingerprint: &str, id: &str) -> NewTask {
    let mut req = request(input, "sharpen");
    req.input_fingerprint = Some(fingerprint.into());
    req.task_id = Some(TaskId::from_str(id));
    req
}

#[test]
fn test_id_collision_refreshes_request_in_place() {
    let dir = tempdir().unwrap();
    let store = SqliteTaskStore::open(&dir.path().join("db.sqlite")).unwrap();
    let first = store.create_task(with_id("/in-a", "fp-a", "fixed")).unwrap();
    assert!(first.created);

    let mut retry = with_id("/in-a-moved", "fp-a", "fixed");
    retry.model = "gpt-image-2".into();
    let again = store.create_task(retry).unwrap();
    assert!(!again.created && again.existing);
    assert_eq!(again.task.input_path, "/in-a-moved");
    assert_eq!(again.task.model, "gpt-image-2");
    assert_eq!(again.task.idempotency_key, first.task.idempotency_key);
    assert_eq!(store.list_tasks(10).unwrap().len(), 1);

    let other = store.create_task(with_id("/in-b", "fp-b", "fixed")).unwrap();
    assert!(!other.created);
    assert_eq!(other.task.input_fingerprint, "fp-a");
    assert_eq!(other.task.idempotency_key, None);
    assert_eq!(store.require_task(&other.task.id).unwrap(), other.task);
}

#[test]
fn test_id_of_succeeded_task_refuses_a_different_folder() {
    let dir = tempdir().unwrap();
    let store = SqliteTaskStore::open(&dir.path().join("db.sqlite")).unwrap();
    let task = store.create_task(with_id("/in-a", "fp-a", "fixed")).unwrap().task;
    store.update_status(&task.id, TaskStatus::Submitted, StatusUpdate::default()).unwrap();
    store.update_status(&task.id, TaskStatus::Running, StatusUpdate::default().total(1)).unwrap();
    store.update_status(&task.id, TaskStatus::Succeeded, StatusUpdate::default().processed(1)).unwrap();

    let err = store.create_task(with_id("/in-b", "fp-b", "fixed")).unwrap_err();
    assert!(matches!(err, StorageError::Conflict { status: TaskStatus::Succeeded, .. }));
    let kept = store.require_task(&task.id).unwrap();
    assert_eq!(kept.input_path, "/in-a");
    assert_eq!(kept.idempotency_key, task.idempotency_key);

    // a fresh id for folder b is a new task, not a reuse of folder a
    let mut fresh = request("/in-b", "sharpen");
    fresh.input_fingerprint = Some("fp-b".into());
    let out = store.create_task(fresh).unwrap();
    assert!(out.created && !out.result_available);
}

#[test]
fn test_orphaned_key_moves_to_new_task_and_survives_reopen() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("db.sqlite");
    let (old_id, new_id) = {
        let store = SqliteTaskStore::open(&db).unwrap();
        let mut req = request("/in", "sharpen");
        req.input_fingerprint = Some("fp".into());
        let first = store.create_task(req.clone()).unwrap().task;
        store.update_status(&first.id, TaskStatus::Submitted, StatusUpdate::default()).unwrap();
        store.update_status(&first.id, TaskStatus::Running, StatusUpdate::default().total(2)).unwrap();
        store.mark_orphaned(&first.id).unwrap();
        let second = store.create_task(req).unwrap();
        assert!(second.created);
        (first.id, second.task.id)
    };

    let store = SqliteTaskStore::open(&db).unwrap();
    let old = store.require_task(&old_id).unwrap();
    assert_eq!(old.idempotency_key, None);
    assert_eq!(old.superseded_by.as_ref(), Some(&new_id));
    let key = store.require_task(&new_id).unwrap().idempotency_key.unwrap();
    assert_eq!(store.find_by_idempotency_key(&key).unwrap().unwrap().id, new_id);
}

#[test]
fn test_readding_a_completed_item_clears_its_output() {
    let dir = tempdir().unwrap();
    let store = SqliteTaskStore::open(&dir.path().join("db.sqlite")).unwrap();
    let mut req = request("/in", "sharpen");
    req.input_fingerprint = Some("fp".into());
    let task = store.create_task(req).unwrap().task;

    store.add_item(&task.id, "a.jpg", None).unwrap();
    store
        .update_item(
            &task.id,
            "a.jpg",
            ItemUpdate::Completed { modified_path: "out/a.jpg".into(), fingerprint: "ff".into(), size: 5 },
        )
        .unwrap();
    let again = store.add_item(&task.id, "a.jpg", None).unwrap();
    assert_eq!(again.status, ItemStatus::Processing);
    assert!(again.modified_image_path.is_none());
    assert!(again.output_size.is_none());
}
