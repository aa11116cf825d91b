use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use deblur_core::{
    now_unix, EpochSecs, ErrorCategory, ErrorCode, FailureInfo, ItemStatus, ParseEnumError, Task, TaskId, TaskItem,
    TaskStatus,
};
use deblur_storage::{
    derive_keys, rules, CreateOutcome, ItemUpdate, NewTask, StatusUpdate, StorageError, StorageResult, TaskStore,
};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::migrations::apply_migrations;

const TASK_COLUMNS: &str = "id, idempotency_key, status, input_path, input_fingerprint, output_path,
    output_fingerprint, output_size, prompt, model, params_json, attempt_count, total_files, processed_files,
    last_heartbeat_at, failure_category, failure_code, failure_message, superseded_by,
    created_at, updated_at, started_at, finished_at";

const ITEM_COLUMNS: &str = "id, task_id, original_image_path, original_fingerprint, modified_image_path,
    modified_fingerprint, output_size, status, error_reason, error_code, attempt_count,
    created_at, updated_at, started_at, finished_at";

/// Durable `TaskStore` over a single SQLite file.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

trait SqlResultExt<T> {
    fn db(self) -> StorageResult<T>;
}

impl<T> SqlResultExt<T> for rusqlite::Result<T> {
    fn db(self) -> StorageResult<T> {
        self.map_err(StorageError::backend)
    }
}

impl SqliteTaskStore {
    pub fn open(db_path: &Path) -> StorageResult<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(StorageError::backend)?;
        }
        let conn = Connection::open(db_path).db()?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory().db()?)
    }

    fn init(mut conn: Connection) -> StorageResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;").db()?;
        let version = apply_migrations(&mut conn).db()?;
        debug!(version, "sqlite task store ready");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Load, mutate and write back one task inside an immediate transaction.
    fn with_task<T>(&self, id: &TaskId, f: impl FnOnce(&mut Task, EpochSecs) -> StorageResult<T>) -> StorageResult<T> {
        let now = now_unix();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
        let mut task = select_task(&tx, id)?.ok_or_else(|| StorageError::NotFound(id.clone()))?;
        let out = f(&mut task, now)?;
        write_task(&tx, &task)?;
        tx.commit().db()?;
        Ok(out)
    }

    fn query_tasks(&self, sql_tail: &str, args: Vec<rusqlite::types::Value>) -> StorageResult<Vec<Task>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks {sql_tail}");
        let mut stmt = conn.prepare(&sql).db()?;
        let rows = stmt.query_map(params_from_iter(args), read_task).db()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().db()
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn status_values(statuses: &[TaskStatus]) -> Vec<rusqlite::types::Value> {
    statuses.iter().map(|s| s.as_str().to_string().into()).collect()
}

fn parse_col<T>(idx: usize, value: &str, parse: fn(&str) -> Result<T, ParseEnumError>) -> rusqlite::Result<T> {
    parse(value).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_u64(v: Option<i64>) -> Option<u64> {
    v.map(|n| n.max(0) as u64)
}

fn read_task(r: &Row<'_>) -> rusqlite::Result<Task> {
    let failure = match (
        r.get::<_, Option<String>>(15)?,
        r.get::<_, Option<String>>(16)?,
        r.get::<_, Option<String>>(17)?,
    ) {
        (Some(cat), Some(code), message) => Some(FailureInfo::new(
            parse_col(15, &cat, ErrorCategory::parse)?,
            parse_col(16, &code, ErrorCode::parse)?,
            message.unwrap_or_default(),
        )),
        _ => None,
    };
    Ok(Task {
        id: TaskId::from_str(r.get::<_, String>(0)?),
        idempotency_key: r.get(1)?,
        status: parse_col(2, &r.get::<_, String>(2)?, TaskStatus::parse)?,
        input_path: r.get(3)?,
        input_fingerprint: r.get(4)?,
        output_path: r.get(5)?,
        output_fingerprint: r.get(6)?,
        output_size: opt_u64(r.get(7)?),
        prompt: r.get(8)?,
        model: r.get(9)?,
        params_blob: r.get(10)?,
        attempt_count: r.get::<_, i64>(11)? as u32,
        total_files: r.get::<_, i64>(12)? as u32,
        processed_files: r.get::<_, i64>(13)? as u32,
        last_heartbeat_at: r.get(14)?,
        failure,
        superseded_by: r.get::<_, Option<String>>(18)?.map(TaskId::from_str),
        created_at: r.get(19)?,
        updated_at: r.get(20)?,
        started_at: r.get(21)?,
        finished_at: r.get(22)?,
    })
}

fn read_item(r: &Row<'_>) -> rusqlite::Result<TaskItem> {
    let error_code = match r.get::<_, Option<String>>(9)? {
        Some(code) => Some(parse_col(9, &code, ErrorCode::parse)?),
        None => None,
    };
    Ok(TaskItem {
        id: r.get(0)?,
        task_id: TaskId::from_str(r.get::<_, String>(1)?),
        original_image_path: r.get(2)?,
        original_fingerprint: r.get(3)?,
        modified_image_path: r.get(4)?,
        modified_fingerprint: r.get(5)?,
        output_size: opt_u64(r.get(6)?),
        status: parse_col(7, &r.get::<_, String>(7)?, ItemStatus::parse)?,
        error_reason: r.get(8)?,
        error_code,
        attempt_count: r.get::<_, i64>(10)? as u32,
        created_at: r.get(11)?,
        updated_at: r.get(12)?,
        started_at: r.get(13)?,
        finished_at: r.get(14)?,
    })
}

fn select_task(conn: &Connection, id: &TaskId) -> StorageResult<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        [id.as_str()],
        read_task,
    )
    .optional()
    .db()
}

fn select_by_key(conn: &Connection, key: &str) -> StorageResult<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE idempotency_key = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"),
        [key],
        read_task,
    )
    .optional()
    .db()
}

fn select_item(conn: &Connection, task_id: &TaskId, path: &str) -> StorageResult<Option<TaskItem>> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM task_items WHERE task_id = ?1 AND original_image_path = ?2"),
        params![task_id.as_str(), path],
        read_item,
    )
    .optional()
    .db()
}

fn insert_task(conn: &Connection, t: &Task) -> StorageResult<bool> {
    let changed = conn
        .execute(
            "INSERT INTO tasks (id, idempotency_key, status, input_path, input_fingerprint, output_path,
                prompt, model, params_json, attempt_count, total_files, processed_files, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT DO NOTHING",
            params![
                t.id.as_str(),
                t.idempotency_key,
                t.status.as_str(),
                t.input_path,
                t.input_fingerprint,
                t.output_path,
                t.prompt,
                t.model,
                t.params_blob,
                t.attempt_count,
                t.total_files,
                t.processed_files,
                t.created_at,
                t.updated_at,
            ],
        )
        .db()?;
    Ok(changed == 1)
}

fn write_task(conn: &Connection, t: &Task) -> StorageResult<()> {
    let (cat, code, msg) = match &t.failure {
        Some(f) => (Some(f.category.as_str()), Some(f.code.as_str()), Some(f.message.as_str())),
        None => (None, None, None),
    };
    conn.execute(
        "UPDATE tasks SET idempotency_key = ?2, status = ?3, input_path = ?4, input_fingerprint = ?5,
            output_path = ?6, output_fingerprint = ?7, output_size = ?8, prompt = ?9, model = ?10,
            params_json = ?11, attempt_count = ?12, total_files = ?13, processed_files = ?14,
            last_heartbeat_at = ?15, failure_category = ?16, failure_code = ?17, failure_message = ?18,
            superseded_by = ?19, updated_at = ?20, started_at = ?21, finished_at = ?22
         WHERE id = ?1",
        params![
            t.id.as_str(),
            t.idempotency_key,
            t.status.as_str(),
            t.input_path,
            t.input_fingerprint,
            t.output_path,
            t.output_fingerprint,
            t.output_size.map(|n| n as i64),
            t.prompt,
            t.model,
            t.params_blob,
            t.attempt_count,
            t.total_files,
            t.processed_files,
            t.last_heartbeat_at,
            cat,
            code,
            msg,
            t.superseded_by.as_ref().map(|s| s.as_str()),
            t.updated_at,
            t.started_at,
            t.finished_at,
        ],
    )
    .db()?;
    Ok(())
}

fn write_item(conn: &Connection, i: &TaskItem) -> StorageResult<()> {
    conn.execute(
        "UPDATE task_items SET original_fingerprint = ?2, modified_image_path = ?3, modified_fingerprint = ?4,
            output_size = ?5, status = ?6, error_reason = ?7, error_code = ?8, attempt_count = ?9,
            updated_at = ?10, started_at = ?11, finished_at = ?12
         WHERE id = ?1",
        params![
            i.id,
            i.original_fingerprint,
            i.modified_image_path,
            i.modified_fingerprint,
            i.output_size.map(|n| n as i64),
            i.status.as_str(),
            i.error_reason,
            i.error_code.map(|c| c.as_str()),
            i.attempt_count,
            i.updated_at,
            i.started_at,
            i.finished_at,
        ],
    )
    .db()?;
    Ok(())
}

impl TaskStore for SqliteTaskStore {
    fn find_by_idempotency_key(&self, key: &str) -> StorageResult<Option<Task>> {
        let conn = self.lock()?;
        select_by_key(&conn, key)
    }

    fn get_task(&self, id: &TaskId) -> StorageResult<Option<Task>> {
        let conn = self.lock()?;
        select_task(&conn, id)
    }

    fn list_tasks(&self, limit: usize) -> StorageResult<Vec<Task>> {
        self.query_tasks(
            "ORDER BY created_at DESC, rowid DESC LIMIT ?",
            vec![(limit.min(i64::MAX as usize) as i64).into()],
        )
    }

    fn create_task(&self, new: NewTask) -> StorageResult<CreateOutcome> {
        let keys = derive_keys(&new)?;
        let now = now_unix();
        let id = new.task_id.clone().unwrap_or_default();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;

        let existing = select_task(&tx, &id)?;
        if let Some(task) = &existing {
            rules::check_id_reuse(task, &keys)?;
        }

        if let Some(mut holder) = select_by_key(&tx, &keys.idempotency_key)? {
            if holder.status == TaskStatus::Succeeded {
                return Ok(CreateOutcome {
                    task: holder,
                    created: false,
                    existing: true,
                    result_available: true,
                });
            }
            if holder.status.is_in_flight() {
                holder.updated_at = now;
                write_task(&tx, &holder)?;
                tx.commit().db()?;
                return Ok(CreateOutcome {
                    task: holder,
                    created: false,
                    existing: true,
                    result_available: false,
                });
            }
            if holder.id != id && existing.is_none() {
                debug!(old = %holder.id, new = %id, status = %holder.status, "retiring idempotency key");
                rules::retire_key(&mut holder, &id, now);
                write_task(&tx, &holder)?;
            }
        }

        if let Some(mut task) = existing {
            rules::refresh_request_fields(&mut task, &keys, &new, now);
            write_task(&tx, &task)?;
            tx.commit().db()?;
            return Ok(CreateOutcome {
                task,
                created: false,
                existing: true,
                result_available: false,
            });
        }

        let key = keys.idempotency_key.clone();
        let task = rules::new_task(id, keys, &new, now);
        if !insert_task(&tx, &task)? {
            // another writer took the key first
            let winner = select_by_key(&tx, &key)?.ok_or(StorageError::NotFound(task.id))?;
            let result_available = winner.status == TaskStatus::Succeeded;
            return Ok(CreateOutcome {
                task: winner,
                created: false,
                existing: true,
                result_available,
            });
        }
        tx.commit().db()?;
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
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET last_heartbeat_at = MAX(COALESCE(last_heartbeat_at, ?2), ?2), updated_at = ?2
                 WHERE id = ?1",
                params![id.as_str(), now_unix()],
            )
            .db()?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn increment_attempt(&self, id: &TaskId) -> StorageResult<u32> {
        self.with_task(id, |t, now| {
            t.attempt_count += 1;
            t.updated_at = now;
            Ok(t.attempt_count)
        })
    }

    fn list_by_status(&self, statuses: &[TaskStatus]) -> StorageResult<Vec<Task>> {
        if statuses.is_empty() {
            return Ok(vec![]);
        }
        self.query_tasks(
            &format!("WHERE status IN ({}) ORDER BY created_at ASC, rowid ASC", placeholders(statuses.len())),
            status_values(statuses),
        )
    }

    fn list_stale(&self, statuses: &[TaskStatus], timeout_secs: i64, now: EpochSecs) -> StorageResult<Vec<Task>> {
        if statuses.is_empty() {
            return Ok(vec![]);
        }
        let mut args = status_values(statuses);
        args.push((now - timeout_secs).into());
        self.query_tasks(
            &format!(
                "WHERE status IN ({}) AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?)
                 ORDER BY created_at ASC, rowid ASC",
                placeholders(statuses.len())
            ),
            args,
        )
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
        let now = now_unix();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
        if select_task(&tx, task_id)?.is_none() {
            return Err(StorageError::NotFound(task_id.clone()));
        }

        let item = match select_item(&tx, task_id, original_path)? {
            Some(mut item) => {
                rules::restart_item(&mut item, original_fingerprint, now);
                write_item(&tx, &item)?;
                item
            }
            None => {
                let draft = rules::new_item(0, task_id, original_path, original_fingerprint, now);
                tx.execute(
                    "INSERT INTO task_items (task_id, original_image_path, original_fingerprint, status,
                        attempt_count, created_at, updated_at, started_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        task_id.as_str(),
                        draft.original_image_path,
                        draft.original_fingerprint,
                        draft.status.as_str(),
                        draft.attempt_count,
                        draft.created_at,
                        draft.updated_at,
                        draft.started_at,
                    ],
                )
                .db()?;
                TaskItem {
                    id: tx.last_insert_rowid(),
                    ..draft
                }
            }
        };
        tx.commit().db()?;
        Ok(item)
    }

    fn update_item(&self, task_id: &TaskId, original_path: &str, update: ItemUpdate) -> StorageResult<TaskItem> {
        let now = now_unix();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
        let mut item = select_item(&tx, task_id, original_path)?.ok_or_else(|| StorageError::ItemNotFound {
            task_id: task_id.clone(),
            path: original_path.to_string(),
        })?;
        rules::apply_item_update(&mut item, update, now);
        write_item(&tx, &item)?;
        tx.commit().db()?;
        Ok(item)
    }

    fn list_items(&self, task_id: &TaskId) -> StorageResult<Vec<TaskItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {ITEM_COLUMNS} FROM task_items WHERE task_id = ?1 ORDER BY id ASC"))
            .db()?;
        let rows = stmt.query_map([task_id.as_str()], read_item).db()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().db()
    }
}
