use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::task::{self, Task, TaskId, TaskStatus};

const TASK_COLUMNS: &str = "id, prompt, status, image_path, error, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("bad timestamp in row {id}: {source}")]
    Timestamp {
        id: TaskId,
        #[source]
        source: chrono::ParseError,
    },

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl StoreError {
    /// True when the backing database is gone or unusable, as opposed to a
    /// transient condition the next loop iteration can retry.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
            ),
            _ => false,
        }
    }
}

/// Durable record of tasks. Owns the exclusive-claim operation.
///
/// Implementations must make `claim_next` safe under concurrent callers,
/// including callers in other processes sharing the same storage.
pub trait TaskStore: Send + Sync {
    /// Insert a new `Pending` task and return the stored record.
    fn enqueue(&self, prompt: &str) -> Result<Task, StoreError>;

    /// Atomically move the oldest `Pending` task to `Processing`.
    /// `Ok(None)` means there is no work, which is not an error.
    fn claim_next(&self) -> Result<Option<Task>, StoreError>;

    fn complete(&self, task: &Task, result_path: &str) -> Result<Task, StoreError>;

    fn fail(&self, task: &Task, reason: &str) -> Result<Task, StoreError>;

    /// Up to `limit` tasks, newest first.
    fn recent_history(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;
}

/// SQLite implementation of [`TaskStore`].
///
/// One connection per instance. Open several instances on the same file to
/// get independent connections; claim exclusivity is enforced by SQLite's
/// write lock, not by the mutex here.
pub struct SqliteTaskStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        init_schema(&conn)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open another connection to the same database file.
    pub fn reopen(&self) -> Result<Self, StoreError> {
        Self::open(&self.path)
    }

    /// Fail every task left in `Processing` by a previous process.
    ///
    /// Only call this before any worker of the current deployment starts;
    /// it cannot tell an orphaned row from one a live worker holds.
    pub fn fail_interrupted(&self) -> Result<usize, StoreError> {
        let conn = self.lock();
        let ts = task::format_timestamp(&task::now());
        let count = conn.execute(
            "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3 WHERE status = ?4",
            params![
                TaskStatus::Failed,
                "interrupted before completion",
                ts,
                TaskStatus::Processing
            ],
        )?;
        Ok(count)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a `Processing -> to` transition guarded by the current status.
    fn finish(
        &self,
        task: &Task,
        to: TaskStatus,
        result_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<Task, StoreError> {
        let conn = self.lock();
        let updated_at = task::now();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?2, image_path = ?3, error = ?4, updated_at = ?5
             WHERE id = ?1 AND status = ?6",
            params![
                task.id,
                to,
                result_path,
                error,
                task::format_timestamp(&updated_at),
                TaskStatus::Processing
            ],
        )?;

        if changed == 0 {
            let from = conn
                .query_row(
                    "SELECT status FROM tasks WHERE id = ?1",
                    params![task.id],
                    |row| row.get::<_, TaskStatus>(0),
                )
                .optional()?
                .unwrap_or(task.status);
            return Err(StoreError::InvalidTransition {
                id: task.id,
                from,
                to,
            });
        }

        Ok(Task {
            status: to,
            result_path: result_path.map(str::to_string),
            error: error.map(str::to_string),
            updated_at,
            ..task.clone()
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn enqueue(&self, prompt: &str) -> Result<Task, StoreError> {
        let conn = self.lock();
        let created_at = task::now();
        let ts = task::format_timestamp(&created_at);
        conn.execute(
            "INSERT INTO tasks (prompt, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![prompt, TaskStatus::Pending, ts],
        )?;

        Ok(Task {
            id: conn.last_insert_rowid(),
            prompt: prompt.to_string(),
            status: TaskStatus::Pending,
            result_path: None,
            error: None,
            created_at,
            updated_at: created_at,
        })
    }

    fn claim_next(&self) -> Result<Option<Task>, StoreError> {
        let mut conn = self.lock();
        // IMMEDIATE takes the database write lock up front, so no other
        // connection can pick the same row between our SELECT and UPDATE.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut task = loop {
            let row = tx
                .query_row(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                         ORDER BY created_at ASC, id ASC LIMIT 1"
                    ),
                    params![TaskStatus::Pending],
                    RawTask::from_row,
                )
                .optional()?;

            let Some(raw) = row else {
                tx.commit()?;
                return Ok(None);
            };
            let id = raw.id;
            match raw.into_task() {
                Ok(task) => break task,
                // An unreadable row would otherwise head the queue forever.
                Err(StoreError::Timestamp { source, .. }) => {
                    tracing::warn!(task_id = id, "Failing task with unreadable timestamp: {}", source);
                    tx.execute(
                        "UPDATE tasks SET status = ?2, error = ?3, updated_at = ?4
                         WHERE id = ?1 AND status = ?5",
                        params![
                            id,
                            TaskStatus::Failed,
                            format!("unreadable timestamp: {source}"),
                            task::format_timestamp(&task::now()),
                            TaskStatus::Pending
                        ],
                    )?;
                }
                Err(e) => return Err(e),
            }
        };

        let updated_at = task::now();
        let changed = tx.execute(
            "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
            params![
                task.id,
                TaskStatus::Processing,
                task::format_timestamp(&updated_at),
                TaskStatus::Pending
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tx.commit()?;

        task.status = TaskStatus::Processing;
        task.updated_at = updated_at;
        Ok(Some(task))
    }

    fn complete(&self, task: &Task, result_path: &str) -> Result<Task, StoreError> {
        self.finish(task, TaskStatus::Completed, Some(result_path), None)
    }

    fn fail(&self, task: &Task, reason: &str) -> Result<Task, StoreError> {
        self.finish(task, TaskStatus::Failed, None, Some(reason))
    }

    fn recent_history(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], RawTask::from_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }

    fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                RawTask::from_row,
            )
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            prompt TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Pending',
            image_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
        "#,
    )?;

    // Databases created before failures carried a diagnostic lack this column.
    let mut stmt = conn.prepare("PRAGMA table_info(tasks)")?;
    let has_error = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|name| name.map(|n| n == "error").unwrap_or(false));
    drop(stmt);

    if !has_error {
        tracing::info!("Migrating tasks table: adding error column");
        conn.execute("ALTER TABLE tasks ADD COLUMN error TEXT", [])?;
    }

    Ok(())
}

/// Row as stored, before timestamp parsing.
struct RawTask {
    id: TaskId,
    prompt: String,
    status: TaskStatus,
    result_path: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            prompt: row.get(1)?,
            status: row.get(2)?,
            result_path: row.get(3)?,
            error: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let id = self.id;
        let parse = |s: &str| {
            task::parse_timestamp(s).map_err(|source| StoreError::Timestamp { id, source })
        };
        Ok(Task {
            id,
            created_at: parse(&self.created_at)?,
            updated_at: parse(&self.updated_at)?,
            prompt: self.prompt,
            status: self.status,
            result_path: self.result_path,
            error: self.error,
        })
    }
}
