//! SQLite persistence for file-state rows, task rows and configuration.
//!
//! All durable effects of the engine land here. Writes are single
//! statements or explicit transactions; `put_*` is upsert. The unique index
//! on `tasks(path, operation)` keeps at most one row per logical task.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::{FileState, FileStatus, Task, TaskOperation, TaskStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    local_hash TEXT NOT NULL DEFAULT '',
    remote_hash TEXT NOT NULL DEFAULT '',
    local_mtime INTEGER NOT NULL DEFAULT 0,
    remote_mtime INTEGER NOT NULL DEFAULT 0,
    last_sync INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    operation TEXT NOT NULL,
    status TEXT NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    last_attempt INTEGER NOT NULL DEFAULT 0,
    chunk_offset INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS tasks_path_operation
    ON tasks (path, operation);
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Partial update of a `files` row; `None` fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct FilePatch {
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub local_mtime: Option<i64>,
    pub remote_mtime: Option<i64>,
    pub last_sync: Option<i64>,
    pub status: Option<FileStatus>,
}

/// Partial update of a task row, keyed by `(path, operation)`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub retries: Option<i64>,
    pub last_attempt: Option<i64>,
}

#[derive(Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn put_file(&self, state: &FileState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (path, local_hash, remote_hash, local_mtime,
                               remote_mtime, last_sync, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (path) DO UPDATE SET
                local_hash = excluded.local_hash,
                remote_hash = excluded.remote_hash,
                local_mtime = excluded.local_mtime,
                remote_mtime = excluded.remote_mtime,
                last_sync = excluded.last_sync,
                status = excluded.status
            "#,
        )
        .bind(&state.path)
        .bind(&state.local_hash)
        .bind(&state.remote_hash)
        .bind(state.local_mtime)
        .bind(state.remote_mtime)
        .bind(state.last_sync)
        .bind(state.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn patch_file(&self, path: &str, patch: FilePatch) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE files SET
                local_hash = COALESCE(?, local_hash),
                remote_hash = COALESCE(?, remote_hash),
                local_mtime = COALESCE(?, local_mtime),
                remote_mtime = COALESCE(?, remote_mtime),
                last_sync = COALESCE(?, last_sync),
                status = COALESCE(?, status)
            WHERE path = ?
            "#,
        )
        .bind(patch.local_hash)
        .bind(patch.remote_hash)
        .bind(patch.local_mtime)
        .bind(patch.remote_mtime)
        .bind(patch.last_sync)
        .bind(patch.status)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, path: &str) -> Result<Option<FileState>> {
        let row = sqlx::query_as::<_, FileState>(
            "SELECT path, local_hash, remote_hash, local_mtime, remote_mtime, \
             last_sync, status FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_files(&self) -> Result<Vec<FileState>> {
        let rows = sqlx::query_as::<_, FileState>(
            "SELECT path, local_hash, remote_hash, local_mtime, remote_mtime, \
             last_sync, status FROM files ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Upsert a task row on its logical `(path, operation)` key. A fresh
    /// enqueue resets retries and re-opens a previously terminal row.
    pub async fn put_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (path, operation, status, retries, last_attempt,
                               chunk_offset)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (path, operation) DO UPDATE SET
                status = excluded.status,
                retries = excluded.retries,
                last_attempt = excluded.last_attempt,
                chunk_offset = excluded.chunk_offset
            "#,
        )
        .bind(&task.path)
        .bind(task.operation)
        .bind(task.status)
        .bind(task.retries)
        .bind(task.last_attempt)
        .bind(task.chunk_offset)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn patch_task(
        &self,
        path: &str,
        operation: TaskOperation,
        patch: TaskPatch,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks SET
                status = COALESCE(?, status),
                retries = COALESCE(?, retries),
                last_attempt = COALESCE(?, last_attempt)
            WHERE path = ? AND operation = ?
            "#,
        )
        .bind(patch.status)
        .bind(patch.retries)
        .bind(patch.last_attempt)
        .bind(path)
        .bind(operation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(
        &self,
        path: &str,
        operation: TaskOperation,
    ) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, Task>(
            "SELECT id, path, operation, status, retries, last_attempt, \
             chunk_offset FROM tasks WHERE path = ? AND operation = ?",
        )
        .bind(path)
        .bind(operation)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_pending_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, Task>(
            "SELECT id, path, operation, status, retries, last_attempt, \
             chunk_offset FROM tasks WHERE status = ? ORDER BY id",
        )
        .bind(TaskStatus::Pending)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Drop active rows for `path` with an operation other than `keep`.
    /// The newer classification wins; completed rows stay for the record.
    pub async fn supersede_tasks(&self, path: &str, keep: TaskOperation) -> Result<()> {
        sqlx::query(
            "DELETE FROM tasks WHERE path = ? AND operation != ? AND status != ?",
        )
        .bind(path)
        .bind(keep)
        .bind(TaskStatus::Completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write config keys in one transaction.
    pub async fn put_config(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(
                "INSERT INTO config (key, value) VALUES (?, ?) \
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_all_config(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM config",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
