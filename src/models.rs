//! Persistent row types and the change events flowing into the reconciler.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Per-path record of what the engine last knew about both sides.
///
/// Hashes are SHA-1 hex; an empty string means absent/unknown. Times are
/// Unix seconds, 0 when unknown or absent. `last_sync` is the last moment
/// both sides were known consistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileState {
    pub path: String,
    pub local_hash: String,
    pub remote_hash: String,
    pub local_mtime: i64,
    pub remote_mtime: i64,
    pub last_sync: i64,
    pub status: FileStatus,
}

impl FileState {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            local_hash: String::new(),
            remote_hash: String::new(),
            local_mtime: 0,
            remote_mtime: 0,
            last_sync: 0,
            status: FileStatus::Synced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Synced,
    LocalModified,
    RemoteModified,
    LocalDeleted,
    RemoteDeleted,
}

/// A queued, persistent unit of work that changes one side to match the
/// other. Logically keyed by `(path, operation)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: i64,
    pub path: String,
    pub operation: TaskOperation,
    pub status: TaskStatus,
    pub retries: i64,
    pub last_attempt: i64,
    /// Reserved for resumable upload; always 0 in the current executor.
    pub chunk_offset: i64,
}

impl Task {
    pub fn new(path: impl Into<String>, operation: TaskOperation) -> Self {
        Self {
            id: 0,
            path: path.into(),
            operation,
            status: TaskStatus::Pending,
            retries: 0,
            last_attempt: unix_now(),
            chunk_offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskOperation {
    Upload,
    Download,
    DeleteRemote,
    DeleteLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

/// A normalized observation from one of the two change sources.
#[derive(Debug, Clone)]
pub enum Change {
    Local(LocalChange),
    Remote(RemoteChange),
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Local(c) => &c.path,
            Change::Remote(c) => &c.path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalChange {
    /// Normalized relative slash-path under the sync root.
    pub path: String,
    pub kind: LocalChangeKind,
    /// SHA-1 of the current content; empty for `Remove`.
    pub hash: String,
    /// Unix mtime; 0 for `Remove`.
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChangeKind {
    Write,
    Remove,
}

#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub path: String,
    pub kind: RemoteChangeKind,
    /// Remote mtime from the listing; 0 for `Removed`.
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChangeKind {
    /// Present remotely, unknown locally.
    Added,
    Modified,
    Removed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_empty_on_both_sides() {
        let state = FileState::new("docs/a.txt");
        assert_eq!(state.path, "docs/a.txt");
        assert_eq!(state.local_hash, "");
        assert_eq!(state.remote_hash, "");
        assert_eq!(state.local_mtime, 0);
        assert_eq!(state.remote_mtime, 0);
        assert_eq!(state.last_sync, 0);
        assert_eq!(state.status, FileStatus::Synced);
    }

    #[test]
    fn fresh_task_is_pending_with_zero_retries() {
        let task = Task::new("a.txt", TaskOperation::Upload);
        assert_eq!(task.id, 0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 0);
        assert_eq!(task.chunk_offset, 0);
        assert!(task.last_attempt > 0);
    }

    #[test]
    fn change_exposes_its_path() {
        let local = Change::Local(LocalChange {
            path: "a.txt".into(),
            kind: LocalChangeKind::Write,
            hash: "h1".into(),
            mtime: 10,
        });
        assert_eq!(local.path(), "a.txt");

        let remote = Change::Remote(RemoteChange {
            path: "b.txt".into(),
            kind: RemoteChangeKind::Removed,
            mtime: 0,
        });
        assert_eq!(remote.path(), "b.txt");
    }

    #[test]
    fn statuses_serialize_to_schema_strings() {
        assert_eq!(
            serde_json::to_value(FileStatus::LocalModified).unwrap(),
            "local_modified"
        );
        assert_eq!(
            serde_json::to_value(TaskOperation::DeleteRemote).unwrap(),
            "delete_remote"
        );
        assert_eq!(serde_json::to_value(TaskStatus::Pending).unwrap(), "pending");
    }
}
