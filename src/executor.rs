//! Task execution: the four operations that make one side match the other.
//!
//! Every operation is idempotent (overwrite or delete), so re-execution
//! after a crash or a duplicate publish converges. On success the executor
//! reports the file-state fields it learned; the queue consumer merges them
//! with `status = synced, last_sync = now`.

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::engine::SharedState;
use crate::error::Result;
use crate::hash::sha1_file;
use crate::models::{Task, TaskOperation};
use crate::store::FilePatch;

/// Seam between the queue consumer and the real executor.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<FilePatch>;
}

pub struct Executor {
    shared: SharedState,
}

impl Executor {
    pub(crate) fn new(shared: SharedState) -> Self {
        Self { shared }
    }

    async fn upload(&self, task: &Task) -> Result<FilePatch> {
        let snap = self.shared.snapshot();
        let local = snap.config.local_dir.join(&task.path);
        let remote = remote_path(&snap.config.remote_dir, &task.path);

        let (hash, mtime) = sha1_file(&local).await?;
        let file = fs::File::open(&local).await?;
        snap.remote
            .write_stream(&remote, Box::new(file), 0o644)
            .await?;
        debug!("uploaded {} to {}", task.path, remote);
        Ok(FilePatch {
            local_hash: Some(hash.clone()),
            remote_hash: Some(hash),
            local_mtime: Some(mtime),
            ..Default::default()
        })
    }

    async fn download(&self, task: &Task) -> Result<FilePatch> {
        let snap = self.shared.snapshot();
        let local = snap.config.local_dir.join(&task.path);
        let remote = remote_path(&snap.config.remote_dir, &task.path);

        let mut reader = snap.remote.read_stream(&remote).await?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&local).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        drop(file);

        let (hash, mtime) = sha1_file(&local).await?;
        debug!("downloaded {} from {}", task.path, remote);
        Ok(FilePatch {
            local_hash: Some(hash.clone()),
            remote_hash: Some(hash),
            local_mtime: Some(mtime),
            ..Default::default()
        })
    }

    async fn delete_remote(&self, task: &Task) -> Result<FilePatch> {
        let snap = self.shared.snapshot();
        let remote = remote_path(&snap.config.remote_dir, &task.path);
        snap.remote.remove(&remote).await?;
        debug!("removed remote {}", remote);
        Ok(FilePatch {
            remote_hash: Some(String::new()),
            remote_mtime: Some(0),
            ..Default::default()
        })
    }

    async fn delete_local(&self, task: &Task) -> Result<FilePatch> {
        let snap = self.shared.snapshot();
        let local = snap.config.local_dir.join(&task.path);
        match fs::remove_file(&local).await {
            Ok(()) => {}
            // Already gone counts as done.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        debug!("removed local {}", local.display());
        Ok(FilePatch {
            local_hash: Some(String::new()),
            local_mtime: Some(0),
            ..Default::default()
        })
    }
}

#[async_trait]
impl TaskExecutor for Executor {
    async fn execute(&self, task: &Task) -> Result<FilePatch> {
        match task.operation {
            TaskOperation::Upload => self.upload(task).await,
            TaskOperation::Download => self.download(task).await,
            TaskOperation::DeleteRemote => self.delete_remote(task).await,
            TaskOperation::DeleteLocal => self.delete_local(task).await,
        }
    }
}

/// Slash-join of the remote collection and a relative path.
pub(crate) fn remote_path(remote_dir: &str, rel: &str) -> String {
    let dir = remote_dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{}", rel.trim_start_matches('/'))
    } else {
        format!("{}/{}", dir, rel.trim_start_matches('/'))
    }
}
