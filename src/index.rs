//! In-memory view of per-path sync state and the three-way classification.
//!
//! The index is a write-through cache over the store, loaded lazily per
//! path. Classification compares an incoming observation against the state
//! row as it was before the observation is applied: the side the event came
//! from has changed by declaration, the other side counts as diverged when
//! its mtime passed `last_sync` or a deletion was recorded for it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::{
    Change, FileState, FileStatus, LocalChangeKind, RemoteChangeKind,
};
use crate::store::{FilePatch, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    InSync,
    LocalOnly(ChangeKind),
    RemoteOnly(ChangeKind),
    /// Both sides diverged relative to `last_sync`; carries what each side
    /// did so a conflict answer can be mapped to the winning operation.
    Conflict { local: ChangeKind, remote: ChangeKind },
}

/// Three-way comparison of an observation against the prior state row.
pub fn classify(prior: &FileState, change: &Change) -> Classification {
    match change {
        Change::Local(lc) => {
            // Identical content on both sides is in sync no matter what the
            // timestamps say.
            if lc.kind == LocalChangeKind::Write
                && !lc.hash.is_empty()
                && lc.hash == prior.remote_hash
            {
                return Classification::InSync;
            }
            let local = match lc.kind {
                LocalChangeKind::Write => ChangeKind::Modified,
                LocalChangeKind::Remove => ChangeKind::Deleted,
            };
            if remote_diverged(prior) {
                Classification::Conflict {
                    local,
                    remote: recorded_remote_kind(prior),
                }
            } else {
                Classification::LocalOnly(local)
            }
        }
        Change::Remote(rc) => {
            if rc.kind != RemoteChangeKind::Removed
                && !prior.local_hash.is_empty()
                && prior.local_hash == prior.remote_hash
            {
                return Classification::InSync;
            }
            let remote = match rc.kind {
                RemoteChangeKind::Added | RemoteChangeKind::Modified => {
                    ChangeKind::Modified
                }
                RemoteChangeKind::Removed => ChangeKind::Deleted,
            };
            if local_diverged(prior) {
                Classification::Conflict {
                    local: recorded_local_kind(prior),
                    remote,
                }
            } else {
                Classification::RemoteOnly(remote)
            }
        }
    }
}

fn local_diverged(state: &FileState) -> bool {
    state.local_mtime > state.last_sync || state.status == FileStatus::LocalDeleted
}

fn remote_diverged(state: &FileState) -> bool {
    state.remote_mtime > state.last_sync || state.status == FileStatus::RemoteDeleted
}

fn recorded_local_kind(state: &FileState) -> ChangeKind {
    if state.status == FileStatus::LocalDeleted {
        ChangeKind::Deleted
    } else {
        ChangeKind::Modified
    }
}

fn recorded_remote_kind(state: &FileState) -> ChangeKind {
    if state.status == FileStatus::RemoteDeleted {
        ChangeKind::Deleted
    } else {
        ChangeKind::Modified
    }
}

/// Write-through cache of `FileState` rows.
#[derive(Debug)]
pub struct FileStateIndex {
    store: Arc<Store>,
    cache: RwLock<HashMap<String, FileState>>,
}

impl FileStateIndex {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Option<FileState>> {
        if let Some(state) = self.cache.read().await.get(path) {
            return Ok(Some(state.clone()));
        }
        let state = self.store.get_file(path).await?;
        if let Some(ref s) = state {
            self.cache.write().await.insert(path.to_string(), s.clone());
        }
        Ok(state)
    }

    pub async fn put(&self, state: FileState) -> Result<()> {
        self.store.put_file(&state).await?;
        self.cache
            .write()
            .await
            .insert(state.path.clone(), state);
        Ok(())
    }

    pub async fn patch(&self, path: &str, patch: FilePatch) -> Result<()> {
        self.store.patch_file(path, patch).await?;
        // Refresh the cached row from the authoritative store.
        if let Some(state) = self.store.get_file(path).await? {
            self.cache.write().await.insert(path.to_string(), state);
        }
        Ok(())
    }
}
