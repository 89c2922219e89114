//! Reconciliation of the merged change stream.
//!
//! One change at a time: persist the observation into the file-state row,
//! classify it three-way against the prior row, then either enqueue the
//! matching task (subject to mode gating), or raise a conflict and enqueue
//! per the answer. Running single-threaded serializes classification per
//! path; a pending conflict blocks the stream until it is answered or the
//! engine shuts down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conflict::{Arbitrator, Resolution};
use crate::engine::SharedState;
use crate::error::{Error, Result};
use crate::index::{classify, ChangeKind, Classification, FileStateIndex};
use crate::models::{
    unix_now, Change, FileState, FileStatus, LocalChangeKind, RemoteChangeKind,
    TaskOperation,
};
use crate::queue::TaskQueue;
use crate::store::FilePatch;

pub struct Reconciler {
    index: Arc<FileStateIndex>,
    queue: Arc<TaskQueue>,
    arbitrator: Arbitrator,
    shared: SharedState,
    paused: Arc<AtomicBool>,
}

impl Reconciler {
    pub(crate) fn new(
        index: Arc<FileStateIndex>,
        queue: Arc<TaskQueue>,
        arbitrator: Arbitrator,
        shared: SharedState,
        paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index,
            queue,
            arbitrator,
            shared,
            paused,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<Change>, cancel: CancellationToken) {
        loop {
            let change = tokio::select! {
                _ = cancel.cancelled() => break,
                change = rx.recv() => match change {
                    Some(change) => change,
                    None => break,
                },
            };
            if let Err(err) = self.handle(change, &cancel).await {
                match err {
                    Error::Classification { .. } => warn!("{err}"),
                    err => error!("reconciliation failed: {err}"),
                }
            }
        }
        debug!("reconciler stopped");
    }

    pub(crate) async fn handle(&self, change: Change, cancel: &CancellationToken) -> Result<()> {
        let path = change.path().to_string();
        let prior = match self.index.get(&path).await? {
            Some(prior) => prior,
            None => match &change {
                Change::Local(_) => FileState::new(&path),
                Change::Remote(rc) if rc.kind == RemoteChangeKind::Added => {
                    FileState::new(&path)
                }
                Change::Remote(_) => {
                    // A modification or removal of a path we never tracked;
                    // drop it, the next prober cycle repairs.
                    return Err(Error::Classification {
                        path,
                        reason: "no state row for remote change".into(),
                    });
                }
            },
        };

        let updated = apply(&prior, &change);
        self.index.put(updated.clone()).await?;

        let classification = classify(&prior, &change);
        if classification == Classification::InSync {
            // Identical content on both sides: refresh the sync point so
            // neither source re-reports this observation.
            debug!("{path} coerced in sync by matching hashes");
            self.index
                .patch(
                    &path,
                    FilePatch {
                        status: Some(FileStatus::Synced),
                        last_sync: Some(unix_now()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        if self.paused.load(Ordering::SeqCst) {
            debug!("paused, recorded {path} without queueing");
            return Ok(());
        }

        let mode = self.shared.snapshot().config.mode;
        match classification {
            Classification::InSync => {}
            Classification::LocalOnly(kind) => {
                if mode.allows_push() {
                    self.queue.enqueue(&path, push_op(kind)).await?;
                } else {
                    debug!("{path}: local change suppressed by {} mode", mode.as_str());
                }
            }
            Classification::RemoteOnly(kind) => {
                if mode.allows_pull() {
                    self.queue.enqueue(&path, pull_op(kind)).await?;
                } else {
                    debug!("{path}: remote change suppressed by {} mode", mode.as_str());
                }
            }
            Classification::Conflict { local, remote } => {
                info!("conflict on {path}, asking arbitrator");
                let choice = tokio::select! {
                    _ = cancel.cancelled() => {
                        // Left diverged; re-classified on the next run.
                        return Ok(());
                    }
                    choice = self.arbitrator.resolve(updated.clone()) => choice,
                };
                match choice {
                    Resolution::Local => {
                        info!("conflict on {path} resolved: keeping local");
                        if mode.allows_push() {
                            self.queue.enqueue(&path, push_op(local)).await?;
                        } else {
                            debug!("{path}: answer suppressed by {} mode", mode.as_str());
                        }
                    }
                    Resolution::Remote => {
                        info!("conflict on {path} resolved: keeping remote");
                        if mode.allows_pull() {
                            self.queue.enqueue(&path, pull_op(remote)).await?;
                        } else {
                            debug!("{path}: answer suppressed by {} mode", mode.as_str());
                        }
                    }
                    Resolution::Ignore => {
                        info!("conflict on {path} ignored, leaving both sides");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Fold an observation into the state row.
fn apply(prior: &FileState, change: &Change) -> FileState {
    let mut state = prior.clone();
    match change {
        Change::Local(c) => match c.kind {
            LocalChangeKind::Write => {
                state.local_hash = c.hash.clone();
                state.local_mtime = c.mtime;
                state.status = FileStatus::LocalModified;
            }
            LocalChangeKind::Remove => {
                state.local_hash = String::new();
                state.local_mtime = 0;
                state.status = FileStatus::LocalDeleted;
            }
        },
        Change::Remote(c) => match c.kind {
            RemoteChangeKind::Added | RemoteChangeKind::Modified => {
                state.remote_mtime = c.mtime;
                state.status = FileStatus::RemoteModified;
            }
            RemoteChangeKind::Removed => {
                state.remote_hash = String::new();
                state.remote_mtime = 0;
                state.status = FileStatus::RemoteDeleted;
            }
        },
    }
    state
}

fn push_op(kind: ChangeKind) -> TaskOperation {
    match kind {
        ChangeKind::Modified => TaskOperation::Upload,
        ChangeKind::Deleted => TaskOperation::DeleteRemote,
    }
}

fn pull_op(kind: ChangeKind) -> TaskOperation {
    match kind {
        ChangeKind::Modified => TaskOperation::Download,
        ChangeKind::Deleted => TaskOperation::DeleteLocal,
    }
}
