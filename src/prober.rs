//! Remote observation: periodic listing of the mirrored collection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::engine::SharedState;
use crate::models::{Change, FileState, FileStatus, RemoteChange, RemoteChangeKind};
use crate::store::Store;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct RemoteProber {
    shared: SharedState,
    store: Arc<Store>,
    paused: Arc<AtomicBool>,
    network_up: Arc<AtomicBool>,
    out: mpsc::Sender<Change>,
}

impl RemoteProber {
    pub(crate) fn new(
        shared: SharedState,
        store: Arc<Store>,
        paused: Arc<AtomicBool>,
        network_up: Arc<AtomicBool>,
        out: mpsc::Sender<Change>,
    ) -> Self {
        Self {
            shared,
            store,
            paused,
            network_up,
            out,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.paused.load(Ordering::SeqCst) || !self.network_up.load(Ordering::SeqCst) {
                continue;
            }

            let snap = self.shared.snapshot();
            let listing = match snap.remote.read_dir(&snap.config.remote_dir).await {
                Ok(listing) => listing,
                Err(err) => {
                    // Any listing failure counts as the network being gone;
                    // the monitor brings the flag back.
                    warn!("remote listing failed: {err}");
                    self.network_up.store(false, Ordering::SeqCst);
                    continue;
                }
            };
            let remote: HashMap<String, i64> = listing
                .into_iter()
                .map(|entry| (entry.name, entry.mtime))
                .collect();

            let known = match self.store.list_files().await {
                Ok(known) => known,
                Err(err) => {
                    error!("listing file states failed: {err}");
                    continue;
                }
            };

            for change in diff(&known, &remote) {
                debug!("remote change: {:?} {}", change.kind, change.path);
                if self.out.send(Change::Remote(change)).await.is_err() {
                    return;
                }
            }
        }
        debug!("remote prober stopped");
    }
}

/// Compare a listing against the known rows.
pub(crate) fn diff(
    known: &[FileState],
    remote: &HashMap<String, i64>,
) -> Vec<RemoteChange> {
    let mut changes = Vec::new();
    let known_paths: HashSet<&str> = known.iter().map(|f| f.path.as_str()).collect();

    for state in known {
        match remote.get(state.path.as_str()) {
            Some(&mtime) => {
                if mtime > state.last_sync {
                    changes.push(RemoteChange {
                        path: state.path.clone(),
                        kind: RemoteChangeKind::Modified,
                        mtime,
                    });
                }
            }
            None => {
                // Only rows that were ever seen remotely produce a removal,
                // and only once.
                if state.remote_mtime > 0 && state.status != FileStatus::RemoteDeleted {
                    changes.push(RemoteChange {
                        path: state.path.clone(),
                        kind: RemoteChangeKind::Removed,
                        mtime: 0,
                    });
                }
            }
        }
    }

    for (name, &mtime) in remote {
        if !known_paths.contains(name.as_str()) {
            changes.push(RemoteChange {
                path: name.clone(),
                kind: RemoteChangeKind::Added,
                mtime,
            });
        }
    }

    changes
}
