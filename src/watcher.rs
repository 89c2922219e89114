//! Local filesystem observation.
//!
//! Raw notify events are bridged onto a tokio channel from the watcher's
//! callback thread, then coalesced per path: an editor save storm collapses
//! into at most one change per path per debounce window. Only the settled
//! change is hashed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::hash::sha1_file;
use crate::models::{Change, LocalChange, LocalChangeKind};

/// Minimum quiet period before a path's change is emitted.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

/// Per-path coalescing of raw events. The latest kind wins and every new
/// event pushes the path's deadline out by the window.
#[derive(Debug)]
pub(crate) struct DebounceBuffer {
    window: Duration,
    pending: HashMap<String, (LocalChangeKind, Instant)>,
}

impl DebounceBuffer {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub(crate) fn record(&mut self, path: String, kind: LocalChangeKind, now: Instant) {
        self.pending.insert(path, (kind, now + self.window));
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(_, deadline)| *deadline).min()
    }

    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<(String, LocalChangeKind)> {
        let mut due = Vec::new();
        self.pending.retain(|path, (kind, deadline)| {
            if *deadline <= now {
                due.push((path.clone(), *kind));
                false
            } else {
                true
            }
        });
        due
    }
}

pub struct LocalWatcher {
    root: PathBuf,
    // Dropping the watcher stops the native watches.
    _watcher: RecommendedWatcher,
    raw_rx: mpsc::Receiver<Event>,
    window: Duration,
}

impl LocalWatcher {
    pub fn new(root: PathBuf) -> Result<Self> {
        Self::with_window(root, DEBOUNCE_WINDOW)
    }

    pub fn with_window(root: PathBuf, window: Duration) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel(1024);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = raw_tx.blocking_send(event);
                }
                Err(err) => error!("watch error: {err}"),
            })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        Ok(Self {
            root,
            _watcher: watcher,
            raw_rx,
            window,
        })
    }

    /// Consume raw events, debounce, hash and forward normalized changes
    /// until cancelled.
    pub async fn run(mut self, out: mpsc::Sender<Change>, cancel: CancellationToken) {
        let mut buffer = DebounceBuffer::new(self.window);
        loop {
            let deadline = buffer.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.raw_rx.recv() => match event {
                    Some(event) => self.absorb(event, &mut buffer),
                    None => break,
                },
                _ = sleep_until_or_forever(deadline) => {
                    for (path, kind) in buffer.drain_due(Instant::now()) {
                        if let Some(change) = self.materialize(path, kind).await {
                            if out.send(change).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
        debug!("local watcher stopped");
    }

    fn absorb(&self, event: Event, buffer: &mut DebounceBuffer) {
        let kind = match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => LocalChangeKind::Write,
            EventKind::Remove(_) => LocalChangeKind::Remove,
            _ => return,
        };
        let now = Instant::now();
        for path in event.paths {
            if kind == LocalChangeKind::Write && path.is_dir() {
                continue;
            }
            if let Some(rel) = relativize(&self.root, &path) {
                buffer.record(rel, kind, now);
            }
        }
    }

    async fn materialize(&self, path: String, kind: LocalChangeKind) -> Option<Change> {
        match kind {
            LocalChangeKind::Write => {
                let abs = self.root.join(&path);
                match sha1_file(&abs).await {
                    Ok((hash, mtime)) => Some(Change::Local(LocalChange {
                        path,
                        kind,
                        hash,
                        mtime,
                    })),
                    Err(err) => {
                        // Transient: the next write or prober cycle recovers.
                        warn!("could not read {}: {err}", abs.display());
                        None
                    }
                }
            }
            LocalChangeKind::Remove => Some(Change::Local(LocalChange {
                path,
                kind,
                hash: String::new(),
                mtime: 0,
            })),
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn relativize(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let s = rel.to_string_lossy().replace('\\', "/");
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
