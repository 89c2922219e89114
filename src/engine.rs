//! The synchronization engine: wiring and lifecycle.
//!
//! An `Engine` owns its collaborators; the only mutable state is the
//! `paused` and `network_up` flags and the config snapshot, which is
//! swapped atomically so in-flight operations finish with the snapshot
//! they started with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::conflict::{Arbitrator, Conflict};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::index::FileStateIndex;
use crate::models::{Change, Task};
use crate::netmon::NetworkMonitor;
use crate::prober::RemoteProber;
use crate::queue::TaskQueue;
use crate::reconciler::Reconciler;
use crate::remote::RemoteClient;
use crate::store::Store;
use crate::watcher::LocalWatcher;
use crate::webdav::WebDavClient;

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const CONFLICT_CHANNEL_CAPACITY: usize = 16;

/// Immutable view of the configuration and the remote client built from it.
pub(crate) struct Snapshot {
    pub config: SyncConfig,
    pub remote: Arc<dyn RemoteClient>,
}

/// Atomically swappable snapshot shared by prober, executor and monitor.
#[derive(Clone)]
pub(crate) struct SharedState {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl SharedState {
    pub(crate) fn new(snapshot: Snapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn swap(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

type RemoteFactory =
    Arc<dyn Fn(&SyncConfig) -> Result<Arc<dyn RemoteClient>> + Send + Sync>;

pub struct Engine {
    store: Arc<Store>,
    index: Arc<FileStateIndex>,
    shared: SharedState,
    factory: RemoteFactory,
    paused: Arc<AtomicBool>,
    network_up: Arc<AtomicBool>,
    queue: Arc<TaskQueue>,
    task_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    arbitrator: Arbitrator,
    conflict_rx: Mutex<Option<mpsc::Receiver<Conflict>>>,
}

impl Engine {
    /// Engine talking WebDAV at `config.url`.
    pub fn new(config: SyncConfig, store: Arc<Store>) -> Result<Self> {
        let factory: RemoteFactory = Arc::new(|cfg: &SyncConfig| {
            Ok(Arc::new(WebDavClient::new(cfg)?) as Arc<dyn RemoteClient>)
        });
        Self::with_factory(config, store, factory)
    }

    /// Engine over a caller-supplied remote (alternative backends, tests).
    /// The same client is kept across config updates.
    pub fn with_remote(
        config: SyncConfig,
        store: Arc<Store>,
        remote: Arc<dyn RemoteClient>,
    ) -> Result<Self> {
        let factory: RemoteFactory = Arc::new(move |_: &SyncConfig| Ok(remote.clone()));
        Self::with_factory(config, store, factory)
    }

    fn with_factory(
        config: SyncConfig,
        store: Arc<Store>,
        factory: RemoteFactory,
    ) -> Result<Self> {
        let remote = factory(&config)?;
        let shared = SharedState::new(Snapshot { config, remote });
        let index = Arc::new(FileStateIndex::new(store.clone()));
        let paused = Arc::new(AtomicBool::new(false));
        let network_up = Arc::new(AtomicBool::new(true));
        let (queue, task_rx) =
            TaskQueue::new(store.clone(), paused.clone(), network_up.clone());
        let (arbitrator, conflict_rx) = Arbitrator::channel(CONFLICT_CHANNEL_CAPACITY);

        Ok(Self {
            store,
            index,
            shared,
            factory,
            paused,
            network_up,
            queue,
            task_rx: Mutex::new(Some(task_rx)),
            arbitrator,
            conflict_rx: Mutex::new(Some(conflict_rx)),
        })
    }

    /// The conflict stream. The shell answers each [`Conflict`] it
    /// receives; can only be taken once.
    pub fn conflicts(&self) -> Option<mpsc::Receiver<Conflict>> {
        self.conflict_rx.lock().ok().and_then(|mut guard| guard.take())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("sync paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("sync resumed");
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(err) = queue.rehydrate_pending().await {
                error!("failed to rehydrate pending tasks: {err}");
            }
        });
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Persist the new configuration and swap the snapshot. Subsequent
    /// prober, monitor and executor iterations see the new values.
    pub async fn update_config(&self, config: SyncConfig) -> Result<()> {
        config.save(&self.store).await?;
        let remote = (self.factory)(&config)?;
        self.shared.swap(Snapshot { config, remote });
        info!("configuration updated");
        Ok(())
    }

    /// Start all background tasks. Returns after wiring succeeds; the
    /// token stops everything.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let snap = self.shared.snapshot();
        if snap.config.local_dir.as_os_str().is_empty() {
            return Err(Error::Config("local_dir is not set".into()));
        }

        let watcher = LocalWatcher::new(snap.config.local_dir.clone())?;
        let task_rx = self
            .task_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| Error::Config("engine already started".into()))?;

        // Survivors of a previous run go first.
        self.queue.rehydrate_pending().await?;

        let (change_tx, change_rx) = mpsc::channel::<Change>(CHANGE_CHANNEL_CAPACITY);

        tokio::spawn(watcher.run(change_tx.clone(), cancel.clone()));

        let prober = RemoteProber::new(
            self.shared.clone(),
            self.store.clone(),
            self.paused.clone(),
            self.network_up.clone(),
            change_tx,
        );
        tokio::spawn(prober.run(cancel.clone()));

        let monitor = NetworkMonitor::new(
            self.shared.clone(),
            self.network_up.clone(),
            self.queue.clone(),
        )?;
        tokio::spawn(monitor.run(cancel.clone()));

        let reconciler = Reconciler::new(
            self.index.clone(),
            self.queue.clone(),
            self.arbitrator.clone(),
            self.shared.clone(),
            self.paused.clone(),
        );
        tokio::spawn(reconciler.run(change_rx, cancel.clone()));

        let executor = Arc::new(Executor::new(self.shared.clone()));
        tokio::spawn(self.queue.clone().run_consumer(
            task_rx,
            executor,
            self.index.clone(),
            cancel,
        ));

        info!("sync engine started");
        Ok(())
    }
}
