//! Durable task queue: a bounded channel fronting the tasks table.
//!
//! Enqueueing persists the row before publishing it, so a task is never
//! visible to the consumer without its durable row. The single consumer
//! serializes execution; pause, network loss and retries are handled by
//! re-publishing with exponential backoff. Pending rows are re-published
//! from the store on startup, on resume and on network recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::executor::TaskExecutor;
use crate::index::FileStateIndex;
use crate::models::{unix_now, FileStatus, Task, TaskOperation, TaskStatus};
use crate::store::{FilePatch, Store, TaskPatch};

/// Bound of the in-memory channel.
pub const QUEUE_CAPACITY: usize = 100;

/// A task executes with `retries` 0..=MAX_RETRIES; the failure after the
/// last attempt parks it.
pub const MAX_RETRIES: i64 = 5;

const BACKOFF_CAP_SECS: u64 = 32;

/// Exponential backoff: `2^retries` seconds, capped.
pub fn backoff(retries: i64) -> Duration {
    let exp = retries.clamp(0, 6) as u32;
    Duration::from_secs((1u64 << exp).min(BACKOFF_CAP_SECS))
}

pub struct TaskQueue {
    store: Arc<Store>,
    tx: mpsc::Sender<Task>,
    paused: Arc<AtomicBool>,
    network_up: Arc<AtomicBool>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<Store>,
        paused: Arc<AtomicBool>,
        network_up: Arc<AtomicBool>,
    ) -> (Arc<Self>, mpsc::Receiver<Task>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Arc::new(Self {
                store,
                tx,
                paused,
                network_up,
            }),
            rx,
        )
    }

    /// Persist a fresh pending task for `(path, operation)` and publish it.
    /// Competing active operations on the same path are superseded.
    pub async fn enqueue(&self, path: &str, operation: TaskOperation) -> Result<()> {
        self.store.supersede_tasks(path, operation).await?;
        let task = Task::new(path, operation);
        self.store.put_task(&task).await?;
        self.publish(task);
        info!("queued {:?} for {}", operation, path);
        Ok(())
    }

    /// Re-publish every pending row from the store.
    pub async fn rehydrate_pending(&self) -> Result<()> {
        let tasks = self.store.list_pending_tasks().await?;
        if !tasks.is_empty() {
            info!("rehydrating {} pending task(s)", tasks.len());
        }
        for task in tasks {
            self.publish(task);
        }
        Ok(())
    }

    fn publish(&self, task: Task) {
        // A full channel is not fatal: pending rows come back through
        // rehydration instead of deadlocking the single consumer.
        if self.tx.try_send(task).is_err() {
            warn!("task channel full, deferring to rehydration");
        }
    }

    /// Consumer loop. Single-threaded on purpose: ordering stays simple and
    /// per-(path, operation) uniqueness guarantees a terminal outcome.
    pub async fn run_consumer(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Task>,
        executor: Arc<dyn TaskExecutor>,
        index: Arc<FileStateIndex>,
        cancel: CancellationToken,
    ) {
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            // The durable row is authoritative: a channel entry whose row
            // was superseded or already completed is stale.
            let row = match self.store.get_task(&task.path, task.operation).await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    debug!("skipping superseded {:?} for {}", task.operation, task.path);
                    continue;
                }
                Err(err) => {
                    error!("failed to read task row for {}: {err}", task.path);
                    continue;
                }
            };
            if row.status == TaskStatus::Completed {
                debug!("skipping completed {:?} for {}", row.operation, row.path);
                continue;
            }

            if self.paused.load(Ordering::SeqCst) || !self.network_up.load(Ordering::SeqCst) {
                if !self.sleep_backoff(row.retries, &cancel).await {
                    break;
                }
                // Saturate below the cap so a long outage delays the task
                // without parking it.
                let retries = (row.retries + 1).min(MAX_RETRIES);
                self.record_attempt(&row, retries, None).await;
                let mut task = row;
                task.retries = retries;
                self.publish(task);
                continue;
            }

            if row.retries > MAX_RETRIES {
                warn!(
                    "parking {:?} for {} after {} retries",
                    row.operation, row.path, row.retries
                );
                self.record_attempt(&row, row.retries, Some(TaskStatus::Failed))
                    .await;
                continue;
            }

            match executor.execute(&row).await {
                Ok(patch) => {
                    self.record_attempt(&row, row.retries, Some(TaskStatus::Completed))
                        .await;
                    let now = unix_now();
                    let result = index
                        .patch(
                            &row.path,
                            FilePatch {
                                status: Some(FileStatus::Synced),
                                last_sync: Some(now),
                                ..patch
                            },
                        )
                        .await;
                    if let Err(err) = result {
                        error!("failed to mark {} synced: {err}", row.path);
                    }
                    info!("completed {:?} for {}", row.operation, row.path);
                }
                Err(err) => {
                    warn!("{:?} for {} failed: {err}", row.operation, row.path);
                    if err.is_network() {
                        self.network_up.store(false, Ordering::SeqCst);
                    }
                    let retries = row.retries + 1;
                    self.record_attempt(&row, retries, Some(TaskStatus::Failed))
                        .await;
                    if retries > MAX_RETRIES {
                        warn!(
                            "parking {:?} for {} after {retries} attempts",
                            row.operation, row.path
                        );
                        continue;
                    }
                    if !self.sleep_backoff(retries, &cancel).await {
                        break;
                    }
                    let mut task = row;
                    task.retries = retries;
                    task.status = TaskStatus::Failed;
                    self.publish(task);
                }
            }
        }
        debug!("task consumer stopped");
    }

    /// Returns false when cancelled mid-sleep.
    async fn sleep_backoff(&self, retries: i64, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(backoff(retries)) => true,
        }
    }

    async fn record_attempt(&self, task: &Task, retries: i64, status: Option<TaskStatus>) {
        let result = self
            .store
            .patch_task(
                &task.path,
                task.operation,
                TaskPatch {
                    status,
                    retries: Some(retries),
                    last_attempt: Some(unix_now()),
                },
            )
            .await;
        if let Err(err) = result {
            error!("failed to persist task attempt for {}: {err}", task.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::FileState;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    struct RecordingExecutor {
        calls: Mutex<Vec<TaskOperation>>,
        executed: AtomicUsize,
        fail: AtomicBool,
    }

    impl RecordingExecutor {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                executed: AtomicUsize::new(0),
                fail: AtomicBool::new(fail),
            })
        }

        fn count(&self) -> usize {
            self.executed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(&self, task: &Task) -> Result<FilePatch> {
            self.calls.lock().await.push(task.operation);
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Io(std::io::Error::other("disk on fire")))
            } else {
                Ok(FilePatch::default())
            }
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        queue: Arc<TaskQueue>,
        rx: Option<mpsc::Receiver<Task>>,
        index: Arc<FileStateIndex>,
        paused: Arc<AtomicBool>,
        network_up: Arc<AtomicBool>,
        cancel: CancellationToken,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("sync.db")).await.unwrap());
        let paused = Arc::new(AtomicBool::new(false));
        let network_up = Arc::new(AtomicBool::new(true));
        let (queue, rx) = TaskQueue::new(store.clone(), paused.clone(), network_up.clone());
        let index = Arc::new(FileStateIndex::new(store.clone()));
        Harness {
            _dir: dir,
            store,
            queue,
            rx: Some(rx),
            index,
            paused,
            network_up,
            cancel: CancellationToken::new(),
        }
    }

    impl Harness {
        fn spawn_consumer(&mut self, executor: Arc<RecordingExecutor>) {
            let rx = self.rx.take().unwrap();
            tokio::spawn(self.queue.clone().run_consumer(
                rx,
                executor,
                self.index.clone(),
                self.cancel.clone(),
            ));
        }
    }

    async fn wait_for<F>(mut check: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..20_000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_task_status(
        store: &Store,
        path: &str,
        op: TaskOperation,
        status: TaskStatus,
    ) -> Task {
        for _ in 0..20_000 {
            if let Some(row) = store.get_task(path, op).await.unwrap() {
                if row.status == status {
                    return row;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {path} never reached {status:?}");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(16));
        assert_eq!(backoff(5), Duration::from_secs(32));
        assert_eq!(backoff(6), Duration::from_secs(32));
        assert_eq!(backoff(40), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn success_completes_task_and_marks_file_synced() {
        let mut h = harness().await;
        let mut state = FileState::new("a.txt");
        state.local_hash = "h1".into();
        state.status = FileStatus::LocalModified;
        h.index.put(state).await.unwrap();

        let exec = RecordingExecutor::new(false);
        h.spawn_consumer(exec.clone());
        h.queue
            .enqueue("a.txt", TaskOperation::Upload)
            .await
            .unwrap();

        wait_for(|| exec.count() == 1).await;
        let row =
            wait_task_status(&h.store, "a.txt", TaskOperation::Upload, TaskStatus::Completed)
                .await;
        assert_eq!(row.retries, 0);
        let mut file = h.store.get_file("a.txt").await.unwrap().unwrap();
        for _ in 0..20_000 {
            if file.status == FileStatus::Synced {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            file = h.store.get_file("a.txt").await.unwrap().unwrap();
        }
        assert_eq!(file.status, FileStatus::Synced);
        assert!(file.last_sync > 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn persistent_failure_parks_after_six_attempts() {
        let mut h = harness().await;
        let exec = RecordingExecutor::new(true);
        h.spawn_consumer(exec.clone());
        h.queue
            .enqueue("d.bin", TaskOperation::Upload)
            .await
            .unwrap();

        wait_for(|| exec.count() == 6).await;
        // Give the consumer time to not execute a seventh attempt.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(exec.count(), 6);

        let row = h
            .store
            .get_task("d.bin", TaskOperation::Upload)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.retries, 6);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn offline_task_waits_and_runs_on_recovery() {
        let mut h = harness().await;
        h.network_up.store(false, Ordering::SeqCst);

        let exec = RecordingExecutor::new(false);
        h.spawn_consumer(exec.clone());
        h.queue
            .enqueue("b.txt", TaskOperation::DeleteRemote)
            .await
            .unwrap();

        // Several gate cycles: no execution, row stays pending.
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(exec.count(), 0);
        let row = h
            .store
            .get_task("b.txt", TaskOperation::DeleteRemote)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TaskStatus::Pending);

        h.network_up.store(true, Ordering::SeqCst);
        wait_for(|| exec.count() == 1).await;
        wait_task_status(
            &h.store,
            "b.txt",
            TaskOperation::DeleteRemote,
            TaskStatus::Completed,
        )
        .await;
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn superseded_and_completed_entries_are_skipped() {
        let mut h = harness().await;

        // Upload queued first, then a newer classification wants download.
        h.queue
            .enqueue("c.txt", TaskOperation::Upload)
            .await
            .unwrap();
        h.queue
            .enqueue("c.txt", TaskOperation::Download)
            .await
            .unwrap();

        let exec = RecordingExecutor::new(false);
        h.spawn_consumer(exec.clone());

        wait_for(|| exec.count() >= 1).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(exec.count(), 1);
        assert_eq!(*exec.calls.lock().await, vec![TaskOperation::Download]);

        // A rehydrated duplicate of a completed task does not re-execute.
        h.queue.rehydrate_pending().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(exec.count(), 1);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn paused_queue_executes_nothing() {
        let mut h = harness().await;
        h.paused.store(true, Ordering::SeqCst);

        let exec = RecordingExecutor::new(false);
        h.spawn_consumer(exec.clone());
        h.queue
            .enqueue("p.txt", TaskOperation::Upload)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(exec.count(), 0);

        h.paused.store(false, Ordering::SeqCst);
        wait_for(|| exec.count() == 1).await;
        h.cancel.cancel();
    }
}
