//! The conflict-resolution handshake between the engine and its shell.
//!
//! The reconciler raises one conflict at a time; the shell (a GUI, the CLI
//! policy loop, or a test stub) receives a [`Conflict`] handle from the
//! engine's conflict stream and answers it exactly once.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::models::FileState;

/// The outside decider's choice for a diverged path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the local side; the remote is overwritten or removed.
    Local,
    /// Keep the remote side; the local file is overwritten or removed.
    Remote,
    /// Leave both sides as they are.
    Ignore,
}

/// A pending conflict handed to the shell. Dropping the handle without
/// answering counts as [`Resolution::Ignore`].
#[derive(Debug)]
pub struct Conflict {
    pub file: FileState,
    answer_tx: oneshot::Sender<Resolution>,
}

impl Conflict {
    /// Answer the conflict. The handle is consumed; an engine that already
    /// gave up waiting discards the answer.
    pub fn answer(self, choice: Resolution) {
        let _ = self.answer_tx.send(choice);
    }
}

/// Engine-side port that turns a diverged `FileState` into a shell
/// round-trip.
#[derive(Debug, Clone)]
pub struct Arbitrator {
    tx: mpsc::Sender<Conflict>,
}

impl Arbitrator {
    /// Returns the port plus the receiving end exposed as
    /// `Engine::conflicts`.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Conflict>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Raise `file` to the shell and wait for its choice. A closed channel
    /// on either leg maps to `Ignore`: the state stays diverged and the
    /// next identical observation raises the conflict again.
    pub async fn resolve(&self, file: FileState) -> Resolution {
        let path = file.path.clone();
        let (answer_tx, answer_rx) = oneshot::channel();
        let conflict = Conflict { file, answer_tx };
        if self.tx.send(conflict).await.is_err() {
            debug!("conflict channel closed, ignoring conflict on {path}");
            return Resolution::Ignore;
        }
        match answer_rx.await {
            Ok(choice) => choice,
            Err(_) => {
                debug!("conflict on {path} dropped without an answer");
                Resolution::Ignore
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileState;

    #[tokio::test]
    async fn answer_reaches_the_engine_side() {
        let (arbitrator, mut rx) = Arbitrator::channel(4);

        let shell = tokio::spawn(async move {
            let conflict = rx.recv().await.unwrap();
            assert_eq!(conflict.file.path, "a.txt");
            conflict.answer(Resolution::Remote);
        });

        let choice = arbitrator.resolve(FileState::new("a.txt")).await;
        assert_eq!(choice, Resolution::Remote);
        shell.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_handle_is_ignore() {
        let (arbitrator, mut rx) = Arbitrator::channel(4);

        let shell = tokio::spawn(async move {
            let conflict = rx.recv().await.unwrap();
            drop(conflict);
        });

        let choice = arbitrator.resolve(FileState::new("a.txt")).await;
        assert_eq!(choice, Resolution::Ignore);
        shell.await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_is_ignore() {
        let (arbitrator, rx) = Arbitrator::channel(4);
        drop(rx);
        let choice = arbitrator.resolve(FileState::new("a.txt")).await;
        assert_eq!(choice, Resolution::Ignore);
    }
}
