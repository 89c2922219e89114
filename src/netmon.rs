//! Reachability monitoring of the remote endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::SharedState;
use crate::error::Result;
use crate::queue::TaskQueue;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct NetworkMonitor {
    shared: SharedState,
    network_up: Arc<AtomicBool>,
    queue: Arc<TaskQueue>,
    http: reqwest::Client,
}

impl NetworkMonitor {
    pub(crate) fn new(
        shared: SharedState,
        network_up: Arc<AtomicBool>,
        queue: Arc<TaskQueue>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Self {
            shared,
            network_up,
            queue,
            http,
        })
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let url = self.shared.snapshot().config.url.clone();
            if url.is_empty() {
                // Nothing to probe against; leave the flag alone.
                continue;
            }

            // Any HTTP response (even an auth rejection) proves the endpoint
            // is reachable; only transport failures count as down.
            let reachable = self.http.get(&url).send().await.is_ok();
            let was_up = self.network_up.swap(reachable, Ordering::SeqCst);

            if !was_up && reachable {
                info!("network restored, resuming queued tasks");
                if let Err(err) = self.queue.rehydrate_pending().await {
                    error!("failed to rehydrate pending tasks: {err}");
                }
            } else if was_up && !reachable {
                warn!("network lost, caching changes");
            }
        }
        debug!("network monitor stopped");
    }
}
