//! Periodic background re-clustering.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;

/// Calls [`Dispatcher::tick`] on a fixed interval until cancelled.
pub struct ClusterScheduler {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl ClusterScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    /// Scheduler using `clustering.interval_secs` from the dispatcher's settings.
    pub fn from_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        let interval = dispatcher.settings().clustering.interval();
        Self::new(dispatcher, interval)
    }

    /// Runs until `ct` is cancelled. Passes execute on the blocking pool so
    /// searches on the async runtime are never stalled by k-means.
    pub async fn run(self, ct: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "Starting cluster scheduler with {}ms interval",
            self.interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = ct.cancelled() => {
                    info!("Cluster scheduler stopped by cancellation token");
                    break;
                }
                _ = ticker.tick() => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    match tokio::task::spawn_blocking(move || dispatcher.tick()).await {
                        Ok(true) => debug!("scheduled clustering pass published"),
                        Ok(false) => {}
                        Err(e) => warn!("clustering task panicked: {e}"),
                    }
                }
            }
        }
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self, ct: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(ct))
    }
}
