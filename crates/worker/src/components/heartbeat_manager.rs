use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

use placesync_domain::CoordinationStore;

use crate::service::WorkerState;

/// Rewrites the worker's registry entry on a fixed interval so a
/// worker blocked on a slow task is still visible as alive.
pub struct HeartbeatManager {
    store: Arc<dyn CoordinationStore>,
    state: Arc<WorkerState>,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        state: Arc<WorkerState>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            state,
            heartbeat_interval,
        }
    }

    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut heartbeat_interval = interval(self.heartbeat_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = heartbeat_interval.tick() => {
                        let info = self.state.snapshot().await;
                        if let Err(e) = self.store.register_worker(&info).await {
                            error!("Failed to write heartbeat for {}: {}", info.worker_id, e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Heartbeat task shutting down");
                        break;
                    }
                }
            }
        })
    }
}
