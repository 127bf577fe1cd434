//! Periodic liveness sweep
//!
//! Every sweep interval, sessions idle past the session timeout are evicted
//! exactly as if their connection had dropped.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::coordinator::MeshCoordinator;

/// Run sweeps until the coordinator shuts down
pub async fn run_liveness_sweep(coordinator: Arc<MeshCoordinator>) {
    let period = coordinator.config().sweep_interval;
    let shutdown = coordinator.shutdown_token();

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(?period, timeout = ?coordinator.config().session_timeout, "Liveness sweep started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = coordinator.evict_expired().await;
                if evicted > 0 {
                    info!(evicted, remaining = coordinator.session_count(), "Liveness sweep evicted sessions");
                } else {
                    debug!(sessions = coordinator.session_count(), "Liveness sweep found no idle sessions");
                }
            }
        }
    }

    info!("Liveness sweep stopped");
}

pub fn spawn_liveness_sweep(coordinator: Arc<MeshCoordinator>) -> JoinHandle<()> {
    tokio::spawn(run_liveness_sweep(coordinator))
}
