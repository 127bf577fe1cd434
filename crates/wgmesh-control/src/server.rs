//! Accept loop
//!
//! Accepts connections from any [`TransportListener`] and serves each on its
//! own task until the coordinator shuts down.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use wgmesh_transport::{PeerConnection, TransportListener};

use crate::coordinator::MeshCoordinator;
use crate::handler::ConnectionHandler;
use crate::task_tracker::TaskTracker;

/// Back-off after a failed accept so a broken listener cannot spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct ControlServer<L: TransportListener> {
    listener: L,
    coordinator: Arc<MeshCoordinator>,
    tasks: Arc<TaskTracker>,
}

impl<L: TransportListener> ControlServer<L> {
    pub fn new(listener: L, coordinator: Arc<MeshCoordinator>) -> Self {
        Self {
            listener,
            coordinator,
            tasks: Arc::new(TaskTracker::new()),
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    /// Connection handlers still running
    pub fn active_connections(&self) -> usize {
        self.tasks.len()
    }

    /// Serve until the coordinator's shutdown token fires. Handlers that
    /// outlive shutdown are aborted on the way out.
    pub async fn run(&self) {
        let shutdown = self.coordinator.shutdown_token();
        let handler = ConnectionHandler::new(self.coordinator.clone());

        match self.listener.local_addr() {
            Ok(addr) => info!("🚀 Control server accepting peers on {}", addr),
            Err(e) => debug!("Listener address unavailable: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((connection, remote)) => {
                    let connection_id = connection.sender().connection_id();
                    debug!(%remote, %connection_id, "Accepted connection");

                    let handler = handler.clone();
                    let tasks = self.tasks.clone();
                    let handle = tokio::spawn(async move {
                        handler.handle_connection(connection).await;
                        tasks.finish(&connection_id);
                    });
                    self.tasks.register(connection_id, handle);
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        // Handlers see the same token and exit on their own; give them a moment
        tokio::time::sleep(Duration::from_millis(50)).await;
        let aborted = self.tasks.abort_all();
        info!(aborted, "Control server stopped");
    }
}
