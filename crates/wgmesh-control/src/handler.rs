//! Per-connection protocol handler
//!
//! Drives one peer connection through `Connected` -> `Authenticated` ->
//! `Closed`. Protocol errors are answered with an `error` message and the
//! connection stays open; authentication failures are answered with
//! `auth_error` and the connection is closed.

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wgmesh_proto::{ClientType, ControlCodec, ControlMessage};
use wgmesh_transport::{PeerConnection, PeerSender};

use crate::coordinator::{AuthRequest, MeshCoordinator};
use crate::error::ControlError;

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Authenticated {
        peer_id: Uuid,
        client_type: ClientType,
    },
    Closed,
}

impl ConnectionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, ConnectionState::Authenticated { .. })
    }
}

/// Handles accepted connections on behalf of one coordinator
#[derive(Clone)]
pub struct ConnectionHandler {
    coordinator: Arc<MeshCoordinator>,
}

impl ConnectionHandler {
    pub fn new(coordinator: Arc<MeshCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Serve one connection until the peer leaves, the connection is
    /// closed from our side, or the coordinator shuts down.
    pub async fn handle_connection<C: PeerConnection>(&self, mut connection: C) {
        let sender = connection.sender();
        let remote = connection.remote_addr();
        let shutdown = self.coordinator.shutdown_token();
        let auth_deadline = tokio::time::sleep(self.coordinator.config().auth_timeout);
        tokio::pin!(auth_deadline);

        debug!(%remote, connection_id = %sender.connection_id(), "New peer connection");

        let mut state = ConnectionState::Connected;
        while state != ConnectionState::Closed {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(e) = sender.close("server shutting down").await {
                        debug!(%remote, "Failed to close connection: {}", e);
                    }
                    break;
                }
                _ = sender.closed() => break,
                _ = &mut auth_deadline, if state == ConnectionState::Connected => {
                    warn!(%remote, "Peer did not authenticate in time");
                    self.reject(&sender, "authentication timeout").await;
                    break;
                }
                frame = connection.recv_text() => frame,
            };

            let text = match frame {
                Ok(Some(text)) => text,
                Ok(None) => {
                    debug!(%remote, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    debug!(%remote, "Connection error: {}", e);
                    break;
                }
            };

            state = self.handle_frame(&sender, state, &text).await;
        }

        if let ConnectionState::Authenticated {
            peer_id,
            client_type,
        } = state
        {
            self.coordinator
                .handle_disconnect(peer_id, client_type, sender.connection_id())
                .await;
        }
        debug!(%remote, "Connection handler finished");
    }

    async fn handle_frame(
        &self,
        sender: &PeerSender,
        state: ConnectionState,
        text: &str,
    ) -> ConnectionState {
        if let ConnectionState::Authenticated { peer_id, .. } = state {
            self.coordinator
                .note_activity(peer_id, sender.connection_id());
        }

        let message = match ControlCodec::decode(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Rejecting frame: {}", e);
                self.reply_error(sender, e.to_string()).await;
                return state;
            }
        };

        debug!(message_type = message.message_type(), "Received message");

        match state {
            ConnectionState::Connected => self.handle_unauthenticated(sender, message).await,
            ConnectionState::Authenticated {
                peer_id,
                client_type,
            } => {
                self.handle_authenticated(sender, peer_id, client_type, message)
                    .await;
                state
            }
            ConnectionState::Closed => state,
        }
    }

    async fn handle_unauthenticated(
        &self,
        sender: &PeerSender,
        message: ControlMessage,
    ) -> ConnectionState {
        let ControlMessage::Auth {
            api_key,
            client_type,
            public_key,
            public_ip,
            ..
        } = message
        else {
            self.reply_error(sender, "Not authenticated").await;
            return ConnectionState::Connected;
        };

        info!(client_type = %client_type, "Auth request");
        let request = AuthRequest {
            api_key,
            client_type,
            public_key,
            public_ip,
        };

        match self.coordinator.authenticate(sender, request).await {
            Ok(identity) => ConnectionState::Authenticated {
                peer_id: identity.id,
                client_type,
            },
            Err(e) => {
                let reason = match e {
                    ControlError::Authentication(reason) => reason,
                    other => {
                        error!(client_type = %client_type, "Authentication failed: {}", other);
                        "Authentication failed".to_string()
                    }
                };
                warn!(client_type = %client_type, %reason, "Rejecting peer");
                self.reject(sender, &reason).await;
                ConnectionState::Closed
            }
        }
    }

    async fn handle_authenticated(
        &self,
        sender: &PeerSender,
        peer_id: Uuid,
        client_type: ClientType,
        message: ControlMessage,
    ) {
        match message {
            ControlMessage::Ping { .. } => {
                if let Err(e) = sender.send(ControlMessage::pong()).await {
                    debug!(peer_id = %peer_id, "Failed to send pong: {}", e);
                }
                self.coordinator.record_ping(peer_id, client_type).await;
            }
            ControlMessage::StatusUpdate {
                status, metadata, ..
            } => {
                debug!(peer_id = %peer_id, ?status, "Status update");
                if let Err(e) = self
                    .coordinator
                    .record_status(peer_id, client_type, status, metadata)
                    .await
                {
                    error!(peer_id = %peer_id, "Failed to record status: {}", e);
                }
            }
            ControlMessage::ConfigAck { success, error, .. } => {
                if success {
                    debug!(peer_id = %peer_id, "Config acknowledged");
                } else {
                    warn!(
                        peer_id = %peer_id,
                        error = error.as_deref().unwrap_or("unspecified"),
                        "Peer failed to apply config"
                    );
                }
            }
            ControlMessage::Auth { .. } => {
                self.reply_error(sender, "Already authenticated").await;
            }
            other => {
                let reason = format!("Unknown message type: {}", other.message_type());
                self.reply_error(sender, reason).await;
            }
        }
    }

    async fn reply_error(&self, sender: &PeerSender, reason: impl Into<String>) {
        if let Err(e) = sender.send(ControlMessage::error(reason)).await {
            debug!("Failed to send error reply: {}", e);
        }
    }

    /// `auth_error`, then close
    async fn reject(&self, sender: &PeerSender, reason: &str) {
        if let Err(e) = sender.send(ControlMessage::auth_error(reason)).await {
            debug!("Failed to send auth_error: {}", e);
        }
        if let Err(e) = sender.close(reason).await {
            debug!("Failed to close connection: {}", e);
        }
    }
}
