//! The coordination engine
//!
//! [`MeshCoordinator`] owns the session registry, the store handle, the
//! allocator and the synthesizer. Connection handlers drive it through
//! [`MeshCoordinator::authenticate`] and [`MeshCoordinator::handle_disconnect`];
//! the mutation service drives it through the `on_*` hooks. Every push is
//! best-effort: a failed send is logged and the fan-out continues.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wgmesh_db::entities::PeerStatus;
use wgmesh_proto::{ClientType, ControlMessage, ReportedStatus};
use wgmesh_transport::PeerSender;

use crate::allocator::{AddressAllocator, TunnelAddress};
use crate::config::CoordinatorConfig;
use crate::error::{ControlError, ControlResult};
use crate::session_registry::{Session, SessionRegistry};
use crate::store::{MeshStore, PeerIdentity};
use crate::synthesizer::{ConfigSynthesizer, MeshSnapshot};

/// What a peer presents in its `auth` message
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub api_key: String,
    pub client_type: ClientType,
    pub public_key: Option<String>,
    pub public_ip: Option<String>,
}

pub struct MeshCoordinator {
    store: MeshStore,
    sessions: SessionRegistry,
    allocator: AddressAllocator,
    synthesizer: ConfigSynthesizer,
    config: CoordinatorConfig,
    shutdown: CancellationToken,
}

impl MeshCoordinator {
    pub fn new(store: MeshStore, config: CoordinatorConfig) -> Arc<Self> {
        info!(
            sweep_interval = ?config.sweep_interval,
            session_timeout = ?config.session_timeout,
            backfill_policy = ?config.backfill_policy,
            "Creating mesh coordinator"
        );
        Arc::new(Self {
            store,
            sessions: SessionRegistry::new(),
            allocator: AddressAllocator::new(config.backfill_policy),
            synthesizer: ConfigSynthesizer::new(config.wireguard_port),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &MeshStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Cancelled once [`MeshCoordinator::shutdown`] runs
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Ids of peers of `client_type` with a live session
    pub fn online_peers(&self, client_type: ClientType) -> Vec<Uuid> {
        self.sessions
            .all_online_of_type(client_type)
            .into_iter()
            .map(|s| s.peer_id)
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    /// Run the handshake for one connection.
    ///
    /// On success the peer is online in the store, registered, has received
    /// `auth_success` followed by its own config, and the opposite role has
    /// been pushed fresh configs. A superseded connection for the same peer
    /// is closed.
    pub async fn authenticate(
        &self,
        sender: &PeerSender,
        request: AuthRequest,
    ) -> ControlResult<PeerIdentity> {
        let AuthRequest {
            api_key,
            client_type,
            public_key,
            public_ip,
        } = request;

        let public_key = public_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if let Some(ref key) = public_key {
            wgmesh_auth::validate_key(key)
                .map_err(|e| ControlError::Authentication(format!("Invalid public key: {}", e)))?;
        }

        // Agents carry no address on their record; a reported IP is ignored
        let public_ip = match client_type {
            ClientType::Gateway => public_ip
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty()),
            ClientType::Agent => None,
        };
        if let Some(ref ip) = public_ip {
            // Endpoints are rendered as ip:port, same rule as operator-set IPs
            ip.parse::<Ipv4Addr>()
                .map_err(|_| ControlError::Authentication(format!("Invalid public IP: {}", ip)))?;
        }

        let identity = self
            .store
            .find_peer_by_credential(client_type, &api_key)
            .await?
            .ok_or_else(|| ControlError::Authentication("Invalid API key".to_string()))?;

        // Register before the status write so a stale disconnect for this
        // peer that races with us sees the new session (see `go_offline`)
        let session = Session::new(identity.id, client_type, sender.clone());
        if let Some(old) = self.sessions.put(session.clone()) {
            if old.connection_id() != sender.connection_id() {
                if let Err(e) = old.sender.close("superseded by a new connection").await {
                    debug!(peer_id = %identity.id, "Superseded connection already gone: {}", e);
                }
            }
        }

        if let Err(e) = self
            .store
            .mark_online(
                client_type,
                identity.id,
                public_key.as_deref(),
                public_ip.as_deref(),
            )
            .await
        {
            self.sessions
                .remove_if_current(identity.id, sender.connection_id());
            return Err(e);
        }

        if let Err(e) = sender
            .send(ControlMessage::auth_success(identity.id, client_type))
            .await
        {
            // The connection died mid-handshake; undo the registration
            if self
                .sessions
                .remove_if_current(identity.id, sender.connection_id())
                .is_some()
            {
                self.go_offline(identity.id, client_type).await;
            }
            return Err(ControlError::Protocol(format!(
                "Failed to send auth_success: {}",
                e
            )));
        }

        info!(
            peer_id = %identity.id,
            client_type = %client_type,
            name = %identity.name,
            "✅ Peer authenticated"
        );

        self.push_config(&session).await;

        let pushed = self.broadcast_to_role(client_type.opposite()).await;
        debug!(
            peer_id = %identity.id,
            role = %client_type.opposite(),
            pushed,
            "Broadcast after authentication"
        );

        Ok(identity)
    }

    /// Tear down the session owned by `connection_id`, if it is still the
    /// current one. Returns whether anything was torn down.
    pub async fn handle_disconnect(
        &self,
        peer_id: Uuid,
        client_type: ClientType,
        connection_id: Uuid,
    ) -> bool {
        if self
            .sessions
            .remove_if_current(peer_id, connection_id)
            .is_none()
        {
            debug!(peer_id = %peer_id, "Connection was not the current session; nothing to clean up");
            return false;
        }

        info!(peer_id = %peer_id, client_type = %client_type, "Peer disconnected");
        self.go_offline(peer_id, client_type).await;
        true
    }

    /// Mark a peer offline once its session is gone. A reconnect that
    /// registered in the meantime keeps the peer online: either it is seen
    /// before the write, or after it and the status is put back.
    pub(crate) async fn go_offline(&self, peer_id: Uuid, client_type: ClientType) {
        if self.sessions.is_online(peer_id) {
            debug!(peer_id = %peer_id, "Peer already reconnected; keeping it online");
            return;
        }
        if let Err(e) = self.store.mark_offline(client_type, peer_id).await {
            error!(peer_id = %peer_id, "Failed to mark peer offline: {}", e);
        }
        if self.sessions.is_online(peer_id) {
            debug!(peer_id = %peer_id, "Peer reconnected during teardown; restoring online");
            if let Err(e) = self.store.mark_online(client_type, peer_id, None, None).await {
                error!(peer_id = %peer_id, "Failed to restore online status: {}", e);
            }
            return;
        }
        self.broadcast_to_role(client_type.opposite()).await;
    }

    /// Evict sessions idle past the session timeout; returns how many
    pub async fn evict_expired(&self) -> usize {
        let expired = self
            .sessions
            .expired(Instant::now(), self.config.session_timeout);

        let mut evicted = 0;
        for session in expired {
            if self
                .sessions
                .remove_if_current(session.peer_id, session.connection_id())
                .is_none()
            {
                continue;
            }
            evicted += 1;

            warn!(
                peer_id = %session.peer_id,
                client_type = %session.client_type,
                "Session timed out"
            );
            if let Err(e) = session.sender.close("session timed out").await {
                debug!(peer_id = %session.peer_id, "Timed-out connection already gone: {}", e);
            }
            self.go_offline(session.peer_id, session.client_type).await;
        }
        evicted
    }

    /// Record liveness for a message arriving on `connection_id`
    pub fn note_activity(&self, peer_id: Uuid, connection_id: Uuid) {
        self.sessions.touch(peer_id, connection_id);
    }

    /// Persist a ping as last-seen; failures only get logged
    pub async fn record_ping(&self, peer_id: Uuid, client_type: ClientType) {
        if let Err(e) = self.store.touch(client_type, peer_id).await {
            error!(peer_id = %peer_id, "Failed to record last seen: {}", e);
        }
    }

    /// Persist a peer-reported status and its metadata
    pub async fn record_status(
        &self,
        peer_id: Uuid,
        client_type: ClientType,
        status: ReportedStatus,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> ControlResult<()> {
        let status = match status {
            ReportedStatus::Online => PeerStatus::Online,
            ReportedStatus::Offline => PeerStatus::Offline,
            ReportedStatus::Error => PeerStatus::Error,
        };
        self.store
            .record_status(
                client_type,
                peer_id,
                status,
                metadata.map(serde_json::Value::Object),
            )
            .await
    }

    /// Send one peer its current config. Returns whether it was delivered.
    pub async fn push_config(&self, session: &Session) -> bool {
        match self.store.snapshot().await {
            Ok(snapshot) => self.push_from_snapshot(&snapshot, session).await,
            Err(e) => {
                error!(peer_id = %session.peer_id, "Failed to load mesh state: {}", e);
                false
            }
        }
    }

    /// Push to one peer if it is connected
    pub async fn push_to_peer(&self, peer_id: Uuid) -> bool {
        match self.sessions.get(peer_id) {
            Some(session) => self.push_config(&session).await,
            None => {
                debug!(peer_id = %peer_id, "Peer not connected; skipping config push");
                false
            }
        }
    }

    /// Push fresh configs to every connected peer of `client_type`.
    /// Returns how many were delivered.
    pub async fn broadcast_to_role(&self, client_type: ClientType) -> usize {
        let targets = self.sessions.all_online_of_type(client_type);
        if targets.is_empty() {
            return 0;
        }

        let snapshot = match self.store.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(role = %client_type, "Failed to load mesh state for broadcast: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for session in &targets {
            if self.push_from_snapshot(&snapshot, session).await {
                delivered += 1;
            }
        }

        info!(
            role = %client_type,
            delivered,
            targets = targets.len(),
            "Broadcast config"
        );
        delivered
    }

    async fn push_from_snapshot(&self, snapshot: &MeshSnapshot, session: &Session) -> bool {
        let Some(config) =
            self.synthesizer
                .for_peer(snapshot, session.client_type, session.peer_id)
        else {
            warn!(peer_id = %session.peer_id, "Peer no longer exists; not pushing config");
            return false;
        };

        match session.sender.send(ControlMessage::config_update(config)).await {
            Ok(()) => {
                debug!(peer_id = %session.peer_id, client_type = %session.client_type, "Sent config");
                true
            }
            Err(e) => {
                warn!(peer_id = %session.peer_id, "Failed to push config: {}", e);
                false
            }
        }
    }

    async fn on_tunnel_changed(&self, agent_id: Uuid) {
        self.broadcast_to_role(ClientType::Gateway).await;
        self.push_to_peer(agent_id).await;
    }

    pub async fn on_tunnel_created(&self, tunnel_id: Uuid, agent_id: Uuid) {
        debug!(tunnel_id = %tunnel_id, agent_id = %agent_id, "Tunnel created");
        self.on_tunnel_changed(agent_id).await;
    }

    pub async fn on_tunnel_updated(&self, tunnel_id: Uuid, agent_id: Uuid) {
        debug!(tunnel_id = %tunnel_id, agent_id = %agent_id, "Tunnel updated");
        self.on_tunnel_changed(agent_id).await;
    }

    /// Call after the tunnel and its addresses are gone from the store
    pub async fn on_tunnel_deleted(&self, tunnel_id: Uuid, agent_id: Uuid) {
        debug!(tunnel_id = %tunnel_id, agent_id = %agent_id, "Tunnel deleted");
        self.on_tunnel_changed(agent_id).await;
    }

    /// Call after the agent and its tunnels are gone from the store
    pub async fn on_agent_deleted(&self, agent_id: Uuid) {
        self.drop_session(agent_id, "agent deleted").await;
        self.broadcast_to_role(ClientType::Gateway).await;
    }

    /// Backfill the new gateway's addresses, then push to agents
    pub async fn on_gateway_created(&self, gateway_id: Uuid) -> ControlResult<Vec<TunnelAddress>> {
        let addresses = self
            .allocator
            .backfill_gateway(self.store.connection(), gateway_id)
            .await?;
        self.broadcast_to_role(ClientType::Agent).await;
        Ok(addresses)
    }

    /// Public IP or other operator change; agents' endpoints may move
    pub async fn on_gateway_updated(&self, gateway_id: Uuid) {
        debug!(gateway_id = %gateway_id, "Gateway updated");
        self.broadcast_to_role(ClientType::Agent).await;
    }

    /// Call after the gateway and its addresses are gone from the store
    pub async fn on_gateway_deleted(&self, gateway_id: Uuid) {
        self.drop_session(gateway_id, "gateway deleted").await;
        self.broadcast_to_role(ClientType::Agent).await;
    }

    async fn drop_session(&self, peer_id: Uuid, reason: &str) {
        if let Some(session) = self.sessions.remove(peer_id) {
            info!(peer_id = %peer_id, reason, "Closing session of removed peer");
            if let Err(e) = session.sender.close(reason).await {
                debug!(peer_id = %peer_id, "Connection already gone: {}", e);
            }
        }
    }

    /// Stop accepting work and close every live session
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down mesh coordinator");
        self.shutdown.cancel();

        let sessions = self.sessions.drain();
        let count = sessions.len();
        for session in sessions {
            if let Err(e) = session.sender.close("server shutting down").await {
                debug!(peer_id = %session.peer_id, "Connection already gone: {}", e);
            }
            if let Err(e) = self
                .store
                .mark_offline(session.client_type, session.peer_id)
                .await
            {
                error!(peer_id = %session.peer_id, "Failed to mark peer offline: {}", e);
            }
        }
        info!(closed = count, "✅ All sessions closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MeshService;
    use wgmesh_transport::memory::{pair, MemoryClient, MemoryConnection};
    use wgmesh_transport::PeerConnection;

    async fn setup() -> (Arc<MeshCoordinator>, MeshService) {
        let db = wgmesh_db::connect("sqlite::memory:").await.unwrap();
        wgmesh_db::migrate(&db).await.unwrap();
        let coordinator = MeshCoordinator::new(MeshStore::new(db), CoordinatorConfig::default());
        let service = MeshService::new(coordinator.clone());
        (coordinator, service)
    }

    fn connection() -> (MemoryConnection, MemoryClient) {
        pair("127.0.0.1:40000".parse().unwrap())
    }

    fn agent_auth(api_key: &str) -> AuthRequest {
        AuthRequest {
            api_key: api_key.to_string(),
            client_type: ClientType::Agent,
            public_key: None,
            public_ip: None,
        }
    }

    #[tokio::test]
    async fn test_stale_disconnect_after_reconnect_keeps_peer_online() {
        let (coordinator, service) = setup().await;
        let created = service.create_agent("a1").await.unwrap();
        let agent_id = created.agent.id;
        let api_key = created.api_key.as_str().to_string();

        let (old_conn, _old_client) = connection();
        let old_sender = old_conn.sender();
        coordinator
            .authenticate(&old_sender, agent_auth(&api_key))
            .await
            .unwrap();

        // The old handler drops its registry entry, then stalls before the
        // status write while the peer reconnects
        assert!(coordinator
            .sessions()
            .remove_if_current(agent_id, old_sender.connection_id())
            .is_some());

        let (new_conn, _new_client) = connection();
        coordinator
            .authenticate(&new_conn.sender(), agent_auth(&api_key))
            .await
            .unwrap();

        coordinator.go_offline(agent_id, ClientType::Agent).await;

        assert!(coordinator.sessions().is_online(agent_id));
        let stored = coordinator.store().get_agent(agent_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PeerStatus::Online);
    }

    #[tokio::test]
    async fn test_disconnect_without_reconnect_goes_offline() {
        let (coordinator, service) = setup().await;
        let created = service.create_agent("a1").await.unwrap();
        let agent_id = created.agent.id;

        let (conn, _client) = connection();
        let sender = conn.sender();
        coordinator
            .authenticate(&sender, agent_auth(created.api_key.as_str()))
            .await
            .unwrap();

        assert!(
            coordinator
                .handle_disconnect(agent_id, ClientType::Agent, sender.connection_id())
                .await
        );
        let stored = coordinator.store().get_agent(agent_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PeerStatus::Offline);
    }
}
