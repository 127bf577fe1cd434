//! Session registry for authenticated peers
//!
//! Maps a peer's entity id to its one live session. Every operation locks a
//! single shard of the map and never across an await, so connection handlers
//! and the liveness sweep can mutate it concurrently.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;
use wgmesh_proto::ClientType;
use wgmesh_transport::PeerSender;

/// A live, authenticated connection for one peer
#[derive(Debug, Clone)]
pub struct Session {
    pub peer_id: Uuid,
    pub client_type: ClientType,
    pub sender: PeerSender,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub last_seen: Instant,
}

impl Session {
    pub fn new(peer_id: Uuid, client_type: ClientType, sender: PeerSender) -> Self {
        Self {
            peer_id,
            client_type,
            sender,
            connected_at: chrono::Utc::now(),
            last_seen: Instant::now(),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.sender.connection_id()
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the one it superseded
    pub fn put(&self, session: Session) -> Option<Session> {
        let peer_id = session.peer_id;
        let old = self.sessions.insert(peer_id, session);
        if let Some(ref replaced) = old {
            tracing::info!(
                peer_id = %peer_id,
                client_type = %replaced.client_type,
                old_connected_at = %replaced.connected_at,
                "Superseded existing session"
            );
        }
        old
    }

    pub fn get(&self, peer_id: Uuid) -> Option<Session> {
        self.sessions.get(&peer_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, peer_id: Uuid) -> Option<Session> {
        self.sessions.remove(&peer_id).map(|(_, session)| session)
    }

    /// Remove the session only if it still belongs to `connection_id`.
    ///
    /// A connection that was superseded must not tear down its replacement.
    pub fn remove_if_current(&self, peer_id: Uuid, connection_id: Uuid) -> Option<Session> {
        self.sessions
            .remove_if(&peer_id, |_, session| {
                session.connection_id() == connection_id
            })
            .map(|(_, session)| session)
    }

    /// Refresh last-seen for the session on `connection_id`
    pub fn touch(&self, peer_id: Uuid, connection_id: Uuid) -> bool {
        match self.sessions.get_mut(&peer_id) {
            Some(mut entry) if entry.connection_id() == connection_id => {
                entry.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn all_online_of_type(&self, client_type: ClientType) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|entry| entry.client_type == client_type)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sessions idle for longer than `timeout`
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|entry| entry.is_expired(now, timeout))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_online(&self, peer_id: Uuid) -> bool {
        self.sessions.contains_key(&peer_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove and return every session
    pub fn drain(&self) -> Vec<Session> {
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}
