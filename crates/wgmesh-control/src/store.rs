//! Repository over the entity store
//!
//! Everything the coordination engine reads or writes in the database goes
//! through [`MeshStore`]. Deletions cascade explicitly inside a transaction.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use wgmesh_db::entities::{agent, gateway, tunnel, tunnel_gateway_ip, PeerStatus};
use wgmesh_proto::ClientType;

use crate::error::ControlResult;
use crate::synthesizer::MeshSnapshot;

/// Identity resolved from a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: Uuid,
    pub name: String,
    pub client_type: ClientType,
}

/// Operator-side gateway changes; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct GatewayChanges {
    pub name: Option<String>,
    pub public_ip: Option<Option<String>>,
    pub region: Option<Option<String>>,
}

#[derive(Clone)]
pub struct MeshStore {
    db: Arc<DatabaseConnection>,
}

impl std::fmt::Debug for MeshStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshStore").finish_non_exhaustive()
    }
}

impl MeshStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    /// Resolve a credential, scoped to the declared role
    pub async fn find_peer_by_credential(
        &self,
        client_type: ClientType,
        api_key: &str,
    ) -> ControlResult<Option<PeerIdentity>> {
        let found = match client_type {
            ClientType::Agent => agent::Entity::find()
                .filter(agent::Column::ApiKey.eq(api_key))
                .one(self.connection())
                .await?
                .map(|a| (a.id, a.name)),
            ClientType::Gateway => gateway::Entity::find()
                .filter(gateway::Column::ApiKey.eq(api_key))
                .one(self.connection())
                .await?
                .map(|g| (g.id, g.name)),
        };

        Ok(found.map(|(id, name)| PeerIdentity {
            id,
            name,
            client_type,
        }))
    }

    /// Persist a successful authentication.
    ///
    /// Agents only learn a public key. Gateways also learn a public IP, which
    /// is left untouched when the peer does not report one.
    pub async fn mark_online(
        &self,
        client_type: ClientType,
        id: Uuid,
        public_key: Option<&str>,
        public_ip: Option<&str>,
    ) -> ControlResult<()> {
        let now = Utc::now();
        match client_type {
            ClientType::Agent => {
                let mut active = agent::ActiveModel {
                    id: Set(id),
                    status: Set(PeerStatus::Online),
                    last_seen_at: Set(Some(now)),
                    updated_at: Set(now),
                    ..Default::default()
                };
                if let Some(key) = public_key {
                    active.wireguard_public_key = Set(Some(key.to_string()));
                }
                active.update(self.connection()).await?;
            }
            ClientType::Gateway => {
                let mut active = gateway::ActiveModel {
                    id: Set(id),
                    status: Set(PeerStatus::Online),
                    last_seen_at: Set(Some(now)),
                    updated_at: Set(now),
                    ..Default::default()
                };
                if let Some(key) = public_key {
                    active.wireguard_public_key = Set(Some(key.to_string()));
                }
                if let Some(ip) = public_ip {
                    active.public_ip = Set(Some(ip.to_string()));
                }
                active.update(self.connection()).await?;
            }
        }
        Ok(())
    }

    /// Status only; `last_seen_at` keeps the last moment the peer was heard
    pub async fn mark_offline(&self, client_type: ClientType, id: Uuid) -> ControlResult<()> {
        let now = Utc::now();
        match client_type {
            ClientType::Agent => {
                agent::ActiveModel {
                    id: Set(id),
                    status: Set(PeerStatus::Offline),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .update(self.connection())
                .await?;
            }
            ClientType::Gateway => {
                gateway::ActiveModel {
                    id: Set(id),
                    status: Set(PeerStatus::Offline),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .update(self.connection())
                .await?;
            }
        }
        Ok(())
    }

    /// Mark every peer offline; no session survives a restart.
    /// Returns how many records changed.
    pub async fn reset_statuses(&self) -> ControlResult<u64> {
        let agents = agent::Entity::update_many()
            .col_expr(agent::Column::Status, Expr::value(PeerStatus::Offline))
            .filter(agent::Column::Status.ne(PeerStatus::Offline))
            .exec(self.connection())
            .await?;
        let gateways = gateway::Entity::update_many()
            .col_expr(gateway::Column::Status, Expr::value(PeerStatus::Offline))
            .filter(gateway::Column::Status.ne(PeerStatus::Offline))
            .exec(self.connection())
            .await?;
        Ok(agents.rows_affected + gateways.rows_affected)
    }

    /// Refresh `last_seen_at` without touching status
    pub async fn touch(&self, client_type: ClientType, id: Uuid) -> ControlResult<()> {
        let now = Some(Utc::now());
        match client_type {
            ClientType::Agent => {
                agent::ActiveModel {
                    id: Set(id),
                    last_seen_at: Set(now),
                    ..Default::default()
                }
                .update(self.connection())
                .await?;
            }
            ClientType::Gateway => {
                gateway::ActiveModel {
                    id: Set(id),
                    last_seen_at: Set(now),
                    ..Default::default()
                }
                .update(self.connection())
                .await?;
            }
        }
        Ok(())
    }

    /// Store a status and, when given, the metadata that came with it
    pub async fn record_status(
        &self,
        client_type: ClientType,
        id: Uuid,
        status: PeerStatus,
        metadata: Option<serde_json::Value>,
    ) -> ControlResult<()> {
        let now = Utc::now();
        match client_type {
            ClientType::Agent => {
                let mut active = agent::ActiveModel {
                    id: Set(id),
                    status: Set(status),
                    last_seen_at: Set(Some(now)),
                    updated_at: Set(now),
                    ..Default::default()
                };
                if metadata.is_some() {
                    active.metadata = Set(metadata);
                }
                active.update(self.connection()).await?;
            }
            ClientType::Gateway => {
                let mut active = gateway::ActiveModel {
                    id: Set(id),
                    status: Set(status),
                    last_seen_at: Set(Some(now)),
                    updated_at: Set(now),
                    ..Default::default()
                };
                if metadata.is_some() {
                    active.metadata = Set(metadata);
                }
                active.update(self.connection()).await?;
            }
        }

        debug!(peer_id = %id, client_type = %client_type, ?status, "Recorded peer status");
        Ok(())
    }

    /// Everything config synthesis reads, in stable creation order
    pub async fn snapshot(&self) -> ControlResult<MeshSnapshot> {
        let db = self.connection();

        let agents = agent::Entity::find()
            .order_by_asc(agent::Column::CreatedAt)
            .order_by_asc(agent::Column::Id)
            .all(db)
            .await?;
        let gateways = gateway::Entity::find()
            .order_by_asc(gateway::Column::CreatedAt)
            .order_by_asc(gateway::Column::Id)
            .all(db)
            .await?;
        let tunnels = tunnel::Entity::find()
            .order_by_asc(tunnel::Column::CreatedAt)
            .order_by_asc(tunnel::Column::Id)
            .all(db)
            .await?;
        let gateway_ips = tunnel_gateway_ip::Entity::find()
            .order_by_asc(tunnel_gateway_ip::Column::CreatedAt)
            .order_by_asc(tunnel_gateway_ip::Column::TunnelId)
            .order_by_asc(tunnel_gateway_ip::Column::GatewayId)
            .all(db)
            .await?;

        Ok(MeshSnapshot {
            agents,
            gateways,
            tunnels,
            gateway_ips,
        })
    }

    pub async fn get_agent(&self, id: Uuid) -> ControlResult<Option<agent::Model>> {
        Ok(agent::Entity::find_by_id(id).one(self.connection()).await?)
    }

    pub async fn get_gateway(&self, id: Uuid) -> ControlResult<Option<gateway::Model>> {
        Ok(gateway::Entity::find_by_id(id).one(self.connection()).await?)
    }

    pub async fn get_tunnel(&self, id: Uuid) -> ControlResult<Option<tunnel::Model>> {
        Ok(tunnel::Entity::find_by_id(id).one(self.connection()).await?)
    }

    /// Addresses held in one tunnel, in allocation order
    pub async fn tunnel_gateway_ips(
        &self,
        tunnel_id: Uuid,
    ) -> ControlResult<Vec<tunnel_gateway_ip::Model>> {
        Ok(tunnel_gateway_ip::Entity::find()
            .filter(tunnel_gateway_ip::Column::TunnelId.eq(tunnel_id))
            .order_by_asc(tunnel_gateway_ip::Column::CreatedAt)
            .order_by_desc(tunnel_gateway_ip::Column::Ip)
            .all(self.connection())
            .await?)
    }

    /// Whether another tunnel already routes `domain`
    pub async fn domain_taken(&self, domain: &str, except: Option<Uuid>) -> ControlResult<bool> {
        let mut query = tunnel::Entity::find().filter(tunnel::Column::Domain.eq(domain));
        if let Some(id) = except {
            query = query.filter(tunnel::Column::Id.ne(id));
        }
        Ok(query.count(self.connection()).await? > 0)
    }

    pub async fn insert_agent(&self, name: &str, api_key: &str) -> ControlResult<agent::Model> {
        let now = Utc::now();
        let model = agent::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            api_key: Set(api_key.to_string()),
            wireguard_public_key: Set(None),
            status: Set(PeerStatus::Offline),
            last_seen_at: Set(None),
            metadata: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(self.connection()).await?)
    }

    pub async fn insert_gateway(
        &self,
        name: &str,
        api_key: &str,
        public_ip: Option<String>,
        region: Option<String>,
        wireguard_public_key: Option<String>,
    ) -> ControlResult<gateway::Model> {
        let now = Utc::now();
        let model = gateway::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            api_key: Set(api_key.to_string()),
            public_ip: Set(public_ip),
            wireguard_public_key: Set(wireguard_public_key),
            region: Set(region),
            status: Set(PeerStatus::Offline),
            last_seen_at: Set(None),
            metadata: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(self.connection()).await?)
    }

    pub async fn update_gateway(
        &self,
        id: Uuid,
        changes: GatewayChanges,
    ) -> ControlResult<gateway::Model> {
        let mut active = gateway::ActiveModel {
            id: Set(id),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        if let Some(name) = changes.name {
            active.name = Set(name);
        }
        if let Some(public_ip) = changes.public_ip {
            active.public_ip = Set(public_ip);
        }
        if let Some(region) = changes.region {
            active.region = Set(region);
        }
        Ok(active.update(self.connection()).await?)
    }

    pub async fn update_tunnel(&self, active: tunnel::ActiveModel) -> ControlResult<tunnel::Model> {
        Ok(active.update(self.connection()).await?)
    }

    /// Delete a tunnel and its gateway addresses; returns what was removed
    pub async fn delete_tunnel(&self, id: Uuid) -> ControlResult<Option<tunnel::Model>> {
        let txn = self.connection().begin().await?;

        let Some(existing) = tunnel::Entity::find_by_id(id).one(&txn).await? else {
            return Ok(None);
        };

        tunnel_gateway_ip::Entity::delete_many()
            .filter(tunnel_gateway_ip::Column::TunnelId.eq(id))
            .exec(&txn)
            .await?;
        tunnel::Entity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        Ok(Some(existing))
    }

    /// Delete an agent with its tunnels and their addresses
    pub async fn delete_agent(&self, id: Uuid) -> ControlResult<bool> {
        let txn = self.connection().begin().await?;

        if agent::Entity::find_by_id(id).one(&txn).await?.is_none() {
            return Ok(false);
        }

        let tunnel_ids: Vec<Uuid> = tunnel::Entity::find()
            .filter(tunnel::Column::AgentId.eq(id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();

        if !tunnel_ids.is_empty() {
            tunnel_gateway_ip::Entity::delete_many()
                .filter(tunnel_gateway_ip::Column::TunnelId.is_in(tunnel_ids.clone()))
                .exec(&txn)
                .await?;
            tunnel::Entity::delete_many()
                .filter(tunnel::Column::AgentId.eq(id))
                .exec(&txn)
                .await?;
        }
        agent::Entity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        debug!(agent_id = %id, tunnels = tunnel_ids.len(), "Deleted agent");
        Ok(true)
    }

    /// Delete a gateway and every address it held
    pub async fn delete_gateway(&self, id: Uuid) -> ControlResult<bool> {
        let txn = self.connection().begin().await?;

        if gateway::Entity::find_by_id(id).one(&txn).await?.is_none() {
            return Ok(false);
        }

        tunnel_gateway_ip::Entity::delete_many()
            .filter(tunnel_gateway_ip::Column::GatewayId.eq(id))
            .exec(&txn)
            .await?;
        gateway::Entity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        Ok(true)
    }
}
