//! Mutation surface for agents, gateways and tunnels
//!
//! Validates operator input, commits the store change, then invokes the
//! matching coordinator hook so connected peers converge.

use chrono::Utc;
use regex_lite::Regex;
use sea_orm::{IntoActiveModel, Set};
use std::net::Ipv4Addr;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};
use uuid::Uuid;
use wgmesh_auth::{CredentialKind, Token, TokenGenerator};
use wgmesh_db::entities::{agent, gateway, tunnel};

use crate::allocator::{GatewayAddress, TunnelAddress};
use crate::coordinator::MeshCoordinator;
use crate::error::{ControlError, ControlResult};
use crate::store::GatewayChanges;

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("domain pattern compiles")
});
static TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9.-]+:\d+$").expect("target pattern compiles"));
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("name pattern compiles"));

const MAX_DOMAIN_LEN: usize = 255;
const MAX_TARGET_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 500;
const MAX_REGION_LEN: usize = 32;

pub fn validate_domain(domain: &str) -> ControlResult<()> {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return Err(ControlError::Validation(
            "Domain must be 1-255 characters".into(),
        ));
    }
    if !DOMAIN_RE.is_match(domain) {
        return Err(ControlError::Validation(format!(
            "Invalid domain format: {}",
            domain
        )));
    }
    Ok(())
}

pub fn validate_target(target: &str) -> ControlResult<()> {
    if target.is_empty() || target.len() > MAX_TARGET_LEN {
        return Err(ControlError::Validation(
            "Target must be 1-255 characters".into(),
        ));
    }
    if !TARGET_RE.is_match(target) {
        return Err(ControlError::Validation(
            "Target must be in format host:port".into(),
        ));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> ControlResult<()> {
    if !NAME_RE.is_match(name) {
        return Err(ControlError::Validation(
            "Name must be 1-64 alphanumeric characters, hyphens or underscores".into(),
        ));
    }
    Ok(())
}

fn validate_description(description: &str) -> ControlResult<()> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ControlError::Validation(
            "Description must be at most 500 characters".into(),
        ));
    }
    Ok(())
}

fn validate_public_ip(ip: &str) -> ControlResult<()> {
    ip.parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| ControlError::Validation(format!("Invalid IPv4 address: {}", ip)))
}

fn validate_region(region: &str) -> ControlResult<()> {
    if region.chars().count() > MAX_REGION_LEN {
        return Err(ControlError::Validation(
            "Region must be at most 32 characters".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub domain: String,
    pub agent_id: Uuid,
    pub target: String,
    pub description: Option<String>,
    pub http_proxy_enabled: bool,
    pub socks_proxy_enabled: bool,
}

impl NewTunnel {
    pub fn new(domain: impl Into<String>, agent_id: Uuid, target: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            agent_id,
            target: target.into(),
            description: None,
            http_proxy_enabled: false,
            socks_proxy_enabled: false,
        }
    }
}

/// Editable tunnel fields; subnet and addresses are fixed for life
#[derive(Debug, Clone, Default)]
pub struct TunnelChanges {
    pub domain: Option<String>,
    pub target: Option<String>,
    pub enabled: Option<bool>,
    pub description: Option<String>,
    pub http_proxy_enabled: Option<bool>,
    pub socks_proxy_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct NewGateway {
    pub name: String,
    pub public_ip: Option<String>,
    pub region: Option<String>,
    pub wireguard_public_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedAgent {
    pub agent: agent::Model,
    /// Shown once; the peer presents it in `auth`
    pub api_key: Token,
}

#[derive(Debug, Clone)]
pub struct CreatedGateway {
    pub gateway: gateway::Model,
    pub api_key: Token,
    /// Addresses backfilled into existing tunnels
    pub addresses: Vec<TunnelAddress>,
}

#[derive(Debug, Clone)]
pub struct CreatedTunnel {
    pub tunnel: tunnel::Model,
    pub gateway_addresses: Vec<GatewayAddress>,
}

/// Operator-facing entry point for topology changes
#[derive(Clone)]
pub struct MeshService {
    coordinator: Arc<MeshCoordinator>,
}

impl MeshService {
    pub fn new(coordinator: Arc<MeshCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<MeshCoordinator> {
        &self.coordinator
    }

    pub async fn create_agent(&self, name: &str) -> ControlResult<CreatedAgent> {
        validate_name(name)?;

        let api_key = TokenGenerator::generate_credential(CredentialKind::Agent);
        let agent = self
            .coordinator
            .store()
            .insert_agent(name, api_key.as_str())
            .await?;

        info!(agent_id = %agent.id, name = %agent.name, "Created agent");
        Ok(CreatedAgent { agent, api_key })
    }

    /// Removes the agent with its tunnels and closes its session
    pub async fn delete_agent(&self, id: Uuid) -> ControlResult<()> {
        if !self.coordinator.store().delete_agent(id).await? {
            return Err(ControlError::not_found("Agent", id));
        }
        info!(agent_id = %id, "Deleted agent");
        self.coordinator.on_agent_deleted(id).await;
        Ok(())
    }

    /// Create a gateway and address it in every existing tunnel before any
    /// push. If the backfill fails the gateway is removed again.
    pub async fn create_gateway(&self, request: NewGateway) -> ControlResult<CreatedGateway> {
        validate_name(&request.name)?;
        if let Some(ref ip) = request.public_ip {
            validate_public_ip(ip)?;
        }
        if let Some(ref region) = request.region {
            validate_region(region)?;
        }
        if let Some(ref key) = request.wireguard_public_key {
            wgmesh_auth::validate_key(key)
                .map_err(|e| ControlError::Validation(format!("Invalid public key: {}", e)))?;
        }

        let api_key = TokenGenerator::generate_credential(CredentialKind::Gateway);
        let store = self.coordinator.store();
        let gateway = store
            .insert_gateway(
                &request.name,
                api_key.as_str(),
                request.public_ip,
                request.region,
                request.wireguard_public_key,
            )
            .await?;

        let addresses = match self.coordinator.on_gateway_created(gateway.id).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!(gateway_id = %gateway.id, "Gateway backfill failed, removing gateway: {}", e);
                if let Err(cleanup) = store.delete_gateway(gateway.id).await {
                    warn!(gateway_id = %gateway.id, "Failed to remove gateway: {}", cleanup);
                }
                return Err(e);
            }
        };

        info!(
            gateway_id = %gateway.id,
            name = %gateway.name,
            tunnels = addresses.len(),
            "Created gateway"
        );
        Ok(CreatedGateway {
            gateway,
            api_key,
            addresses,
        })
    }

    pub async fn update_gateway(
        &self,
        id: Uuid,
        changes: GatewayChanges,
    ) -> ControlResult<gateway::Model> {
        if let Some(ref name) = changes.name {
            validate_name(name)?;
        }
        if let Some(Some(ref ip)) = changes.public_ip {
            validate_public_ip(ip)?;
        }
        if let Some(Some(ref region)) = changes.region {
            validate_region(region)?;
        }

        let store = self.coordinator.store();
        if store.get_gateway(id).await?.is_none() {
            return Err(ControlError::not_found("Gateway", id));
        }

        let updated = store.update_gateway(id, changes).await?;
        self.coordinator.on_gateway_updated(id).await;
        Ok(updated)
    }

    /// Removes the gateway with all its addresses and closes its session
    pub async fn delete_gateway(&self, id: Uuid) -> ControlResult<()> {
        if !self.coordinator.store().delete_gateway(id).await? {
            return Err(ControlError::not_found("Gateway", id));
        }
        info!(gateway_id = %id, "Deleted gateway");
        self.coordinator.on_gateway_deleted(id).await;
        Ok(())
    }

    /// Create a tunnel with a fresh subnet and an address for every gateway
    pub async fn create_tunnel(&self, request: NewTunnel) -> ControlResult<CreatedTunnel> {
        validate_domain(&request.domain)?;
        validate_target(&request.target)?;
        if let Some(ref description) = request.description {
            validate_description(description)?;
        }

        let store = self.coordinator.store();
        if store.get_agent(request.agent_id).await?.is_none() {
            return Err(ControlError::not_found("Agent", request.agent_id));
        }
        if store.domain_taken(&request.domain, None).await? {
            return Err(ControlError::Conflict(format!(
                "Domain already in use: {}",
                request.domain
            )));
        }

        let now = Utc::now();
        let draft = tunnel::ActiveModel {
            id: Set(Uuid::new_v4()),
            domain: Set(request.domain),
            agent_id: Set(request.agent_id),
            target: Set(request.target),
            enabled: Set(true),
            description: Set(request.description),
            subnet: Set(None),
            agent_ip: Set(None),
            http_proxy_enabled: Set(request.http_proxy_enabled),
            socks_proxy_enabled: Set(request.socks_proxy_enabled),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let (tunnel, gateway_addresses) = self
            .coordinator
            .allocator()
            .insert_tunnel(store.connection(), draft)
            .await?;

        info!(
            tunnel_id = %tunnel.id,
            domain = %tunnel.domain,
            subnet = tunnel.subnet.as_deref().unwrap_or("-"),
            "Created tunnel"
        );
        self.coordinator
            .on_tunnel_created(tunnel.id, tunnel.agent_id)
            .await;

        Ok(CreatedTunnel {
            tunnel,
            gateway_addresses,
        })
    }

    pub async fn update_tunnel(
        &self,
        id: Uuid,
        changes: TunnelChanges,
    ) -> ControlResult<tunnel::Model> {
        if let Some(ref domain) = changes.domain {
            validate_domain(domain)?;
        }
        if let Some(ref target) = changes.target {
            validate_target(target)?;
        }
        if let Some(ref description) = changes.description {
            validate_description(description)?;
        }

        let store = self.coordinator.store();
        let existing = store
            .get_tunnel(id)
            .await?
            .ok_or_else(|| ControlError::not_found("Tunnel", id))?;

        if let Some(ref domain) = changes.domain {
            if *domain != existing.domain && store.domain_taken(domain, Some(id)).await? {
                return Err(ControlError::Conflict(format!(
                    "Domain already in use: {}",
                    domain
                )));
            }
        }

        let mut active = existing.into_active_model();
        if let Some(domain) = changes.domain {
            active.domain = Set(domain);
        }
        if let Some(target) = changes.target {
            active.target = Set(target);
        }
        if let Some(enabled) = changes.enabled {
            active.enabled = Set(enabled);
        }
        if let Some(description) = changes.description {
            active.description = Set(Some(description));
        }
        if let Some(flag) = changes.http_proxy_enabled {
            active.http_proxy_enabled = Set(flag);
        }
        if let Some(flag) = changes.socks_proxy_enabled {
            active.socks_proxy_enabled = Set(flag);
        }
        active.updated_at = Set(Utc::now());

        let updated = store.update_tunnel(active).await?;
        self.coordinator
            .on_tunnel_updated(updated.id, updated.agent_id)
            .await;
        Ok(updated)
    }

    /// Removes the tunnel and its addresses, then pushes to affected peers
    pub async fn delete_tunnel(&self, id: Uuid) -> ControlResult<()> {
        let removed = self
            .coordinator
            .store()
            .delete_tunnel(id)
            .await?
            .ok_or_else(|| ControlError::not_found("Tunnel", id))?;

        info!(tunnel_id = %id, domain = %removed.domain, "Deleted tunnel");
        self.coordinator
            .on_tunnel_deleted(removed.id, removed.agent_id)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_validation() {
        assert!(validate_domain("app.example.com").is_ok());
        assert!(validate_domain("a").is_ok());
        assert!(validate_domain("my-app.internal").is_ok());

        assert!(validate_domain("").is_err());
        assert!(validate_domain("-bad.example.com").is_err());
        assert!(validate_domain("bad-.example.com").is_err());
        assert!(validate_domain("bad..example.com").is_err());
        assert!(validate_domain("under_score.example.com").is_err());
        assert!(validate_domain(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_target_validation() {
        assert!(validate_target("localhost:8080").is_ok());
        assert!(validate_target("10.0.0.5:22").is_ok());

        assert!(validate_target("localhost").is_err());
        assert!(validate_target("localhost:http").is_err());
        assert!(validate_target("http://localhost:80").is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("edge_gw-1").is_ok());
        assert!(validate_name(&"n".repeat(64)).is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name(&"n".repeat(65)).is_err());
        assert!(validate_name("has space").is_err());
    }

    #[test]
    fn test_field_limits() {
        assert!(validate_description(&"d".repeat(500)).is_ok());
        assert!(validate_description(&"d".repeat(501)).is_err());
        assert!(validate_region("eu-west-1").is_ok());
        assert!(validate_region(&"r".repeat(33)).is_err());
        assert!(validate_public_ip("203.0.113.7").is_ok());
        assert!(validate_public_ip("256.0.0.1").is_err());
        assert!(validate_public_ip("2001:db8::1").is_err());
    }
}
