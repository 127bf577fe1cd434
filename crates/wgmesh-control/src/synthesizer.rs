//! Per-peer configuration synthesis
//!
//! Pure functions from a [`MeshSnapshot`] to the document one peer should
//! hold. No I/O; the same snapshot always yields the same output.
//!
//! A gateway sees every online agent (with the agent's address in each of
//! its tunnels as allowed IPs) and every tunnel. An agent sees the gateways
//! it can actually peer with (online and holding a public key) restricted to
//! its own tunnels.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;
use wgmesh_db::entities::{agent, gateway, tunnel, tunnel_gateway_ip, PeerStatus};
use wgmesh_proto::{
    AgentConfig, AgentGatewayPeer, AgentIdentity, AgentTunnel, ClientType, GatewayAgentPeer,
    GatewayConfig, GatewayTunnel, PeerConfig, TunnelGatewayAddress, WIREGUARD_PORT,
};

/// The store state synthesis reads, already in creation order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshSnapshot {
    pub agents: Vec<agent::Model>,
    pub gateways: Vec<gateway::Model>,
    pub tunnels: Vec<tunnel::Model>,
    pub gateway_ips: Vec<tunnel_gateway_ip::Model>,
}

impl MeshSnapshot {
    pub fn agent(&self, id: Uuid) -> Option<&agent::Model> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn gateway(&self, id: Uuid) -> Option<&gateway::Model> {
        self.gateways.iter().find(|g| g.id == id)
    }
}

fn host_route(ip: &str) -> String {
    format!("{}/32", ip)
}

/// `ip:port`, bracketing IPv6 literals
fn endpoint(public_ip: &str, port: u16) -> String {
    match public_ip.parse::<IpAddr>() {
        Ok(addr) => SocketAddr::new(addr, port).to_string(),
        Err(_) => format!("{}:{}", public_ip, port),
    }
}

/// Gateways an agent may peer with
fn is_eligible_gateway(gw: &gateway::Model) -> bool {
    gw.status == PeerStatus::Online && gw.wireguard_public_key.is_some()
}

pub fn synthesize_gateway_config(snapshot: &MeshSnapshot, gateway_id: Uuid) -> GatewayConfig {
    let own_ips: HashMap<Uuid, &str> = snapshot
        .gateway_ips
        .iter()
        .filter(|row| row.gateway_id == gateway_id)
        .map(|row| (row.tunnel_id, row.ip.as_str()))
        .collect();

    let agents = snapshot
        .agents
        .iter()
        .filter(|a| a.status == PeerStatus::Online)
        .map(|a| GatewayAgentPeer {
            id: a.id,
            name: a.name.clone(),
            wireguard_public_key: a.wireguard_public_key.clone(),
            allowed_ips: snapshot
                .tunnels
                .iter()
                .filter(|t| t.agent_id == a.id)
                .filter_map(|t| t.agent_ip.as_deref())
                .map(host_route)
                .collect(),
        })
        .collect();

    let tunnels = snapshot
        .tunnels
        .iter()
        .map(|t| GatewayTunnel {
            id: t.id,
            domain: t.domain.clone(),
            agent_id: t.agent_id,
            target: t.target.clone(),
            enabled: t.enabled,
            subnet: t.subnet.clone(),
            gateway_ip: own_ips.get(&t.id).map(|ip| ip.to_string()),
            agent_ip: t.agent_ip.clone(),
        })
        .collect();

    GatewayConfig { agents, tunnels }
}

/// `None` when the agent is not in the snapshot
pub fn synthesize_agent_config(
    snapshot: &MeshSnapshot,
    agent_id: Uuid,
    wireguard_port: u16,
) -> Option<AgentConfig> {
    let agent = snapshot.agent(agent_id)?;

    let own_tunnels: Vec<&tunnel::Model> = snapshot
        .tunnels
        .iter()
        .filter(|t| t.agent_id == agent_id)
        .collect();

    let eligible: HashMap<Uuid, &gateway::Model> = snapshot
        .gateways
        .iter()
        .filter(|g| is_eligible_gateway(g))
        .map(|g| (g.id, g))
        .collect();

    // Addresses of eligible gateways in this agent's tunnels, tunnel order first
    let mut by_tunnel: HashMap<Uuid, Vec<TunnelGatewayAddress>> = HashMap::new();
    let mut by_gateway: HashMap<Uuid, Vec<String>> = HashMap::new();
    for t in &own_tunnels {
        for row in snapshot
            .gateway_ips
            .iter()
            .filter(|row| row.tunnel_id == t.id && eligible.contains_key(&row.gateway_id))
        {
            by_tunnel.entry(t.id).or_default().push(TunnelGatewayAddress {
                gateway_id: row.gateway_id,
                ip: row.ip.clone(),
            });
            by_gateway
                .entry(row.gateway_id)
                .or_default()
                .push(host_route(&row.ip));
        }
    }

    let gateways = snapshot
        .gateways
        .iter()
        .filter_map(|g| {
            let key = g.wireguard_public_key.clone()?;
            if g.status != PeerStatus::Online {
                return None;
            }
            Some(AgentGatewayPeer {
                id: g.id,
                name: g.name.clone(),
                public_ip: g.public_ip.clone(),
                wireguard_public_key: key,
                endpoint: g.public_ip.as_deref().map(|ip| endpoint(ip, wireguard_port)),
                allowed_ips: by_gateway.remove(&g.id).unwrap_or_default(),
            })
        })
        .collect();

    let tunnels = own_tunnels
        .iter()
        .map(|t| AgentTunnel {
            id: t.id,
            domain: t.domain.clone(),
            target: t.target.clone(),
            enabled: t.enabled,
            subnet: t.subnet.clone(),
            agent_ip: t.agent_ip.clone(),
            gateway_ips: by_tunnel.remove(&t.id).unwrap_or_default(),
            http_proxy_enabled: t.http_proxy_enabled,
            socks_proxy_enabled: t.socks_proxy_enabled,
        })
        .collect();

    Some(AgentConfig {
        agent: AgentIdentity {
            id: agent.id,
            name: agent.name.clone(),
            wireguard_public_key: agent.wireguard_public_key.clone(),
        },
        gateways,
        tunnels,
    })
}

/// Builds role-appropriate documents with a fixed WireGuard port
#[derive(Debug, Clone, Copy)]
pub struct ConfigSynthesizer {
    wireguard_port: u16,
}

impl Default for ConfigSynthesizer {
    fn default() -> Self {
        Self::new(WIREGUARD_PORT)
    }
}

impl ConfigSynthesizer {
    pub fn new(wireguard_port: u16) -> Self {
        Self { wireguard_port }
    }

    pub fn gateway_config(&self, snapshot: &MeshSnapshot, gateway_id: Uuid) -> Option<GatewayConfig> {
        snapshot.gateway(gateway_id)?;
        Some(synthesize_gateway_config(snapshot, gateway_id))
    }

    pub fn agent_config(&self, snapshot: &MeshSnapshot, agent_id: Uuid) -> Option<AgentConfig> {
        synthesize_agent_config(snapshot, agent_id, self.wireguard_port)
    }

    /// Document for one peer; `None` once the peer no longer exists
    pub fn for_peer(
        &self,
        snapshot: &MeshSnapshot,
        client_type: ClientType,
        peer_id: Uuid,
    ) -> Option<PeerConfig> {
        match client_type {
            ClientType::Agent => self.agent_config(snapshot, peer_id).map(PeerConfig::from),
            ClientType::Gateway => self.gateway_config(snapshot, peer_id).map(PeerConfig::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    struct Fixture {
        snapshot: MeshSnapshot,
        tick: i64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                snapshot: MeshSnapshot::default(),
                tick: 0,
            }
        }

        fn now(&mut self) -> chrono::DateTime<Utc> {
            self.tick += 1;
            Utc::now() + Duration::seconds(self.tick)
        }

        fn agent(&mut self, name: &str, status: PeerStatus) -> Uuid {
            let now = self.now();
            let id = Uuid::new_v4();
            self.snapshot.agents.push(agent::Model {
                id,
                name: name.to_string(),
                api_key: format!("agt_{}", name),
                wireguard_public_key: Some(format!("{}-key", name)),
                status,
                last_seen_at: None,
                metadata: None,
                created_at: now,
                updated_at: now,
            });
            id
        }

        fn gateway(&mut self, name: &str, status: PeerStatus, public_ip: Option<&str>) -> Uuid {
            let now = self.now();
            let id = Uuid::new_v4();
            self.snapshot.gateways.push(gateway::Model {
                id,
                name: name.to_string(),
                api_key: format!("gw_{}", name),
                public_ip: public_ip.map(str::to_string),
                wireguard_public_key: Some(format!("{}-key", name)),
                region: None,
                status,
                last_seen_at: None,
                metadata: None,
                created_at: now,
                updated_at: now,
            });
            id
        }

        fn tunnel(&mut self, domain: &str, agent_id: Uuid, number: u8) -> Uuid {
            let now = self.now();
            let id = Uuid::new_v4();
            self.snapshot.tunnels.push(tunnel::Model {
                id,
                domain: domain.to_string(),
                agent_id,
                target: "localhost:8080".to_string(),
                enabled: true,
                description: None,
                subnet: Some(format!("10.{}.0.0/24", number)),
                agent_ip: Some(format!("10.{}.0.2", number)),
                http_proxy_enabled: false,
                socks_proxy_enabled: false,
                created_at: now,
                updated_at: now,
            });
            id
        }

        fn address(&mut self, tunnel_id: Uuid, gateway_id: Uuid, ip: &str) {
            let now = self.now();
            self.snapshot.gateway_ips.push(tunnel_gateway_ip::Model {
                tunnel_id,
                gateway_id,
                ip: ip.to_string(),
                created_at: now,
            });
        }
    }

    #[test]
    fn test_gateway_config_lists_online_agents_only() {
        let mut fx = Fixture::new();
        let a1 = fx.agent("a1", PeerStatus::Online);
        let a2 = fx.agent("a2", PeerStatus::Offline);
        let g1 = fx.gateway("g1", PeerStatus::Online, Some("203.0.113.5"));
        let t1 = fx.tunnel("one.example.com", a1, 1);
        let t2 = fx.tunnel("two.example.com", a2, 2);
        fx.address(t1, g1, "10.1.0.254");

        let config = synthesize_gateway_config(&fx.snapshot, g1);

        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].id, a1);
        assert_eq!(config.agents[0].allowed_ips, vec!["10.1.0.2/32"]);

        // Tunnels are listed regardless of agent status
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels[0].id, t1);
        assert_eq!(config.tunnels[0].gateway_ip.as_deref(), Some("10.1.0.254"));
        assert_eq!(config.tunnels[1].id, t2);
        assert_eq!(config.tunnels[1].gateway_ip, None);
    }

    #[test]
    fn test_gateway_config_unions_agent_addresses() {
        let mut fx = Fixture::new();
        let a1 = fx.agent("a1", PeerStatus::Online);
        let g1 = fx.gateway("g1", PeerStatus::Online, None);
        fx.tunnel("one.example.com", a1, 1);
        fx.tunnel("two.example.com", a1, 3);

        let config = synthesize_gateway_config(&fx.snapshot, g1);
        assert_eq!(
            config.agents[0].allowed_ips,
            vec!["10.1.0.2/32", "10.3.0.2/32"]
        );
    }

    #[test]
    fn test_agent_config_endpoint_and_allowed_ips() {
        let mut fx = Fixture::new();
        let a1 = fx.agent("a1", PeerStatus::Online);
        let g1 = fx.gateway("g1", PeerStatus::Online, Some("203.0.113.5"));
        let t1 = fx.tunnel("one.example.com", a1, 1);
        fx.address(t1, g1, "10.1.0.254");

        let config = synthesize_agent_config(&fx.snapshot, a1, 51820).unwrap();

        assert_eq!(config.agent.id, a1);
        assert_eq!(config.gateways.len(), 1);
        let peer = &config.gateways[0];
        assert_eq!(peer.endpoint.as_deref(), Some("203.0.113.5:51820"));
        assert_eq!(peer.allowed_ips, vec!["10.1.0.254/32"]);
        assert_eq!(peer.wireguard_public_key, "g1-key");

        assert_eq!(config.tunnels[0].gateway_ips.len(), 1);
        assert_eq!(config.tunnels[0].gateway_ips[0].gateway_id, g1);
    }

    #[test]
    fn test_agent_config_excludes_offline_and_keyless_gateways() {
        let mut fx = Fixture::new();
        let a1 = fx.agent("a1", PeerStatus::Online);
        let online = fx.gateway("online", PeerStatus::Online, Some("198.51.100.1"));
        let offline = fx.gateway("offline", PeerStatus::Offline, Some("198.51.100.2"));
        let keyless = fx.gateway("keyless", PeerStatus::Online, Some("198.51.100.3"));
        fx.snapshot.gateways[2].wireguard_public_key = None;

        let t1 = fx.tunnel("one.example.com", a1, 1);
        fx.address(t1, online, "10.1.0.254");
        fx.address(t1, offline, "10.1.0.253");
        fx.address(t1, keyless, "10.1.0.252");

        let config = synthesize_agent_config(&fx.snapshot, a1, 51820).unwrap();

        let ids: Vec<Uuid> = config.gateways.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![online]);

        let tunnel_gateways: Vec<Uuid> = config.tunnels[0]
            .gateway_ips
            .iter()
            .map(|g| g.gateway_id)
            .collect();
        assert_eq!(tunnel_gateways, vec![online]);
    }

    #[test]
    fn test_agent_config_restricted_to_own_tunnels() {
        let mut fx = Fixture::new();
        let a1 = fx.agent("a1", PeerStatus::Online);
        let a2 = fx.agent("a2", PeerStatus::Online);
        let g1 = fx.gateway("g1", PeerStatus::Online, None);
        let t1 = fx.tunnel("one.example.com", a1, 1);
        let t2 = fx.tunnel("two.example.com", a2, 2);
        fx.address(t1, g1, "10.1.0.254");
        fx.address(t2, g1, "10.2.0.254");

        let config = synthesize_agent_config(&fx.snapshot, a1, 51820).unwrap();
        assert_eq!(config.tunnels.len(), 1);
        assert_eq!(config.tunnels[0].id, t1);
        assert_eq!(config.gateways[0].allowed_ips, vec!["10.1.0.254/32"]);
        assert_eq!(config.gateways[0].endpoint, None);
    }

    #[test]
    fn test_endpoint_formatting() {
        assert_eq!(endpoint("203.0.113.5", 51820), "203.0.113.5:51820");
        assert_eq!(endpoint("2001:db8::1", 51820), "[2001:db8::1]:51820");
        assert_eq!(endpoint("gw.example.com", 4500), "gw.example.com:4500");
    }

    #[test]
    fn test_synthesis_is_idempotent() {
        let mut fx = Fixture::new();
        let a1 = fx.agent("a1", PeerStatus::Online);
        let g1 = fx.gateway("g1", PeerStatus::Online, Some("203.0.113.5"));
        let g2 = fx.gateway("g2", PeerStatus::Online, Some("203.0.113.6"));
        let t1 = fx.tunnel("one.example.com", a1, 1);
        fx.address(t1, g1, "10.1.0.254");
        fx.address(t1, g2, "10.1.0.253");

        let synth = ConfigSynthesizer::default();
        let first = serde_json::to_string(&synth.for_peer(&fx.snapshot, ClientType::Agent, a1))
            .unwrap();
        let second = serde_json::to_string(&synth.for_peer(&fx.snapshot, ClientType::Agent, a1))
            .unwrap();
        assert_eq!(first, second);

        let first = serde_json::to_string(&synth.for_peer(&fx.snapshot, ClientType::Gateway, g2))
            .unwrap();
        let second = serde_json::to_string(&synth.for_peer(&fx.snapshot, ClientType::Gateway, g2))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_peer_has_no_config() {
        let fx = Fixture::new();
        let synth = ConfigSynthesizer::default();
        assert!(synth
            .for_peer(&fx.snapshot, ClientType::Agent, Uuid::new_v4())
            .is_none());
        assert!(synth
            .for_peer(&fx.snapshot, ClientType::Gateway, Uuid::new_v4())
            .is_none());
    }
}
