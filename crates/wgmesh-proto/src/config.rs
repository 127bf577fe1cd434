//! Per-peer configuration documents pushed in `config_update` messages

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration document for either role.
///
/// Untagged on the wire: the receiving peer already knows which shape to expect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PeerConfig {
    Agent(AgentConfig),
    Gateway(GatewayConfig),
}

impl From<AgentConfig> for PeerConfig {
    fn from(config: AgentConfig) -> Self {
        PeerConfig::Agent(config)
    }
}

impl From<GatewayConfig> for PeerConfig {
    fn from(config: GatewayConfig) -> Self {
        PeerConfig::Gateway(config)
    }
}

/// What a gateway needs: the online agents it peers with and every tunnel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub agents: Vec<GatewayAgentPeer>,
    pub tunnels: Vec<GatewayTunnel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAgentPeer {
    pub id: Uuid,
    pub name: String,
    pub wireguard_public_key: Option<String>,
    /// Host routes (`/32`) for the agent's address in each of its subnetted tunnels
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTunnel {
    pub id: Uuid,
    pub domain: String,
    pub agent_id: Uuid,
    pub target: String,
    pub enabled: bool,
    pub subnet: Option<String>,
    /// This gateway's own address in the tunnel, when one is assigned
    pub gateway_ip: Option<String>,
    pub agent_ip: Option<String>,
}

/// What an agent needs: its identity, the online gateways and its own tunnels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent: AgentIdentity,
    pub gateways: Vec<AgentGatewayPeer>,
    pub tunnels: Vec<AgentTunnel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub id: Uuid,
    pub name: String,
    pub wireguard_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentGatewayPeer {
    pub id: Uuid,
    pub name: String,
    pub public_ip: Option<String>,
    pub wireguard_public_key: String,
    /// `publicIp:51820`, absent when the gateway has no public IP
    pub endpoint: Option<String>,
    /// Host routes (`/32`) for the gateway's address in each tunnel of this agent
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentTunnel {
    pub id: Uuid,
    pub domain: String,
    pub target: String,
    pub enabled: bool,
    pub subnet: Option<String>,
    pub agent_ip: Option<String>,
    pub gateway_ips: Vec<TunnelGatewayAddress>,
    #[serde(default)]
    pub http_proxy_enabled: bool,
    #[serde(default)]
    pub socks_proxy_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelGatewayAddress {
    pub gateway_id: Uuid,
    pub ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gateway_config_field_names() {
        let agent_id = Uuid::new_v4();
        let config = GatewayConfig {
            agents: vec![GatewayAgentPeer {
                id: agent_id,
                name: "edge-1".to_string(),
                wireguard_public_key: Some("key".to_string()),
                allowed_ips: vec!["10.1.0.2/32".to_string()],
            }],
            tunnels: vec![GatewayTunnel {
                id: Uuid::new_v4(),
                domain: "app.example.com".to_string(),
                agent_id,
                target: "localhost:8080".to_string(),
                enabled: true,
                subnet: Some("10.1.0.0/24".to_string()),
                gateway_ip: None,
                agent_ip: Some("10.1.0.2".to_string()),
            }],
        };

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["agents"][0]["allowedIPs"][0], "10.1.0.2/32");
        assert_eq!(value["agents"][0]["wireguardPublicKey"], "key");
        assert_eq!(value["tunnels"][0]["agentId"], agent_id.to_string());
        assert!(value["tunnels"][0]["gatewayIp"].is_null());
        assert_eq!(value["tunnels"][0]["agentIp"], "10.1.0.2");
    }

    #[test]
    fn test_untagged_config_picks_agent_shape() {
        let raw = json!({
            "agent": { "id": Uuid::nil(), "name": "a", "wireguardPublicKey": null },
            "gateways": [],
            "tunnels": []
        });
        let config: PeerConfig = serde_json::from_value(raw).unwrap();
        assert!(matches!(config, PeerConfig::Agent(_)));

        let raw = json!({ "agents": [], "tunnels": [] });
        let config: PeerConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config, PeerConfig::Gateway(GatewayConfig::default()));
    }

    #[test]
    fn test_agent_tunnel_gateway_ips() {
        let gateway_id = Uuid::new_v4();
        let tunnel = AgentTunnel {
            id: Uuid::new_v4(),
            domain: "db.example.com".to_string(),
            target: "127.0.0.1:5432".to_string(),
            enabled: false,
            subnet: None,
            agent_ip: None,
            gateway_ips: vec![TunnelGatewayAddress {
                gateway_id,
                ip: "10.3.0.254".to_string(),
            }],
            http_proxy_enabled: false,
            socks_proxy_enabled: true,
        };

        let value = serde_json::to_value(&tunnel).unwrap();
        assert_eq!(value["gatewayIps"][0]["gatewayId"], gateway_id.to_string());
        assert_eq!(value["gatewayIps"][0]["ip"], "10.3.0.254");
        assert_eq!(value["socksProxyEnabled"], true);
        assert!(value["subnet"].is_null());
    }
}
