//! Database entities

pub mod agent;
pub mod gateway;
pub mod status;
pub mod tunnel;
pub mod tunnel_gateway_ip;

pub use agent::Entity as Agent;
pub use gateway::Entity as Gateway;
pub use status::PeerStatus;
pub use tunnel::Entity as Tunnel;
pub use tunnel_gateway_ip::Entity as TunnelGatewayIp;

pub mod prelude {
    pub use super::agent::Entity as Agent;
    pub use super::gateway::Entity as Gateway;
    pub use super::status::PeerStatus;
    pub use super::tunnel::Entity as Tunnel;
    pub use super::tunnel_gateway_ip::Entity as TunnelGatewayIp;
}
