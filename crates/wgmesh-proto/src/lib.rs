//! Mesh Control Protocol Definitions
//!
//! This crate defines the JSON control messages exchanged between the
//! coordinator and its agents and gateways, plus the per-peer
//! configuration documents carried in `config_update`.

pub mod codec;
pub mod config;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use config::*;
pub use messages::*;

/// UDP port every gateway's WireGuard endpoint listens on
pub const WIREGUARD_PORT: u16 = 51820;

/// Prefix of the first IPv4 octet used for tunnel subnets (`10.N.0.0/24`)
pub const TUNNEL_NETWORK_OCTET: u8 = 10;
