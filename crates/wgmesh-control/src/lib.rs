//! Coordination engine for the mesh control plane
//!
//! - [`allocator`]: tunnel subnets and per-gateway addresses
//! - [`synthesizer`]: per-peer configuration documents
//! - [`session_registry`]: live authenticated sessions
//! - [`coordinator`], [`handler`], [`liveness`], [`server`]: the connection manager
//! - [`service`]: validated topology mutations that drive the coordinator hooks
pub mod allocator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod liveness;
pub mod server;
pub mod service;
pub mod session_registry;
pub mod store;
pub mod synthesizer;
pub mod task_tracker;

pub use allocator::{
    is_valid_subnet, parse_subnet, AddressAllocator, GatewayAddress, SubnetAllocation,
    TunnelAddress,
};
pub use config::{BackfillPolicy, CoordinatorConfig};
pub use coordinator::{AuthRequest, MeshCoordinator};
pub use error::{AllocationError, ControlError, ControlResult};
pub use handler::{ConnectionHandler, ConnectionState};
pub use liveness::{run_liveness_sweep, spawn_liveness_sweep};
pub use server::ControlServer;
pub use service::{
    CreatedAgent, CreatedGateway, CreatedTunnel, MeshService, NewGateway, NewTunnel, TunnelChanges,
};
pub use session_registry::{Session, SessionRegistry};
pub use store::{GatewayChanges, MeshStore, PeerIdentity};
pub use synthesizer::{ConfigSynthesizer, MeshSnapshot};
pub use task_tracker::TaskTracker;
