//! Error types for the coordination engine

use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// Address allocation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("Subnet limit reached (max: 254 tunnels)")]
    SubnetsExhausted,

    #[error("No more IPs available for gateways in subnet {subnet}")]
    AddressesExhausted { subnet: String },

    #[error("Invalid subnet format: {0}")]
    InvalidSubnet(String),
}

impl AllocationError {
    pub fn is_exhaustion(&self) -> bool {
        !matches!(self, AllocationError::InvalidSubnet(_))
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    /// Unknown or mismatched credential; terminal for the connection
    #[error("{0}")]
    Authentication(String),

    /// Malformed or unexpected message; the connection stays open
    #[error("{0}")]
    Protocol(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[from] DbErr),
}

impl ControlError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        ControlError::NotFound { kind, id }
    }
}

impl From<wgmesh_proto::CodecError> for ControlError {
    fn from(err: wgmesh_proto::CodecError) -> Self {
        ControlError::Protocol(err.to_string())
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
