//! Control protocol message types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::config::PeerConfig;

/// Role a peer authenticates as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Agent,
    Gateway,
}

impl ClientType {
    /// The role whose configuration depends on this role's state
    pub fn opposite(self) -> Self {
        match self {
            ClientType::Agent => ClientType::Gateway,
            ClientType::Gateway => ClientType::Agent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Agent => "agent",
            ClientType::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a connected peer reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Online,
    Offline,
    Error,
}

/// Control channel message.
///
/// On the wire every message is a JSON object tagged by `type` with a
/// millisecond `timestamp` and camelCase fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    Auth {
        #[serde(default)]
        timestamp: u64,
        api_key: String,
        client_type: ClientType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_ip: Option<String>,
    },
    AuthSuccess {
        #[serde(default)]
        timestamp: u64,
        client_id: Uuid,
        client_type: ClientType,
    },
    AuthError {
        #[serde(default)]
        timestamp: u64,
        error: String,
    },
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
    Pong {
        #[serde(default)]
        timestamp: u64,
    },
    StatusUpdate {
        #[serde(default)]
        timestamp: u64,
        status: ReportedStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Map<String, Value>>,
    },
    ConfigUpdate {
        #[serde(default)]
        timestamp: u64,
        config: PeerConfig,
    },
    ConfigAck {
        #[serde(default)]
        timestamp: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        #[serde(default)]
        timestamp: u64,
        error: String,
    },
}

/// Wire names of every message type, in declaration order
pub const MESSAGE_TYPES: &[&str] = &[
    "auth",
    "auth_success",
    "auth_error",
    "ping",
    "pong",
    "status_update",
    "config_update",
    "config_ack",
    "error",
];

impl ControlMessage {
    pub fn auth(
        api_key: impl Into<String>,
        client_type: ClientType,
        public_key: Option<String>,
        public_ip: Option<String>,
    ) -> Self {
        ControlMessage::Auth {
            timestamp: now_millis(),
            api_key: api_key.into(),
            client_type,
            public_key,
            public_ip,
        }
    }

    pub fn auth_success(client_id: Uuid, client_type: ClientType) -> Self {
        ControlMessage::AuthSuccess {
            timestamp: now_millis(),
            client_id,
            client_type,
        }
    }

    pub fn auth_error(error: impl Into<String>) -> Self {
        ControlMessage::AuthError {
            timestamp: now_millis(),
            error: error.into(),
        }
    }

    pub fn ping() -> Self {
        ControlMessage::Ping {
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        ControlMessage::Pong {
            timestamp: now_millis(),
        }
    }

    pub fn status_update(status: ReportedStatus, metadata: Option<Map<String, Value>>) -> Self {
        ControlMessage::StatusUpdate {
            timestamp: now_millis(),
            status,
            metadata,
        }
    }

    pub fn config_update(config: impl Into<PeerConfig>) -> Self {
        ControlMessage::ConfigUpdate {
            timestamp: now_millis(),
            config: config.into(),
        }
    }

    pub fn config_ack(success: bool, error: Option<String>) -> Self {
        ControlMessage::ConfigAck {
            timestamp: now_millis(),
            success,
            error,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ControlMessage::Error {
            timestamp: now_millis(),
            error: error.into(),
        }
    }

    /// Wire name of this message's `type` tag
    pub fn message_type(&self) -> &'static str {
        match self {
            ControlMessage::Auth { .. } => "auth",
            ControlMessage::AuthSuccess { .. } => "auth_success",
            ControlMessage::AuthError { .. } => "auth_error",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
            ControlMessage::StatusUpdate { .. } => "status_update",
            ControlMessage::ConfigUpdate { .. } => "config_update",
            ControlMessage::ConfigAck { .. } => "config_ack",
            ControlMessage::Error { .. } => "error",
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            ControlMessage::Auth { timestamp, .. }
            | ControlMessage::AuthSuccess { timestamp, .. }
            | ControlMessage::AuthError { timestamp, .. }
            | ControlMessage::Ping { timestamp }
            | ControlMessage::Pong { timestamp }
            | ControlMessage::StatusUpdate { timestamp, .. }
            | ControlMessage::ConfigUpdate { timestamp, .. }
            | ControlMessage::ConfigAck { timestamp, .. }
            | ControlMessage::Error { timestamp, .. } => *timestamp,
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
