//! Agent entity: a tunnel-side node exposing internal services

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::status::PeerStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    /// Bearer credential presented in `auth`
    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Learned from the agent at its first successful authentication
    #[sea_orm(unique, nullable)]
    pub wireguard_public_key: Option<String>,

    pub status: PeerStatus,

    pub last_seen_at: Option<ChronoDateTimeUtc>,

    /// Metadata from the most recent `status_update`
    #[sea_orm(column_type = "Json", nullable)]
    pub metadata: Option<Json>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Tunnels routed through this agent
    #[sea_orm(has_many = "super::tunnel::Entity")]
    Tunnels,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnels.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
