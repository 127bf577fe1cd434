//! Tunnel entity: binds an external domain to one agent's internal target

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub domain: String,

    pub agent_id: Uuid,

    /// Internal `host:port` the agent forwards to
    pub target: String,

    pub enabled: bool,

    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    /// `10.N.0.0/24`, assigned once at creation
    #[sea_orm(unique, nullable)]
    pub subnet: Option<String>,

    /// Always `.2` of `subnet`
    pub agent_ip: Option<String>,

    pub http_proxy_enabled: bool,

    pub socks_proxy_enabled: bool,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::agent::Entity",
        from = "Column::AgentId",
        to = "super::agent::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Agent,

    #[sea_orm(has_many = "super::tunnel_gateway_ip::Entity")]
    TunnelGatewayIps,
}

impl Related<super::agent::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Agent.def()
    }
}

impl Related<super::tunnel_gateway_ip::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TunnelGatewayIps.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
