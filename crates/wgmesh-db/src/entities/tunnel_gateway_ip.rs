//! TunnelGatewayIp entity: a gateway's address inside one tunnel's subnet

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnel_gateway_ips")]
pub struct Model {
    /// Tunnel UUID (composite primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub tunnel_id: Uuid,

    /// Gateway UUID (composite primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub gateway_id: Uuid,

    /// e.g. `10.1.0.254`, handed out from the top of the subnet downward
    pub ip: String,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tunnel::Entity",
        from = "Column::TunnelId",
        to = "super::tunnel::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Tunnel,

    #[sea_orm(
        belongs_to = "super::gateway::Entity",
        from = "Column::GatewayId",
        to = "super::gateway::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Gateway,
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl Related<super::gateway::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Gateway.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
