//! Gateway entity: a public ingress/exit node

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::status::PeerStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "gateways")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Set by the operator or learned at authentication
    pub public_ip: Option<String>,

    #[sea_orm(nullable)]
    pub wireguard_public_key: Option<String>,

    pub region: Option<String>,

    pub status: PeerStatus,

    pub last_seen_at: Option<ChronoDateTimeUtc>,

    #[sea_orm(column_type = "Json", nullable)]
    pub metadata: Option<Json>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tunnel_gateway_ip::Entity")]
    TunnelGatewayIps,
}

impl Related<super::tunnel_gateway_ip::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TunnelGatewayIps.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
