//! Operational status shared by agents and gateways

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Authenticated session is live
    #[sea_orm(string_value = "online")]
    Online,

    #[sea_orm(string_value = "offline")]
    #[default]
    Offline,

    /// Peer reported a local failure through `status_update`
    #[sea_orm(string_value = "error")]
    Error,
}
