//! Initial schema: agents, gateways, tunnels and per-tunnel gateway addresses

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Create agents table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Agent::Table)
                    .if_not_exists()
                    .col(uuid(Agent::Id).primary_key())
                    .col(string_len(Agent::Name, 64).not_null())
                    .col(string_len(Agent::ApiKey, 64).not_null().unique_key())
                    .col(string_len_null(Agent::WireguardPublicKey, 256).unique_key())
                    .col(string_len(Agent::Status, 16).not_null().default("offline"))
                    .col(timestamp_with_time_zone_null(Agent::LastSeenAt))
                    .col(ColumnDef::new(Agent::Metadata).json().null())
                    .col(
                        timestamp_with_time_zone(Agent::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Agent::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Create gateways table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Gateway::Table)
                    .if_not_exists()
                    .col(uuid(Gateway::Id).primary_key())
                    .col(string_len(Gateway::Name, 64).not_null())
                    .col(string_len(Gateway::ApiKey, 64).not_null().unique_key())
                    .col(string_len_null(Gateway::PublicIp, 15))
                    .col(string_len_null(Gateway::WireguardPublicKey, 256))
                    .col(string_len_null(Gateway::Region, 32))
                    .col(string_len(Gateway::Status, 16).not_null().default("offline"))
                    .col(timestamp_with_time_zone_null(Gateway::LastSeenAt))
                    .col(ColumnDef::new(Gateway::Metadata).json().null())
                    .col(
                        timestamp_with_time_zone(Gateway::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Gateway::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Create tunnels table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Tunnel::Table)
                    .if_not_exists()
                    .col(uuid(Tunnel::Id).primary_key())
                    .col(string_len(Tunnel::Domain, 255).not_null().unique_key())
                    .col(uuid(Tunnel::AgentId).not_null())
                    .col(string_len(Tunnel::Target, 255).not_null())
                    .col(boolean(Tunnel::Enabled).not_null().default(true))
                    .col(text_null(Tunnel::Description))
                    .col(string_len_null(Tunnel::Subnet, 18).unique_key())
                    .col(string_len_null(Tunnel::AgentIp, 15))
                    .col(boolean(Tunnel::HttpProxyEnabled).not_null().default(false))
                    .col(boolean(Tunnel::SocksProxyEnabled).not_null().default(false))
                    .col(
                        timestamp_with_time_zone(Tunnel::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Tunnel::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnels_agent_id")
                            .from(Tunnel::Table, Tunnel::AgentId)
                            .to(Agent::Table, Agent::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnels_agent_id")
                    .table(Tunnel::Table)
                    .col(Tunnel::AgentId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. Create tunnel_gateway_ips junction table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(TunnelGatewayIp::Table)
                    .if_not_exists()
                    .col(uuid(TunnelGatewayIp::TunnelId).not_null())
                    .col(uuid(TunnelGatewayIp::GatewayId).not_null())
                    .col(string_len(TunnelGatewayIp::Ip, 15).not_null())
                    .col(
                        timestamp_with_time_zone(TunnelGatewayIp::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(TunnelGatewayIp::TunnelId)
                            .col(TunnelGatewayIp::GatewayId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnel_gateway_ips_tunnel_id")
                            .from(TunnelGatewayIp::Table, TunnelGatewayIp::TunnelId)
                            .to(Tunnel::Table, Tunnel::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnel_gateway_ips_gateway_id")
                            .from(TunnelGatewayIp::Table, TunnelGatewayIp::GatewayId)
                            .to(Gateway::Table, Gateway::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // An address is held by at most one gateway within a tunnel
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnel_gateway_ips_tunnel_ip")
                    .table(TunnelGatewayIp::Table)
                    .col(TunnelGatewayIp::TunnelId)
                    .col(TunnelGatewayIp::Ip)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnel_gateway_ips_gateway_id")
                    .table(TunnelGatewayIp::Table)
                    .col(TunnelGatewayIp::GatewayId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Drop tables in reverse order (respecting foreign keys)
        manager
            .drop_table(Table::drop().table(TunnelGatewayIp::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Tunnel::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Gateway::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Agent::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Agent {
    #[sea_orm(iden = "agents")]
    Table,
    Id,
    Name,
    ApiKey,
    WireguardPublicKey,
    Status,
    LastSeenAt,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Gateway {
    #[sea_orm(iden = "gateways")]
    Table,
    Id,
    Name,
    ApiKey,
    PublicIp,
    WireguardPublicKey,
    Region,
    Status,
    LastSeenAt,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tunnel {
    #[sea_orm(iden = "tunnels")]
    Table,
    Id,
    Domain,
    AgentId,
    Target,
    Enabled,
    Description,
    Subnet,
    AgentIp,
    HttpProxyEnabled,
    SocksProxyEnabled,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum TunnelGatewayIp {
    #[sea_orm(iden = "tunnel_gateway_ips")]
    Table,
    TunnelId,
    GatewayId,
    Ip,
    CreatedAt,
}
