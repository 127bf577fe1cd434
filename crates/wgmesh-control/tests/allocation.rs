//! Address allocation against a real SQLite store

use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use std::collections::BTreeSet;
use std::sync::Arc;
use wgmesh_control::{
    AllocationError, BackfillPolicy, ControlError, CoordinatorConfig, MeshCoordinator, MeshService,
    MeshStore, NewGateway, NewTunnel, TunnelChanges,
};
use wgmesh_db::entities::{gateway, tunnel, tunnel_gateway_ip};
use wgmesh_db::{connect, migrate};

async fn setup_with(policy: BackfillPolicy) -> MeshService {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    migrate(&db).await.expect("Failed to run migrations");

    let config = CoordinatorConfig {
        backfill_policy: policy,
        ..CoordinatorConfig::default()
    };
    MeshService::new(MeshCoordinator::new(MeshStore::new(db), config))
}

async fn setup() -> MeshService {
    setup_with(BackfillPolicy::BestEffort).await
}

fn gateway_named(name: &str) -> NewGateway {
    NewGateway {
        name: name.to_string(),
        public_ip: Some("203.0.113.10".to_string()),
        ..NewGateway::default()
    }
}

async fn gateway_ips_for(
    service: &MeshService,
    tunnel_id: uuid::Uuid,
) -> Vec<tunnel_gateway_ip::Model> {
    service
        .coordinator()
        .store()
        .tunnel_gateway_ips(tunnel_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_gateway_then_tunnel_then_second_gateway() {
    let service = setup().await;

    let g1 = service.create_gateway(gateway_named("g1")).await.unwrap();
    assert!(g1.addresses.is_empty());
    let rows = tunnel_gateway_ip::Entity::find()
        .count(service.coordinator().store().connection())
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let a1 = service.create_agent("a1").await.unwrap();
    let t1 = service
        .create_tunnel(NewTunnel::new("app.example.com", a1.agent.id, "localhost:8080"))
        .await
        .unwrap();

    assert_eq!(t1.tunnel.subnet.as_deref(), Some("10.1.0.0/24"));
    assert_eq!(t1.tunnel.agent_ip.as_deref(), Some("10.1.0.2"));
    assert_eq!(t1.gateway_addresses.len(), 1);
    assert_eq!(t1.gateway_addresses[0].gateway_id, g1.gateway.id);
    assert_eq!(t1.gateway_addresses[0].ip, "10.1.0.254");

    let g2 = service.create_gateway(gateway_named("g2")).await.unwrap();
    assert_eq!(g2.addresses.len(), 1);
    assert_eq!(g2.addresses[0].tunnel_id, t1.tunnel.id);
    assert_eq!(g2.addresses[0].ip, "10.1.0.253");

    let rows = gateway_ips_for(&service, t1.tunnel.id).await;
    let ips: BTreeSet<&str> = rows.iter().map(|r| r.ip.as_str()).collect();
    assert_eq!(ips, BTreeSet::from(["10.1.0.253", "10.1.0.254"]));
}

#[tokio::test]
async fn test_subnets_fill_gaps_lowest_first() {
    let service = setup().await;
    let a1 = service.create_agent("a1").await.unwrap();

    let mut ids = Vec::new();
    for i in 1..=3 {
        let created = service
            .create_tunnel(NewTunnel::new(
                format!("t{}.example.com", i),
                a1.agent.id,
                "localhost:80",
            ))
            .await
            .unwrap();
        assert_eq!(created.tunnel.subnet, Some(format!("10.{}.0.0/24", i)));
        ids.push(created.tunnel.id);
    }

    service.delete_tunnel(ids[1]).await.unwrap();

    let refill = service
        .create_tunnel(NewTunnel::new("t4.example.com", a1.agent.id, "localhost:80"))
        .await
        .unwrap();
    assert_eq!(refill.tunnel.subnet.as_deref(), Some("10.2.0.0/24"));
    assert_eq!(refill.tunnel.agent_ip.as_deref(), Some("10.2.0.2"));

    let next = service
        .create_tunnel(NewTunnel::new("t5.example.com", a1.agent.id, "localhost:80"))
        .await
        .unwrap();
    assert_eq!(next.tunnel.subnet.as_deref(), Some("10.4.0.0/24"));
}

#[tokio::test]
async fn test_255th_tunnel_is_refused() {
    let service = setup().await;
    let a1 = service.create_agent("a1").await.unwrap();

    let mut subnets = BTreeSet::new();
    for i in 1..=254 {
        let created = service
            .create_tunnel(NewTunnel::new(
                format!("t{}.example.com", i),
                a1.agent.id,
                "localhost:80",
            ))
            .await
            .unwrap();
        assert!(subnets.insert(created.tunnel.subnet.unwrap()));
    }
    assert_eq!(subnets.len(), 254);

    let err = service
        .create_tunnel(NewTunnel::new("overflow.example.com", a1.agent.id, "localhost:80"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::Allocation(AllocationError::SubnetsExhausted)
    ));

    let stored = tunnel::Entity::find()
        .count(service.coordinator().store().connection())
        .await
        .unwrap();
    assert_eq!(stored, 254);
}

#[tokio::test]
async fn test_gateway_addresses_are_distinct_and_avoid_agent() {
    let service = setup().await;
    let a1 = service.create_agent("a1").await.unwrap();

    for i in 0..5 {
        service
            .create_gateway(gateway_named(&format!("g{}", i)))
            .await
            .unwrap();
    }
    let t1 = service
        .create_tunnel(NewTunnel::new("app.example.com", a1.agent.id, "localhost:80"))
        .await
        .unwrap();
    service.create_gateway(gateway_named("late")).await.unwrap();

    let rows = gateway_ips_for(&service, t1.tunnel.id).await;
    assert_eq!(rows.len(), 6);

    let ips: BTreeSet<&str> = rows.iter().map(|r| r.ip.as_str()).collect();
    assert_eq!(ips.len(), 6);
    assert!(!ips.contains("10.1.0.2"));
    assert!(!ips.contains("10.1.0.1"));
    assert!(ips.contains("10.1.0.249"));
}

#[tokio::test]
async fn test_tunnel_refused_when_gateways_exceed_subnet() {
    let service = setup().await;
    let a1 = service.create_agent("a1").await.unwrap();
    let store = service.coordinator().store();

    // One more gateway than a /24 can address
    for i in 0..253 {
        store
            .insert_gateway(&format!("g{}", i), &format!("gw_key_{}", i), None, None, None)
            .await
            .unwrap();
    }

    let err = service
        .create_tunnel(NewTunnel::new("app.example.com", a1.agent.id, "localhost:80"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::Allocation(AllocationError::AddressesExhausted { .. })
    ));

    // Nothing from the failed creation survives
    let db = store.connection();
    assert_eq!(tunnel::Entity::find().count(db).await.unwrap(), 0);
    assert_eq!(tunnel_gateway_ip::Entity::find().count(db).await.unwrap(), 0);
}

async fn fill_tunnel_with_gateways(service: &MeshService) -> uuid::Uuid {
    let a1 = service.create_agent("a1").await.unwrap();
    let t1 = service
        .create_tunnel(NewTunnel::new("full.example.com", a1.agent.id, "localhost:80"))
        .await
        .unwrap();
    for i in 0..252 {
        service
            .create_gateway(NewGateway {
                name: format!("g{}", i),
                ..NewGateway::default()
            })
            .await
            .unwrap();
    }
    assert_eq!(gateway_ips_for(service, t1.tunnel.id).await.len(), 252);
    t1.tunnel.id
}

#[tokio::test]
async fn test_backfill_best_effort_skips_full_tunnel() {
    let service = setup_with(BackfillPolicy::BestEffort).await;
    let full = fill_tunnel_with_gateways(&service).await;

    // 252 gateways still fit in a fresh subnet
    let a2 = service.create_agent("a2").await.unwrap();
    let roomy = service
        .create_tunnel(NewTunnel::new("roomy.example.com", a2.agent.id, "localhost:80"))
        .await
        .unwrap();

    // Both tunnels are full now; the gateway is kept without addresses
    let extra = service
        .create_gateway(NewGateway {
            name: "extra".to_string(),
            ..NewGateway::default()
        })
        .await
        .unwrap();
    assert!(extra.addresses.is_empty());
    assert_eq!(gateway_ips_for(&service, full).await.len(), 252);
    assert_eq!(gateway_ips_for(&service, roomy.tunnel.id).await.len(), 252);

    let stored = gateway::Entity::find()
        .filter(gateway::Column::Id.eq(extra.gateway.id))
        .one(service.coordinator().store().connection())
        .await
        .unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_backfill_fail_fast_removes_gateway() {
    let service = setup_with(BackfillPolicy::FailFast).await;
    fill_tunnel_with_gateways(&service).await;

    let err = service
        .create_gateway(NewGateway {
            name: "extra".to_string(),
            ..NewGateway::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::Allocation(AllocationError::AddressesExhausted { .. })
    ));

    let remaining = gateway::Entity::find()
        .filter(gateway::Column::Name.eq("extra"))
        .count(service.coordinator().store().connection())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_update_keeps_subnet_and_addresses() {
    let service = setup().await;
    let a1 = service.create_agent("a1").await.unwrap();
    service.create_gateway(gateway_named("g1")).await.unwrap();
    let t1 = service
        .create_tunnel(NewTunnel::new("app.example.com", a1.agent.id, "localhost:80"))
        .await
        .unwrap();

    let updated = service
        .update_tunnel(
            t1.tunnel.id,
            TunnelChanges {
                domain: Some("renamed.example.com".to_string()),
                enabled: Some(false),
                socks_proxy_enabled: Some(true),
                ..TunnelChanges::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.domain, "renamed.example.com");
    assert!(!updated.enabled);
    assert!(updated.socks_proxy_enabled);
    assert_eq!(updated.subnet, t1.tunnel.subnet);
    assert_eq!(updated.agent_ip, t1.tunnel.agent_ip);
    assert_eq!(gateway_ips_for(&service, t1.tunnel.id).await[0].ip, "10.1.0.254");
}

#[tokio::test]
async fn test_tunnel_validation_and_conflicts() {
    let service = setup().await;
    let a1 = service.create_agent("a1").await.unwrap();

    let missing_agent = service
        .create_tunnel(NewTunnel::new("x.example.com", uuid::Uuid::new_v4(), "localhost:80"))
        .await
        .unwrap_err();
    assert!(matches!(missing_agent, ControlError::NotFound { .. }));

    let bad_target = service
        .create_tunnel(NewTunnel::new("x.example.com", a1.agent.id, "localhost"))
        .await
        .unwrap_err();
    assert!(matches!(bad_target, ControlError::Validation(_)));

    service
        .create_tunnel(NewTunnel::new("x.example.com", a1.agent.id, "localhost:80"))
        .await
        .unwrap();
    let duplicate = service
        .create_tunnel(NewTunnel::new("x.example.com", a1.agent.id, "localhost:81"))
        .await
        .unwrap_err();
    assert!(matches!(duplicate, ControlError::Conflict(_)));
}

#[tokio::test]
async fn test_concurrent_tunnel_creation_never_shares_a_subnet() {
    let service = Arc::new(setup().await);
    let a1 = service.create_agent("a1").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let service = service.clone();
        let agent_id = a1.agent.id;
        handles.push(tokio::spawn(async move {
            service
                .create_tunnel(NewTunnel::new(
                    format!("c{}.example.com", i),
                    agent_id,
                    "localhost:80",
                ))
                .await
                .map(|created| created.tunnel.subnet)
        }));
    }

    let mut subnets = BTreeSet::new();
    for handle in handles {
        let subnet = handle.await.unwrap().unwrap().unwrap();
        assert!(subnets.insert(subnet), "subnet handed out twice");
    }
    let expected: BTreeSet<String> = (1..=16).map(|n| format!("10.{}.0.0/24", n)).collect();
    assert_eq!(subnets, expected);
}

#[tokio::test]
async fn test_deleting_agent_cascades() {
    let service = setup().await;
    let a1 = service.create_agent("a1").await.unwrap();
    service.create_gateway(gateway_named("g1")).await.unwrap();
    service
        .create_tunnel(NewTunnel::new("app.example.com", a1.agent.id, "localhost:80"))
        .await
        .unwrap();

    service.delete_agent(a1.agent.id).await.unwrap();

    let db = service.coordinator().store().connection();
    let tunnels = tunnel::Entity::find()
        .filter(tunnel::Column::AgentId.eq(a1.agent.id))
        .count(db)
        .await
        .unwrap();
    assert_eq!(tunnels, 0);
    assert_eq!(tunnel_gateway_ip::Entity::find().count(db).await.unwrap(), 0);

    let again = service.delete_agent(a1.agent.id).await.unwrap_err();
    assert!(matches!(again, ControlError::NotFound { .. }));
}

#[tokio::test]
async fn test_credentials_are_prefixed_by_role() {
    let service = setup().await;
    let agent = service.create_agent("a1").await.unwrap();
    let gateway = service.create_gateway(gateway_named("g1")).await.unwrap();

    assert!(agent.api_key.as_str().starts_with("agt_"));
    assert!(gateway.api_key.as_str().starts_with("gw_"));
    assert_eq!(agent.agent.api_key, agent.api_key.as_str());
}
