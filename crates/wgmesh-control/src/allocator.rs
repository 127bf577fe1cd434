//! Address allocation for tunnel subnets
//!
//! Every tunnel owns one `10.N.0.0/24`, N in `1..=254`, handed out lowest
//! free first. Inside a subnet `.1` is reserved for the legacy single-gateway
//! layout, `.2` is always the agent, and gateways take addresses from `.254`
//! downward, never below `.3`.
//!
//! The pure helpers at the top decide addresses; the async functions apply
//! them to the entity store. [`AddressAllocator`] serializes every allocation
//! behind one critical section and runs each inside a transaction.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgmesh_db::entities::{gateway, tunnel, tunnel_gateway_ip};
use wgmesh_proto::TUNNEL_NETWORK_OCTET;

use crate::config::BackfillPolicy;
use crate::error::{AllocationError, ControlResult};

/// Highest subnet number, and so the tunnel cap
pub const MAX_SUBNET_NUMBER: u8 = 254;
/// Host octet reserved for the legacy single-gateway layout
pub const LEGACY_GATEWAY_HOST: u8 = 1;
/// Host octet of the agent in every tunnel
pub const AGENT_HOST: u8 = 2;
/// First host octet handed to a gateway
pub const HIGHEST_GATEWAY_HOST: u8 = 254;
/// Last host octet a gateway may receive
pub const LOWEST_GATEWAY_HOST: u8 = 3;

/// A tunnel's subnet and the agent's fixed address in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetAllocation {
    pub number: u8,
    pub subnet: String,
    pub agent_ip: String,
}

impl SubnetAllocation {
    pub fn for_number(number: u8) -> Self {
        Self {
            number,
            subnet: format!("{}.{}.0.0/24", TUNNEL_NETWORK_OCTET, number),
            agent_ip: host_address(number, AGENT_HOST).to_string(),
        }
    }

    /// Address of host `octet` inside this subnet
    pub fn host(&self, octet: u8) -> Ipv4Addr {
        host_address(self.number, octet)
    }

    /// `.1`, the gateway-side address of the old one-gateway layout
    pub fn legacy_gateway_address(&self) -> String {
        self.host(LEGACY_GATEWAY_HOST).to_string()
    }
}

fn host_address(number: u8, octet: u8) -> Ipv4Addr {
    Ipv4Addr::new(TUNNEL_NETWORK_OCTET, number, 0, octet)
}

/// Whether `subnet` has the exact shape `10.<1-3 digits>.0.0/24`
pub fn is_valid_subnet(subnet: &str) -> bool {
    subnet_number_digits(subnet).is_some()
}

/// Parse `10.N.0.0/24`; `None` for any other shape or N outside `1..=254`
pub fn parse_subnet(subnet: &str) -> Option<SubnetAllocation> {
    let number: u8 = subnet_number_digits(subnet)?.parse().ok()?;
    if number == 0 || number > MAX_SUBNET_NUMBER {
        return None;
    }
    Some(SubnetAllocation::for_number(number))
}

fn subnet_number_digits(subnet: &str) -> Option<&str> {
    let digits = subnet.strip_prefix("10.")?.strip_suffix(".0.0/24")?;
    if digits.is_empty() || digits.len() > 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(digits)
}

/// Lowest subnet number not in `used`
pub fn next_subnet_number(used: &BTreeSet<u8>) -> Result<u8, AllocationError> {
    (1..=MAX_SUBNET_NUMBER)
        .find(|n| !used.contains(n))
        .ok_or(AllocationError::SubnetsExhausted)
}

/// Highest free gateway host octet, scanning down from `.254` to `.3`
pub fn next_gateway_octet(used: &BTreeSet<u8>) -> Option<u8> {
    (LOWEST_GATEWAY_HOST..=HIGHEST_GATEWAY_HOST)
        .rev()
        .find(|octet| !used.contains(octet))
}

/// Last octet of a dotted-quad, if it is one
fn host_octet(ip: &str) -> Option<u8> {
    ip.parse::<Ipv4Addr>().ok().map(|addr| addr.octets()[3])
}

/// A gateway's new address in one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddress {
    pub gateway_id: Uuid,
    pub ip: String,
}

/// An address a gateway received in one tunnel during backfill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAddress {
    pub tunnel_id: Uuid,
    pub ip: String,
}

/// Pick the lowest free subnet across all subnetted tunnels
pub async fn allocate_tunnel_subnet<C: ConnectionTrait>(db: &C) -> ControlResult<SubnetAllocation> {
    let tunnels = tunnel::Entity::find()
        .filter(tunnel::Column::Subnet.is_not_null())
        .all(db)
        .await?;

    let used: BTreeSet<u8> = tunnels
        .iter()
        .filter_map(|t| t.subnet.as_deref())
        .filter_map(parse_subnet)
        .map(|s| s.number)
        .collect();

    let number = next_subnet_number(&used)?;
    Ok(SubnetAllocation::for_number(number))
}

/// Give every gateway lacking an address in this tunnel the next free one.
///
/// All-or-nothing: if the subnet runs out, nothing is persisted.
pub async fn allocate_gateway_addresses_for_tunnel<C: ConnectionTrait>(
    db: &C,
    tunnel_id: Uuid,
    subnet: &str,
) -> ControlResult<Vec<GatewayAddress>> {
    let allocation =
        parse_subnet(subnet).ok_or_else(|| AllocationError::InvalidSubnet(subnet.to_string()))?;

    let gateways = gateway::Entity::find()
        .order_by_asc(gateway::Column::CreatedAt)
        .order_by_asc(gateway::Column::Id)
        .all(db)
        .await?;
    if gateways.is_empty() {
        return Ok(Vec::new());
    }

    let existing = tunnel_gateway_ip::Entity::find()
        .filter(tunnel_gateway_ip::Column::TunnelId.eq(tunnel_id))
        .all(db)
        .await?;

    let assigned: BTreeSet<Uuid> = existing.iter().map(|row| row.gateway_id).collect();
    let mut used: BTreeSet<u8> = existing.iter().filter_map(|row| host_octet(&row.ip)).collect();

    let mut allocations = Vec::new();
    for gw in gateways.iter().filter(|g| !assigned.contains(&g.id)) {
        let octet = next_gateway_octet(&used).ok_or_else(|| AllocationError::AddressesExhausted {
            subnet: allocation.subnet.clone(),
        })?;
        used.insert(octet);
        allocations.push(GatewayAddress {
            gateway_id: gw.id,
            ip: allocation.host(octet).to_string(),
        });
    }

    if !allocations.is_empty() {
        let now = Utc::now();
        let rows = allocations.iter().map(|a| tunnel_gateway_ip::ActiveModel {
            tunnel_id: Set(tunnel_id),
            gateway_id: Set(a.gateway_id),
            ip: Set(a.ip.clone()),
            created_at: Set(now),
        });
        tunnel_gateway_ip::Entity::insert_many(rows)
            .exec_without_returning(db)
            .await?;
    }

    debug!(
        tunnel_id = %tunnel_id,
        subnet = %allocation.subnet,
        count = allocations.len(),
        "Allocated gateway addresses for tunnel"
    );
    Ok(allocations)
}

/// Give one gateway an address in every subnetted tunnel it lacks one in.
///
/// Under [`BackfillPolicy::BestEffort`] an exhausted tunnel is logged and
/// skipped; under [`BackfillPolicy::FailFast`] it aborts with nothing persisted.
pub async fn allocate_tunnel_addresses_for_gateway<C: ConnectionTrait>(
    db: &C,
    gateway_id: Uuid,
    policy: BackfillPolicy,
) -> ControlResult<Vec<TunnelAddress>> {
    let tunnels = tunnel::Entity::find()
        .filter(tunnel::Column::Subnet.is_not_null())
        .order_by_asc(tunnel::Column::CreatedAt)
        .order_by_asc(tunnel::Column::Id)
        .all(db)
        .await?;
    if tunnels.is_empty() {
        return Ok(Vec::new());
    }

    let mut rows_by_tunnel: HashMap<Uuid, Vec<tunnel_gateway_ip::Model>> = HashMap::new();
    for row in tunnel_gateway_ip::Entity::find().all(db).await? {
        rows_by_tunnel.entry(row.tunnel_id).or_default().push(row);
    }

    let mut allocations = Vec::new();
    for t in &tunnels {
        let Some(allocation) = t.subnet.as_deref().and_then(parse_subnet) else {
            warn!(tunnel_id = %t.id, subnet = ?t.subnet, "Skipping tunnel with invalid subnet");
            continue;
        };

        let existing = rows_by_tunnel.get(&t.id).map(Vec::as_slice).unwrap_or(&[]);
        if existing.iter().any(|row| row.gateway_id == gateway_id) {
            continue;
        }

        let used: BTreeSet<u8> = existing.iter().filter_map(|row| host_octet(&row.ip)).collect();
        match next_gateway_octet(&used) {
            Some(octet) => allocations.push(TunnelAddress {
                tunnel_id: t.id,
                ip: allocation.host(octet).to_string(),
            }),
            None => {
                let err = AllocationError::AddressesExhausted {
                    subnet: allocation.subnet.clone(),
                };
                match policy {
                    BackfillPolicy::BestEffort => {
                        warn!(
                            tunnel_id = %t.id,
                            gateway_id = %gateway_id,
                            "No more IPs available for gateway in tunnel; skipping"
                        );
                    }
                    BackfillPolicy::FailFast => return Err(err.into()),
                }
            }
        }
    }

    if !allocations.is_empty() {
        let now = Utc::now();
        let rows = allocations.iter().map(|a| tunnel_gateway_ip::ActiveModel {
            tunnel_id: Set(a.tunnel_id),
            gateway_id: Set(gateway_id),
            ip: Set(a.ip.clone()),
            created_at: Set(now),
        });
        tunnel_gateway_ip::Entity::insert_many(rows)
            .exec_without_returning(db)
            .await?;
    }

    Ok(allocations)
}

/// Serializes allocations so two concurrent creations never share a subnet
/// or an address.
#[derive(Debug, Default)]
pub struct AddressAllocator {
    lock: Mutex<()>,
    policy: BackfillPolicy,
}

impl AddressAllocator {
    pub fn new(policy: BackfillPolicy) -> Self {
        Self {
            lock: Mutex::new(()),
            policy,
        }
    }

    pub fn policy(&self) -> BackfillPolicy {
        self.policy
    }

    /// Insert a tunnel with a fresh subnet, then address every gateway in it.
    ///
    /// `subnet` and `agent_ip` on `draft` are overwritten. One transaction:
    /// exhaustion of either kind leaves no trace.
    pub async fn insert_tunnel(
        &self,
        db: &DatabaseConnection,
        mut draft: tunnel::ActiveModel,
    ) -> ControlResult<(tunnel::Model, Vec<GatewayAddress>)> {
        let _guard = self.lock.lock().await;
        let txn = db.begin().await?;

        let allocation = allocate_tunnel_subnet(&txn).await?;
        draft.subnet = Set(Some(allocation.subnet.clone()));
        draft.agent_ip = Set(Some(allocation.agent_ip.clone()));
        let created = draft.insert(&txn).await?;

        let addresses =
            allocate_gateway_addresses_for_tunnel(&txn, created.id, &allocation.subnet).await?;

        txn.commit().await?;

        info!(
            tunnel_id = %created.id,
            subnet = %allocation.subnet,
            agent_ip = %allocation.agent_ip,
            gateways = addresses.len(),
            "Allocated tunnel subnet"
        );
        Ok((created, addresses))
    }

    /// Give every gateway without an address in this tunnel one now
    pub async fn address_gateways_for_tunnel(
        &self,
        db: &DatabaseConnection,
        tunnel_id: Uuid,
        subnet: &str,
    ) -> ControlResult<Vec<GatewayAddress>> {
        let _guard = self.lock.lock().await;
        let txn = db.begin().await?;
        let addresses = allocate_gateway_addresses_for_tunnel(&txn, tunnel_id, subnet).await?;
        txn.commit().await?;
        Ok(addresses)
    }

    /// Address a newly created gateway in every existing subnetted tunnel
    pub async fn backfill_gateway(
        &self,
        db: &DatabaseConnection,
        gateway_id: Uuid,
    ) -> ControlResult<Vec<TunnelAddress>> {
        let _guard = self.lock.lock().await;
        let txn = db.begin().await?;
        let addresses = allocate_tunnel_addresses_for_gateway(&txn, gateway_id, self.policy).await?;
        txn.commit().await?;

        info!(
            gateway_id = %gateway_id,
            tunnels = addresses.len(),
            "Backfilled gateway addresses"
        );
        Ok(addresses)
    }
}
