//! Tunables for the coordination engine

use serde::{Deserialize, Serialize};
use std::time::Duration;
use wgmesh_proto::WIREGUARD_PORT;

/// What to do when a new gateway cannot get an address in some tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillPolicy {
    /// Log and skip the exhausted tunnel, keep allocating for the rest
    #[default]
    BestEffort,
    /// Abort the whole backfill; nothing is persisted
    FailFast,
}

impl std::str::FromStr for BackfillPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best_effort" | "best-effort" => Ok(BackfillPolicy::BestEffort),
            "fail_fast" | "fail-fast" => Ok(BackfillPolicy::FailFast),
            other => Err(format!("unknown backfill policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often the liveness sweep runs
    pub sweep_interval: Duration,
    /// Sessions idle for longer than this are evicted
    pub session_timeout: Duration,
    /// Unauthenticated connections are closed after this long
    pub auth_timeout: Duration,
    /// Port advertised in gateway endpoints
    pub wireguard_port: u16,
    pub backfill_policy: BackfillPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            session_timeout: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(10),
            wireguard_port: WIREGUARD_PORT,
            backfill_policy: BackfillPolicy::BestEffort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.session_timeout, Duration::from_secs(60));
        assert_eq!(config.wireguard_port, 51820);
        assert_eq!(config.backfill_policy, BackfillPolicy::BestEffort);
    }

    #[test]
    fn test_backfill_policy_parsing() {
        assert_eq!(
            "fail_fast".parse::<BackfillPolicy>(),
            Ok(BackfillPolicy::FailFast)
        );
        assert_eq!(
            "best-effort".parse::<BackfillPolicy>(),
            Ok(BackfillPolicy::BestEffort)
        );
        assert!("sometimes".parse::<BackfillPolicy>().is_err());
    }
}
