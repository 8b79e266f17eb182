//! # config
//!
//! why: hold the static cluster membership and timing knobs a node reads at startup
//! relations: consumed by node.rs (quorum, payload bound) and raft-node (timers, addresses)
//! what: RaftConfig timing settings, ClusterConfig membership loaded from json

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::NodeId;

/// Timing and batching configuration for a raft node. All durations are milliseconds.
///
/// Keep `heartbeat_interval` a small fraction of `election_timeout_min` so that a
/// healthy leader always reaches its followers before they time out, and keep
/// `rpc_timeout` at or below `election_timeout_min` so a stalled peer surfaces as a
/// failed reply before the next election round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound (exclusive) of the randomized election timeout
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats / replication rounds
    pub heartbeat_interval: u64,
    /// Per-call timeout for outbound rpcs
    pub rpc_timeout: u64,
    /// Maximum number of entries carried by a single AppendEntries
    pub max_payload_entries: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_payload_entries: 64,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::ElectionTimeout {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::Zero { name: "heartbeat_interval" });
        }
        if self.election_timeout_min <= self.heartbeat_interval {
            return Err(ConfigError::ElectionTimeoutLTHeartBeat {
                election_timeout_min: self.election_timeout_min,
                heartbeat_interval: self.heartbeat_interval,
            });
        }
        if self.rpc_timeout == 0 {
            return Err(ConfigError::Zero { name: "rpc_timeout" });
        }
        if self.rpc_timeout > self.election_timeout_min {
            return Err(ConfigError::RpcTimeoutGTElectionTimeout {
                rpc_timeout: self.rpc_timeout,
                election_timeout_min: self.election_timeout_min,
            });
        }
        if self.max_payload_entries == 0 {
            return Err(ConfigError::Zero { name: "max_payload_entries" });
        }
        Ok(())
    }

    /// Draw a fresh election timeout uniformly from `[min, max)`.
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}

/// Static cluster membership: node id to network address, plus raft timings.
///
/// Loaded once at startup and never mutated; there is no membership change.
///
/// ```json
/// {
///   "nodes": { "1": "127.0.0.1:7101", "2": "127.0.0.1:7102", "3": "127.0.0.1:7103" },
///   "raft": { "election_timeout_min": 150, "election_timeout_max": 300 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: BTreeMap<NodeId, String>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl ClusterConfig {
    pub fn new(nodes: BTreeMap<NodeId, String>) -> Self {
        Self {
            nodes,
            raft: RaftConfig::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_json::from_str(contents)?;
        if config.nodes.is_empty() {
            return Err(ConfigError::EmptyCluster);
        }
        config.raft.validate()?;
        Ok(config)
    }

    /// Check that `id` is a configured member.
    pub fn validate_member(&self, id: NodeId) -> Result<(), ConfigError> {
        if self.nodes.contains_key(&id) {
            Ok(())
        } else {
            Err(ConfigError::UnknownNode(id))
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_election_range() {
        let config = RaftConfig {
            election_timeout_min: 300,
            election_timeout_max: 300,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ElectionTimeout { min: 300, max: 300 })
        ));
    }

    #[test]
    fn rejects_heartbeat_not_below_election_timeout() {
        let config = RaftConfig {
            heartbeat_interval: 150,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ElectionTimeoutLTHeartBeat { .. })
        ));
    }

    #[test]
    fn rejects_rpc_timeout_above_election_timeout() {
        let config = RaftConfig {
            rpc_timeout: 151,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RpcTimeoutGTElectionTimeout {
                rpc_timeout: 151,
                election_timeout_min: 150
            })
        ));

        let at_bound = RaftConfig {
            rpc_timeout: 150,
            ..Default::default()
        };
        assert!(at_bound.validate().is_ok());
    }

    #[test]
    fn random_timeout_stays_in_range() {
        let config = RaftConfig::default();
        for _ in 0..200 {
            let t = config.random_election_timeout();
            assert!(t >= Duration::from_millis(150));
            assert!(t < Duration::from_millis(300));
        }
    }

    #[test]
    fn random_timeouts_differ() {
        let config = RaftConfig::default();
        let draws: std::collections::BTreeSet<_> =
            (0..50).map(|_| config.random_election_timeout()).collect();
        assert!(draws.len() > 1);
    }

    #[test]
    fn cluster_config_parses_json() {
        let config = ClusterConfig::from_json(
            r#"{ "nodes": { "1": "127.0.0.1:7101", "2": "127.0.0.1:7102" },
                 "raft": { "heartbeat_interval": 20 } }"#,
        )
        .unwrap();
        assert_eq!(config.node_ids(), vec![1, 2]);
        assert_eq!(config.address(2), Some("127.0.0.1:7102"));
        assert_eq!(config.raft.heartbeat_interval, 20);
        assert_eq!(config.raft.election_timeout_min, 150);
        assert!(config.validate_member(1).is_ok());
        assert!(matches!(config.validate_member(9), Err(ConfigError::UnknownNode(9))));
    }

    #[test]
    fn cluster_config_rejects_empty_membership() {
        let err = ClusterConfig::from_json(r#"{ "nodes": {} }"#).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCluster));
    }
}
