//! The recognized configuration surface.
//!
//! Every missing or invalid value is a startup error naming the offending
//! key: a simulation either starts with a fully-specified world or not at
//! all.

use serde::Deserialize;
use simbft_consensus::{messages::MessageSizes, replica::ViewIncrement, sampler::Sampler};
use simbft_transport::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Regions with an id at or below this are authorities.
pub const AUTHORITY_REGION_MAX: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unrecognized blockchain kind: {0}")]
    UnknownBlockchain(String),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("duplicate node id in topology: {0}")]
    DuplicateNode(u32),
    #[error("no authority nodes in topology (regions 0..=3)")]
    NoAuthorities,
    #[error("missing link measurements for region pair {0} -> {1}")]
    MissingLink(u32, u32),
    #[error("workload references unknown node: {0}")]
    UnknownNode(u32),
}

/// Placement of a node in a region.
#[derive(Clone, Debug, Deserialize)]
pub struct NodePlacement {
    pub node: u32,
    pub region: u32,
}

/// Measured characteristics of the path between two regions.
#[derive(Clone, Debug, Deserialize)]
pub struct RegionLink {
    pub from_region: u32,
    pub to_region: u32,
    pub latency_ms: f64,
    #[serde(default)]
    pub jitter_ms: f64,
    /// Bytes per second; omitted means unlimited.
    #[serde(default)]
    pub throughput_bps: Option<u64>,
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
}

fn default_success_rate() -> f64 {
    1.0
}

/// One workload entry: enqueue `count` transactions at `node` at virtual time
/// `at_seconds`.
#[derive(Clone, Debug, Deserialize)]
pub struct Arrival {
    pub at_seconds: f64,
    pub node: u32,
    pub count: u64,
}

fn default_view_increment() -> ViewIncrement {
    ViewIncrement::ByTimeoutCount
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub blockchain: String,
    pub block_size_limit: u64,
    pub transactions_per_block: Sampler,
    pub message_size_kb: MessageSizes,
    pub checkpoint_interval: u64,
    pub checkpoint_delay_seconds: f64,
    pub validation_delay: Sampler,
    pub timeout_value_seconds: f64,
    pub malicious_drop_probability: f64,
    pub consecutive_empty_rounds_to_stop: u32,
    #[serde(default = "default_view_increment")]
    pub view_increment: ViewIncrement,
    pub time_between_blocks: Sampler,
    pub topology: Vec<NodePlacement>,
    pub links: Vec<RegionLink>,
    #[serde(default)]
    pub workload: Vec<Arrival>,
}

impl Config {
    /// Parse and validate a configuration document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.blockchain != "pbft" {
            return Err(ConfigError::UnknownBlockchain(self.blockchain.clone()));
        }
        if self.block_size_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "block_size_limit",
                reason: "must be non-zero".into(),
            });
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid {
                key: "checkpoint_interval",
                reason: "must be non-zero".into(),
            });
        }
        if self.checkpoint_delay_seconds <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "checkpoint_delay_seconds",
                reason: "must be positive".into(),
            });
        }
        if self.timeout_value_seconds <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "timeout_value_seconds",
                reason: "must be positive".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.malicious_drop_probability) {
            return Err(ConfigError::Invalid {
                key: "malicious_drop_probability",
                reason: format!("{} is not in [0, 1]", self.malicious_drop_probability),
            });
        }
        if self.consecutive_empty_rounds_to_stop == 0 {
            return Err(ConfigError::Invalid {
                key: "consecutive_empty_rounds_to_stop",
                reason: "must be non-zero".into(),
            });
        }
        if self.topology.is_empty() {
            return Err(ConfigError::Invalid {
                key: "topology",
                reason: "must name at least one node".into(),
            });
        }

        // Node ids are unique and at least one is an authority
        let mut nodes = BTreeSet::new();
        for placement in &self.topology {
            if !nodes.insert(placement.node) {
                return Err(ConfigError::DuplicateNode(placement.node));
            }
        }
        if self.authorities().is_empty() {
            return Err(ConfigError::NoAuthorities);
        }

        // Every ordered region pair in play needs measurements
        let links: BTreeSet<(u32, u32)> = self
            .links
            .iter()
            .map(|link| (link.from_region, link.to_region))
            .collect();
        for link in &self.links {
            if !(0.0..=1.0).contains(&link.success_rate) {
                return Err(ConfigError::Invalid {
                    key: "links.success_rate",
                    reason: format!("{} is not in [0, 1]", link.success_rate),
                });
            }
        }
        for a in &self.topology {
            for b in &self.topology {
                if a.node == b.node {
                    continue;
                }
                if !links.contains(&(a.region, b.region)) {
                    return Err(ConfigError::MissingLink(a.region, b.region));
                }
            }
        }

        // Workload only targets known nodes
        for arrival in &self.workload {
            if !nodes.contains(&arrival.node) {
                return Err(ConfigError::UnknownNode(arrival.node));
            }
        }
        Ok(())
    }

    /// All nodes, in topology order.
    pub fn participants(&self) -> Vec<NodeId> {
        self.topology
            .iter()
            .map(|placement| NodeId(placement.node))
            .collect()
    }

    /// Nodes in authority regions, in topology order.
    pub fn authorities(&self) -> Vec<NodeId> {
        self.topology
            .iter()
            .filter(|placement| placement.region <= AUTHORITY_REGION_MAX)
            .map(|placement| NodeId(placement.node))
            .collect()
    }

    /// Region of a node (topology is validated, so lookups cannot miss).
    pub fn region_of(&self, node: NodeId) -> u32 {
        self.topology
            .iter()
            .find(|placement| placement.node == node.0)
            .map(|placement| placement.region)
            .expect("node exists in topology")
    }

    /// Link measurements indexed by ordered region pair.
    pub fn link_table(&self) -> BTreeMap<(u32, u32), &RegionLink> {
        self.links
            .iter()
            .map(|link| ((link.from_region, link.to_region), link))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "blockchain": "pbft",
            "block_size_limit": 1,
            "transactions_per_block": {"distribution": "fixed", "value": 10.0},
            "message_size_kb": {
                "status": 0.5, "tx": 0.25, "hash": 0.03, "prepare": 0.1,
                "commit": 0.1, "reply": 0.5, "block_bodies": 1.0,
                "checkpoint": 0.1, "view_change": 0.5, "new_view": 0.5
            },
            "checkpoint_interval": 5,
            "checkpoint_delay_seconds": 10.0,
            "validation_delay": {"distribution": "fixed", "value": 0.0},
            "timeout_value_seconds": 30.0,
            "malicious_drop_probability": 0.0,
            "consecutive_empty_rounds_to_stop": 3,
            "time_between_blocks": {"distribution": "fixed", "value": 5.0},
            "topology": [
                {"node": 0, "region": 1},
                {"node": 1, "region": 1}
            ],
            "links": [
                {"from_region": 1, "to_region": 1, "latency_ms": 10.0}
            ]
        })
    }

    #[test]
    fn test_minimal_config_parses() {
        let config = Config::from_json(&minimal().to_string()).unwrap();
        assert_eq!(config.participants().len(), 2);
        assert_eq!(config.authorities().len(), 2);
        assert_eq!(config.view_increment, ViewIncrement::ByTimeoutCount);
        assert_eq!(config.region_of(NodeId(1)), 1);
    }

    #[test]
    fn test_unknown_blockchain_fails() {
        let mut raw = minimal();
        raw["blockchain"] = "tendermint".into();
        let err = Config::from_json(&raw.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBlockchain(kind) if kind == "tendermint"));
    }

    #[test]
    fn test_missing_link_fails() {
        let mut raw = minimal();
        raw["topology"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({"node": 2, "region": 4}));
        let err = Config::from_json(&raw.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingLink(_, _)));
    }

    #[test]
    fn test_bad_probability_fails() {
        let mut raw = minimal();
        raw["malicious_drop_probability"] = 1.5.into();
        let err = Config::from_json(&raw.to_string()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "malicious_drop_probability",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_workload_node_fails() {
        let mut raw = minimal();
        raw["workload"] =
            serde_json::json!([{"at_seconds": 1.0, "node": 9, "count": 10}]);
        let err = Config::from_json(&raw.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode(9)));
    }

    #[test]
    fn test_unknown_key_fails() {
        let mut raw = minimal();
        raw["hashrate"] = 17.into();
        assert!(matches!(
            Config::from_json(&raw.to_string()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_authority_split_by_region() {
        let mut raw = minimal();
        raw["topology"] = serde_json::json!([
            {"node": 0, "region": 1},
            {"node": 1, "region": 3},
            {"node": 2, "region": 4}
        ]);
        raw["links"] = serde_json::json!([
            {"from_region": 1, "to_region": 1, "latency_ms": 10.0},
            {"from_region": 1, "to_region": 3, "latency_ms": 10.0},
            {"from_region": 1, "to_region": 4, "latency_ms": 10.0},
            {"from_region": 3, "to_region": 1, "latency_ms": 10.0},
            {"from_region": 3, "to_region": 4, "latency_ms": 10.0},
            {"from_region": 4, "to_region": 1, "latency_ms": 10.0},
            {"from_region": 4, "to_region": 3, "latency_ms": 10.0}
        ]);
        let config = Config::from_json(&raw.to_string()).unwrap();
        assert_eq!(config.authorities(), vec![NodeId(0), NodeId(1)]);
        assert_eq!(config.participants().len(), 3);
    }
}
