//! The run's output: a mapping from metric key to value.

use serde::Serialize;
use serde_json::json;
use simbft_consensus::types::ChainSummary;
use std::collections::BTreeMap;

/// Mean observed delivery performance of one directed link.
#[derive(Clone, Debug, Serialize)]
pub struct LinkReport {
    pub delivered: u64,
    pub mean_ms: f64,
}

/// Everything a run emits: propagation times per link, per-replica chain
/// summaries, and the simulation window.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    /// Virtual milliseconds at which the run started/ended.
    pub start_ms: u64,
    pub end_ms: u64,
    /// Rounds the coordinator drove before stopping.
    pub rounds: u64,
    /// The network view at the end of the run.
    pub final_view: u64,
    pub chains: BTreeMap<String, ChainSummary>,
    pub propagation: BTreeMap<String, LinkReport>,
}

impl Report {
    /// Flatten into a metric-key → value map.
    pub fn metrics(&self) -> BTreeMap<String, serde_json::Value> {
        let mut metrics = BTreeMap::new();
        metrics.insert("start_simulation_ms".to_string(), json!(self.start_ms));
        metrics.insert("end_simulation_ms".to_string(), json!(self.end_ms));
        metrics.insert("rounds".to_string(), json!(self.rounds));
        metrics.insert("final_view".to_string(), json!(self.final_view));
        for (replica, summary) in &self.chains {
            metrics.insert(format!("chain_{replica}"), json!(summary));
        }
        for (link, stats) in &self.propagation {
            metrics.insert(format!("propagation_{link}"), json!(stats));
        }
        metrics
    }
}
