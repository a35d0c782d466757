//! Implementation of a simulated network with per-link performance
//! characteristics (latency, jitter, throughput, loss).

mod metrics;
mod network;
pub use network::{Config, Link, LinkStats, Network, Propagation, Receiver, Sender};

use crate::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message too large: {0} bytes")]
    MessageTooLarge(u64),
    #[error("network closed")]
    NetworkClosed,
    #[error("address already registered: {0}")]
    AlreadyRegistered(NodeId),
    #[error("not valid to link self")]
    LinkingSelf,
    #[error("invalid success rate (must be in [0, 1]): {0}")]
    InvalidSuccessRate(f64),
    #[error("invalid throughput (must be non-zero)")]
    InvalidThroughput,
}
