//! Send messages between simulated peers with configurable latency,
//! bandwidth, and loss.
//!
//! Payloads are in-memory structured values, not encoded bytes: the transport
//! charges transmission time from the size reported by [Measured] instead of
//! serializing anything. Delivery is asynchronous on the virtual clock of
//! [simbft_runtime]: a message sent over a link arrives after the link's
//! propagation delay (sampled) plus its transmission delay (size over
//! throughput), wrapped in an [Envelope] recording who sent it and when.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

pub mod simulated;

/// Identifies a peer in the simulated network.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enum indicating the set of recipients to send a message to.
///
/// The sender itself is always skipped, even when explicitly listed.
#[derive(Clone, Debug)]
pub enum Recipients {
    All,
    Some(Vec<NodeId>),
    One(NodeId),
}

/// An in-memory payload whose simulated wire size is known.
pub trait Measured {
    /// Simulated size of the payload in bytes.
    fn size_bytes(&self) -> u64;

    /// Short label naming the payload kind (used for metrics and fault
    /// injection).
    fn kind(&self) -> &'static str;
}

/// The timestamped, addressed wrapper around a payload in transit.
///
/// Produced by a peer's send operation and consumed exactly once by the
/// destination's inbound processing loop.
#[derive(Clone, Debug)]
pub struct Envelope<P> {
    pub payload: P,
    pub sent: SystemTime,
    pub origin: NodeId,
    pub destination: NodeId,
}
