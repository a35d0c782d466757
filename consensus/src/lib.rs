//! Replicate a chain of blocks among simulated Byzantine peers.
//!
//! This crate implements a PBFT-style replicated state machine on top of
//! [simbft_transport]: three-phase quorum certification
//! (pre-prepare/prepare/commit), checkpointing with log garbage collection,
//! and view-change/new-view leader replacement on timeout. Messages carry a
//! placeholder validity flag instead of signatures, and their simulated wire
//! sizes come from a configured size table — studying protocol behavior under
//! network conditions is the point, not cryptography.
//!
//! A [replica::Replica] is an actor owning its own log, chain, and transaction
//! queue; the [coordinator::Coordinator] drives rounds by commanding the
//! current view's leader to propose. The only state shared between them is
//! [coordinator::NetworkState] (the view counter and authority list).

use thiserror::Error;

pub mod coordinator;
pub mod faults;
pub mod messages;
pub mod queue;
pub mod replica;
pub mod sampler;
pub mod types;

/// Errors that can occur when interacting with consensus components.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown parent: {0}")]
    UnknownParent(types::Digest),
    #[error("conflicting block at height {0}")]
    ConflictingBlock(u64),
    #[error("mailbox closed")]
    Closed,
}
