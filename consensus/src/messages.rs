//! Typed protocol payloads and their simulated sizes.
//!
//! Payloads are never encoded: the [Catalog] stamps each one with a byte size
//! computed from the configured per-kind table (`items × per_item + overhead`,
//! in kilobytes) and the transport charges transmission time from that.

use crate::types::{Block, Chain, Digest, Transaction};
use serde::{Deserialize, Serialize};
use simbft_transport::{Measured, NodeId};
use std::collections::BTreeSet;

/// Simulated size of each message kind, in kilobytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageSizes {
    pub status: f64,
    pub tx: f64,
    pub hash: f64,
    pub prepare: f64,
    pub commit: f64,
    pub reply: f64,
    pub block_bodies: f64,
    pub checkpoint: f64,
    pub view_change: f64,
    pub new_view: f64,
}

fn kb(kilobytes: f64) -> u64 {
    (kilobytes * 1024.0) as u64
}

/// Inform a peer of our current chain state.
///
/// Sent after connecting and prior to any protocol messages.
#[derive(Clone, Debug)]
pub struct Status {
    pub head: Digest,
    pub genesis: Digest,
    pub height: u64,
    pub size: u64,
}

/// Transactions the peer should make sure are on its queue.
#[derive(Clone, Debug)]
pub struct Transactions {
    pub transactions: Vec<Transaction>,
    pub size: u64,
}

/// The primary's proposal for a sequence number.
///
/// `block == None` is the view-change no-op placeholder. `valid` stands in
/// for a digest check: this simulation carries no signatures.
#[derive(Clone, Debug)]
pub struct PrePrepare {
    pub view: u64,
    pub sequence: u64,
    pub digest: Digest,
    pub block: Option<Block>,
    pub replay: bool,
    pub valid: bool,
    pub size: u64,
}

/// A replica's vote that it accepted the proposal for a sequence number.
#[derive(Clone, Debug)]
pub struct Prepare {
    pub view: u64,
    pub sequence: u64,
    pub digest: Digest,
    pub replica: NodeId,
    pub size: u64,
}

/// A replica's vote that the proposal is prepared.
#[derive(Clone, Debug)]
pub struct Commit {
    pub view: u64,
    pub sequence: u64,
    pub digest: Digest,
    pub replica: NodeId,
    pub size: u64,
}

/// A replica's vote to advance the stable watermark to a sequence number.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub sequence: u64,
    pub digest: Digest,
    pub replica: NodeId,
    pub size: u64,
}

/// A prepared-but-uncommitted sequence number carried by a view-change.
#[derive(Clone, Debug)]
pub struct PreparedProof {
    pub sequence: u64,
    pub digest: Digest,
    pub block: Option<Block>,
}

/// A replica's demand to replace the primary of `new_view - 1`.
#[derive(Clone, Debug)]
pub struct ViewChange {
    pub new_view: u64,
    pub last_stable: u64,
    pub stable_votes: BTreeSet<NodeId>,
    pub prepared: Vec<PreparedProof>,
    pub replica: NodeId,
    pub size: u64,
}

/// The new primary's announcement of the adopted view.
#[derive(Clone, Debug)]
pub struct NewView {
    pub view: u64,
    pub view_changes: Vec<ViewChange>,
    pub replays: Vec<PrePrepare>,
    pub size: u64,
}

/// Result of a committed sequence number, addressed to non-authorities.
#[derive(Clone, Debug)]
pub struct Reply {
    pub view: u64,
    pub sequence: u64,
    pub digest: Digest,
    pub block: Block,
    pub replica: NodeId,
    pub size: u64,
}

/// The protocol message set.
#[derive(Clone, Debug)]
pub enum Payload {
    Status(Status),
    Transactions(Transactions),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
    Reply(Reply),
}

impl Measured for Payload {
    fn size_bytes(&self) -> u64 {
        match self {
            Self::Status(message) => message.size,
            Self::Transactions(message) => message.size,
            Self::PrePrepare(message) => message.size,
            Self::Prepare(message) => message.size,
            Self::Commit(message) => message.size,
            Self::Checkpoint(message) => message.size,
            Self::ViewChange(message) => message.size,
            Self::NewView(message) => message.size,
            Self::Reply(message) => message.size,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Transactions(_) => "transactions",
            Self::PrePrepare(_) => "pre-prepare",
            Self::Prepare(_) => "prepare",
            Self::Commit(_) => "commit",
            Self::Checkpoint(_) => "checkpoint",
            Self::ViewChange(_) => "view-change",
            Self::NewView(_) => "new-view",
            Self::Reply(_) => "reply",
        }
    }
}

/// Builds typed payloads for one replica and computes their simulated sizes.
///
/// The catalog owns the replica's monotonic pre-prepare sequence counter: it
/// advances on every fresh proposal (never on a view-change replay) and floors
/// to any sequence number observed from the rest of the network.
#[derive(Clone, Debug)]
pub struct Catalog {
    replica: NodeId,
    sizes: MessageSizes,
    sequence: u64,
}

impl Catalog {
    pub fn new(replica: NodeId, sizes: MessageSizes) -> Self {
        Self {
            replica,
            sizes,
            sequence: 0,
        }
    }

    /// The last sequence number handed out or observed.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Floor the sequence counter to progress observed from other replicas.
    pub fn observe(&mut self, sequence: u64) {
        if sequence > self.sequence {
            self.sequence = sequence;
        }
    }

    pub fn status(&self, chain: &Chain) -> Payload {
        Payload::Status(Status {
            head: chain.head().hash(),
            genesis: chain.genesis_block().hash(),
            height: chain.height(),
            size: kb(self.sizes.status),
        })
    }

    pub fn transactions(&self, transactions: Vec<Transaction>) -> Payload {
        let size = kb(transactions.len() as f64 * self.sizes.tx);
        Payload::Transactions(Transactions { transactions, size })
    }

    /// Build a fresh proposal, advancing the sequence counter.
    pub fn pre_prepare(&mut self, view: u64, block: Block) -> Payload {
        self.sequence += 1;
        let size = kb(
            self.sizes.hash
                + self.sizes.block_bodies
                + block.transactions.len() as f64 * self.sizes.tx,
        );
        Payload::PrePrepare(PrePrepare {
            view,
            sequence: self.sequence,
            digest: block.hash(),
            block: Some(block),
            replay: false,
            valid: true,
            size,
        })
    }

    /// Re-issue a proposal during a view-change (the counter is untouched).
    pub fn pre_prepare_replay(
        &self,
        view: u64,
        sequence: u64,
        digest: Digest,
        block: Option<Block>,
    ) -> Payload {
        let size = match &block {
            Some(block) => kb(
                self.sizes.hash
                    + self.sizes.block_bodies
                    + block.transactions.len() as f64 * self.sizes.tx,
            ),
            None => kb(self.sizes.hash),
        };
        Payload::PrePrepare(PrePrepare {
            view,
            sequence,
            digest,
            block,
            replay: true,
            valid: true,
            size,
        })
    }

    pub fn prepare(&self, view: u64, sequence: u64, digest: Digest) -> Payload {
        Payload::Prepare(Prepare {
            view,
            sequence,
            digest,
            replica: self.replica,
            size: kb(self.sizes.prepare),
        })
    }

    pub fn commit(&self, view: u64, sequence: u64, digest: Digest) -> Payload {
        Payload::Commit(Commit {
            view,
            sequence,
            digest,
            replica: self.replica,
            size: kb(self.sizes.commit),
        })
    }

    pub fn checkpoint(&self, sequence: u64, digest: Digest) -> Payload {
        Payload::Checkpoint(Checkpoint {
            sequence,
            digest,
            replica: self.replica,
            size: kb(self.sizes.checkpoint),
        })
    }

    pub fn view_change(
        &self,
        new_view: u64,
        last_stable: u64,
        stable_votes: BTreeSet<NodeId>,
        prepared: Vec<PreparedProof>,
    ) -> Payload {
        let size = kb(self.sizes.view_change + prepared.len() as f64 * self.sizes.hash);
        Payload::ViewChange(ViewChange {
            new_view,
            last_stable,
            stable_votes,
            prepared,
            replica: self.replica,
            size,
        })
    }

    pub fn new_view(&self, view: u64, view_changes: Vec<ViewChange>, replays: Vec<PrePrepare>) -> Payload {
        let size = kb(
            self.sizes.new_view
                + view_changes.len() as f64 * self.sizes.view_change
                + replays.len() as f64 * self.sizes.hash,
        );
        Payload::NewView(NewView {
            view,
            view_changes,
            replays,
            size,
        })
    }

    pub fn reply(&self, view: u64, sequence: u64, block: Block) -> Payload {
        Payload::Reply(Reply {
            view,
            sequence,
            digest: block.hash(),
            block,
            replica: self.replica,
            size: kb(self.sizes.reply),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_sizes() -> MessageSizes {
    MessageSizes {
        status: 0.5,
        tx: 0.25,
        hash: 0.03,
        prepare: 0.1,
        commit: 0.1,
        reply: 0.5,
        block_bodies: 1.0,
        checkpoint: 0.1,
        view_change: 0.5,
        new_view: 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockHeader;

    fn catalog() -> Catalog {
        Catalog::new(NodeId(0), test_sizes())
    }

    fn block(transactions: usize) -> Block {
        let transactions = (0..transactions)
            .map(|signature| Transaction {
                from: NodeId(0),
                to: NodeId(1),
                value: 1,
                fee: 1,
                signature: signature as u64,
            })
            .collect();
        Block::new(
            BlockHeader::new(Digest::default(), 1, 0, NodeId(0), 1),
            transactions,
        )
    }

    #[test]
    fn test_size_table_arithmetic() {
        let catalog = catalog();

        // transactions: count × per-tx
        let payload = catalog.transactions(block(4).transactions);
        assert_eq!(payload.size_bytes(), kb(4.0 * 0.25));

        // prepare/commit/reply: fixed overhead
        let payload = catalog.prepare(0, 1, Digest::default());
        assert_eq!(payload.size_bytes(), kb(0.1));
        assert_eq!(payload.kind(), "prepare");
    }

    #[test]
    fn test_pre_prepare_counts_block_bodies() {
        let mut catalog = catalog();
        let payload = catalog.pre_prepare(0, block(8));
        assert_eq!(payload.size_bytes(), kb(0.03 + 1.0 + 8.0 * 0.25));
    }

    #[test]
    fn test_sequence_counter() {
        let mut catalog = catalog();
        assert_eq!(catalog.sequence(), 0);

        // Fresh proposals advance the counter
        let first = catalog.pre_prepare(0, block(0));
        let second = catalog.pre_prepare(0, block(0));
        match (first, second) {
            (Payload::PrePrepare(first), Payload::PrePrepare(second)) => {
                assert_eq!(first.sequence, 1);
                assert_eq!(second.sequence, 2);
            }
            _ => unreachable!(),
        }

        // Replays do not
        catalog.pre_prepare_replay(1, 2, Digest::default(), None);
        assert_eq!(catalog.sequence(), 2);

        // Observed progress floors the counter
        catalog.observe(10);
        assert_eq!(catalog.sequence(), 10);
        catalog.observe(4);
        assert_eq!(catalog.sequence(), 10);
    }
}
