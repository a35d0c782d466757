//! Blocks, transactions, and the per-replica chain.

use crate::Error;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use simbft_transport::NodeId;
use std::collections::BTreeMap;
use std::fmt;

/// A 32-byte block identifier derived from the header fields.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Digest([u8; 32]);

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Truncated like a log-friendly hash prefix
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A transfer between two accounts.
///
/// Transactions are immutable and identified by their (placeholder) signature:
/// a queue holds at most one transaction per signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: NodeId,
    pub to: NodeId,
    pub value: u64,
    pub fee: u64,
    pub signature: u64,
}

/// Header of a block; the hash is derived deterministically from the
/// remaining fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent: Digest,
    pub number: u64,
    /// Virtual milliseconds since the simulation epoch.
    pub timestamp: u64,
    pub proposer: NodeId,
    pub weight: u64,
    pub hash: Digest,
}

impl BlockHeader {
    pub fn new(parent: Digest, number: u64, timestamp: u64, proposer: NodeId, weight: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(parent.0);
        hasher.update(number.to_be_bytes());
        hasher.update(timestamp.to_be_bytes());
        hasher.update(proposer.0.to_be_bytes());
        hasher.update(weight.to_be_bytes());
        let hash = Digest(hasher.finalize().into());
        Self {
            parent,
            number,
            timestamp,
            proposer,
            weight,
            hash,
        }
    }

    fn genesis() -> Self {
        Self::new(Digest::default(), 0, 0, NodeId::default(), 0)
    }
}

/// A block is immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Digest {
        self.header.hash
    }
}

/// Compact description of a replica's chain, emitted in the report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub height: u64,
    pub head: Digest,
    pub blocks: u64,
    pub transactions: u64,
}

/// Serialized form of a chain (the persisted-snapshot interface).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub genesis: Block,
    /// Non-genesis blocks in height order.
    pub blocks: Vec<Block>,
}

/// Append-only sequence of blocks keyed by hash.
///
/// Owned per-replica; grows only via [Chain::add_block] and is never
/// rewritten (no reorg logic).
#[derive(Clone, Debug)]
pub struct Chain {
    blocks: BTreeMap<Digest, Block>,
    by_height: BTreeMap<u64, Digest>,
    genesis: Digest,
    head: Digest,
}

impl Chain {
    /// Create a chain holding only the genesis block.
    pub fn genesis() -> Self {
        let genesis = Block::new(BlockHeader::genesis(), Vec::new());
        let hash = genesis.hash();
        let mut blocks = BTreeMap::new();
        blocks.insert(hash, genesis);
        let mut by_height = BTreeMap::new();
        by_height.insert(0, hash);
        Self {
            blocks,
            by_height,
            genesis: hash,
            head: hash,
        }
    }

    /// Append a block whose parent is already present.
    ///
    /// Re-adding a known block is a no-op. A different block at an occupied
    /// height is rejected: there is no reorg in this model.
    pub fn add_block(&mut self, block: Block) -> Result<(), Error> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return Ok(());
        }
        if !self.blocks.contains_key(&block.header.parent) {
            return Err(Error::UnknownParent(block.header.parent));
        }
        if self.by_height.contains_key(&block.header.number) {
            return Err(Error::ConflictingBlock(block.header.number));
        }
        self.by_height.insert(block.header.number, hash);
        if block.header.number > self.head().header.number {
            self.head = hash;
        }
        self.blocks.insert(hash, block);
        Ok(())
    }

    pub fn get(&self, hash: &Digest) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &Digest) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn head(&self) -> &Block {
        &self.blocks[&self.head]
    }

    pub fn genesis_block(&self) -> &Block {
        &self.blocks[&self.genesis]
    }

    pub fn height(&self) -> u64 {
        self.head().header.number
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            height: self.height(),
            head: self.head,
            blocks: self.blocks.len() as u64,
            transactions: self
                .blocks
                .values()
                .map(|block| block.transactions.len() as u64)
                .sum(),
        }
    }

    /// Capture the chain as a serializable snapshot.
    pub fn capture(&self) -> Snapshot {
        Snapshot {
            genesis: self.genesis_block().clone(),
            blocks: self
                .by_height
                .iter()
                .filter(|(height, _)| **height > 0)
                .map(|(_, hash)| self.blocks[hash].clone())
                .collect(),
        }
    }

    /// Rebuild a chain from a snapshot, re-checking the append-only
    /// invariants.
    pub fn restore(snapshot: Snapshot) -> Result<Self, Error> {
        let mut chain = Self::genesis();
        for block in snapshot.blocks {
            chain.add_block(block)?;
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(parent: &Block, number: u64, proposer: u32) -> Block {
        Block::new(
            BlockHeader::new(parent.hash(), number, number * 1_000, NodeId(proposer), number),
            Vec::new(),
        )
    }

    #[test]
    fn test_header_hash_deterministic() {
        let a = BlockHeader::new(Digest::default(), 1, 42, NodeId(3), 1);
        let b = BlockHeader::new(Digest::default(), 1, 42, NodeId(3), 1);
        assert_eq!(a.hash, b.hash);

        let c = BlockHeader::new(Digest::default(), 1, 43, NodeId(3), 1);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_chain_grows_from_genesis() {
        let mut chain = Chain::genesis();
        let first = block(chain.genesis_block(), 1, 0);
        chain.add_block(first.clone()).unwrap();
        let second = block(&first, 2, 1);
        chain.add_block(second.clone()).unwrap();

        assert_eq!(chain.height(), 2);
        assert_eq!(chain.head().hash(), second.hash());
        assert!(chain.contains(&first.hash()));
    }

    #[test]
    fn test_chain_rejects_unknown_parent() {
        let mut chain = Chain::genesis();
        let orphan = Block::new(
            BlockHeader::new(Digest([9; 32]), 1, 0, NodeId(0), 1),
            Vec::new(),
        );
        assert!(matches!(
            chain.add_block(orphan),
            Err(Error::UnknownParent(_))
        ));
    }

    #[test]
    fn test_chain_never_reorgs() {
        let mut chain = Chain::genesis();
        let first = block(chain.genesis_block(), 1, 0);
        chain.add_block(first.clone()).unwrap();

        // Re-adding the same block is fine
        chain.add_block(first.clone()).unwrap();
        assert_eq!(chain.summary().blocks, 2);

        // A different block at the same height is not
        let rival = block(chain.genesis_block(), 1, 7);
        assert_ne!(rival.hash(), first.hash());
        assert!(matches!(
            chain.add_block(rival),
            Err(Error::ConflictingBlock(1))
        ));
        assert_eq!(chain.head().hash(), first.hash());
    }

    #[test]
    fn test_snapshot_restores_chain() {
        let mut chain = Chain::genesis();
        let first = block(chain.genesis_block(), 1, 0);
        chain.add_block(first.clone()).unwrap();
        let second = block(&first, 2, 1);
        chain.add_block(second).unwrap();

        let restored = Chain::restore(chain.capture()).unwrap();
        assert_eq!(restored.height(), chain.height());
        assert_eq!(restored.head().hash(), chain.head().hash());
        assert_eq!(restored.summary(), chain.summary());
    }
}
