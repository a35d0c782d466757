//! FIFO store of pending transactions feeding block construction.

use crate::types::Transaction;
use std::collections::{HashMap, VecDeque};

/// Per-replica pending-transaction store.
///
/// Transactions are identified by their signature: putting a transaction
/// whose signature is already pending overwrites the pending entry in place
/// (its queue position is kept).
#[derive(Debug, Default)]
pub struct TransactionQueue {
    pending: VecDeque<u64>,
    by_signature: HashMap<u64, Transaction>,
}

impl TransactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a transaction (or overwrite the pending one with the same
    /// signature).
    pub fn put(&mut self, transaction: Transaction) {
        let signature = transaction.signature;
        if self.by_signature.insert(signature, transaction).is_none() {
            self.pending.push_back(signature);
        }
    }

    /// Pop the oldest pending transaction.
    pub fn get(&mut self) -> Option<Transaction> {
        while let Some(signature) = self.pending.pop_front() {
            if let Some(transaction) = self.by_signature.remove(&signature) {
                return Some(transaction);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.by_signature.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_signature.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simbft_transport::NodeId;

    fn transaction(signature: u64, value: u64) -> Transaction {
        Transaction {
            from: NodeId(0),
            to: NodeId(1),
            value,
            fee: 1,
            signature,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = TransactionQueue::new();
        for signature in 0..5 {
            queue.put(transaction(signature, signature));
        }
        assert_eq!(queue.len(), 5);
        for signature in 0..5 {
            assert_eq!(queue.get().unwrap().signature, signature);
        }
        assert!(queue.is_empty());
        assert!(queue.get().is_none());
    }

    #[test]
    fn test_duplicate_signature_overwrites() {
        let mut queue = TransactionQueue::new();
        queue.put(transaction(1, 10));
        queue.put(transaction(2, 20));
        queue.put(transaction(1, 99));

        assert_eq!(queue.len(), 2);
        let first = queue.get().unwrap();
        assert_eq!(first.signature, 1);
        assert_eq!(first.value, 99);
        assert_eq!(queue.get().unwrap().signature, 2);
    }
}
