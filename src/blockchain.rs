//! Chain and mempool state: validation, the chain-replacement rule and
//! balance accounting.
//!
//! `Blockchain` is a plain struct; the owning [`crate::node::Node`] wraps it
//! in a single mutex so every mutating operation is serialized and critical
//! sections stay short. No network I/O happens while that lock is held.

use crate::block::{Block, DIFFICULTY};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Fixed coinbase reward per mined block.
pub const MINING_REWARD: f64 = 50.0;

/// Serializable view of the full node state, exchanged in `RESPONSE_CHAIN`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainSnapshot {
    pub chain: Vec<Block>,
    pub pending_transactions: Vec<Transaction>,
}

#[derive(Debug)]
pub struct Blockchain {
    chain: Vec<Block>,
    pending: Vec<Transaction>,
    /// Ids of pending transactions, for O(1) duplicate detection.
    pending_ids: HashSet<String>,
}

impl Blockchain {
    /// A fresh chain holding only the genesis constant.
    pub fn new() -> Self {
        Blockchain {
            chain: vec![Block::genesis()],
            pending: Vec::new(),
            pending_ids: HashSet::new(),
        }
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Number of blocks, genesis included.
    pub fn height(&self) -> usize {
        self.chain.len()
    }

    pub fn last_block(&self) -> &Block {
        self.chain.last().expect("chain always holds genesis")
    }

    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    /// Pending transactions ordered by descending value. The sort is stable,
    /// so equal values keep their arrival order.
    pub fn pending_by_priority(&self) -> Vec<Transaction> {
        let mut txs = self.pending.clone();
        txs.sort_by(|a, b| {
            b.valor()
                .partial_cmp(&a.valor())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        txs
    }

    /// Queue a transaction. Rejects non-positive values, ids already
    /// pending, and ids already confirmed in a block. Idempotent per id.
    pub fn add_transaction(&mut self, tx: Transaction) -> bool {
        if tx.valor() <= 0.0 {
            return false;
        }
        if self.pending_ids.contains(&tx.id) || self.contains_transaction(&tx.id) {
            return false;
        }
        self.pending_ids.insert(tx.id.clone());
        self.pending.push(tx);
        true
    }

    /// Append a block if it extends the tip with a valid proof. Confirmed
    /// transactions are dropped from the mempool in one pass. Never panics
    /// on bad input; invalid blocks are silently refused.
    pub fn add_block(&mut self, block: Block) -> bool {
        if !self.is_valid_block(&block) {
            debug!(index = block.index, "rejected block");
            return false;
        }
        let confirmed: HashSet<&str> = block
            .transactions
            .iter()
            .map(|tx| tx.id.as_str())
            .collect();
        self.pending.retain(|tx| !confirmed.contains(tx.id.as_str()));
        self.pending_ids
            .retain(|id| !confirmed.contains(id.as_str()));
        drop(confirmed);
        self.chain.push(block);
        true
    }

    fn is_valid_block(&self, block: &Block) -> bool {
        block.index == self.chain.len() as u64
            && block.previous_hash == self.last_block().hash
            && block.is_valid_proof(DIFFICULTY)
    }

    /// Validate a foreign chain: its first block must match the local
    /// genesis constant byte-for-byte (by canonical form) and every later
    /// block must satisfy the link and proof invariants.
    pub fn is_valid_chain(chain: &[Block]) -> bool {
        let Some(first) = chain.first() else {
            return false;
        };
        if first.canonical_json() != Block::genesis().canonical_json() {
            return false;
        }
        chain.windows(2).all(|pair| {
            let (prev, current) = (&pair[0], &pair[1]);
            current.index == prev.index + 1
                && current.previous_hash == prev.hash
                && current.is_valid_proof(DIFFICULTY)
        })
    }

    /// Adopt `new_chain` when it is strictly longer and valid. Pending
    /// transactions already confirmed by the new chain are dropped; the
    /// rest stay queued and may still be mined later.
    pub fn replace_chain(&mut self, new_chain: Vec<Block>) -> bool {
        if new_chain.len() <= self.chain.len() {
            return false;
        }
        if !Self::is_valid_chain(&new_chain) {
            return false;
        }
        let confirmed: HashSet<&str> = new_chain
            .iter()
            .flat_map(|block| &block.transactions)
            .map(|tx| tx.id.as_str())
            .collect();
        self.pending.retain(|tx| !confirmed.contains(tx.id.as_str()));
        self.pending_ids
            .retain(|id| !confirmed.contains(id.as_str()));
        drop(confirmed);
        self.chain = new_chain;
        true
    }

    /// Confirmed balance: incoming minus outgoing across accepted blocks.
    /// The mempool is ignored.
    pub fn get_balance(&self, address: &str) -> f64 {
        let mut balance = 0.0;
        for block in &self.chain {
            for tx in &block.transactions {
                if tx.destino == address {
                    balance += tx.valor();
                }
                if tx.origem == address {
                    balance -= tx.valor();
                }
            }
        }
        balance
    }

    /// Confirmed balance minus pending outgoing value, for drivers that
    /// want to warn before queueing an overdraft.
    pub fn available_balance(&self, address: &str) -> f64 {
        let outgoing: f64 = self
            .pending
            .iter()
            .filter(|tx| tx.origem == address)
            .map(|tx| tx.valor())
            .sum();
        self.get_balance(address) - outgoing
    }

    /// Whether `id` is already confirmed in some accepted block.
    pub fn contains_transaction(&self, id: &str) -> bool {
        self.chain
            .iter()
            .any(|block| block.transactions.iter().any(|tx| tx.id == id))
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            chain: self.chain.clone(),
            pending_transactions: self.pending.clone(),
        }
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}
