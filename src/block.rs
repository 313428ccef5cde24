//! Block structure, canonical hashing and the proof-of-work predicate.

use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use serde_json::Number;
use sha2::{Digest, Sha256};

/// Required hex prefix of a valid block hash.
pub const DIFFICULTY: &str = "000";

/// Hash of the genesis block. Network constant: every conforming
/// implementation hard-codes the same literal and never re-derives it.
pub const GENESIS_HASH: &str = "816534932c2b7154836da6afc367695e6337db8a921823784c14378abed4f7d7";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    /// 0-based height in the chain.
    pub index: u64,
    /// Hex hash of the parent block; 64 zeros for genesis.
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    pub timestamp: Number,
    /// SHA-256 of the canonical body, 64 lowercase hex chars.
    pub hash: String,
}

impl Block {
    /// The fixed first block of every chain. Constructed as a literal; no
    /// hashing is performed.
    pub fn genesis() -> Self {
        Block {
            index: 0,
            previous_hash: "0".repeat(64),
            transactions: Vec::new(),
            nonce: 0,
            timestamp: Number::from(0u64),
            hash: GENESIS_HASH.to_string(),
        }
    }

    /// SHA-256 over the canonical JSON of the block body, i.e. every field
    /// except `hash`, keys recursively sorted, no whitespace. Lowercase hex.
    pub fn compute_hash(&self) -> String {
        let digest = Sha256::digest(self.canonical_body().as_bytes());
        hex::encode(digest)
    }

    /// Canonical JSON encoding of the hashed body. `serde_json` maps keep
    /// their keys in sorted order, which gives the recursive key ordering
    /// the protocol requires.
    fn canonical_body(&self) -> String {
        serde_json::json!({
            "index": self.index,
            "previous_hash": self.previous_hash,
            "transactions": self.transactions,
            "nonce": self.nonce,
            "timestamp": self.timestamp,
        })
        .to_string()
    }

    /// Canonical JSON of the whole block, `hash` included. Used for the
    /// byte-identity comparison against the genesis constant.
    pub fn canonical_json(&self) -> String {
        serde_json::to_value(self)
            .map(|value| value.to_string())
            .unwrap_or_default()
    }

    /// True when the stored hash both carries the difficulty prefix and
    /// matches a fresh recomputation of the body.
    pub fn is_valid_proof(&self, difficulty: &str) -> bool {
        self.hash.starts_with(difficulty) && self.hash == self.compute_hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash.chars().all(|c| c == '0')
    }
}
