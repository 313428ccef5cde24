//! Transaction value object and its canonical wire mapping.
//!
//! The wire field names (`origem`, `destino`, `valor`) are fixed by the
//! network protocol and shared by every interoperating implementation.
//! `valor` and `timestamp` are kept as raw JSON numbers so a peer's
//! integer-versus-float formatting survives a round trip bit-exactly and
//! re-hashing a received block reproduces its original digest.

use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Reserved source address of mining-reward transactions.
pub const COINBASE_ADDRESS: &str = "coinbase";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub origem: String,
    pub destino: String,
    pub valor: Number,
    pub timestamp: Number,
}

impl Transaction {
    /// Create a transaction with a fresh UUID and the current timestamp.
    ///
    /// Returns `None` when the value is non-positive or not finite; such
    /// transactions never enter the system through the local creation path.
    pub fn new(origem: &str, destino: &str, valor: f64) -> Option<Self> {
        if !valor.is_finite() || valor <= 0.0 {
            return None;
        }
        Some(Transaction {
            id: Uuid::new_v4().to_string(),
            origem: origem.to_string(),
            destino: destino.to_string(),
            valor: Number::from_f64(valor)?,
            timestamp: epoch_timestamp(),
        })
    }

    /// Mining-reward transaction credited to `miner_address`, stamped with
    /// the timestamp of the block it opens.
    pub fn coinbase(miner_address: &str, timestamp: Number) -> Self {
        Transaction {
            id: Uuid::new_v4().to_string(),
            origem: COINBASE_ADDRESS.to_string(),
            destino: miner_address.to_string(),
            valor: Number::from_f64(crate::blockchain::MINING_REWARD)
                .unwrap_or_else(|| Number::from(0u64)),
            timestamp,
        }
    }

    /// Numeric value of the transfer; zero for numbers outside f64 range.
    pub fn valor(&self) -> f64 {
        self.valor.as_f64().unwrap_or(0.0)
    }

    pub fn is_coinbase(&self) -> bool {
        self.origem == COINBASE_ADDRESS
    }
}

/// Current wall clock as fractional seconds since the Unix epoch.
pub fn epoch_timestamp() -> Number {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Number::from_f64(secs).unwrap_or_else(|| Number::from(0u64))
}
