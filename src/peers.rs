//! Peer table: liveness accounting, quarantine and bounded admission.
//!
//! Thread-safe in the same way the rest of the node's shared state is: the
//! map lives behind its own lock, snapshots are taken under the lock and
//! the lock is released before any network I/O happens.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Upper bound on the number of known peers.
pub const MAX_PEERS: usize = 20;

/// Consecutive failures after which a peer is quarantined.
pub const MAX_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub last_seen: Instant,
    /// Consecutive failures; any successful exchange resets it to zero.
    pub failures: u32,
}

impl PeerEntry {
    fn new() -> Self {
        PeerEntry {
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    /// Quarantined peers are skipped by broadcast but kept in the table;
    /// a later successful exchange brings them back.
    pub fn is_quarantined(&self) -> bool {
        self.failures >= MAX_FAILURES
    }
}

/// Mapping from `host:port` to liveness state. Cloning is cheap and shares
/// the underlying table.
#[derive(Debug, Clone)]
pub struct PeerTable {
    own_address: String,
    inner: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerTable {
    pub fn new(own_address: String) -> Self {
        PeerTable {
            own_address,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Admit a peer address. Returns `true` only when the address was newly
    /// added. The node's own address is never admitted. When the table is
    /// full, the quarantined peer with the most failures is evicted to make
    /// room; with no quarantined peer the newcomer is refused.
    pub fn learn(&self, address: &str) -> bool {
        if address.is_empty() || address == self.own_address {
            return false;
        }
        let mut peers = self.inner.write();
        if let Some(entry) = peers.get_mut(address) {
            entry.last_seen = Instant::now();
            return false;
        }
        if peers.len() >= MAX_PEERS {
            let victim = peers
                .iter()
                .filter(|(_, entry)| entry.is_quarantined())
                .max_by_key(|(_, entry)| entry.failures)
                .map(|(addr, _)| addr.clone());
            match victim {
                Some(victim) => {
                    debug!(peer = %victim, "evicting quarantined peer for a newcomer");
                    peers.remove(&victim);
                }
                None => {
                    debug!(peer = %address, "peer table full, refusing newcomer");
                    return false;
                }
            }
        }
        peers.insert(address.to_string(), PeerEntry::new());
        true
    }

    pub fn contains(&self, address: &str) -> bool {
        self.inner.read().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Every known address, quarantined peers included.
    pub fn addresses(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Known addresses except `exclude`, for `DISCOVER_PEERS` replies.
    pub fn known_except(&self, exclude: &str) -> Vec<String> {
        self.inner
            .read()
            .keys()
            .filter(|addr| addr.as_str() != exclude)
            .cloned()
            .collect()
    }

    /// Non-quarantined addresses, minus an optional exclusion, as the
    /// target set of one broadcast round.
    pub fn broadcast_targets(&self, exclude: Option<&str>) -> Vec<String> {
        self.inner
            .read()
            .iter()
            .filter(|(addr, entry)| !entry.is_quarantined() && Some(addr.as_str()) != exclude)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// A successful exchange clears the failure streak and refreshes
    /// `last_seen`.
    pub fn record_success(&self, address: &str) {
        if let Some(entry) = self.inner.write().get_mut(address) {
            entry.failures = 0;
            entry.last_seen = Instant::now();
        }
    }

    /// Count one more consecutive failure; returns the new count.
    pub fn record_failure(&self, address: &str) -> u32 {
        let mut peers = self.inner.write();
        match peers.get_mut(address) {
            Some(entry) => {
                entry.failures = entry.failures.saturating_add(1);
                if entry.failures == MAX_FAILURES {
                    debug!(peer = %address, "peer quarantined");
                }
                entry.failures
            }
            None => 0,
        }
    }

    pub fn failures(&self, address: &str) -> Option<u32> {
        self.inner.read().get(address).map(|entry| entry.failures)
    }
}
