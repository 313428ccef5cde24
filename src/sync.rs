//! Chain synchronization: candidate aggregation and longest-chain
//! selection.
//!
//! The node fans a `REQUEST_CHAIN` out to every known peer and funnels the
//! replies into one bounded aggregation window. Selection is pure and
//! testable: keep only candidates strictly longer than the local chain that
//! validate end to end, then take the longest, first seen winning ties.

use crate::block::Block;
use crate::blockchain::Blockchain;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Wall-clock cap on one aggregation round.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// A chain offered by one peer during a sync round.
#[derive(Debug)]
pub struct Candidate {
    pub peer: String,
    pub chain: Vec<Block>,
}

/// Drain candidates from `rx` until every expected peer has answered, the
/// senders are gone, or the window elapses. A timeout is not an error: the
/// best candidate seen so far still gets adopted.
pub async fn collect(
    mut rx: mpsc::Receiver<Candidate>,
    expected: usize,
    window: Duration,
) -> Vec<Candidate> {
    let deadline = tokio::time::Instant::now() + window;
    let mut candidates = Vec::new();
    while candidates.len() < expected {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(candidate)) => candidates.push(candidate),
            Ok(None) => break,
            Err(_) => {
                debug!(
                    received = candidates.len(),
                    expected, "sync window elapsed"
                );
                break;
            }
        }
    }
    candidates
}

/// Pick the longest valid candidate strictly longer than `local_height`.
/// Ties keep the first-seen candidate.
pub fn select_best(local_height: usize, candidates: Vec<Candidate>) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;
    for candidate in candidates {
        if candidate.chain.len() <= local_height {
            continue;
        }
        if !Blockchain::is_valid_chain(&candidate.chain) {
            debug!(peer = %candidate.peer, "discarding invalid sync candidate");
            continue;
        }
        let longer = match &best {
            Some(current) => candidate.chain.len() > current.chain.len(),
            None => true,
        };
        if longer {
            best = Some(candidate);
        }
    }
    best
}
