//! Parallel proof-of-work search with cooperative cancellation.
//!
//! Four workers split the nonce space in interleaved stripes: worker `i`
//! tests nonces `i, i + WORKERS, i + 2*WORKERS, ...`. They share only the
//! immutable block template and one atomic cancellation flag, checked once
//! per nonce; the first finder publishes through a single-slot channel and
//! raises the flag so the others drain out. The node raises the same flag
//! when a competing block arrives from the network, in which case the
//! search ends with [`MineOutcome::Cancelled`] and nothing is appended.

use crate::block::{Block, DIFFICULTY};
use crate::transaction::Transaction;
use serde_json::Number;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::debug;

/// Number of parallel mining workers.
pub const WORKERS: u64 = 4;

/// Nonce attempts between progress log lines, per worker.
const PROGRESS_INTERVAL: u64 = 5_000;

/// Immutable skeleton of the block being searched.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub index: u64,
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    pub timestamp: Number,
}

#[derive(Debug)]
pub enum MineOutcome {
    /// A valid nonce was found; the finalized block carries it.
    Mined(Block),
    /// The cancellation flag was raised before any worker succeeded.
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct Miner {
    cancel: Arc<AtomicBool>,
}

impl Miner {
    pub fn new() -> Self {
        Miner {
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raise the cancellation flag. Workers observe it at the next nonce
    /// boundary. The flag is monotone within one search; call [`reset`]
    /// before starting the next one.
    ///
    /// [`reset`]: Miner::reset
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Search for a nonce whose hash carries the difficulty prefix.
    ///
    /// CPU-bound and blocking; the node drives it through
    /// `tokio::task::spawn_blocking`.
    pub fn mine(&self, template: BlockTemplate) -> MineOutcome {
        let (slot, found) = mpsc::sync_channel::<Block>(1);

        thread::scope(|scope| {
            for worker in 0..WORKERS {
                let cancel = Arc::clone(&self.cancel);
                let slot = slot.clone();
                let template = &template;
                scope.spawn(move || {
                    let mut block = Block {
                        index: template.index,
                        previous_hash: template.previous_hash.clone(),
                        transactions: template.transactions.clone(),
                        nonce: worker,
                        timestamp: template.timestamp.clone(),
                        hash: String::new(),
                    };
                    let mut attempts: u64 = 0;
                    while !cancel.load(Ordering::Relaxed) {
                        let hash = block.compute_hash();
                        if hash.starts_with(DIFFICULTY) {
                            block.hash = hash;
                            // first writer wins; a concurrent finder just
                            // sees the slot occupied
                            let _ = slot.try_send(block);
                            cancel.store(true, Ordering::SeqCst);
                            return;
                        }
                        block.nonce += WORKERS;
                        attempts += 1;
                        if attempts % PROGRESS_INTERVAL == 0 {
                            debug!(worker, nonce = block.nonce, "mining in progress");
                        }
                    }
                });
            }
        });

        drop(slot);
        match found.try_recv() {
            Ok(block) => MineOutcome::Mined(block),
            Err(_) => MineOutcome::Cancelled,
        }
    }
}
