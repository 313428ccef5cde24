//! The peer-to-peer node: TCP listener, dispatch, broadcast fan-out,
//! discovery and chain synchronization.
//!
//! The node is the composition root. It owns the blockchain behind a single
//! mutex, the peer table, and the miner's cancellation flag, and it mediates
//! all I/O: inbound frames are decoded, dispatched and applied under the
//! chain lock; outbound traffic always runs on short-lived connections with
//! the lock released.

use crate::block::Block;
use crate::blockchain::{Blockchain, ChainSnapshot};
use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::miner::{BlockTemplate, MineOutcome, Miner};
use crate::peers::PeerTable;
use crate::protocol::{self, Envelope, Message};
use crate::sync::{self, Candidate, SYNC_TIMEOUT};
use crate::transaction::{epoch_timestamp, Transaction};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Cap on establishing an outbound connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap on waiting for the reply frame of a request.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Node {
    address: String,
    wallet: String,
    chain: Arc<Mutex<Blockchain>>,
    peers: PeerTable,
    miner: Miner,
    listener: Mutex<Option<TcpListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bootstrap: Vec<String>,
    sync_interval: Duration,
}

impl Node {
    /// Bind the listening socket and assemble the node. Port 0 asks the OS
    /// for a free port; the advertised address reflects the one granted.
    pub async fn bind(config: &Config) -> Result<Arc<Self>> {
        let listener =
            TcpListener::bind((config.network.host.as_str(), config.network.port)).await?;
        let port = listener.local_addr()?.port();
        let address = format!("{}:{}", config.network.host, port);
        let wallet = config
            .miner
            .wallet
            .clone()
            .unwrap_or_else(|| address.clone());
        info!(%address, %wallet, "node listening");

        Ok(Arc::new(Node {
            peers: PeerTable::new(address.clone()),
            address,
            wallet,
            chain: Arc::new(Mutex::new(Blockchain::new())),
            miner: Miner::new(),
            listener: Mutex::new(Some(listener)),
            tasks: Mutex::new(Vec::new()),
            bootstrap: config.network.bootstrap_peers.clone(),
            sync_interval: Duration::from_secs(config.network.sync_interval_secs),
        }))
    }

    /// Spawn the accept loop, the sync heartbeat, and one dial per
    /// bootstrap address.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let accept = tokio::spawn(async move { node.accept_loop().await });

        let node = Arc::clone(self);
        let heartbeat = tokio::spawn(async move { node.heartbeat().await });

        self.tasks.lock().extend([accept, heartbeat]);

        for peer in self.bootstrap.clone() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                if node.connect_to_peer(&peer).await {
                    node.sync_blockchain().await;
                }
            });
        }
    }

    /// Bind and start in one step.
    pub async fn spawn(config: &Config) -> Result<Arc<Self>> {
        let node = Self::bind(config).await?;
        node.start();
        Ok(node)
    }

    /// Tear the node down: cancel mining and abort the background tasks.
    /// In-flight connections unwind at their next suspension point.
    pub fn shutdown(&self) {
        self.miner.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(address = %self.address, "node stopped");
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn peer_addresses(&self) -> Vec<String> {
        self.peers.addresses()
    }

    pub fn chain_height(&self) -> usize {
        self.chain.lock().height()
    }

    pub fn chain_snapshot(&self) -> ChainSnapshot {
        self.chain.lock().snapshot()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.chain.lock().pending().to_vec()
    }

    pub fn balance_of(&self, address: &str) -> f64 {
        self.chain.lock().get_balance(address)
    }

    pub fn available_balance_of(&self, address: &str) -> f64 {
        self.chain.lock().available_balance(address)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn accept_loop(self: Arc<Self>) {
        let listener = self.listener.lock().take();
        let Some(listener) = listener else {
            warn!("accept loop started twice");
            return;
        };
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = node.handle_connection(stream).await {
                            debug!(%remote, %err, "connection closed");
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Serve one connection: decode a single framed envelope, learn the
    /// sender, dispatch, write the reply when the message is a query, and
    /// close. Codec errors propagate and cost the peer its connection.
    async fn handle_connection(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let envelope = protocol::read_frame(&mut stream).await?;
        debug!(
            kind = envelope.message.kind(),
            sender = %envelope.sender,
            "frame received"
        );

        let newly_learned = self.peers.learn(&envelope.sender);
        if let Some(reply) = self.dispatch(envelope, newly_learned).await {
            protocol::write_frame(&mut stream, &self.envelope(reply)).await?;
        }
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope, newly_learned: bool) -> Option<Message> {
        let Envelope { message, sender } = envelope;
        match message {
            Message::NewTransaction { transaction } => {
                let added = self.chain.lock().add_transaction(transaction.clone());
                if added {
                    info!(id = %transaction.id, "transaction accepted from network");
                    self.broadcast(Message::NewTransaction { transaction }, Some(&sender))
                        .await;
                }
                None
            }
            Message::NewBlock { block } => {
                self.accept_block(block, Some(&sender)).await;
                None
            }
            Message::RequestChain {} => {
                let blockchain = self.chain.lock().snapshot();
                Some(Message::ResponseChain { blockchain })
            }
            Message::ResponseChain { blockchain } => {
                // a peer pushed its chain unsolicited; treat it as a sync
                // candidate
                let mut chain = self.chain.lock();
                if chain.replace_chain(blockchain.chain) {
                    info!(height = chain.height(), sender = %sender, "adopted pushed chain");
                }
                None
            }
            Message::Ping {} => {
                if !sender.is_empty() {
                    self.peers.record_success(&sender);
                    if newly_learned {
                        info!(peer = %sender, "peer registered via ping");
                        // gossip the newcomer to the rest of the overlay
                        let node = Arc::clone(self);
                        let newcomer = sender.clone();
                        tokio::spawn(async move {
                            node.broadcast(
                                Message::PeersList {
                                    peers: vec![newcomer.clone()],
                                },
                                Some(&newcomer),
                            )
                            .await;
                        });
                    }
                }
                Some(Message::Pong {})
            }
            Message::Pong {} => {
                if !sender.is_empty() {
                    self.peers.record_success(&sender);
                }
                None
            }
            Message::DiscoverPeers {} => Some(Message::PeersList {
                peers: self.peers.known_except(&sender),
            }),
            Message::PeersList { peers } => {
                for peer in peers {
                    if peer != self.address && !self.peers.contains(&peer) {
                        let node = Arc::clone(self);
                        tokio::spawn(async move {
                            node.connect_to_peer(&peer).await;
                        });
                    }
                }
                None
            }
        }
    }

    /// Apply a block received from the network. Acceptance cancels any
    /// in-flight mining and re-broadcasts the block; a rejection that looks
    /// ahead of the local tip schedules a sync round instead.
    async fn accept_block(self: &Arc<Self>, block: Block, from: Option<&str>) {
        let (accepted, local_height) = {
            let mut chain = self.chain.lock();
            (chain.add_block(block.clone()), chain.height())
        };
        if accepted {
            info!(index = block.index, hash = %block.hash, "block accepted from network");
            self.miner.cancel();
            self.broadcast(Message::NewBlock { block }, from).await;
        } else if block.index as usize > local_height {
            debug!(
                index = block.index,
                local_height, "peer is ahead of us, scheduling sync"
            );
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.sync_blockchain().await;
            });
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn envelope(&self, message: Message) -> Envelope {
        Envelope::new(message, &self.address)
    }

    async fn dial(&self, peer: &str) -> Result<TcpStream> {
        tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| NodeError::PeerUnreachable(format!("{}: connect timed out", peer)))?
            .map_err(|err| NodeError::PeerUnreachable(format!("{}: {}", peer, err)))
    }

    /// One-shot request/response exchange on a fresh connection, with
    /// failure accounting against the peer table.
    pub async fn request(&self, peer: &str, message: Message) -> Result<Envelope> {
        let result = self.exchange(peer, message).await;
        match &result {
            Ok(_) => self.peers.record_success(peer),
            Err(_) => {
                self.peers.record_failure(peer);
            }
        }
        result
    }

    async fn exchange(&self, peer: &str, message: Message) -> Result<Envelope> {
        let mut stream = self.dial(peer).await?;
        protocol::write_frame(&mut stream, &self.envelope(message)).await?;
        tokio::time::timeout(REPLY_TIMEOUT, protocol::read_frame(&mut stream))
            .await
            .map_err(|_| NodeError::PeerUnreachable(format!("{}: reply timed out", peer)))?
    }

    /// Fan a message out to every non-quarantined peer in randomized order,
    /// one short-lived connection per peer, sends running in parallel.
    /// Resolves once every send finished its failure accounting.
    pub async fn broadcast(self: &Arc<Self>, message: Message, exclude: Option<&str>) {
        let mut targets = self.peers.broadcast_targets(exclude);
        targets.shuffle(&mut rand::thread_rng());
        self.broadcast_to(targets, message).await;
    }

    /// Deterministic-order half of [`broadcast`]; the split keeps the
    /// shuffle out of tests that assert on delivery.
    ///
    /// [`broadcast`]: Node::broadcast
    pub async fn broadcast_to(self: &Arc<Self>, targets: Vec<String>, message: Message) {
        if targets.is_empty() {
            return;
        }
        debug!(kind = message.kind(), peers = targets.len(), "broadcasting");
        let mut sends = JoinSet::new();
        for peer in targets {
            let node = Arc::clone(self);
            let message = message.clone();
            sends.spawn(async move {
                node.send_oneshot(&peer, message).await;
            });
        }
        while sends.join_next().await.is_some() {}
    }

    /// Fire-and-forget delivery of a broadcast frame: connect, write one
    /// frame, close. No reply is read.
    async fn send_oneshot(self: &Arc<Self>, peer: &str, message: Message) {
        let result: Result<()> = async {
            let mut stream = self.dial(peer).await?;
            protocol::write_frame(&mut stream, &self.envelope(message)).await
        }
        .await;
        match result {
            Ok(()) => self.peers.record_success(peer),
            Err(err) => {
                let failures = self.peers.record_failure(peer);
                debug!(peer = %peer, %err, failures, "broadcast send failed");
            }
        }
    }

    /// Handshake with a peer: PING, await PONG, admit it to the table and
    /// ask it for more peers.
    ///
    /// Returns an explicitly boxed future rather than using `async fn`:
    /// this function and [`discover_from`] recursively spawn each other,
    /// and the compiler cannot resolve the resulting opaque-type cycle
    /// without the indirection.
    ///
    /// [`discover_from`]: Node::discover_from
    pub fn connect_to_peer<'a>(
        self: &'a Arc<Self>,
        peer: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            if peer == self.address {
                return false;
            }
            match self.request(peer, Message::Ping {}).await {
                Ok(reply) if matches!(reply.message, Message::Pong {}) => {
                    self.peers.learn(peer);
                    self.peers.record_success(peer);
                    info!(peer = %peer, "connected to peer");
                    self.discover_from(peer).await;
                    true
                }
                Ok(reply) => {
                    debug!(peer = %peer, kind = reply.message.kind(), "unexpected ping reply");
                    false
                }
                Err(err) => {
                    warn!(peer = %peer, %err, "failed to connect to peer");
                    false
                }
            }
        })
    }

    async fn discover_from(self: &Arc<Self>, peer: &str) {
        match self.request(peer, Message::DiscoverPeers {}).await {
            Ok(Envelope {
                message: Message::PeersList { peers },
                ..
            }) => {
                debug!(peer = %peer, count = peers.len(), "peers discovered");
                for candidate in peers {
                    if candidate != self.address && !self.peers.contains(&candidate) {
                        let node = Arc::clone(self);
                        tokio::spawn(async move {
                            node.connect_to_peer(&candidate).await;
                        });
                    }
                }
            }
            Ok(reply) => {
                debug!(peer = %peer, kind = reply.message.kind(), "unexpected discovery reply")
            }
            Err(err) => debug!(peer = %peer, %err, "peer discovery failed"),
        }
    }

    // ------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------

    /// Reconcile with the overlay: request the chain from every known peer,
    /// aggregate the replies for at most [`SYNC_TIMEOUT`], and adopt the
    /// longest valid chain strictly longer than ours. Returns the number of
    /// blocks gained.
    pub async fn sync_blockchain(self: &Arc<Self>) -> usize {
        let peers = self.peers.addresses();
        if peers.is_empty() {
            return 0;
        }
        let local_height = self.chain.lock().height();
        let (candidates_tx, candidates_rx) = tokio::sync::mpsc::channel(peers.len());

        for peer in &peers {
            let node = Arc::clone(self);
            let peer = peer.clone();
            let candidates_tx = candidates_tx.clone();
            tokio::spawn(async move {
                match node.request(&peer, Message::RequestChain {}).await {
                    Ok(Envelope {
                        message: Message::ResponseChain { blockchain },
                        ..
                    }) => {
                        let _ = candidates_tx
                            .send(Candidate {
                                peer,
                                chain: blockchain.chain,
                            })
                            .await;
                    }
                    Ok(reply) => {
                        debug!(peer = %peer, kind = reply.message.kind(), "unexpected sync reply")
                    }
                    Err(err) => debug!(peer = %peer, %err, "chain request failed"),
                }
            });
        }
        drop(candidates_tx);

        let candidates = sync::collect(candidates_rx, peers.len(), SYNC_TIMEOUT).await;
        let Some(best) = sync::select_best(local_height, candidates) else {
            debug!("no sync candidate beats the local chain");
            return 0;
        };

        let mut chain = self.chain.lock();
        let before = chain.height();
        if chain.replace_chain(best.chain) {
            let gained = chain.height() - before;
            info!(peer = %best.peer, gained, height = chain.height(), "adopted longer chain");
            gained
        } else {
            0
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.peers.is_empty() {
                continue;
            }
            let gained = self.sync_blockchain().await;
            if gained > 0 {
                info!(gained, "heartbeat sync adopted blocks");
            }
        }
    }

    // ------------------------------------------------------------------
    // Driver surface
    // ------------------------------------------------------------------

    /// Create, queue and broadcast a transaction. `None` when the value is
    /// invalid or the transaction was refused locally.
    pub async fn submit_transaction(
        self: &Arc<Self>,
        origem: &str,
        destino: &str,
        valor: f64,
    ) -> Option<Transaction> {
        let transaction = Transaction::new(origem, destino, valor)?;
        if !self.chain.lock().add_transaction(transaction.clone()) {
            return None;
        }
        info!(id = %transaction.id, valor, "transaction queued");
        self.broadcast(
            Message::NewTransaction {
                transaction: transaction.clone(),
            },
            None,
        )
        .await;
        Some(transaction)
    }

    /// Mine one block from the pending set (value-descending, coinbase
    /// first) and broadcast it on success. `None` when the mempool is
    /// empty, mining was cancelled, or a competing block won the race.
    pub async fn mine(self: &Arc<Self>) -> Option<Block> {
        let template = {
            let chain = self.chain.lock();
            if chain.pending().is_empty() {
                info!("nothing to mine, mempool is empty");
                return None;
            }
            let timestamp = epoch_timestamp();
            let mut transactions = vec![Transaction::coinbase(&self.wallet, timestamp.clone())];
            transactions.extend(chain.pending_by_priority());
            BlockTemplate {
                index: chain.height() as u64,
                previous_hash: chain.last_block().hash.clone(),
                transactions,
                timestamp,
            }
        };

        self.miner.reset();
        let miner = self.miner.clone();
        let outcome = tokio::task::spawn_blocking(move || miner.mine(template))
            .await
            .ok()?;

        match outcome {
            MineOutcome::Mined(block) => {
                let accepted = self.chain.lock().add_block(block.clone());
                if !accepted {
                    // a network block won the race while we were hashing
                    debug!(index = block.index, "mined block obsolete, dropping");
                    return None;
                }
                info!(index = block.index, hash = %block.hash, nonce = block.nonce, "mined block");
                self.broadcast(
                    Message::NewBlock {
                        block: block.clone(),
                    },
                    None,
                )
                .await;
                Some(block)
            }
            MineOutcome::Cancelled => {
                info!("mining cancelled");
                None
            }
        }
    }
}
