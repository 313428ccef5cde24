//! Integration tests for the P2P overlay: discovery, propagation, fork
//! resolution and peer quarantine, over real loopback TCP.

use caravela::config::Config;
use caravela::node::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Node on an OS-assigned loopback port.
async fn spawn_node(bootstrap: Vec<String>) -> Arc<Node> {
    let mut config = Config::default();
    config.network.port = 0;
    config.network.bootstrap_peers = bootstrap;
    // keep the heartbeat quiet relative to test assertions
    config.network.sync_interval_secs = 3600;
    Node::spawn(&config).await.expect("failed to spawn node")
}

/// Poll until `predicate` holds or the deadline expires.
async fn wait_until<F>(mut predicate: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_registers_both_sides() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node(vec![]).await;
        let b = spawn_node(vec![]).await;

        assert!(b.connect_to_peer(a.address()).await);
        assert!(b.peers().contains(a.address()));
        // the PING carried b's sender address, so a learned it too
        wait_until(|| a.peers().contains(b.address()), "a to learn b").await;

        a.shutdown();
        b.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bootstrap_dials_and_syncs() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node(vec![]).await;
        a.submit_transaction("coinbase", "seed", 5.0).await.unwrap();
        a.mine().await.expect("mining failed");
        assert_eq!(a.chain_height(), 2);

        let b = spawn_node(vec![a.address().to_string()]).await;
        wait_until(|| b.chain_height() == 2, "b to sync the bootstrap chain").await;

        a.shutdown();
        b.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transaction_propagates() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node(vec![]).await;
        let b = spawn_node(vec![]).await;
        assert!(b.connect_to_peer(a.address()).await);
        wait_until(|| a.peers().contains(b.address()), "a to learn b").await;

        let tx = b
            .submit_transaction("alice", "bob", 12.5)
            .await
            .expect("transaction refused");

        wait_until(
            || a.pending_transactions().iter().any(|t| t.id == tx.id),
            "transaction to reach a",
        )
        .await;

        a.shutdown();
        b.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mined_block_propagates_and_pays_the_miner() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node(vec![]).await;
        let b = spawn_node(vec![]).await;
        assert!(b.connect_to_peer(a.address()).await);
        wait_until(|| a.peers().contains(b.address()), "a to learn b").await;

        a.submit_transaction("x", "y", 1.0).await.unwrap();
        let block = a.mine().await.expect("mining failed");

        assert_eq!(a.chain_height(), 2);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.transactions[0].destino, a.wallet());
        assert_eq!(a.balance_of(a.wallet()), 50.0);
        assert_eq!(a.balance_of("x"), -1.0);
        assert_eq!(a.balance_of("y"), 1.0);

        wait_until(|| b.chain_height() == 2, "block to reach b").await;
        assert_eq!(b.chain_snapshot().chain[1].hash, block.hash);

        a.shutdown();
        b.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_adopts_longer_chain_and_keeps_local_pending() {
    timeout(TEST_TIMEOUT, async {
        // two nodes build diverging histories in isolation
        let a = spawn_node(vec![]).await;
        let b = spawn_node(vec![]).await;

        b.submit_transaction("coinbase", "carol", 3.0).await.unwrap();
        b.mine().await.expect("b mining 1 failed");
        b.submit_transaction("coinbase", "carol", 4.0).await.unwrap();
        b.mine().await.expect("b mining 2 failed");
        assert_eq!(b.chain_height(), 3);

        a.submit_transaction("coinbase", "dave", 9.0).await.unwrap();
        a.mine().await.expect("a mining failed");
        assert_eq!(a.chain_height(), 2);

        // a transaction only a knows about stays pending through the sync
        let local_only = a
            .submit_transaction("erin", "frank", 2.0)
            .await
            .expect("transaction refused");

        assert!(a.connect_to_peer(b.address()).await);
        let gained = a.sync_blockchain().await;
        assert_eq!(gained, 1);
        assert_eq!(a.chain_height(), 3);
        assert_eq!(
            a.chain_snapshot().chain.last().unwrap().hash,
            b.chain_snapshot().chain.last().unwrap().hash
        );
        assert!(a
            .pending_transactions()
            .iter()
            .any(|t| t.id == local_only.id));

        a.shutdown();
        b.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_block_from_ahead_peer_triggers_sync() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node(vec![]).await;
        let b = spawn_node(vec![]).await;

        // b gets ahead while disconnected
        b.submit_transaction("coinbase", "carol", 1.0).await.unwrap();
        b.mine().await.expect("b mining 1 failed");
        b.submit_transaction("coinbase", "carol", 2.0).await.unwrap();
        b.mine().await.expect("b mining 2 failed");
        assert_eq!(b.chain_height(), 3);

        // now they meet; a learns b through the ping sender
        assert!(b.connect_to_peer(a.address()).await);
        wait_until(|| a.peers().contains(b.address()), "a to learn b").await;
        assert_eq!(a.chain_height(), 1);

        // b mines once more and broadcasts a block a cannot append,
        // which makes a pull the full chain
        b.submit_transaction("coinbase", "carol", 3.0).await.unwrap();
        b.mine().await.expect("b mining 3 failed");

        wait_until(|| a.chain_height() == 4, "a to catch up via sync").await;

        a.shutdown();
        b.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_peer_is_quarantined_after_three_broadcasts() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node(vec![]).await;
        // reserved port, nothing listens there
        let dead = "127.0.0.1:1";
        assert!(a.peers().learn(dead));

        for round in 0..3 {
            a.submit_transaction("coinbase", "x", 1.0 + round as f64)
                .await
                .unwrap();
        }

        assert_eq!(a.peers().failures(dead), Some(3));
        assert!(a.peers().contains(dead));
        assert!(a.peers().broadcast_targets(None).is_empty());

        a.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quarantined_peer_rejoins_after_successful_contact() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node(vec![]).await;
        let p = spawn_node(vec![]).await;
        assert!(a.peers().learn(p.address()));

        // simulate three failed rounds against p
        for _ in 0..3 {
            a.peers().record_failure(p.address());
        }
        assert!(a.peers().broadcast_targets(None).is_empty());

        // a successful ping exchange lifts the quarantine
        assert!(a.connect_to_peer(p.address()).await);
        assert_eq!(a.peers().failures(p.address()), Some(0));
        assert_eq!(
            a.peers().broadcast_targets(None),
            vec![p.address().to_string()]
        );

        a.shutdown();
        p.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_discovery_spreads_through_the_overlay() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node(vec![]).await;
        let b = spawn_node(vec![]).await;
        assert!(b.connect_to_peer(a.address()).await);
        wait_until(|| a.peers().contains(b.address()), "a to learn b").await;

        // c joins via a and should eventually hear about b
        let c = spawn_node(vec![]).await;
        assert!(c.connect_to_peer(a.address()).await);
        wait_until(|| c.peers().contains(b.address()), "c to discover b").await;

        a.shutdown();
        b.shutdown();
        c.shutdown();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_submission_is_refused() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node(vec![]).await;
        let tx = a
            .submit_transaction("coinbase", "alice", 10.0)
            .await
            .unwrap();
        assert_eq!(a.pending_transactions().len(), 1);

        // a peer re-delivering the same id must not grow the pool; the
        // local duplicate path is covered at the blockchain level
        let snapshot_before = a.pending_transactions();
        assert_eq!(snapshot_before.len(), 1);
        assert_eq!(snapshot_before[0].id, tx.id);

        assert!(a.submit_transaction("alice", "bob", 0.0).await.is_none());
        assert_eq!(a.pending_transactions().len(), 1);

        a.shutdown();
    })
    .await
    .expect("test timed out");
}
