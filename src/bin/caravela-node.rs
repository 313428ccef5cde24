#![forbid(unsafe_code)]
//! Node daemon: binds the P2P listener, dials bootstrap peers and logs a
//! periodic health line. All interaction beyond that goes through peers on
//! the overlay.

use caravela::config::load_config;
use caravela::node::Node;
use std::env;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = load_config()?;

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" if i + 1 < args.len() => {
                config.network.host = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                config.network.port = args[i + 1].parse()?;
                i += 2;
            }
            "--wallet" if i + 1 < args.len() => {
                config.miner.wallet = Some(args[i + 1].clone());
                i += 2;
            }
            "--bootstrap" if i + 1 < args.len() => {
                config.network.bootstrap_peers.push(args[i + 1].clone());
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                eprintln!("unknown argument: {}", other);
                print_usage();
                return Ok(());
            }
        }
    }

    let node = Node::spawn(&config).await?;
    info!(
        address = node.address(),
        wallet = node.wallet(),
        "caravela node running"
    );

    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        info!(
            height = node.chain_height(),
            peers = node.peers().len(),
            pending = node.pending_transactions().len(),
            "node health"
        );
    }
}

fn print_usage() {
    println!("Usage: caravela-node [options]");
    println!("  --host <host>            listen host (default 127.0.0.1)");
    println!("  --port <port>            listen port (default 5000, 0 = ephemeral)");
    println!("  --wallet <address>       coinbase reward recipient (default host:port)");
    println!("  --bootstrap <host:port>  peer to dial at startup (repeatable)");
}
