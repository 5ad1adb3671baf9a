//! CLI commands for the sync node
//!
//! Implements the command handlers for the CLI interface.

use crate::config::HandlerSettings;
use crate::core::{Block, Chain, Header, Transaction};
use crate::handler::{Handler, HandlerConfig};
use crate::memory::{
    build_chain, IdleDownloader, InlineBlockFetcher, InlineTxFetcher, MemoryChain, MemoryTxPool,
    RecordingConsensus,
};
use crate::network::{HashOrNumber, Message, Peer, ETH66};
use crate::sync::SyncMode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// How long the simulation waits for the initial sync
const SYNC_DEADLINE: Duration = Duration::from_secs(30);

/// Settle time for propagation before shutting down
const SETTLE_TIME: Duration = Duration::from_millis(250);

/// Parameters of a simulated network
#[derive(Debug, Clone, Copy)]
pub struct SimulateOptions {
    pub peers: usize,
    pub blocks: u64,
    pub txs: usize,
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub height: u64,
    pub sync_mode: SyncMode,
    pub accepts_txs: bool,
    /// Messages the remote peers received, by type
    pub delivered: BTreeMap<String, usize>,
}

/// Load settings from a file, or use the defaults
pub fn load_settings(path: Option<&Path>) -> CliResult<HandlerSettings> {
    match path {
        Some(path) => Ok(HandlerSettings::load(path)?),
        None => Ok(HandlerSettings::default()),
    }
}

/// Print the effective settings
pub fn cmd_config(path: Option<&Path>) -> CliResult<()> {
    let settings = load_settings(path)?;

    println!("⚙️  Handler settings");
    println!("{}", serde_json::to_string_pretty(&settings)?);
    if let Some(checkpoint) = settings.checkpoint {
        println!(
            "   └─ Checkpoint block: #{} ({})",
            checkpoint.number(),
            checkpoint.hash().short()
        );
    }
    Ok(())
}

/// A simulated remote peer serving a pre-built chain
struct RemotePeer {
    to_node: mpsc::Sender<Message>,
    responder: JoinHandle<BTreeMap<String, usize>>,
}

/// Answer the handshake and header requests, count everything else
async fn serve_remote(
    mut from_node: mpsc::Receiver<Message>,
    to_node: mpsc::Sender<Message>,
    chain: Arc<Vec<Block>>,
    td: u128,
) -> BTreeMap<String, usize> {
    let mut delivered = BTreeMap::new();
    while let Some(msg) = from_node.recv().await {
        *delivered.entry(msg.type_name().to_string()).or_insert(0) += 1;

        let reply = match msg {
            Message::Status(status) => {
                let head = chain.last().map(|b| b.hash).unwrap_or(status.head);
                Some(Message::Status(crate::network::Status { td, head, ..status }))
            }
            Message::GetBlockHeaders { origin, amount } => {
                let start = match origin {
                    HashOrNumber::Number(n) => n,
                    HashOrNumber::Hash(hash) => chain
                        .iter()
                        .find(|b| b.hash == hash)
                        .map(|b| b.number())
                        .unwrap_or(u64::MAX),
                };
                let headers: Vec<Header> = chain
                    .iter()
                    .filter(|b| b.number() >= start)
                    .take(amount as usize)
                    .map(|b| b.header.clone())
                    .collect();
                Some(Message::BlockHeaders(headers))
            }
            _ => None,
        };

        if let Some(reply) = reply {
            if to_node.send(reply).await.is_err() {
                break;
            }
        }
    }
    delivered
}

/// Run a node against simulated peers and report what happened
pub async fn cmd_simulate(settings: HandlerSettings, opts: SimulateOptions) -> CliResult<SimulationReport> {
    let chain = Arc::new(MemoryChain::new(settings.network_id));
    let pool = Arc::new(MemoryTxPool::new());
    let downloader = Arc::new(IdleDownloader::new());

    // Every remote peer serves the same longer chain
    let genesis = chain.current_block();
    let remote_chain = build_chain(&genesis, opts.blocks, 1, &[]);
    let remote_td = genesis.difficulty() + opts.blocks as u128;
    downloader.set_import(remote_chain.clone(), chain.clone());
    let remote_chain = Arc::new(remote_chain);

    let handler = Arc::new(Handler::new(HandlerConfig {
        settings,
        chain: chain.clone(),
        tx_pool: pool.clone(),
        downloader,
        block_fetcher: Arc::new(InlineBlockFetcher::new()),
        tx_fetcher: Arc::new(InlineTxFetcher::new()),
        consensus: Arc::new(RecordingConsensus::new()),
        event_mux: None,
    })?);
    handler.start(opts.peers);

    println!("🌐 Simulating {} peer(s) serving {} block(s)...", opts.peers, opts.blocks);

    let mut remotes = Vec::with_capacity(opts.peers);
    for i in 0..opts.peers {
        let (peer, from_node) = Peer::new(format!("sim-{:03}", i).as_str(), ETH66, false);
        let (to_node, inbound) = mpsc::channel(64);
        let responder = tokio::spawn(serve_remote(
            from_node,
            to_node.clone(),
            remote_chain.clone(),
            remote_td,
        ));
        handler.spawn_peer(Arc::new(peer), inbound);
        remotes.push(RemotePeer { to_node, responder });
    }

    let deadline = tokio::time::Instant::now() + SYNC_DEADLINE;
    while chain.current_height() < opts.blocks && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    println!("⛓️  Synced to height {}", chain.current_height());

    let txs: Vec<Transaction> = (0..opts.txs)
        .map(|n| Transaction::new("simulator", n as u64, n.to_be_bytes().to_vec()))
        .collect();
    let accepted = pool.add_locals(txs).iter().filter(|r| r.is_ok()).count();
    println!("📨 Submitted {} transaction(s)", accepted);

    let mined = chain.extend(1, 1)?;
    for block in mined {
        println!("⛏️  Mined block #{} ({})", block.number(), block.hash.short());
        handler.event_mux().post(block);
    }

    tokio::time::sleep(SETTLE_TIME).await;
    let accepts_txs = handler.accepts_txs();
    let sync_mode = handler.sync_mode();
    handler.stop().await;

    let mut delivered = BTreeMap::new();
    for remote in remotes {
        drop(remote.to_node);
        match remote.responder.await {
            Ok(counts) => {
                for (kind, count) in counts {
                    *delivered.entry(kind).or_insert(0) += count;
                }
            }
            Err(e) => log::warn!("Simulated peer failed: {}", e),
        }
    }

    let report = SimulationReport {
        height: chain.current_height(),
        sync_mode,
        accepts_txs,
        delivered,
    };
    print_report(&report);
    Ok(report)
}

fn print_report(report: &SimulationReport) {
    println!("📊 Simulation report");
    println!("   ├─ Height: {}", report.height);
    println!("   ├─ Sync mode: {}", report.sync_mode);
    println!("   ├─ Accepting transactions: {}", report.accepts_txs);
    println!("   └─ Delivered to peers:");
    for (kind, count) in &report.delivered {
        println!("      {} x {}", count, kind);
    }
}
