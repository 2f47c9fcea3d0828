//! naru-node: permissioned BFT ledger daemon.

use anyhow::Result;
use clap::Parser;
use naru::config::NodeConfig;
use naru::crypto::ed25519::NodeKeypair;
use naru::crypto::NodeSigner;
use naru::metrics::Metrics;
use naru::net::p2p::{self, P2pConfig};
use naru::node::{Node, NodeParams};
use naru::storage::block_store::FsBlockStore;
use naru::storage::Storage;
use naru::wsv::genesis_block;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "naru-node", version, about = "Permissioned BFT ledger node")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "./config.toml")]
    config: PathBuf,
    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<String>,
    /// Override the listen multiaddr.
    #[arg(long)]
    listen: Option<String>,
    /// Additional static peer multiaddresses.
    #[arg(long = "peer")]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = NodeConfig::load(&cli.config)?;
    if let Some(d) = cli.data_dir {
        cfg.node.data_dir = d;
    }
    if let Some(l) = cli.listen {
        cfg.network.listen = l;
    }
    cfg.network.peers.extend(cli.peers);
    cfg.apply_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.node.log_level.clone())),
        )
        .init();

    let data_dir = cfg.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let keypair = NodeKeypair::load_or_create(&data_dir)?;
    info!(pubkey = %keypair.public_key().short_hex(), "node identity");

    let blocks = Arc::new(FsBlockStore::open(data_dir.join("blocks"))?);
    let genesis = genesis_block(cfg.genesis_commands()?);
    let storage = Storage::open(blocks, Some(data_dir.join("state.json")), genesis)?;
    let metrics = Arc::new(Metrics::new()?);

    let (net_shutdown_tx, net_shutdown_rx) = watch::channel(false);
    let (net, gossip_rx, net_task) = p2p::spawn(
        P2pConfig {
            local_key: p2p::identity_from_seed(keypair.seed()),
            listen: cfg.network.listen.parse()?,
            static_peers: cfg
                .network
                .peers
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<_>, _>>()?,
            enable_mdns: cfg.network.enable_mdns,
            request_timeout: Duration::from_millis(cfg.network.fetch_timeout_ms),
        },
        storage.block_query(),
        metrics.clone(),
        net_shutdown_rx,
    )?;

    let node = Node::init(
        NodeParams {
            ordering: cfg.ordering_config(),
            yac: cfg.yac_config(),
            fetch_timeout: Duration::from_millis(cfg.network.fetch_timeout_ms),
            status_poll: Duration::from_secs(cfg.network.status_poll_s),
        },
        keypair,
        storage,
        net,
        gossip_rx,
        metrics,
    )?;

    node.run(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        // Listeners first, then the pipeline; an in-flight commit always
        // runs to completion before its task observes the signal.
        let _ = net_shutdown_tx.send(true);
        let _ = net_task.await;
    })
    .await;
    Ok(())
}
