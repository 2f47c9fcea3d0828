//! TOML configuration file support.
//!
//! Config is loaded from the `--config` path (default: ./config.toml).
//! CLI flags override config file values. Environment variables (`NARU_*`)
//! override both.

use crate::crypto::PublicKey;
use crate::ordering::OrderingConfig;
use crate::consensus::YacConfig;
use crate::types::{Command, Peer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub ordering: OrderingSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub genesis: GenesisSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub data_dir: String,
    pub log_level: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self { data_dir: "./data/node".into(), log_level: "info".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingSection {
    /// Size trigger for proposals.
    pub max_tx_per_proposal: usize,
    /// Time trigger for proposals (milliseconds).
    pub proposal_delay_ms: u64,
    /// Pending-queue bound; submissions beyond it are rejected.
    pub queue_cap: usize,
}

impl Default for OrderingSection {
    fn default() -> Self {
        Self { max_tx_per_proposal: 10, proposal_delay_ms: 5_000, queue_cap: 4_096 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    /// First voting round timeout; later rounds back off exponentially.
    pub round_timeout_ms: u64,
    pub max_round_timeout_ms: u64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self { round_timeout_ms: 1_000, max_round_timeout_ms: 32_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Listen multiaddr, e.g. "/ip4/0.0.0.0/tcp/7001".
    pub listen: String,
    /// Static peer multiaddresses.
    pub peers: Vec<String>,
    pub enable_mdns: bool,
    /// Per-peer timeout for a block-range fetch (milliseconds).
    pub fetch_timeout_ms: u64,
    /// Interval between peer status polls (seconds).
    pub status_poll_s: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen: "/ip4/0.0.0.0/tcp/7001".into(),
            peers: vec![],
            enable_mdns: false,
            fetch_timeout_ms: 10_000,
            status_poll_s: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GenesisSection {
    pub domains: Vec<String>,
    pub accounts: Vec<GenesisAccount>,
    pub assets: Vec<String>,
    pub endowments: Vec<GenesisEndowment>,
    pub peers: Vec<GenesisPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAccount {
    /// `name@domain`
    pub id: String,
    /// Hex-encoded ed25519 public key.
    pub pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisEndowment {
    pub account: String,
    pub asset: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisPeer {
    pub address: String,
    pub pubkey: String,
}

impl NodeConfig {
    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&s)?)
    }

    /// `NARU_*` environment overrides, applied after file and CLI.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("NARU_DATA_DIR") {
            self.node.data_dir = v;
        }
        if let Ok(v) = std::env::var("NARU_LOG_LEVEL") {
            self.node.log_level = v;
        }
        if let Ok(v) = std::env::var("NARU_LISTEN") {
            self.network.listen = v;
        }
        if let Ok(v) = std::env::var("NARU_PEERS") {
            self.network.peers = v.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
        if let Ok(v) = std::env::var("NARU_MAX_TX_PER_PROPOSAL") {
            if let Ok(n) = v.parse() {
                self.ordering.max_tx_per_proposal = n;
            }
        }
        if let Ok(v) = std::env::var("NARU_PROPOSAL_DELAY_MS") {
            if let Ok(n) = v.parse() {
                self.ordering.proposal_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("NARU_ROUND_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.consensus.round_timeout_ms = n;
            }
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.node.data_dir)
    }

    pub fn ordering_config(&self) -> OrderingConfig {
        OrderingConfig {
            max_tx_per_proposal: self.ordering.max_tx_per_proposal,
            proposal_delay_ms: self.ordering.proposal_delay_ms,
            queue_cap: self.ordering.queue_cap,
        }
    }

    pub fn yac_config(&self) -> YacConfig {
        YacConfig {
            round_timeout_ms: self.consensus.round_timeout_ms,
            max_round_timeout_ms: self.consensus.max_round_timeout_ms,
        }
    }

    /// Bootstrap commands for the deterministic genesis block, in a fixed
    /// order: domains, accounts, assets, endowments, peers.
    pub fn genesis_commands(&self) -> anyhow::Result<Vec<Command>> {
        let mut out = Vec::new();
        for d in &self.genesis.domains {
            out.push(Command::CreateDomain { domain: d.clone() });
        }
        for a in &self.genesis.accounts {
            out.push(Command::CreateAccount {
                account: a.id.clone(),
                pubkey: PublicKey::from_hex(&a.pubkey)?,
            });
        }
        for a in &self.genesis.assets {
            out.push(Command::CreateAsset { asset: a.clone() });
        }
        for e in &self.genesis.endowments {
            out.push(Command::AddAssetQuantity {
                account: e.account.clone(),
                asset: e.asset.clone(),
                amount: e.amount,
            });
        }
        for p in &self.genesis.peers {
            out.push(Command::AddPeer {
                peer: Peer {
                    address: p.address.clone(),
                    pubkey: PublicKey::from_hex(&p.pubkey)?,
                },
            });
        }
        Ok(out)
    }
}
