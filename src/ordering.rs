//! Ordering gate: aggregates transactions from the local submit surface and
//! peer gossip, and emits proposals on a size-or-timeout trigger.

use crate::consensus::proposer_for;
use crate::crypto::PublicKey;
use crate::storage::{BlockQuery, PeerQuery};
use crate::types::{Block, Hash32, Height, Proposal, Transaction};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct OrderingConfig {
    /// Size trigger: emit as soon as this many transactions are pending.
    pub max_tx_per_proposal: usize,
    /// Time trigger: emit whatever is pending this long after the last
    /// proposal (empty proposals are suppressed).
    pub proposal_delay_ms: u64,
    /// Bound on the pending queue; submissions beyond it are dropped.
    pub queue_cap: usize,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self { max_tx_per_proposal: 10, proposal_delay_ms: 5_000, queue_cap: 4_096 }
    }
}

pub struct OrderingGate;

pub struct OrderingParams {
    pub cfg: OrderingConfig,
    pub block_query: BlockQuery,
    /// Peer set used for the round-robin proposer check.
    pub peer_query: PeerQuery,
    pub local_pk: PublicKey,
    /// Transactions from the submit surface and from peer gossip.
    pub ingest_rx: mpsc::Receiver<Transaction>,
    pub proposal_tx: broadcast::Sender<Proposal>,
    /// Committed blocks; transactions another proposer landed are pruned
    /// from the pending queue.
    pub commit_rx: broadcast::Receiver<Block>,
    pub metrics: std::sync::Arc<crate::metrics::Metrics>,
    pub shutdown: watch::Receiver<bool>,
}

impl OrderingGate {
    pub fn spawn(mut p: OrderingParams) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut pending: VecDeque<Transaction> = VecDeque::new();
            // Every payload hash ever accepted; the dedup (and replay)
            // window spans the node's lifetime.
            let mut seen: HashSet<Hash32> = HashSet::new();
            let mut last_emit = Instant::now();
            let mut last_height: Option<Height> = None;

            loop {
                let deadline = last_emit + Duration::from_millis(p.cfg.proposal_delay_ms);
                tokio::select! {
                    tx = p.ingest_rx.recv() => {
                        let Some(tx) = tx else { break };
                        let hash = tx.payload_hash();
                        if seen.contains(&hash) {
                            debug!(tx = %hash.short_hex(), "duplicate transaction dropped");
                            continue;
                        }
                        if pending.len() >= p.cfg.queue_cap {
                            warn!(cap = p.cfg.queue_cap, "pending queue full; transaction dropped");
                            p.metrics.txs_rejected.inc();
                            continue;
                        }
                        seen.insert(hash);
                        pending.push_back(tx);
                        if pending.len() >= p.cfg.max_tx_per_proposal {
                            Self::emit(&p, &mut pending, &mut last_emit, &mut last_height);
                        }
                    }
                    commit = p.commit_rx.recv() => {
                        match commit {
                            Ok(block) => {
                                // Drop anything another proposer already got
                                // committed. `seen` keeps the hash so a
                                // replayed submission stays deduplicated.
                                let committed: HashSet<Hash32> =
                                    block.transactions.iter().map(|t| t.payload_hash()).collect();
                                if !committed.is_empty() {
                                    pending.retain(|t| !committed.contains(&t.payload_hash()));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "commit stream lagged in ordering gate");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        if pending.is_empty() {
                            // Empty proposals are suppressed; restart the window.
                            last_emit = Instant::now();
                        } else {
                            Self::emit(&p, &mut pending, &mut last_emit, &mut last_height);
                        }
                    }
                    _ = p.shutdown.changed() => {
                        if *p.shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn emit(
        p: &OrderingParams,
        pending: &mut VecDeque<Transaction>,
        last_emit: &mut Instant,
        last_height: &mut Option<Height>,
    ) {
        let height = p.block_query.top_height().map_or(1, |t| t + 1);
        // Never two proposals at the same height: wait until the previous
        // one is resolved by a commit.
        if *last_height == Some(height) {
            debug!(height, "previous proposal still in flight; holding batch");
            *last_emit = Instant::now();
            return;
        }
        // Only the designated proposer for this height emits; everyone else
        // keeps collecting and relies on gossip to reach the proposer.
        let peers = p.peer_query.peers();
        if let Some(proposer) = proposer_for(&peers, height) {
            if proposer.pubkey != p.local_pk {
                debug!(height, proposer = %proposer.pubkey.short_hex(), "not our turn to propose");
                *last_emit = Instant::now();
                return;
            }
        }

        let take = pending.len().min(p.cfg.max_tx_per_proposal);
        let transactions: Vec<Transaction> = pending.drain(..take).collect();
        let proposal = Proposal {
            height,
            transactions,
            created_ms: now_ms(),
        };
        info!(height, txs = proposal.transactions.len(), "proposal emitted");
        p.metrics.proposals_emitted.inc();
        *last_emit = Instant::now();
        *last_height = Some(height);
        let _ = p.proposal_tx.send(proposal);
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ed25519::NodeKeypair;
    use crate::crypto::NodeSigner;
    use crate::storage::block_store::MemBlockStore;
    use crate::storage::Storage;
    use crate::types::{Command, TxPayload, TxSignature};
    use crate::wsv::genesis_block;
    use std::sync::Arc;

    fn tx(n: u64) -> Transaction {
        let kp = NodeKeypair::from_seed([1; 32]);
        let payload = TxPayload {
            creator: "alice@wonderland".into(),
            created_ms: n,
            commands: vec![Command::CreateDomain { domain: format!("d{n}") }],
        };
        let signature = kp.sign(&crate::types::tx_sign_bytes(&payload));
        Transaction { payload, signatures: vec![TxSignature { pubkey: kp.public_key(), signature }] }
    }

    struct GateHarness {
        ingest: mpsc::Sender<Transaction>,
        proposals: broadcast::Receiver<Proposal>,
        _commit_tx: broadcast::Sender<Block>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn gate(cfg: OrderingConfig) -> GateHarness {
        let storage = Storage::open(
            Arc::new(MemBlockStore::default()),
            None,
            genesis_block(vec![Command::CreateDomain { domain: "wonderland".into() }]),
        )
        .unwrap();
        let (ingest_tx, ingest_rx) = mpsc::channel(64);
        let (proposal_tx, proposal_rx) = broadcast::channel(16);
        let (commit_tx, commit_rx) = broadcast::channel(16);
        let (shutdown_tx, shutdown) = watch::channel(false);
        OrderingGate::spawn(OrderingParams {
            cfg,
            block_query: storage.block_query(),
            peer_query: storage.peer_query(),
            local_pk: NodeKeypair::from_seed([1; 32]).public_key(),
            ingest_rx,
            proposal_tx,
            commit_rx,
            metrics: Arc::new(crate::metrics::Metrics::new().unwrap()),
            shutdown,
        });
        GateHarness {
            ingest: ingest_tx,
            proposals: proposal_rx,
            _commit_tx: commit_tx,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn size_trigger_fires_before_delay() {
        let mut h = gate(OrderingConfig {
            max_tx_per_proposal: 3,
            proposal_delay_ms: 60_000,
            queue_cap: 100,
        });
        for n in 0..3 {
            h.ingest.send(tx(n)).await.unwrap();
        }
        let proposal =
            tokio::time::timeout(Duration::from_secs(2), h.proposals.recv()).await.unwrap().unwrap();
        assert_eq!(proposal.height, 1);
        assert_eq!(proposal.transactions.len(), 3);
    }

    #[tokio::test]
    async fn time_trigger_emits_partial_batch_in_order() {
        let mut h = gate(OrderingConfig {
            max_tx_per_proposal: 10,
            proposal_delay_ms: 200,
            queue_cap: 100,
        });
        let a = tx(1);
        let b = tx(2);
        h.ingest.send(a.clone()).await.unwrap();
        h.ingest.send(b.clone()).await.unwrap();
        let proposal =
            tokio::time::timeout(Duration::from_secs(2), h.proposals.recv()).await.unwrap().unwrap();
        assert_eq!(proposal.transactions.len(), 2);
        assert_eq!(proposal.transactions[0].payload_hash(), a.payload_hash());
        assert_eq!(proposal.transactions[1].payload_hash(), b.payload_hash());
    }

    #[tokio::test]
    async fn duplicates_deduplicated_on_insert() {
        let mut h = gate(OrderingConfig {
            max_tx_per_proposal: 10,
            proposal_delay_ms: 200,
            queue_cap: 100,
        });
        let a = tx(1);
        h.ingest.send(a.clone()).await.unwrap();
        h.ingest.send(a.clone()).await.unwrap();
        h.ingest.send(a).await.unwrap();
        let proposal =
            tokio::time::timeout(Duration::from_secs(2), h.proposals.recv()).await.unwrap().unwrap();
        assert_eq!(proposal.transactions.len(), 1);
    }

    #[tokio::test]
    async fn no_second_proposal_at_same_height() {
        let mut h = gate(OrderingConfig {
            max_tx_per_proposal: 1,
            proposal_delay_ms: 100,
            queue_cap: 100,
        });
        h.ingest.send(tx(1)).await.unwrap();
        h.ingest.send(tx(2)).await.unwrap();
        let first =
            tokio::time::timeout(Duration::from_secs(2), h.proposals.recv()).await.unwrap().unwrap();
        assert_eq!(first.height, 1);
        // No commit happened, so the gate must hold the second batch even
        // though both triggers have fired repeatedly.
        let second = tokio::time::timeout(Duration::from_millis(500), h.proposals.recv()).await;
        assert!(second.is_err(), "gate emitted a second proposal at height 1");
    }
}
