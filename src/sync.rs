//! Synchronizer: turns consensus decisions into commits.
//!
//! A decision matching the locally built candidate is committed directly;
//! any other decision (or an explicit lag report) triggers catch-up, which
//! pulls the missing range from peers with per-peer failover and applies it
//! through a single mutable snapshot. All commits are published on one
//! stream, gap-free and strictly increasing.

use crate::consensus::Decision;
use crate::crypto::{PublicKey, SignatureVerifier};
use crate::loader::{BlockLoader, LoaderError};
use crate::metrics::Metrics;
use crate::storage::{PeerQuery, Storage};
use crate::types::{Block, BlockSignature, Hash32, Height};
use crate::validation::chain_validate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct SyncParams<V> {
    pub storage: Arc<Storage>,
    pub peer_query: PeerQuery,
    pub loader: BlockLoader<V>,
    pub local_pk: PublicKey,
    pub decision_rx: broadcast::Receiver<Decision>,
    /// Candidate blocks, cached so a decision for our own candidate can be
    /// committed without a network round-trip.
    pub candidate_rx: broadcast::Receiver<Block>,
    /// Explicit catch-up requests (status poll, behind detection).
    pub request_rx: mpsc::UnboundedReceiver<Height>,
    pub commit_tx: broadcast::Sender<Block>,
    pub metrics: Arc<Metrics>,
    pub shutdown: watch::Receiver<bool>,
}

pub struct Synchronizer;

impl Synchronizer {
    pub fn spawn<V: SignatureVerifier + 'static>(mut p: SyncParams<V>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut candidates: HashMap<Hash32, Block> = HashMap::new();

            loop {
                tokio::select! {
                    // Candidates are published strictly before the decision
                    // that references them; drain them first so a decision
                    // for our own candidate never misses the cache.
                    biased;

                    candidate = p.candidate_rx.recv() => {
                        match candidate {
                            Ok(block) => {
                                candidates.insert(block.hash(), block);
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "candidate stream lagged in synchronizer");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    decision = p.decision_rx.recv() => {
                        match decision {
                            Ok(decision) => {
                                Self::handle_decision(&p, &mut candidates, decision).await;
                                let top = p.storage.block_query().top_height().unwrap_or(0);
                                candidates.retain(|_, b| b.header.height > top);
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "decision stream lagged in synchronizer");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    target = p.request_rx.recv() => {
                        let Some(target) = target else { break };
                        let top = p.storage.block_query().top_height().unwrap_or(0);
                        if target > top {
                            Self::catch_up(&p, target, None).await;
                        }
                    }
                    _ = p.shutdown.changed() => {
                        // A commit in flight finishes inside its select arm;
                        // shutdown only lands between events.
                        if *p.shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn handle_decision<V: SignatureVerifier>(
        p: &SyncParams<V>,
        candidates: &mut HashMap<Hash32, Block>,
        decision: Decision,
    ) {
        let top = p.storage.block_query().top_height().unwrap_or(0);
        if decision.height <= top {
            debug!(height = decision.height, top, "stale decision ignored");
            return;
        }

        let local = candidates
            .get(&decision.block_hash)
            .filter(|b| b.header.height == decision.height)
            .cloned();

        match local {
            Some(block) if decision.height == top + 1 => {
                if Self::commit_own(p, block, &decision) {
                    return;
                }
                // Chain validation refused the block we voted for: fatal
                // for this height, recover through peers.
                Self::catch_up(p, decision.height, Some(decision.block_hash.clone())).await;
            }
            _ => {
                // The winning hash is not ours, or we are more than one
                // block behind.
                Self::catch_up(p, decision.height, Some(decision.block_hash.clone())).await;
            }
        }
    }

    /// Commit the locally built candidate for a decision that chose it.
    /// Returns false if validation or the commit itself failed.
    fn commit_own<V: SignatureVerifier>(p: &SyncParams<V>, mut block: Block, decision: &Decision) -> bool {
        // Fold the quorum votes into the block's signature set.
        for vote in &decision.votes {
            if !block.signatures.iter().any(|s| s.pubkey == vote.voter) {
                block.signatures.push(BlockSignature {
                    pubkey: vote.voter.clone(),
                    signature: vote.signature.clone(),
                });
            }
        }

        let mut ms = p.storage.create_mutable_storage();
        let peers = ms.state().peer_set();
        let expected_height = ms.top_height().map_or(0, |t| t + 1);
        if let Err(e) = chain_validate::<V>(&block, expected_height, &ms.top_hash(), &peers) {
            error!(height = block.header.height, "own candidate failed chain validation: {e}");
            return false;
        }
        if let Err(e) = ms.apply_block(block) {
            error!("candidate replay failed: {e}");
            return false;
        }
        match p.storage.commit(ms) {
            Ok(committed) => {
                Self::publish(p, committed);
                true
            }
            Err(e) => {
                error!("commit failed: {e}");
                false
            }
        }
    }

    /// Pull `(top, target]` from peers, validating each block against the
    /// evolving snapshot. Each peer's valid progress is committed through
    /// one mutable snapshot; a peer that falls short hands over to the
    /// next. If no peer supplies anything valid, local state is unchanged
    /// and the failure is surfaced.
    async fn catch_up<V: SignatureVerifier>(p: &SyncParams<V>, target: Height, expected: Option<Hash32>) {
        p.metrics.catch_up_runs.inc();
        let peers: Vec<_> = p
            .peer_query
            .peers()
            .into_iter()
            .filter(|peer| peer.pubkey != p.local_pk)
            .collect();

        for peer in &peers {
            match Self::catch_up_from(p, peer, target, expected.as_ref()).await {
                Ok(committed) => {
                    let reached = p.storage.block_query().top_height().unwrap_or(0);
                    info!(
                        peer = %peer.address,
                        to = reached,
                        blocks = committed.len(),
                        "catch-up range committed"
                    );
                    Self::publish(p, committed);
                    if reached >= target {
                        return;
                    }
                }
                Err(e) => {
                    warn!(peer = %peer.address, "catch-up attempt failed: {e}");
                }
            }
        }
        if p.storage.block_query().top_height().unwrap_or(0) < target {
            p.metrics.catch_up_failures.inc();
            error!(target, "catch-up failed: no peer supplied a valid block range");
        }
    }

    async fn catch_up_from<V: SignatureVerifier>(
        p: &SyncParams<V>,
        peer: &crate::types::Peer,
        target: Height,
        expected: Option<&Hash32>,
    ) -> Result<Vec<Block>, LoaderError> {
        let mut ms = p.storage.create_mutable_storage();
        let base = ms.top_height().unwrap_or(0);

        while ms.top_height().unwrap_or(0) < target {
            let from = ms.top_height().unwrap_or(0);
            let prev_hash = ms.top_hash();
            let peers_now = ms.state().peer_set();
            let blocks = p.loader.fetch(peer, from, target, &prev_hash, &peers_now).await?;
            if blocks.is_empty() {
                // The peer has nothing above `from`; keep what validated.
                break;
            }

            for block in blocks {
                // Re-validate against the evolving peer set before applying;
                // the loader checked with the set as of the fetch start.
                let expected_height = ms.top_height().map_or(0, |t| t + 1);
                chain_validate::<V>(&block, expected_height, &ms.top_hash(), &ms.state().peer_set())
                    .map_err(|_| LoaderError::InvalidStream("chain validation failed"))?;
                ms.apply_block(block)
                    .map_err(|_| LoaderError::InvalidStream("block replay failed"))?;
            }
        }

        let reached = ms.top_height().unwrap_or(0);
        if reached == base {
            return Err(LoaderError::InvalidStream("peer supplied no blocks"));
        }
        if let Some(want) = expected {
            if reached >= target && &ms.top_hash() != want {
                return Err(LoaderError::InvalidStream("target hash mismatch"));
            }
        }

        p.storage
            .commit(ms)
            .map_err(|_| LoaderError::InvalidStream("commit refused"))
    }

    fn publish<V>(p: &SyncParams<V>, committed: Vec<Block>) {
        for block in committed {
            p.metrics.blocks_committed.inc();
            p.metrics.commit_height.set(block.header.height as i64);
            info!(
                height = block.header.height,
                txs = block.header.txs_number,
                hash = %block.hash().short_hex(),
                "block committed"
            );
            let _ = p.commit_tx.send(block);
        }
    }
}
