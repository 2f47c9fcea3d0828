//! Consensus gate: votes on candidate block hashes and emits one decision
//! per height.

pub mod engine;
pub mod messages;

pub use engine::{ConsensusError, Phase, VoteOutbox, VoteOutcome, YacConfig, YacEngine};
pub use messages::{Decision, Vote};

use crate::crypto::{NodeSigner, SignatureVerifier};
use crate::metrics::Metrics;
use crate::storage::PeerQuery;
use crate::types::{Block, Height};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Supermajority threshold: strictly more than two thirds of `n`.
pub fn quorum_threshold(n: usize) -> usize {
    n * 2 / 3 + 1
}

/// Round-robin proposer for a height over the current peer set. `None`
/// when no peers are registered (single-node deployments propose freely).
pub fn proposer_for(peers: &[crate::types::Peer], height: Height) -> Option<&crate::types::Peer> {
    if peers.is_empty() {
        return None;
    }
    Some(&peers[(height as usize) % peers.len()])
}

struct ChannelOutbox {
    tx: mpsc::UnboundedSender<Vote>,
}

impl VoteOutbox for ChannelOutbox {
    fn broadcast_vote(&mut self, vote: Vote) {
        let _ = self.tx.send(vote);
    }
}

pub struct GateParams<S> {
    pub cfg: YacConfig,
    pub signer: Arc<S>,
    pub peer_query: PeerQuery,
    /// Height the node will vote on next (committed top + 1).
    pub start_height: Height,
    /// Candidate blocks from the simulator.
    pub candidate_rx: broadcast::Receiver<Block>,
    /// Verified peer votes from the wire.
    pub vote_rx: mpsc::UnboundedReceiver<Vote>,
    /// Our own votes, bound for the wire.
    pub vote_tx: mpsc::UnboundedSender<Vote>,
    pub decision_tx: broadcast::Sender<Decision>,
    /// Committed blocks; each one advances the engine to the next height.
    pub commit_rx: broadcast::Receiver<Block>,
    /// Raised when peer votes show we have fallen behind.
    pub behind_tx: mpsc::UnboundedSender<Height>,
    pub metrics: Arc<Metrics>,
    pub shutdown: watch::Receiver<bool>,
}

/// Drives a `YacEngine` from the node's event streams.
pub struct ConsensusGate;

const TICK_MS: u64 = 100;

impl ConsensusGate {
    pub fn spawn<S, V>(mut p: GateParams<S>) -> JoinHandle<()>
    where
        S: NodeSigner + 'static,
        V: SignatureVerifier + 'static,
    {
        tokio::spawn(async move {
            let mut engine =
                YacEngine::<V>::new(p.cfg.clone(), p.start_height, p.peer_query.peers());
            let mut out = ChannelOutbox { tx: p.vote_tx.clone() };
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(TICK_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // A candidate can outrun the commit that unlocks its height
            // (the ordering gate reads storage directly); park it until the
            // engine advances.
            let mut parked: Option<Block> = None;

            loop {
                tokio::select! {
                    candidate = p.candidate_rx.recv() => {
                        match candidate {
                            Ok(block) => {
                                let height = block.header.height;
                                if height > engine.height() {
                                    parked = Some(block);
                                    continue;
                                }
                                if height < engine.height() {
                                    debug!(height, current = engine.height(), "stale candidate ignored");
                                    continue;
                                }
                                if let Some(decision) =
                                    engine.on_candidate(p.signer.as_ref(), &mut out, height, block.hash())
                                {
                                    p.metrics.decisions.inc();
                                    let _ = p.decision_tx.send(decision);
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "candidate stream lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    vote = p.vote_rx.recv() => {
                        let Some(vote) = vote else { break };
                        p.metrics.votes_received.inc();
                        match engine.on_vote(vote) {
                            Ok(VoteOutcome::Decided(decision)) => {
                                p.metrics.decisions.inc();
                                let _ = p.decision_tx.send(decision);
                            }
                            Ok(VoteOutcome::Ahead(height)) => {
                                let _ = p.behind_tx.send(height);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                p.metrics.votes_rejected.inc();
                                debug!("vote rejected: {e}");
                            }
                        }
                    }
                    commit = p.commit_rx.recv() => {
                        match commit {
                            Ok(block) => {
                                let next = block.header.height + 1;
                                engine.advance(next, p.peer_query.peers());
                                if parked.as_ref().map(|b| b.header.height) == Some(engine.height()) {
                                    if let Some(block) = parked.take() {
                                        if let Some(decision) = engine.on_candidate(
                                            p.signer.as_ref(),
                                            &mut out,
                                            block.header.height,
                                            block.hash(),
                                        ) {
                                            p.metrics.decisions.inc();
                                            let _ = p.decision_tx.send(decision);
                                        }
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "commit stream lagged in consensus gate");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = tick.tick() => {
                        engine.tick(&mut out, TICK_MS);
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_threshold_is_supermajority() {
        assert_eq!(quorum_threshold(1), 1);
        assert_eq!(quorum_threshold(3), 3);
        assert_eq!(quorum_threshold(4), 3);
        assert_eq!(quorum_threshold(7), 5);
        assert_eq!(quorum_threshold(10), 7);
    }

    #[test]
    fn proposer_rotates_with_height() {
        use crate::crypto::PublicKey;
        use crate::types::Peer;
        let peers: Vec<Peer> = (0..3u8)
            .map(|i| Peer { address: format!("/node/{i}"), pubkey: PublicKey(vec![i; 32]) })
            .collect();
        assert_eq!(proposer_for(&peers, 1).unwrap().pubkey, peers[1].pubkey);
        assert_eq!(proposer_for(&peers, 2).unwrap().pubkey, peers[2].pubkey);
        assert_eq!(proposer_for(&peers, 3).unwrap().pubkey, peers[0].pubkey);
        assert!(proposer_for(&[], 1).is_none());
    }
}
