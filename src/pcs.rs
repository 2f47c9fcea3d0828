//! Peer communication service: a thin multiplexer over the proposal and
//! commit streams.
//!
//! Both streams are hot: a subscriber sees every event published after it
//! subscribed and nothing from before. Slow subscribers lag and drop
//! rather than block the publishers.

use crate::types::{Block, Proposal};
use tokio::sync::broadcast;

pub struct PeerCommunicationService {
    proposal_tx: broadcast::Sender<Proposal>,
    commit_tx: broadcast::Sender<Block>,
}

impl PeerCommunicationService {
    pub fn new(capacity: usize) -> Self {
        let (proposal_tx, _) = broadcast::channel(capacity);
        let (commit_tx, _) = broadcast::channel(capacity);
        Self { proposal_tx, commit_tx }
    }

    /// Publisher handle for the ordering gate.
    pub fn proposal_sender(&self) -> broadcast::Sender<Proposal> {
        self.proposal_tx.clone()
    }

    /// Publisher handle for the synchronizer.
    pub fn commit_sender(&self) -> broadcast::Sender<Block> {
        self.commit_tx.clone()
    }

    pub fn on_proposal(&self) -> broadcast::Receiver<Proposal> {
        self.proposal_tx.subscribe()
    }

    pub fn on_commit(&self) -> broadcast::Receiver<Block> {
        self.commit_tx.subscribe()
    }
}

impl Default for PeerCommunicationService {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, Hash32};

    fn block(height: u64) -> Block {
        Block {
            header: BlockHeader {
                height,
                prev_hash: Hash32::zero(),
                merkle_root: crate::types::tx_merkle_root(&[]),
                txs_number: 0,
                created_ms: 0,
            },
            transactions: vec![],
            signatures: vec![],
        }
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let pcs = PeerCommunicationService::default();
        let early_commit = pcs.commit_sender();
        let _sink = pcs.on_commit();
        early_commit.send(block(1)).unwrap();

        let mut late = pcs.on_commit();
        early_commit.send(block(2)).unwrap();
        assert_eq!(late.recv().await.unwrap().header.height, 2);
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn commit_order_matches_publication_order() {
        let pcs = PeerCommunicationService::default();
        let mut sub = pcs.on_commit();
        let tx = pcs.commit_sender();
        for h in 1..=3 {
            tx.send(block(h)).unwrap();
        }
        for h in 1..=3 {
            assert_eq!(sub.recv().await.unwrap().header.height, h);
        }
    }
}
