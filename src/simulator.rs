//! Simulator: turns each proposal into a candidate block by running
//! stateful validation on a throwaway world-state snapshot.
//!
//! The snapshot is always discarded; the simulator never writes canonical
//! state.

use crate::crypto::NodeSigner;
use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::types::{
    commit_sign_bytes, tx_merkle_root, Block, BlockHeader, BlockSignature, Proposal,
};
use crate::validation::stateful_validate;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SimulatorParams<S> {
    pub storage: Arc<Storage>,
    pub signer: Arc<S>,
    pub proposal_rx: broadcast::Receiver<Proposal>,
    pub candidate_tx: broadcast::Sender<Block>,
    /// Proposals after stateful filtering, for status consumers.
    pub verified_tx: broadcast::Sender<Proposal>,
    pub metrics: Arc<Metrics>,
    pub shutdown: watch::Receiver<bool>,
}

pub struct Simulator;

impl Simulator {
    pub fn spawn<S: NodeSigner + 'static>(mut p: SimulatorParams<S>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    proposal = p.proposal_rx.recv() => {
                        match proposal {
                            Ok(proposal) => Self::process(&p, proposal),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "proposal stream lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
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

    fn process<S: NodeSigner>(p: &SimulatorParams<S>, proposal: Proposal) {
        // A proposal is simulated only on top of its direct predecessor.
        // Anything else means this node is behind; catch-up will cover the
        // gap and the proposal is dropped.
        let Some(last_block) = p.storage.block_query().get(proposal.height.wrapping_sub(1)) else {
            debug!(height = proposal.height, "predecessor missing; proposal discarded");
            p.metrics.proposals_discarded.inc();
            return;
        };
        if last_block.header.height + 1 != proposal.height {
            p.metrics.proposals_discarded.inc();
            return;
        }

        let mut wsv = p.storage.create_temporary_wsv();
        let verified = stateful_validate(&proposal, &mut wsv);
        let dropped = proposal.transactions.len() - verified.transactions.len();
        if dropped > 0 {
            debug!(height = proposal.height, dropped, "stateful validation dropped transactions");
        }

        // The proposer's clock, carried in the proposal, stamps the block:
        // every validator that simulates this proposal builds the identical
        // candidate and votes for the same hash.
        let mut block = Block {
            header: BlockHeader {
                height: verified.height,
                prev_hash: last_block.hash(),
                merkle_root: tx_merkle_root(&verified.transactions),
                txs_number: verified.transactions.len() as u32,
                created_ms: proposal.created_ms,
            },
            transactions: verified.transactions.clone(),
            signatures: vec![],
        };
        let hash = block.hash();
        block.signatures.push(BlockSignature {
            pubkey: p.signer.public_key(),
            signature: p.signer.sign(&commit_sign_bytes(block.header.height, &hash)),
        });

        info!(
            height = block.header.height,
            txs = block.header.txs_number,
            hash = %hash.short_hex(),
            "candidate block built"
        );
        p.metrics.candidates_built.inc();
        let _ = p.candidate_tx.send(block);
        let _ = p.verified_tx.send(verified);
        // `wsv` drops here: the snapshot and its buffered writes vanish.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ed25519::NodeKeypair;
    use crate::storage::block_store::MemBlockStore;
    use crate::types::{Command, Transaction, TxPayload, TxSignature};
    use crate::wsv::genesis_block;
    use std::time::Duration;

    fn harness() -> (
        Arc<Storage>,
        NodeKeypair,
        broadcast::Sender<Proposal>,
        broadcast::Receiver<Block>,
        watch::Sender<bool>,
    ) {
        let kp = NodeKeypair::from_seed([1; 32]);
        let genesis = genesis_block(vec![
            Command::CreateDomain { domain: "wonderland".into() },
            Command::CreateAccount {
                account: "alice@wonderland".into(),
                pubkey: kp.public_key(),
            },
            Command::CreateAsset { asset: "rose#wonderland".into() },
            Command::AddAssetQuantity {
                account: "alice@wonderland".into(),
                asset: "rose#wonderland".into(),
                amount: 10,
            },
        ]);
        let storage = Storage::open(Arc::new(MemBlockStore::default()), None, genesis).unwrap();
        let (proposal_tx, proposal_rx) = broadcast::channel(16);
        let (candidate_tx, candidate_rx) = broadcast::channel(16);
        let (verified_tx, _verified_rx) = broadcast::channel(16);
        let (shutdown_tx, shutdown) = watch::channel(false);
        Simulator::spawn(SimulatorParams {
            storage: storage.clone(),
            signer: Arc::new(kp.clone()),
            proposal_rx,
            candidate_tx,
            verified_tx,
            metrics: Arc::new(Metrics::new().unwrap()),
            shutdown,
        });
        (storage, kp, proposal_tx, candidate_rx, shutdown_tx)
    }

    fn signed_tx(kp: &NodeKeypair, commands: Vec<Command>, nonce: u64) -> Transaction {
        let payload = TxPayload { creator: "alice@wonderland".into(), created_ms: nonce, commands };
        let signature = kp.sign(&crate::types::tx_sign_bytes(&payload));
        Transaction { payload, signatures: vec![TxSignature { pubkey: kp.public_key(), signature }] }
    }

    #[tokio::test]
    async fn candidate_links_to_top_block() {
        let (storage, kp, proposal_tx, mut candidates, _shutdown) = harness();
        let tx = signed_tx(
            &kp,
            vec![Command::TransferAsset {
                src: "alice@wonderland".into(),
                dest: "alice@wonderland".into(),
                asset: "rose#wonderland".into(),
                amount: 1,
            }],
            1,
        );
        proposal_tx
            .send(Proposal { height: 1, transactions: vec![tx], created_ms: 0 })
            .unwrap();
        let block = tokio::time::timeout(Duration::from_secs(2), candidates.recv())
            .await
            .unwrap()
            .unwrap();
        let genesis_hash = storage.block_query().get(0).unwrap().hash();
        assert_eq!(block.header.height, 1);
        assert_eq!(block.header.prev_hash, genesis_hash);
        assert_eq!(block.header.txs_number, 1);
        assert_eq!(block.signatures.len(), 1);
        // Canonical state untouched: the snapshot was discarded.
        assert_eq!(storage.block_query().top_height(), Some(0));
    }

    #[tokio::test]
    async fn proposal_for_future_height_is_discarded() {
        let (_storage, kp, proposal_tx, mut candidates, _shutdown) = harness();
        let tx = signed_tx(&kp, vec![Command::CreateDomain { domain: "x".into() }], 1);
        // Node is at height 0; a proposal at height 3 has no predecessor.
        proposal_tx
            .send(Proposal { height: 3, transactions: vec![tx], created_ms: 0 })
            .unwrap();
        let got = tokio::time::timeout(Duration::from_millis(300), candidates.recv()).await;
        assert!(got.is_err(), "candidate emitted for a proposal the node cannot simulate");
    }

    #[tokio::test]
    async fn stateful_rejections_shrink_candidate() {
        let (_storage, kp, proposal_tx, mut candidates, _shutdown) = harness();
        let good = signed_tx(
            &kp,
            vec![Command::AddAssetQuantity {
                account: "alice@wonderland".into(),
                asset: "rose#wonderland".into(),
                amount: 2,
            }],
            1,
        );
        let overdraw = signed_tx(
            &kp,
            vec![Command::TransferAsset {
                src: "alice@wonderland".into(),
                dest: "alice@wonderland".into(),
                asset: "rose#wonderland".into(),
                amount: 10_000,
            }],
            2,
        );
        proposal_tx
            .send(Proposal { height: 1, transactions: vec![good.clone(), overdraw], created_ms: 0 })
            .unwrap();
        let block = tokio::time::timeout(Duration::from_secs(2), candidates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.header.txs_number, 1);
        assert_eq!(block.transactions[0].payload_hash(), good.payload_hash());
    }
}
