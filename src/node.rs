//! Node assembly: brings the subsystems up leaves-first, wires their event
//! streams, and drives them until shutdown.
//!
//! Data flow: submit/gossip -> OrderingGate -> Simulator -> ConsensusGate
//! -> Synchronizer -> Storage, with the proposal and commit streams
//! republished through the PeerCommunicationService.

use crate::consensus::{proposer_for, ConsensusGate, GateParams, Vote, YacConfig};
use crate::crypto::ed25519::{NodeKeypair, Ed25519Oracle};
use crate::crypto::NodeSigner;
use crate::loader::BlockLoader;
use crate::metrics::Metrics;
use crate::net::{Envelope, GossipPayload, PeerNetwork};
use crate::ordering::{OrderingConfig, OrderingGate, OrderingParams};
use crate::pcs::PeerCommunicationService;
use crate::simulator::{Simulator, SimulatorParams};
use crate::storage::Storage;
use crate::sync::{SyncParams, Synchronizer};
use crate::types::{Proposal, Transaction};
use crate::validation::{stateless_validate, ValidationError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct NodeParams {
    pub ordering: OrderingConfig,
    pub yac: YacConfig,
    /// Per-peer timeout for block-range fetches.
    pub fetch_timeout: Duration,
    /// Interval between peer status polls.
    pub status_poll: Duration,
}

impl Default for NodeParams {
    fn default() -> Self {
        Self {
            ordering: OrderingConfig::default(),
            yac: YacConfig::default(),
            fetch_timeout: Duration::from_secs(10),
            status_poll: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("transaction rejected: {0}")]
    Rejected(#[from] ValidationError),
    #[error("ingest queue full")]
    Backpressure,
    #[error("node is shutting down")]
    Closed,
}

/// Submit surface handed to the RPC layer and to tests.
#[derive(Clone)]
pub struct NodeHandle {
    ingest: mpsc::Sender<Transaction>,
    net: Arc<dyn PeerNetwork>,
    keypair: Arc<NodeKeypair>,
    metrics: Arc<Metrics>,
}

impl NodeHandle {
    /// Stateless-validate, gossip to peers, and enqueue locally. Returns
    /// acknowledgement only; final status is observable on the PCS streams.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<(), SubmitError> {
        if let Err(e) = stateless_validate::<Ed25519Oracle>(&tx) {
            self.metrics.txs_rejected.inc();
            return Err(e.into());
        }
        if let Ok(env) = Envelope::seal(&GossipPayload::Transaction(tx.clone()), self.keypair.as_ref()) {
            self.net.broadcast(env).await;
        }
        self.ingest.try_send(tx).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })?;
        self.metrics.txs_submitted.inc();
        Ok(())
    }
}

pub struct Node {
    storage: Arc<Storage>,
    pcs: Arc<PeerCommunicationService>,
    handle: NodeHandle,
    verified_tx: broadcast::Sender<Proposal>,
    metrics: Arc<Metrics>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Assemble and start every subsystem. `storage` must already be open
    /// (it is the deepest leaf); `net`/`gossip_rx` come from the chosen
    /// transport.
    pub fn init(
        params: NodeParams,
        keypair: NodeKeypair,
        storage: Arc<Storage>,
        net: Arc<dyn PeerNetwork>,
        mut gossip_rx: mpsc::UnboundedReceiver<Envelope>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let keypair = Arc::new(keypair);
        let local_pk = keypair.public_key();

        let peer_query = storage.peer_query();
        let block_query = storage.block_query();
        let start_height = block_query.top_height().unwrap_or(0) + 1;
        info!(height = start_height, "node starting");

        let pcs = Arc::new(PeerCommunicationService::new(256));
        let (candidate_tx, _) = broadcast::channel(64);
        let (verified_tx, _) = broadcast::channel(64);
        let (decision_tx, _) = broadcast::channel(64);
        let (ingest_tx, ingest_rx) = mpsc::channel(params.ordering.queue_cap);
        let (vote_in_tx, vote_in_rx) = mpsc::unbounded_channel();
        let (vote_out_tx, mut vote_out_rx) = mpsc::unbounded_channel::<Vote>();
        let (sync_req_tx, sync_req_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();

        tasks.push(OrderingGate::spawn(OrderingParams {
            cfg: params.ordering.clone(),
            block_query: block_query.clone(),
            peer_query: peer_query.clone(),
            local_pk: local_pk.clone(),
            ingest_rx,
            proposal_tx: pcs.proposal_sender(),
            commit_rx: pcs.on_commit(),
            metrics: metrics.clone(),
            shutdown: shutdown_rx.clone(),
        }));

        tasks.push(Simulator::spawn(SimulatorParams {
            storage: storage.clone(),
            signer: keypair.clone(),
            proposal_rx: pcs.on_proposal(),
            candidate_tx: candidate_tx.clone(),
            verified_tx: verified_tx.clone(),
            metrics: metrics.clone(),
            shutdown: shutdown_rx.clone(),
        }));

        tasks.push(ConsensusGate::spawn::<NodeKeypair, Ed25519Oracle>(GateParams {
            cfg: params.yac.clone(),
            signer: keypair.clone(),
            peer_query: peer_query.clone(),
            start_height,
            candidate_rx: candidate_tx.subscribe(),
            vote_rx: vote_in_rx,
            vote_tx: vote_out_tx,
            decision_tx: decision_tx.clone(),
            commit_rx: pcs.on_commit(),
            behind_tx: sync_req_tx.clone(),
            metrics: metrics.clone(),
            shutdown: shutdown_rx.clone(),
        }));

        tasks.push(Synchronizer::spawn::<Ed25519Oracle>(SyncParams {
            storage: storage.clone(),
            peer_query: peer_query.clone(),
            loader: BlockLoader::new(net.clone(), params.fetch_timeout),
            local_pk: local_pk.clone(),
            decision_rx: decision_tx.subscribe(),
            candidate_rx: candidate_tx.subscribe(),
            request_rx: sync_req_rx,
            commit_tx: pcs.commit_sender(),
            metrics: metrics.clone(),
            shutdown: shutdown_rx.clone(),
        }));

        // Ingress: open gossip envelopes and route their payloads. Invalid
        // signatures are dropped silently, counted.
        {
            let metrics = metrics.clone();
            let peer_query = peer_query.clone();
            let ingest_tx = ingest_tx.clone();
            let proposal_fwd = pcs.proposal_sender();
            let local_pk = local_pk.clone();
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        env = gossip_rx.recv() => {
                            let Some(env) = env else { break };
                            if env.sender == local_pk {
                                continue;
                            }
                            let payload = match env.open::<Ed25519Oracle>() {
                                Ok(p) => p,
                                Err(_) => {
                                    metrics.envelopes_dropped.inc();
                                    continue;
                                }
                            };
                            match payload {
                                GossipPayload::Transaction(tx) => {
                                    if stateless_validate::<Ed25519Oracle>(&tx).is_err() {
                                        metrics.txs_rejected.inc();
                                        continue;
                                    }
                                    if ingest_tx.try_send(tx).is_err() {
                                        debug!("ingest queue full; gossiped transaction dropped");
                                    }
                                }
                                GossipPayload::Proposal(proposal) => {
                                    // Accept only from the designated
                                    // proposer for that height.
                                    let peers = peer_query.peers();
                                    let from_proposer = proposer_for(&peers, proposal.height)
                                        .map_or(false, |p| p.pubkey == env.sender);
                                    if !from_proposer {
                                        debug!(height = proposal.height, "proposal from non-proposer dropped");
                                        continue;
                                    }
                                    let _ = proposal_fwd.send(proposal);
                                }
                                GossipPayload::Vote(vote) => {
                                    let _ = vote_in_tx.send(vote);
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Egress: our votes, and our own proposals, sealed and gossiped.
        {
            let net = net.clone();
            let keypair = keypair.clone();
            let peer_query = peer_query.clone();
            let local_pk = local_pk.clone();
            let mut proposal_rx = pcs.on_proposal();
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        vote = vote_out_rx.recv() => {
                            let Some(vote) = vote else { break };
                            if let Ok(env) = Envelope::seal(&GossipPayload::Vote(vote), keypair.as_ref()) {
                                net.broadcast(env).await;
                            }
                        }
                        proposal = proposal_rx.recv() => {
                            match proposal {
                                Ok(proposal) => {
                                    // Remote proposals also land on this
                                    // stream; gossip only the ones we
                                    // proposed ourselves.
                                    let peers = peer_query.peers();
                                    let ours = proposer_for(&peers, proposal.height)
                                        .map_or(true, |p| p.pubkey == local_pk);
                                    if !ours {
                                        continue;
                                    }
                                    if let Ok(env) = Envelope::seal(&GossipPayload::Proposal(proposal), keypair.as_ref()) {
                                        net.broadcast(env).await;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Status poll: discover committed heights we are missing and hand
        // them to the synchronizer (startup catch-up is just the first
        // tick).
        {
            let net = net.clone();
            let peer_query = peer_query.clone();
            let block_query = block_query.clone();
            let local_pk = local_pk.clone();
            let sync_req_tx = sync_req_tx.clone();
            let mut shutdown = shutdown_rx.clone();
            let poll = params.status_poll;
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(poll);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let local_top = block_query.top_height().unwrap_or(0);
                            let mut best = local_top;
                            for peer in peer_query.peers() {
                                if peer.pubkey == local_pk {
                                    continue;
                                }
                                if let Ok(status) = net.request_status(&peer).await {
                                    if let Some(t) = status.top_height {
                                        best = best.max(t);
                                    }
                                }
                            }
                            if best > local_top {
                                debug!(local = local_top, best, "behind peers; requesting catch-up");
                                let _ = sync_req_tx.send(best);
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        let handle = NodeHandle {
            ingest: ingest_tx,
            net,
            keypair: keypair.clone(),
            metrics: metrics.clone(),
        };

        Ok(Self { storage, pcs, handle, verified_tx, metrics, tasks, shutdown_tx })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn pcs(&self) -> &PeerCommunicationService {
        &self.pcs
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Proposals after stateful filtering, as published by the simulator.
    pub fn on_verified_proposal(&self) -> broadcast::Receiver<Proposal> {
        self.verified_tx.subscribe()
    }

    /// Block until `signal` resolves, then shut down.
    pub async fn run(self, signal: impl std::future::Future<Output = ()>) {
        signal.await;
        self.shutdown().await;
    }

    /// Signal every task to stop and wait for them to drain. Tasks only
    /// observe the signal between events, so an in-flight commit always
    /// completes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("node stopped");
    }
}
