//! libp2p transport: gossipsub for the signed envelope topic (transactions
//! and votes), request-response for block-range transfer and status
//! polling, optional mDNS discovery.
//!
//! The swarm runs on its own task; `P2pHandle` sends it commands and
//! resolves request-response replies through oneshot channels.

use super::{Envelope, NetError, PeerNetwork, PeerStatus};
use crate::loader;
use crate::metrics::Metrics;
use crate::storage::BlockQuery;
use crate::types::{Block, Height, Peer};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    core::upgrade,
    gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode},
    mdns, noise,
    request_response::{
        self, Behaviour as RequestResponse, Codec as RequestResponseCodec,
        Event as RequestResponseEvent, Message as RequestResponseMessage, OutboundRequestId,
        ProtocolSupport,
    },
    swarm::behaviour::toggle::Toggle,
    swarm::{NetworkBehaviour, StreamProtocol, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm, Transport,
};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub fn proto_range() -> StreamProtocol {
    StreamProtocol::new("/naru/blockrange/1.0.0")
}
pub fn proto_status() -> StreamProtocol {
    StreamProtocol::new("/naru/status/1.0.0")
}

const GOSSIP_TOPIC: &str = "naru-gossip";
const MAX_MSG_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

// ── Request/response messages ─────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RangeRequest {
    pub from: Height,
    pub to: Height,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RangeResponse {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StatusRequest {}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Req {
    Range(RangeRequest),
    Status(StatusRequest),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Resp {
    Range(RangeResponse),
    Status(PeerStatus),
}

// ── Codec ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Codec;

#[async_trait]
impl RequestResponseCodec for Codec {
    type Protocol = StreamProtocol;
    type Request = Req;
    type Response = Resp;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Req>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        let mut limited = futures::AsyncReadExt::take(io, MAX_MSG_SIZE as u64 + 1);
        futures::AsyncReadExt::read_to_end(&mut limited, &mut buf).await?;
        if buf.len() > MAX_MSG_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request too large"));
        }
        bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e}")))
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Resp>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        let mut limited = futures::AsyncReadExt::take(io, MAX_MSG_SIZE as u64 + 1);
        futures::AsyncReadExt::read_to_end(&mut limited, &mut buf).await?;
        if buf.len() > MAX_MSG_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response too large"));
        }
        bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e}")))
    }

    async fn write_request<T>(&mut self, _: &StreamProtocol, io: &mut T, req: Req) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        let bytes = bincode::serialize(&req)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e}")))?;
        futures::AsyncWriteExt::write_all(io, &bytes).await?;
        futures::AsyncWriteExt::close(io).await
    }

    async fn write_response<T>(&mut self, _: &StreamProtocol, io: &mut T, resp: Resp) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        let bytes = bincode::serialize(&resp)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e}")))?;
        futures::AsyncWriteExt::write_all(io, &bytes).await?;
        futures::AsyncWriteExt::close(io).await
    }
}

// ── Behaviour ─────────────────────────────────────────────────────────────

#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub rr: RequestResponse<Codec>,
}

pub struct P2pConfig {
    pub local_key: libp2p::identity::Keypair,
    pub listen: Multiaddr,
    /// Peer addresses dialed at startup.
    pub static_peers: Vec<Multiaddr>,
    pub enable_mdns: bool,
    pub request_timeout: Duration,
}

/// Derive the libp2p identity from the node's ed25519 seed so the swarm
/// peer id is a pure function of the ledger public key.
pub fn identity_from_seed(mut seed: [u8; 32]) -> libp2p::identity::Keypair {
    libp2p::identity::Keypair::ed25519_from_bytes(&mut seed)
        .expect("32-byte ed25519 seed is always valid")
}

fn peer_id_of(peer: &Peer) -> Result<PeerId, NetError> {
    let pk = libp2p::identity::ed25519::PublicKey::try_from_bytes(&peer.pubkey.0)
        .map_err(|e| NetError::Codec(format!("peer key: {e}")))?;
    Ok(libp2p::identity::PublicKey::from(pk).to_peer_id())
}

// ── Driver ────────────────────────────────────────────────────────────────

enum Command {
    Broadcast(Envelope),
    RequestRange {
        peer: Peer,
        from: Height,
        to: Height,
        resp: oneshot::Sender<Result<Vec<Block>, NetError>>,
    },
    RequestStatus {
        peer: Peer,
        resp: oneshot::Sender<Result<PeerStatus, NetError>>,
    },
}

enum PendingReply {
    Range(oneshot::Sender<Result<Vec<Block>, NetError>>),
    Status(oneshot::Sender<Result<PeerStatus, NetError>>),
}

/// Command-channel front implementing `PeerNetwork`.
pub struct P2pHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl PeerNetwork for P2pHandle {
    async fn broadcast(&self, env: Envelope) {
        let _ = self.cmd_tx.send(Command::Broadcast(env));
    }

    async fn request_range(
        &self,
        peer: &Peer,
        from: Height,
        to: Height,
    ) -> Result<Vec<Block>, NetError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RequestRange { peer: peer.clone(), from, to, resp: tx })
            .map_err(|_| NetError::Unreachable("network task stopped".into()))?;
        rx.await.map_err(|_| NetError::Unreachable("request dropped".into()))?
    }

    async fn request_status(&self, peer: &Peer) -> Result<PeerStatus, NetError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RequestStatus { peer: peer.clone(), resp: tx })
            .map_err(|_| NetError::Unreachable("network task stopped".into()))?;
        rx.await.map_err(|_| NetError::Unreachable("request dropped".into()))?
    }
}

/// Build the swarm and spawn its driver task. Returns the outbound handle,
/// the inbound gossip stream, and the driver's join handle.
pub fn spawn(
    cfg: P2pConfig,
    block_query: BlockQuery,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(Arc<P2pHandle>, mpsc::UnboundedReceiver<Envelope>, JoinHandle<()>)> {
    let peer_id = PeerId::from(cfg.local_key.public());
    info!(%peer_id, "local peer id");

    let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1)
        .authenticate(noise::Config::new(&cfg.local_key)?)
        .multiplex(yamux::Config::default())
        .boxed();

    let topic = IdentTopic::new(GOSSIP_TOPIC);

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_millis(200))
        .validation_mode(ValidationMode::Strict)
        .max_transmit_size(MAX_MSG_SIZE)
        .build()?;
    let mut gossipsub = gossipsub::Behaviour::new(
        MessageAuthenticity::Signed(cfg.local_key.clone()),
        gossipsub_config,
    )
    .map_err(anyhow::Error::msg)?;
    gossipsub.subscribe(&topic)?;

    let mdns = if cfg.enable_mdns {
        Toggle::from(Some(mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?))
    } else {
        Toggle::from(None)
    };

    let protocols = vec![
        (proto_range(), ProtocolSupport::Full),
        (proto_status(), ProtocolSupport::Full),
    ];
    let rr_cfg = request_response::Config::default().with_request_timeout(cfg.request_timeout);
    let rr = RequestResponse::with_codec(Codec, protocols, rr_cfg);

    let behaviour = Behaviour { gossipsub, mdns, rr };
    let mut swarm = Swarm::new(
        transport,
        behaviour,
        peer_id,
        libp2p::swarm::Config::with_tokio_executor(),
    );
    swarm.listen_on(cfg.listen)?;
    for addr in cfg.static_peers.iter().cloned() {
        let _ = swarm.dial(addr);
    }

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut pending: HashMap<OutboundRequestId, PendingReply> = HashMap::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    handle_command(&mut swarm, &topic, &mut pending, cmd);
                }
                event = swarm.select_next_some() => {
                    handle_swarm_event(&mut swarm, &block_query, &metrics, &gossip_tx, &mut pending, event);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    Ok((Arc::new(P2pHandle { cmd_tx }), gossip_rx, task))
}

fn handle_command(
    swarm: &mut Swarm<Behaviour>,
    topic: &IdentTopic,
    pending: &mut HashMap<OutboundRequestId, PendingReply>,
    cmd: Command,
) {
    match cmd {
        Command::Broadcast(env) => {
            if let Ok(bytes) = bincode::serialize(&env) {
                if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic.clone(), bytes) {
                    debug!("gossipsub publish: {e:?}");
                }
            }
        }
        Command::RequestRange { peer, from, to, resp } => {
            let target = match peer_id_of(&peer) {
                Ok(id) => id,
                Err(e) => {
                    let _ = resp.send(Err(e));
                    return;
                }
            };
            if let Ok(addr) = peer.address.parse::<Multiaddr>() {
                let _ = swarm.dial(addr);
            }
            let id = swarm
                .behaviour_mut()
                .rr
                .send_request(&target, Req::Range(RangeRequest { from, to }));
            pending.insert(id, PendingReply::Range(resp));
        }
        Command::RequestStatus { peer, resp } => {
            let target = match peer_id_of(&peer) {
                Ok(id) => id,
                Err(e) => {
                    let _ = resp.send(Err(e));
                    return;
                }
            };
            if let Ok(addr) = peer.address.parse::<Multiaddr>() {
                let _ = swarm.dial(addr);
            }
            let id = swarm.behaviour_mut().rr.send_request(&target, Req::Status(StatusRequest {}));
            pending.insert(id, PendingReply::Status(resp));
        }
    }
}

fn handle_swarm_event(
    swarm: &mut Swarm<Behaviour>,
    block_query: &BlockQuery,
    metrics: &Metrics,
    gossip_tx: &mpsc::UnboundedSender<Envelope>,
    pending: &mut HashMap<OutboundRequestId, PendingReply>,
    event: SwarmEvent<BehaviourEvent>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => info!(%address, "listening"),
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            debug!(%peer_id, "connection established");
        }
        SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
            for (peer_id, addr) in list {
                debug!(%peer_id, %addr, "mdns discovered");
                let _ = swarm.dial(addr);
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message, ..
        })) => match bincode::deserialize::<Envelope>(&message.data) {
            // Envelope signatures are checked at the node ingress so the
            // drop counter lives in one place for every transport.
            Ok(env) => {
                let _ = gossip_tx.send(env);
            }
            Err(e) => debug!("undecodable gossip message: {e}"),
        },
        SwarmEvent::Behaviour(BehaviourEvent::Rr(RequestResponseEvent::Message {
            peer,
            message,
        })) => match message {
            RequestResponseMessage::Request { request, channel, .. } => {
                let resp = match request {
                    Req::Range(rr) => {
                        metrics.ranges_served.inc();
                        let to = rr.to.min(rr.from.saturating_add(loader::MAX_RANGE_BLOCKS));
                        Resp::Range(RangeResponse { blocks: block_query.range(rr.from, to) })
                    }
                    Req::Status(_) => {
                        let top_height = block_query.top_height();
                        let top_hash = block_query.top_block().map(|b| b.hash());
                        Resp::Status(PeerStatus { top_height, top_hash })
                    }
                };
                if swarm.behaviour_mut().rr.send_response(channel, resp).is_err() {
                    debug!(%peer, "response channel closed");
                }
            }
            RequestResponseMessage::Response { request_id, response } => {
                match (pending.remove(&request_id), response) {
                    (Some(PendingReply::Range(tx)), Resp::Range(r)) => {
                        let _ = tx.send(Ok(r.blocks));
                    }
                    (Some(PendingReply::Status(tx)), Resp::Status(s)) => {
                        let _ = tx.send(Ok(s));
                    }
                    (Some(PendingReply::Range(tx)), _) => {
                        let _ = tx.send(Err(NetError::Codec("mismatched response".into())));
                    }
                    (Some(PendingReply::Status(tx)), _) => {
                        let _ = tx.send(Err(NetError::Codec("mismatched response".into())));
                    }
                    (None, _) => {}
                }
            }
        },
        SwarmEvent::Behaviour(BehaviourEvent::Rr(RequestResponseEvent::OutboundFailure {
            peer,
            request_id,
            error,
        })) => {
            warn!(%peer, "outbound request failed: {error}");
            match pending.remove(&request_id) {
                Some(PendingReply::Range(tx)) => {
                    let _ = tx.send(Err(NetError::Unreachable(error.to_string())));
                }
                Some(PendingReply::Status(tx)) => {
                    let _ = tx.send(Err(NetError::Unreachable(error.to_string())));
                }
                None => {}
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            debug!(peer = ?peer_id, "outgoing connection error: {error}");
        }
        _ => {}
    }
}
