//! In-memory transport for integration testing without sockets.
//!
//! Simulates a small P2P network: gossip envelopes fan out to every other
//! registered node, and range/status requests are answered straight from
//! the target node's storage. Nodes can be partitioned off to exercise
//! failover paths.

use super::{Envelope, NetError, PeerNetwork, PeerStatus};
use crate::crypto::PublicKey;
use crate::loader::MAX_RANGE_BLOCKS;
use crate::storage::Storage;
use crate::types::{Block, Height, Peer};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct NodeSlot {
    gossip_tx: mpsc::UnboundedSender<Envelope>,
    storage: Arc<Storage>,
}

struct Inner {
    nodes: HashMap<PublicKey, NodeSlot>,
    partitioned: HashSet<PublicKey>,
}

/// The shared network; clone handles out of it per node.
#[derive(Clone)]
pub struct InMemHub {
    inner: Arc<Mutex<Inner>>,
}

impl InMemHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes: HashMap::new(),
                partitioned: HashSet::new(),
            })),
        }
    }

    /// Register a node and get its network handle plus its inbound gossip
    /// stream.
    pub fn register(
        &self,
        local: PublicKey,
        storage: Arc<Storage>,
    ) -> (InMemNet, mpsc::UnboundedReceiver<Envelope>) {
        let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .nodes
            .insert(local.clone(), NodeSlot { gossip_tx, storage });
        (InMemNet { inner: self.inner.clone(), local }, gossip_rx)
    }

    /// Cut a node off: its gossip is dropped and requests to or from it
    /// fail as unreachable.
    pub fn partition(&self, pk: &PublicKey) {
        self.inner.lock().unwrap().partitioned.insert(pk.clone());
    }

    pub fn heal(&self, pk: &PublicKey) {
        self.inner.lock().unwrap().partitioned.remove(pk);
    }
}

impl Default for InMemHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct InMemNet {
    inner: Arc<Mutex<Inner>>,
    local: PublicKey,
}

#[async_trait]
impl PeerNetwork for InMemNet {
    async fn broadcast(&self, env: Envelope) {
        let inner = self.inner.lock().unwrap();
        if inner.partitioned.contains(&self.local) {
            return;
        }
        for (pk, slot) in inner.nodes.iter() {
            if pk == &self.local || inner.partitioned.contains(pk) {
                continue;
            }
            let _ = slot.gossip_tx.send(env.clone());
        }
    }

    async fn request_range(
        &self,
        peer: &Peer,
        from: Height,
        to: Height,
    ) -> Result<Vec<Block>, NetError> {
        let inner = self.inner.lock().unwrap();
        if inner.partitioned.contains(&self.local) || inner.partitioned.contains(&peer.pubkey) {
            return Err(NetError::Unreachable(peer.address.clone()));
        }
        let slot = inner
            .nodes
            .get(&peer.pubkey)
            .ok_or_else(|| NetError::Unreachable(peer.address.clone()))?;
        let to = to.min(from.saturating_add(MAX_RANGE_BLOCKS));
        Ok(slot.storage.block_query().range(from, to))
    }

    async fn request_status(&self, peer: &Peer) -> Result<PeerStatus, NetError> {
        let inner = self.inner.lock().unwrap();
        if inner.partitioned.contains(&self.local) || inner.partitioned.contains(&peer.pubkey) {
            return Err(NetError::Unreachable(peer.address.clone()));
        }
        let slot = inner
            .nodes
            .get(&peer.pubkey)
            .ok_or_else(|| NetError::Unreachable(peer.address.clone()))?;
        let bq = slot.storage.block_query();
        let top_height = bq.top_height();
        let top_hash = bq.top_block().map(|b| b.hash());
        Ok(PeerStatus { top_height, top_hash })
    }
}
