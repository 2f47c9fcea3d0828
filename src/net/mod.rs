//! Peer-to-peer wire surface.
//!
//! Three services: transaction gossip and vote exchange ride a broadcast
//! topic as signed envelopes; block-range transfer and status polling are
//! request/response. Envelopes with invalid signatures are dropped
//! silently, with a counter increment at the ingress.

pub mod inmem;
pub mod p2p;

use crate::consensus::Vote;
use crate::crypto::{PublicKey, Signature, NodeSigner, SignatureVerifier};
use crate::types::{Block, Hash32, Height, Peer, Proposal, Transaction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("envelope signature invalid")]
    InvalidEnvelope,
    #[error("codec error: {0}")]
    Codec(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GossipPayload {
    Transaction(Transaction),
    /// The designated proposer's batch for a height; receivers simulate it
    /// to build the identical candidate block.
    Proposal(Proposal),
    Vote(Vote),
}

const DOMAIN_ENVELOPE: &[u8] = b"NARU_ENV";

/// A gossip message signed by the sending peer. The signature covers the
/// exact payload bytes on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub sender: PublicKey,
    pub signature: Signature,
}

fn envelope_sign_bytes(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DOMAIN_ENVELOPE.len() + payload.len());
    out.extend_from_slice(DOMAIN_ENVELOPE);
    out.extend_from_slice(payload);
    out
}

impl Envelope {
    pub fn seal<S: NodeSigner>(payload: &GossipPayload, signer: &S) -> Result<Self, NetError> {
        let bytes = bincode::serialize(payload).map_err(|e| NetError::Codec(e.to_string()))?;
        let signature = signer.sign(&envelope_sign_bytes(&bytes));
        Ok(Self { payload: bytes, sender: signer.public_key(), signature })
    }

    /// Verify the sender signature and decode the payload.
    pub fn open<V: SignatureVerifier>(&self) -> Result<GossipPayload, NetError> {
        V::verify(&self.sender, &envelope_sign_bytes(&self.payload), &self.signature)
            .map_err(|_| NetError::InvalidEnvelope)?;
        bincode::deserialize(&self.payload).map_err(|e| NetError::Codec(e.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerStatus {
    pub top_height: Option<Height>,
    pub top_hash: Option<Hash32>,
}

/// Outbound half of the wire surface. Inbound gossip is delivered through
/// the envelope channel handed out at network construction.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Best-effort gossip to every connected peer.
    async fn broadcast(&self, env: Envelope);

    /// Fetch blocks `[from, to]` ascending from one peer.
    async fn request_range(&self, peer: &Peer, from: Height, to: Height)
        -> Result<Vec<Block>, NetError>;

    async fn request_status(&self, peer: &Peer) -> Result<PeerStatus, NetError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ed25519::{NodeKeypair, Ed25519Oracle};

    #[test]
    fn envelope_roundtrip() {
        let kp = NodeKeypair::from_seed([3; 32]);
        let vote = Vote::sign(&kp, 4, Hash32([8; 32]));
        let env = Envelope::seal(&GossipPayload::Vote(vote.clone()), &kp).unwrap();
        match env.open::<Ed25519Oracle>().unwrap() {
            GossipPayload::Vote(v) => assert_eq!(v, vote),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn tampered_envelope_is_rejected() {
        let kp = NodeKeypair::from_seed([3; 32]);
        let vote = Vote::sign(&kp, 4, Hash32([8; 32]));
        let mut env = Envelope::seal(&GossipPayload::Vote(vote), &kp).unwrap();
        env.payload[0] ^= 1;
        assert!(matches!(env.open::<Ed25519Oracle>(), Err(NetError::InvalidEnvelope)));
    }
}
