//! Signing identities and the verification seam.
//!
//! The pipeline treats cryptography as an oracle: each component carries a
//! `NodeSigner` for the node's own key and is generic over a
//! `SignatureVerifier`, with the concrete variant picked at startup.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature does not verify")]
    Verification,
    #[error("malformed key material: {0}")]
    Malformed(String),
}

/// Raw public key bytes as they appear in account signatories, peer
/// records and wire envelopes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PublicKey(pub Vec<u8>);

impl PublicKey {
    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        hex::decode(s).map(Self).map_err(|e| SignatureError::Malformed(e.to_string()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(6)])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// Signing capability of this node.
pub trait NodeSigner: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, msg: &[u8]) -> Signature;
}

/// Verification oracle over model objects.
pub trait SignatureVerifier: Send + Sync {
    fn verify(pk: &PublicKey, msg: &[u8], sig: &Signature) -> Result<(), SignatureError>;
}

pub mod ed25519;
