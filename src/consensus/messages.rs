//! Consensus vote messages.
//!
//! A vote signs the block commit bytes (`commit_sign_bytes`), the same
//! bytes a proposer signs when building a candidate. A decided height's
//! vote set therefore doubles as the committed block's quorum certificate.

use crate::crypto::{PublicKey, Signature, NodeSigner};
use crate::types::{commit_sign_bytes, BlockSignature, Hash32, Height};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub height: Height,
    pub block_hash: Hash32,
    pub voter: PublicKey,
    pub signature: Signature,
}

impl Vote {
    pub fn sign<S: NodeSigner>(signer: &S, height: Height, block_hash: Hash32) -> Self {
        let msg = commit_sign_bytes(height, &block_hash);
        Self {
            height,
            block_hash,
            voter: signer.public_key(),
            signature: signer.sign(&msg),
        }
    }

    pub fn as_block_signature(&self) -> BlockSignature {
        BlockSignature { pubkey: self.voter.clone(), signature: self.signature.clone() }
    }
}

/// The outcome of a voting height: the winning hash plus the votes that
/// carried it over the threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub height: Height,
    pub block_hash: Hash32,
    pub votes: Vec<Vote>,
}
