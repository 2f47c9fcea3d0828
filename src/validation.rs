//! Transaction and block validators.
//!
//! Stateless checks cover structure and signatures only; stateful checks
//! run commands against a throwaway world-state snapshot; chain checks
//! gate whole blocks before they extend the ledger.

use crate::crypto::SignatureVerifier;
use crate::storage::TemporaryWsv;
use crate::types::{commit_sign_bytes, tx_merkle_root, Block, Hash32, Height, Peer, Proposal, Transaction};
use rayon::prelude::*;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("creator id is malformed")]
    MalformedCreator,
    #[error("transaction carries no commands")]
    EmptyCommands,
    #[error("transaction carries no signatures")]
    MissingSignatures,
    #[error("signature does not verify")]
    BadSignature,
    #[error("block height {got} does not follow {expected}")]
    WrongHeight { got: Height, expected: Height },
    #[error("block does not link to the previous block")]
    PrevHashMismatch,
    #[error("declared transaction count does not match the body")]
    TxCountMismatch,
    #[error("merkle root does not match the transactions")]
    MerkleMismatch,
    #[error("signature quorum not reached: {got} of {need}")]
    InsufficientQuorum { got: usize, need: usize },
}

/// Ed25519 verification is CPU-bound; batches above this size are checked
/// in parallel.
const PAR_BATCH_MIN: usize = 16;

/// Structural well-formedness plus every signature verifying against its
/// declared public key.
pub fn stateless_validate<V: SignatureVerifier>(tx: &Transaction) -> Result<(), ValidationError> {
    if !tx.payload.creator.contains('@') || tx.payload.creator.starts_with('@') {
        return Err(ValidationError::MalformedCreator);
    }
    if tx.payload.commands.is_empty() {
        return Err(ValidationError::EmptyCommands);
    }
    if tx.signatures.is_empty() {
        return Err(ValidationError::MissingSignatures);
    }
    let msg = tx.sign_bytes();
    for sig in &tx.signatures {
        V::verify(&sig.pubkey, &msg, &sig.signature).map_err(|_| ValidationError::BadSignature)?;
    }
    Ok(())
}

/// Per-transaction stateless verdicts for a batch, parallelised when the
/// batch is large.
pub fn stateless_validate_batch<V: SignatureVerifier>(txs: &[Transaction]) -> Vec<bool> {
    if txs.len() > PAR_BATCH_MIN {
        txs.par_iter().map(|tx| stateless_validate::<V>(tx).is_ok()).collect()
    } else {
        txs.iter().map(|tx| stateless_validate::<V>(tx).is_ok()).collect()
    }
}

/// Run every transaction of a proposal against the snapshot inside a
/// savepoint; transactions whose creator is unknown, whose signers are not
/// registered signatories, or whose commands fail are dropped.
///
/// Deterministic: same proposal + same snapshot gives the same accepted
/// subset in the same relative order.
pub fn stateful_validate(proposal: &Proposal, wsv: &mut TemporaryWsv) -> Proposal {
    let mut accepted = Vec::with_capacity(proposal.transactions.len());
    for tx in &proposal.transactions {
        let Some(account) = wsv.state().accounts.get(&tx.payload.creator).cloned() else {
            debug!(creator = %tx.payload.creator, "dropping tx: unknown creator");
            continue;
        };
        if !tx.signatures.iter().any(|s| account.signatories.contains(&s.pubkey)) {
            debug!(creator = %tx.payload.creator, "dropping tx: no registered signatory signed");
            continue;
        }
        if let Err(e) = wsv.apply_transaction(tx) {
            debug!(creator = %tx.payload.creator, "dropping tx: {e}");
            continue;
        }
        accepted.push(tx.clone());
    }
    Proposal {
        height: proposal.height,
        transactions: accepted,
        created_ms: proposal.created_ms,
    }
}

/// Header-level chain validation of a block extending `(expected_height - 1,
/// prev_hash)`: linkage, declared count, merkle root, and a signature quorum
/// over the peer set at that height. Command replay is performed by the
/// caller's `MutableStorage` when the block is applied.
pub fn chain_validate<V: SignatureVerifier>(
    block: &Block,
    expected_height: Height,
    prev_hash: &Hash32,
    peers: &[Peer],
) -> Result<(), ValidationError> {
    if block.header.height != expected_height {
        return Err(ValidationError::WrongHeight { got: block.header.height, expected: expected_height });
    }
    if &block.header.prev_hash != prev_hash {
        return Err(ValidationError::PrevHashMismatch);
    }
    if block.header.txs_number as usize != block.transactions.len() {
        return Err(ValidationError::TxCountMismatch);
    }
    if block.header.merkle_root != tx_merkle_root(&block.transactions) {
        return Err(ValidationError::MerkleMismatch);
    }

    let hash = block.hash();
    let msg = commit_sign_bytes(block.header.height, &hash);
    let known: BTreeSet<_> = peers.iter().map(|p| &p.pubkey).collect();
    let mut signers = BTreeSet::new();
    for sig in &block.signatures {
        if !known.contains(&sig.pubkey) {
            continue;
        }
        if V::verify(&sig.pubkey, &msg, &sig.signature).is_ok() {
            signers.insert(sig.pubkey.clone());
        }
    }
    let need = crate::consensus::quorum_threshold(peers.len());
    if signers.len() < need {
        return Err(ValidationError::InsufficientQuorum { got: signers.len(), need });
    }
    Ok(())
}
