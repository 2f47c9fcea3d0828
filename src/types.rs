//! Ledger model objects and their deterministic binary encodings.
//!
//! All hashing and signing uses a fixed binary format, NOT serde output.
//! Format: ASCII domain tag || fixed fields as little-endian integers ||
//! length-prefixed raw bytes. This is stable across serde versions and
//! whitespace changes.

use crate::crypto::{PublicKey, Signature};
use crate::merkle;
use serde::{Deserialize, Serialize};

pub type Height = u64;
pub type Round = u32;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

pub fn hash_bytes(b: &[u8]) -> Hash32 {
    let h = blake3::hash(b);
    let mut out = [0u8; 32];
    out.copy_from_slice(h.as_bytes());
    Hash32(out)
}

// ── Domain tags ───────────────────────────────────────────────────────────
//
// Distinct tags prevent cross-type replay: a signature over one object kind
// never verifies as another.

const DOMAIN_TX_HASH: &[u8] = b"NARU_TX";
const DOMAIN_TX_SIGN: &[u8] = b"NARU_TXSG";
const DOMAIN_BLOCK: &[u8] = b"NARU_BLK";
const DOMAIN_COMMIT: &[u8] = b"NARU_CMIT";
const DOMAIN_TXROOT: &[u8] = b"NARU_TXROOT";

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u16).to_le_bytes());
    out.extend_from_slice(b);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

// ── Peers ─────────────────────────────────────────────────────────────────

/// A ledger peer: dial address plus its signing identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: String,
    pub pubkey: PublicKey,
}

// ── Commands ──────────────────────────────────────────────────────────────

/// State-mutating commands carried by transactions.
///
/// Account ids are `name@domain`, asset ids are `name#domain`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    CreateDomain { domain: String },
    CreateAccount { account: String, pubkey: PublicKey },
    AddSignatory { account: String, pubkey: PublicKey },
    RemoveSignatory { account: String, pubkey: PublicKey },
    CreateAsset { asset: String },
    AddAssetQuantity { account: String, asset: String, amount: u64 },
    TransferAsset { src: String, dest: String, asset: String, amount: u64 },
    AddPeer { peer: Peer },
}

impl Command {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Command::CreateDomain { domain } => {
                out.push(0x01);
                put_str(out, domain);
            }
            Command::CreateAccount { account, pubkey } => {
                out.push(0x02);
                put_str(out, account);
                put_bytes(out, &pubkey.0);
            }
            Command::AddSignatory { account, pubkey } => {
                out.push(0x03);
                put_str(out, account);
                put_bytes(out, &pubkey.0);
            }
            Command::RemoveSignatory { account, pubkey } => {
                out.push(0x04);
                put_str(out, account);
                put_bytes(out, &pubkey.0);
            }
            Command::CreateAsset { asset } => {
                out.push(0x05);
                put_str(out, asset);
            }
            Command::AddAssetQuantity { account, asset, amount } => {
                out.push(0x06);
                put_str(out, account);
                put_str(out, asset);
                out.extend_from_slice(&amount.to_le_bytes());
            }
            Command::TransferAsset { src, dest, asset, amount } => {
                out.push(0x07);
                put_str(out, src);
                put_str(out, dest);
                put_str(out, asset);
                out.extend_from_slice(&amount.to_le_bytes());
            }
            Command::AddPeer { peer } => {
                out.push(0x08);
                put_str(out, &peer.address);
                put_bytes(out, &peer.pubkey.0);
            }
        }
    }
}

// ── Transactions ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    /// Creator account id (`name@domain`).
    pub creator: String,
    /// Unix milliseconds at transaction construction.
    pub created_ms: u64,
    pub commands: Vec<Command>,
}

impl TxPayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        put_str(&mut out, &self.creator);
        out.extend_from_slice(&self.created_ms.to_le_bytes());
        out.extend_from_slice(&(self.commands.len() as u32).to_le_bytes());
        for c in &self.commands {
            c.encode_into(&mut out);
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature {
    pub pubkey: PublicKey,
    pub signature: Signature,
}

/// A signed transaction. Identity is the payload hash; signatures are
/// excluded from it (the hash is over the content being signed).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub payload: TxPayload,
    pub signatures: Vec<TxSignature>,
}

impl Transaction {
    pub fn payload_hash(&self) -> Hash32 {
        let mut buf = Vec::with_capacity(DOMAIN_TX_HASH.len() + 64);
        buf.extend_from_slice(DOMAIN_TX_HASH);
        buf.extend_from_slice(&self.payload.encode());
        hash_bytes(&buf)
    }

    /// Bytes every transaction signature must cover.
    pub fn sign_bytes(&self) -> Vec<u8> {
        tx_sign_bytes(&self.payload)
    }
}

pub fn tx_sign_bytes(payload: &TxPayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DOMAIN_TX_SIGN.len() + 64);
    buf.extend_from_slice(DOMAIN_TX_SIGN);
    buf.extend_from_slice(&payload.encode());
    buf
}

// ── Proposals ─────────────────────────────────────────────────────────────

/// An ordered batch of transactions targeted at a specific height,
/// pre-validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub height: Height,
    pub transactions: Vec<Transaction>,
    pub created_ms: u64,
}

// ── Blocks ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: Height,
    pub prev_hash: Hash32,
    /// Ordered merkle root over transaction payload hashes.
    pub merkle_root: Hash32,
    pub txs_number: u32,
    /// Unix milliseconds at candidate construction (proposer's clock).
    pub created_ms: u64,
}

/// A peer signature over a block's commit bytes. Votes collected during
/// consensus carry the same bytes, so a decided block's quorum certificate
/// is exactly its vote signatures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    pub pubkey: PublicKey,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub signatures: Vec<BlockSignature>,
}

impl Block {
    /// Deterministic block hash over the header fields.
    ///
    /// Format: "NARU_BLK" || height(8 LE) || prev(32) || merkle_root(32) ||
    ///         txs_number(4 LE) || created_ms(8 LE)
    pub fn hash(&self) -> Hash32 {
        let h = &self.header;
        let mut buf = Vec::with_capacity(DOMAIN_BLOCK.len() + 8 + 32 + 32 + 4 + 8);
        buf.extend_from_slice(DOMAIN_BLOCK);
        buf.extend_from_slice(&h.height.to_le_bytes());
        buf.extend_from_slice(&h.prev_hash.0);
        buf.extend_from_slice(&h.merkle_root.0);
        buf.extend_from_slice(&h.txs_number.to_le_bytes());
        buf.extend_from_slice(&h.created_ms.to_le_bytes());
        hash_bytes(&buf)
    }
}

/// Bytes signed when endorsing a block at a height: by the proposer at
/// candidate construction and by every voter during consensus.
pub fn commit_sign_bytes(height: Height, block_hash: &Hash32) -> Vec<u8> {
    let mut out = Vec::with_capacity(DOMAIN_COMMIT.len() + 8 + 32);
    out.extend_from_slice(DOMAIN_COMMIT);
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&block_hash.0);
    out
}

/// Ordered merkle root over transaction payload hashes.
pub fn tx_merkle_root(txs: &[Transaction]) -> Hash32 {
    if txs.is_empty() {
        return hash_bytes(DOMAIN_TXROOT);
    }
    let leaves: Vec<[u8; 32]> = txs.iter().map(|t| t.payload_hash().0).collect();
    Hash32(merkle::ordered_root(&leaves))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(creator: &str, nonce: u64) -> Transaction {
        Transaction {
            payload: TxPayload {
                creator: creator.into(),
                created_ms: nonce,
                commands: vec![Command::CreateDomain { domain: "wonderland".into() }],
            },
            signatures: vec![],
        }
    }

    #[test]
    fn payload_hash_ignores_signatures() {
        let mut a = tx("alice@wonderland", 1);
        let b = a.clone();
        a.signatures.push(TxSignature {
            pubkey: PublicKey(vec![1; 32]),
            signature: Signature(vec![2; 64]),
        });
        assert_eq!(a.payload_hash(), b.payload_hash());
    }

    #[test]
    fn payload_hash_covers_commands() {
        let a = tx("alice@wonderland", 1);
        let mut b = a.clone();
        b.payload.commands = vec![Command::CreateAsset { asset: "rose#wonderland".into() }];
        assert_ne!(a.payload_hash(), b.payload_hash());
    }

    #[test]
    fn block_hash_changes_with_header() {
        let block = Block {
            header: BlockHeader {
                height: 1,
                prev_hash: Hash32::zero(),
                merkle_root: tx_merkle_root(&[]),
                txs_number: 0,
                created_ms: 7,
            },
            transactions: vec![],
            signatures: vec![],
        };
        let mut other = block.clone();
        other.header.height = 2;
        assert_ne!(block.hash(), other.hash());
    }

    #[test]
    fn merkle_root_is_order_sensitive() {
        let a = tx("alice@wonderland", 1);
        let b = tx("bob@wonderland", 2);
        let ab = tx_merkle_root(&[a.clone(), b.clone()]);
        let ba = tx_merkle_root(&[b, a]);
        assert_ne!(ab, ba);
    }
}
