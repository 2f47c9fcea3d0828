//! Merkle roots over ledger content.
//!
//! Roots follow the same hashing conventions as the rest of the model
//! layer: blake3 with ASCII domain tags and length-prefixed fields. The
//! tree is built bottom-up, folding each level pairwise; an odd trailing
//! node is paired with itself. Not a sparse tree (no proofs), but fully
//! deterministic across platforms and O(n log n) in the leaf count.

use std::collections::BTreeMap;

const LEAF_TAG: &[u8] = b"NARU_MKL";
const NODE_TAG: &[u8] = b"NARU_MKN";

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut h = blake3::Hasher::new();
    h.update(NODE_TAG);
    h.update(left);
    h.update(right);
    *h.finalize().as_bytes()
}

fn entry_hash(key: &str, value: &str) -> [u8; 32] {
    let mut h = blake3::Hasher::new();
    h.update(LEAF_TAG);
    h.update(&(key.len() as u32).to_le_bytes());
    h.update(key.as_bytes());
    h.update(&(value.len() as u32).to_le_bytes());
    h.update(value.as_bytes());
    *h.finalize().as_bytes()
}

/// Root over pre-hashed 32-byte leaves in their given order.
pub fn ordered_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    assert!(!leaves.is_empty());
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    level[0]
}

/// Root over a string key/value map. BTreeMap iteration is key-sorted, so
/// the root is independent of insertion order.
pub fn map_root(kv: &BTreeMap<String, String>) -> [u8; 32] {
    if kv.is_empty() {
        let mut h = blake3::Hasher::new();
        h.update(LEAF_TAG);
        return *h.finalize().as_bytes();
    }
    let leaves: Vec<[u8; 32]> = kv.iter().map(|(k, v)| entry_hash(k, v)).collect();
    ordered_root(&leaves)
}
