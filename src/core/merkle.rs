//! Merkle tree over transaction hashes.
//!
//! Each parent is double SHA-256 of its two children concatenated. A level
//! with an odd count pairs its last hash with itself.

use crate::core::codec::{self, DecodeError};
use crate::core::types::{Hash256, NULL_HASH};
use crate::crypto::hash256;

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    hash256(&buf)
}

fn next_level(level: &[Hash256]) -> Vec<Hash256> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [single] => hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Build every level of the tree, leaves first, root last. An empty input
/// gives no levels.
pub fn build_merkle_tree(leaves: &[Hash256]) -> Vec<Vec<Hash256>> {
    if leaves.is_empty() {
        return Vec::new();
    }
    let mut levels = vec![leaves.to_vec()];
    while levels.last().map_or(false, |l| l.len() > 1) {
        let next = next_level(levels.last().map(Vec::as_slice).unwrap_or(&[]));
        levels.push(next);
    }
    levels
}

/// Root of the tree; the null hash for an empty list.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    build_merkle_tree(leaves)
        .last()
        .and_then(|root| root.first().copied())
        .unwrap_or(NULL_HASH)
}

/// Root computed in place over concatenated 32-byte hashes, without keeping
/// the intermediate levels. Trailing bytes that do not form a hash are ignored.
pub fn calculate_merkle_root(concatenated: &[u8]) -> Hash256 {
    let mut level: Vec<Hash256> = concatenated
        .chunks_exact(32)
        .map(|c| {
            let mut h = [0u8; 32];
            h.copy_from_slice(c);
            h
        })
        .collect();
    if level.is_empty() {
        return NULL_HASH;
    }
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Transaction hashes of a serialized block, hashed straight from the raw
/// byte ranges.
pub fn transaction_hashes_from_block_bytes(bytes: &[u8]) -> Result<Vec<Hash256>, DecodeError> {
    Ok(codec::block_tx_spans(bytes)?
        .iter()
        .map(|span| hash256(&bytes[span.offset..span.offset + span.len]))
        .collect())
}
