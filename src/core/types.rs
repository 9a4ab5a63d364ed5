use std::sync::OnceLock;

use crate::core::codec;
use crate::crypto::hash256;

/// A 32-byte hash used throughout the system
pub type Hash256 = [u8; 32];

/// Null hash (all zeros) used for the genesis prev_hash and coinbase inputs
pub const NULL_HASH: Hash256 = [0u8; 32];

/// Output index used by the coinbase input
pub const COINBASE_VOUT: u32 = 0xFFFF_FFFF;

/// Sequence number marking an input as final
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

// ─── Transaction Types ───────────────────────────────────────────────

/// Represents a reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn null() -> Self {
        OutPoint { txid: NULL_HASH, vout: COINBASE_VOUT }
    }

    pub fn is_null(&self) -> bool {
        self.txid == NULL_HASH && self.vout == COINBASE_VOUT
    }
}

/// Transaction input - spends a previous output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// Transaction output - creates a new spendable output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A complete transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Coinbase spending nothing, with the given input script and outputs
    pub fn new_coinbase(script_sig: Vec<u8>, outputs: Vec<TxOutput>) -> Self {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            outputs,
            lock_time: 0,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output(&self) -> Option<u64> {
        self.outputs.iter().try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }

    /// Transaction hash (double SHA-256 of the wire encoding)
    pub fn hash(&self) -> Hash256 {
        hash256(&codec::encode_transaction(self))
    }

    pub fn size(&self) -> usize {
        codec::transaction_len(self)
    }
}

// ─── Block Types ─────────────────────────────────────────────────────

/// Block header, 80 bytes on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    /// Compact difficulty target ("bits")
    pub target: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Block hash (double SHA-256 of the 80 header bytes)
    pub fn hash(&self) -> Hash256 {
        hash256(&codec::encode_header(self))
    }
}

/// A block. The hash is computed once and cached; mutate the header through
/// [`Block::header_mut`] so the cache is dropped.
#[derive(Debug, Clone)]
pub struct Block {
    header: BlockHeader,
    pub transactions: Vec<Transaction>,
    cached_hash: OnceLock<Hash256>,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.transactions == other.transactions
    }
}

impl Eq for Block {}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block { header, transactions, cached_hash: OnceLock::new() }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut BlockHeader {
        self.cached_hash = OnceLock::new();
        &mut self.header
    }

    pub fn hash(&self) -> Hash256 {
        *self.cached_hash.get_or_init(|| self.header.hash())
    }

    pub fn prev_hash(&self) -> &Hash256 {
        &self.header.prev_hash
    }

    pub fn time(&self) -> u32 {
        self.header.time
    }

    pub fn target(&self) -> u32 {
        self.header.target
    }

    pub fn transaction_hashes(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::hash).collect()
    }

    /// Merkle root over the current transactions
    pub fn compute_merkle_root(&self) -> Hash256 {
        super::merkle::merkle_root(&self.transaction_hashes())
    }

    /// Recompute and store the merkle root after editing transactions
    pub fn update_merkle_root(&mut self) {
        let root = self.compute_merkle_root();
        self.header_mut().merkle_root = root;
    }

    pub fn size(&self) -> usize {
        codec::block_len(self)
    }
}

/// Display a hash the way block explorers do (byte-reversed hex)
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a byte-reversed hex hash
pub fn hash_from_hex(s: &str) -> Option<Hash256> {
    let bytes = hex::decode(s).ok()?;
    let mut hash: Hash256 = bytes.try_into().ok()?;
    hash.reverse();
    Some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coinbase_detection() {
        let cb = Transaction::new_coinbase(vec![1, 2], vec![TxOutput { value: 5, script_pubkey: vec![] }]);
        assert!(cb.is_coinbase());

        let mut spend = cb.clone();
        spend.inputs[0].previous_output = OutPoint { txid: [1u8; 32], vout: 0 };
        assert!(!spend.is_coinbase());
    }

    #[test]
    fn test_total_output_overflow() {
        let mut tx = Transaction::new_coinbase(vec![1, 2], vec![]);
        tx.outputs.push(TxOutput { value: u64::MAX, script_pubkey: vec![] });
        tx.outputs.push(TxOutput { value: 1, script_pubkey: vec![] });
        assert_eq!(tx.total_output(), None);
    }

    #[test]
    fn test_header_mut_resets_cached_hash() {
        let header = BlockHeader {
            version: 1,
            prev_hash: NULL_HASH,
            merkle_root: NULL_HASH,
            time: 1,
            target: 0x1d00ffff,
            nonce: 0,
        };
        let mut block = Block::new(header, vec![]);
        let before = block.hash();
        block.header_mut().nonce = 1;
        assert_ne!(before, block.hash());
        assert_eq!(block.hash(), block.header().hash());
    }

    #[test]
    fn test_hash_hex_round_trip() {
        let s = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash_from_hex(s).unwrap();
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash_to_hex(&hash), s);
    }
}
