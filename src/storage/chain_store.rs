//! Chain-specific records on top of [`Database`].
//!
//! Lookups return `Ok(None)` / `Ok(false)` for "not there" and `Err` only
//! for storage failures, so callers can tell a missing record from a
//! broken store.

use std::path::Path;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use super::database::{Database, DatabaseConfig, IndexDef};
use super::StorageError;
use crate::core::branch::{Branch, BranchId};
use crate::core::codec::{self, HEADER_SIZE};
use crate::core::params::MAX_ORPHAN_CACHE;
use crate::core::types::*;

pub use crate::core::branch::BlockLocation;

/// block hash → branch u8, index u32
const IDX_BLOCK_LOCATION: u8 = 0;
/// branch u8, index u32 BE → block hash ‖ serialized block
const IDX_BLOCK: u8 = 1;
/// orphan slot → serialized block
const IDX_ORPHAN: u8 = 2;
/// branch id → branch record
const IDX_BRANCH: u8 = 3;
/// branch id → length byte ‖ little-endian work
const IDX_WORK: u8 = 4;
/// txid → transaction reference
const IDX_TX: u8 = 5;
/// txid ‖ vout BE → unspent output
const IDX_UTXO: u8 = 6;

const INDEXES: [IndexDef; 7] = [
    IndexDef { id: IDX_BLOCK_LOCATION, key_size: 32 },
    IndexDef { id: IDX_BLOCK, key_size: 5 },
    IndexDef { id: IDX_ORPHAN, key_size: 1 },
    IndexDef { id: IDX_BRANCH, key_size: 1 },
    IndexDef { id: IDX_WORK, key_size: 1 },
    IndexDef { id: IDX_TX, key_size: 32 },
    IndexDef { id: IDX_UTXO, key_size: 36 },
];

/// Extra data: initialised, main branch, branch count, first orphan, orphan count
const EXTRA_SIZE: usize = 5;
const INITIALISED: u8 = 1;

/// Validator state kept in the store's extra data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorInfo {
    pub main_branch: BranchId,
    pub num_branches: u8,
    pub first_orphan: u8,
    pub num_orphans: u8,
}

/// Where a transaction lives and how many of its outputs are unspent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    /// Main-chain blocks carrying this txid (duplicate coinbases before BIP30)
    pub instance_count: u32,
    pub unspent_outputs: u32,
    pub branch: BranchId,
    pub block_index: u32,
    /// Offset of the output list inside the serialized block
    pub outputs_offset: u32,
    pub outputs_len: u32,
    pub coinbase: bool,
    pub output_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub value: u64,
    pub height: u32,
    pub coinbase: bool,
    pub script_pubkey: Vec<u8>,
}

impl UtxoEntry {
    pub fn output(&self) -> TxOutput {
        TxOutput { value: self.value, script_pubkey: self.script_pubkey.clone() }
    }
}

fn block_key(location: BlockLocation) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = location.branch;
    key[1..].copy_from_slice(&location.index.to_be_bytes());
    key
}

fn utxo_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.txid);
    key[32..].copy_from_slice(&outpoint.vout.to_be_bytes());
    key
}

fn decode_location(bytes: &[u8]) -> Result<BlockLocation, StorageError> {
    if bytes.len() != 5 {
        return Err(StorageError::Corrupt(format!("block location of {} bytes", bytes.len())));
    }
    Ok(BlockLocation::new(bytes[0], u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]])))
}

fn encode_location(location: BlockLocation) -> [u8; 5] {
    let mut out = [0u8; 5];
    out[0] = location.branch;
    out[1..].copy_from_slice(&location.index.to_le_bytes());
    out
}

pub struct ChainStore {
    db: Database,
}

impl ChainStore {
    pub fn open<P: AsRef<Path>>(dir: P, config: DatabaseConfig) -> Result<Self, StorageError> {
        let config = DatabaseConfig { extra_data_size: config.extra_data_size.max(EXTRA_SIZE), ..config };
        Ok(ChainStore { db: Database::open(dir, config, &INDEXES)? })
    }

    // ─── Validator info ──────────────────────────────────────────────

    /// `None` until the genesis block has been stored.
    pub fn load_validator_info(&self) -> Result<Option<ValidatorInfo>, StorageError> {
        let extra = self.db.read_extra(0, EXTRA_SIZE)?;
        if extra[0] != INITIALISED {
            return Ok(None);
        }
        Ok(Some(ValidatorInfo {
            main_branch: extra[1],
            num_branches: extra[2],
            first_orphan: extra[3],
            num_orphans: extra[4],
        }))
    }

    pub fn save_validator_info(&self, info: &ValidatorInfo) -> Result<(), StorageError> {
        self.db.write_extra(
            0,
            &[INITIALISED, info.main_branch, info.num_branches, info.first_orphan, info.num_orphans],
        )
    }

    // ─── Branches ────────────────────────────────────────────────────

    /// Branch record with its work filled in.
    pub fn load_branch(&self, id: BranchId) -> Result<Option<Branch>, StorageError> {
        let Some(bytes) = self.db.get(IDX_BRANCH, &[id])? else {
            return Ok(None);
        };
        let mut branch: Branch = bincode::deserialize(&bytes)?;
        branch.work = self.load_work(id)?.unwrap_or_default();
        Ok(Some(branch))
    }

    /// Save the record and its work.
    pub fn save_branch(&self, id: BranchId, branch: &Branch) -> Result<(), StorageError> {
        self.db.write(IDX_BRANCH, &[id], &bincode::serialize(branch)?)?;
        self.save_work(id, &branch.work)
    }

    pub fn delete_branch(&self, id: BranchId) -> Result<bool, StorageError> {
        self.db.delete(IDX_WORK, &[id])?;
        self.db.delete(IDX_BRANCH, &[id])
    }

    pub fn load_work(&self, id: BranchId) -> Result<Option<BigUint>, StorageError> {
        let Some(bytes) = self.db.get(IDX_WORK, &[id])? else {
            return Ok(None);
        };
        let len = *bytes.first().ok_or_else(|| StorageError::Corrupt("empty work record".into()))? as usize;
        let digits = bytes
            .get(1..1 + len)
            .ok_or_else(|| StorageError::Corrupt(format!("work record shorter than {} bytes", len)))?;
        Ok(Some(BigUint::from_bytes_le(digits)))
    }

    pub fn save_work(&self, id: BranchId, work: &BigUint) -> Result<(), StorageError> {
        let digits = work.to_bytes_le();
        let len = u8::try_from(digits.len()).map_err(|_| StorageError::Corrupt("work exceeds 255 bytes".into()))?;
        let mut value = Vec::with_capacity(digits.len() + 1);
        value.push(len);
        value.extend_from_slice(&digits);
        self.db.write(IDX_WORK, &[id], &value)
    }

    // ─── Blocks ──────────────────────────────────────────────────────

    pub fn block_exists(&self, hash: &Hash256) -> Result<bool, StorageError> {
        self.db.exists(IDX_BLOCK_LOCATION, hash)
    }

    pub fn block_location(&self, hash: &Hash256) -> Result<Option<BlockLocation>, StorageError> {
        self.db.get(IDX_BLOCK_LOCATION, hash)?.map(|b| decode_location(&b)).transpose()
    }

    pub fn save_block(&self, location: BlockLocation, block: &Block) -> Result<(), StorageError> {
        let hash = block.hash();
        let mut value = Vec::with_capacity(32 + block.size());
        value.extend_from_slice(&hash);
        value.extend_from_slice(&codec::encode_block(block, true));
        self.db.write(IDX_BLOCK, &block_key(location), &value)?;
        self.db.write(IDX_BLOCK_LOCATION, &hash, &encode_location(location))
    }

    pub fn load_block(&self, location: BlockLocation) -> Result<Option<Block>, StorageError> {
        let Some(bytes) = self.db.get(IDX_BLOCK, &block_key(location))? else {
            return Ok(None);
        };
        let raw = bytes.get(32..).ok_or_else(|| StorageError::Corrupt("block record too short".into()))?;
        let (block, _) = codec::decode_block(raw, true)?;
        Ok(Some(block))
    }

    pub fn load_header(&self, location: BlockLocation) -> Result<Option<BlockHeader>, StorageError> {
        match self.db.read_sub(IDX_BLOCK, &block_key(location), 32, HEADER_SIZE)? {
            Some(bytes) => Ok(Some(codec::decode_header(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load_block_hash(&self, location: BlockLocation) -> Result<Option<Hash256>, StorageError> {
        Ok(self.db.read_sub(IDX_BLOCK, &block_key(location), 0, 32)?.map(|bytes| {
            let mut hash = NULL_HASH;
            hash.copy_from_slice(&bytes);
            hash
        }))
    }

    /// Remove a block and its hash entry. Returns false when nothing was stored there.
    pub fn delete_block(&self, location: BlockLocation) -> Result<bool, StorageError> {
        let Some(hash) = self.load_block_hash(location)? else {
            return Ok(false);
        };
        self.db.delete(IDX_BLOCK_LOCATION, &hash)?;
        self.db.delete(IDX_BLOCK, &block_key(location))
    }

    /// Renumber a stored block, keeping its hash entry in step.
    pub fn move_block(&self, from: BlockLocation, to: BlockLocation) -> Result<bool, StorageError> {
        let Some(hash) = self.load_block_hash(from)? else {
            return Ok(false);
        };
        self.db.change_key(IDX_BLOCK, &block_key(from), &block_key(to))?;
        self.db.write(IDX_BLOCK_LOCATION, &hash, &encode_location(to))?;
        Ok(true)
    }

    // ─── Orphans ─────────────────────────────────────────────────────

    pub fn save_orphan(&self, slot: usize, block: &Block) -> Result<(), StorageError> {
        self.db.write(IDX_ORPHAN, &[orphan_slot(slot)?], &codec::encode_block(block, true))
    }

    pub fn load_orphan(&self, slot: usize) -> Result<Option<Block>, StorageError> {
        match self.db.get(IDX_ORPHAN, &[orphan_slot(slot)?])? {
            Some(bytes) => Ok(Some(codec::decode_block(&bytes, true)?.0)),
            None => Ok(None),
        }
    }

    pub fn delete_orphan(&self, slot: usize) -> Result<bool, StorageError> {
        self.db.delete(IDX_ORPHAN, &[orphan_slot(slot)?])
    }

    // ─── Unspent outputs ─────────────────────────────────────────────

    pub fn utxo_exists(&self, outpoint: &OutPoint) -> Result<bool, StorageError> {
        self.db.exists(IDX_UTXO, &utxo_key(outpoint))
    }

    pub fn load_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StorageError> {
        match self.db.get(IDX_UTXO, &utxo_key(outpoint))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_utxo(&self, outpoint: &OutPoint, entry: &UtxoEntry) -> Result<(), StorageError> {
        self.db.write(IDX_UTXO, &utxo_key(outpoint), &bincode::serialize(entry)?)
    }

    pub fn delete_utxo(&self, outpoint: &OutPoint) -> Result<bool, StorageError> {
        self.db.delete(IDX_UTXO, &utxo_key(outpoint))
    }

    /// Every unspent output of one transaction, ascending by index.
    #[cfg(test)]
    pub fn utxos_of(&self, txid: &Hash256) -> Result<Vec<(OutPoint, UtxoEntry)>, StorageError> {
        let min = utxo_key(&OutPoint { txid: *txid, vout: 0 });
        let max = utxo_key(&OutPoint { txid: *txid, vout: u32::MAX });
        let mut out = Vec::new();
        for key in self.db.keys_in_range(IDX_UTXO, &min, &max)? {
            let vout = u32::from_be_bytes([key[32], key[33], key[34], key[35]]);
            let outpoint = OutPoint { txid: *txid, vout };
            if let Some(entry) = self.load_utxo(&outpoint)? {
                out.push((outpoint, entry));
            }
        }
        Ok(out)
    }

    // ─── Transaction references ──────────────────────────────────────

    pub fn load_tx_ref(&self, txid: &Hash256) -> Result<Option<TxRef>, StorageError> {
        match self.db.get(IDX_TX, txid)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_tx_ref(&self, txid: &Hash256, tx_ref: &TxRef) -> Result<(), StorageError> {
        self.db.write(IDX_TX, txid, &bincode::serialize(tx_ref)?)
    }

    pub fn delete_tx_ref(&self, txid: &Hash256) -> Result<bool, StorageError> {
        self.db.delete(IDX_TX, txid)
    }

    /// Whether a known transaction still has unspent outputs.
    pub fn has_unspent_outputs(&self, txid: &Hash256) -> Result<bool, StorageError> {
        Ok(self.load_tx_ref(txid)?.map_or(false, |r| r.unspent_outputs > 0))
    }

    /// Recover an output from the block holding its transaction, for
    /// restoring outputs spent by a block being disconnected.
    pub fn load_output(&self, tx_ref: &TxRef, vout: u32) -> Result<Option<TxOutput>, StorageError> {
        let location = BlockLocation::new(tx_ref.branch, tx_ref.block_index);
        let Some(bytes) = self.db.read_sub(
            IDX_BLOCK,
            &block_key(location),
            32 + tx_ref.outputs_offset as usize,
            tx_ref.outputs_len as usize,
        )?
        else {
            return Ok(None);
        };
        let mut outputs = codec::decode_outputs(&bytes)?;
        if (vout as usize) < outputs.len() {
            Ok(Some(outputs.swap_remove(vout as usize)))
        } else {
            Ok(None)
        }
    }

    // ─── Change sets ─────────────────────────────────────────────────

    pub fn stage(&self) -> Result<(), StorageError> {
        self.db.stage()
    }

    pub fn revert(&self) {
        self.db.revert()
    }

    pub fn commit(&self) -> Result<bool, StorageError> {
        self.db.commit()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()
    }
}

fn orphan_slot(slot: usize) -> Result<u8, StorageError> {
    if slot >= MAX_ORPHAN_CACHE {
        return Err(StorageError::Corrupt(format!("orphan slot {} out of range", slot)));
    }
    Ok(slot as u8)
}
