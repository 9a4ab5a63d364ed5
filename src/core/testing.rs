//! Chain-building helpers shared by the validator and processor tests.

use std::path::Path;
use std::sync::Arc;

use crate::core::params::*;
use crate::core::script::StandardScriptEngine;
use crate::core::types::*;
use crate::core::validator::*;
use crate::pow;
use crate::storage::{ChainStore, DatabaseConfig, StorageError};

pub const OP_TRUE_SCRIPT: [u8; 1] = [0x51];
pub const REGTEST_BITS: u32 = 0x207fffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    NewBranch { branch: u8, parent: u8, fork_index: u32 },
    DeleteBranch(u8),
    Add { branch: u8, hash: Hash256, height: u32, add: AddType },
    Remove { branch: u8, hash: Hash256, height: u32 },
    Finished { hash: Hash256, status: BlockStatus },
    Invalid { hash: Hash256, reason: BlockError },
    NoNew(Hash256),
    Fatal,
}

/// Records every notification in order.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
}

impl Recorder {
    pub fn added(&self) -> Vec<(u32, AddType)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Add { height, add, .. } => Some((*height, *add)),
                _ => None,
            })
            .collect()
    }

    pub fn finished(&self, hash: &Hash256) -> Option<BlockStatus> {
        self.events.iter().rev().find_map(|e| match e {
            Event::Finished { hash: h, status } if h == hash => Some(*status),
            _ => None,
        })
    }
}

impl ValidatorEvents for Recorder {
    type Context = ();

    fn on_delete_branch(&mut self, branch: u8, _: &mut ()) {
        self.events.push(Event::DeleteBranch(branch));
    }
    fn on_new_branch(&mut self, branch: u8, parent: u8, fork_index: u32, _: &mut ()) {
        self.events.push(Event::NewBranch { branch, parent, fork_index });
    }
    fn on_add_block(&mut self, branch: u8, block: &Block, height: u32, add: AddType, _: &mut ()) {
        self.events.push(Event::Add { branch, hash: block.hash(), height, add });
    }
    fn on_remove_block(&mut self, branch: u8, block: &Block, height: u32, _: &mut ()) {
        self.events.push(Event::Remove { branch, hash: block.hash(), height });
    }
    fn on_block_finished(&mut self, block: &Block, status: BlockStatus, _: &mut ()) {
        self.events.push(Event::Finished { hash: block.hash(), status });
    }
    fn on_block_invalid(&mut self, block: &Block, reason: &BlockError, _: &mut ()) {
        self.events.push(Event::Invalid { hash: block.hash(), reason: reason.clone() });
    }
    fn on_no_new_branches(&mut self, block: &Block, _: &mut ()) {
        self.events.push(Event::NoNew(block.hash()));
    }
    fn on_fatal_error(&mut self, _: &StorageError, _: &mut ()) {
        self.events.push(Event::Fatal);
    }
}

pub fn open_store(dir: &Path) -> Arc<ChainStore> {
    Arc::new(ChainStore::open(dir, DatabaseConfig::default()).unwrap())
}

pub fn open_validator(params: NetworkParams, store: Arc<ChainStore>) -> Validator<Recorder> {
    Validator::open(params, ValidatorFlags::default(), store, Box::new(StandardScriptEngine), Recorder::default())
        .unwrap()
}

/// Coinbase paying `value` to an anyone-can-spend script. `tag` keeps
/// coinbases of competing blocks at the same height distinct.
pub fn coinbase(height: u32, tag: u8, value: u64) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&height.to_le_bytes());
    script_sig.push(tag);
    Transaction::new_coinbase(script_sig, vec![TxOutput { value, script_pubkey: OP_TRUE_SCRIPT.to_vec() }])
}

/// Spend `outpoint` (locked by OP_TRUE) into one OP_TRUE output.
pub fn spend(outpoint: OutPoint, value: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput { previous_output: outpoint, script_sig: Vec::new(), sequence: SEQUENCE_FINAL }],
        outputs: vec![TxOutput { value, script_pubkey: OP_TRUE_SCRIPT.to_vec() }],
        lock_time: 0,
    }
}

/// Regtest block on `prev` with a valid merkle root and proof of work.
pub fn mine(prev: &Block, time: u32, transactions: Vec<Transaction>) -> Block {
    let mut block = Block::new(
        BlockHeader {
            version: 1,
            prev_hash: prev.hash(),
            merkle_root: NULL_HASH,
            time,
            target: REGTEST_BITS,
            nonce: 0,
        },
        transactions,
    );
    block.update_merkle_root();
    while !pow::check_proof_of_work(&block.hash(), REGTEST_BITS, REGTEST_BITS) {
        block.header_mut().nonce += 1;
    }
    block
}

/// Block at `height` on `prev` holding only a full-reward coinbase.
pub fn next_block(prev: &Block, height: u32, tag: u8) -> Block {
    mine(prev, prev.time() + 600, vec![coinbase(height, tag, block_reward(height))])
}

/// Extend `tip` by `count` blocks, returning them in order.
pub fn chain_from(tip: &Block, tip_height: u32, count: u32, tag: u8) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count as usize);
    for i in 0..count {
        let prev = blocks.last().unwrap_or(tip);
        let block = next_block(prev, tip_height + 1 + i, tag);
        blocks.push(block);
    }
    blocks
}

/// Network time far enough ahead to accept any test block.
pub const NOW: u64 = 2_000_000_000;
