//! Consensus checks on a block's transactions and the UTXO updates that
//! apply or undo a block on the main chain.

use std::collections::{HashMap, HashSet};

use crate::core::branch::{BlockLocation, Branches};
use crate::core::codec;
use crate::core::params::*;
use crate::core::script::{self, ScriptEngine, ScriptError, ScriptOutcome};
use crate::core::types::*;
use crate::storage::{ChainStore, StorageError, TxRef, UtxoEntry};

/// Why a block was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    Duplicate,
    NoTransactions,
    BadProofOfWork,
    TimeTooNew { time: u32, limit: u64 },
    BadMerkleRoot,
    BadTarget { expected: u32, actual: u32 },
    TimeTooOld { time: u32, median: u32 },
    FirstNotCoinbase,
    ExtraCoinbase(usize),
    OverwritesUnspent(Hash256),
    NonFinal(usize),
    BadTransaction { tx: usize, reason: &'static str },
    TooManySigOps(u32),
    MissingInput(OutPoint),
    DoubleSpend(OutPoint),
    ImmatureSpend(OutPoint),
    ScriptFailed { tx: usize, input: usize },
    ScriptEngine(ScriptError),
    InputsBelowOutputs(usize),
    CoinbaseTooLarge { allowed: u64, actual: u64 },
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockError::Duplicate => write!(f, "block already known"),
            BlockError::NoTransactions => write!(f, "block has no transactions"),
            BlockError::BadProofOfWork => write!(f, "proof of work does not meet target"),
            BlockError::TimeTooNew { time, limit } => write!(f, "timestamp {} beyond {}", time, limit),
            BlockError::BadMerkleRoot => write!(f, "merkle root mismatch"),
            BlockError::BadTarget { expected, actual } => {
                write!(f, "target {:08x}, expected {:08x}", actual, expected)
            }
            BlockError::TimeTooOld { time, median } => write!(f, "timestamp {} not after median {}", time, median),
            BlockError::FirstNotCoinbase => write!(f, "first transaction is not a coinbase"),
            BlockError::ExtraCoinbase(i) => write!(f, "transaction {} is a second coinbase", i),
            BlockError::OverwritesUnspent(txid) => {
                write!(f, "transaction {} overwrites unspent outputs", hash_to_hex(txid))
            }
            BlockError::NonFinal(i) => write!(f, "transaction {} is not final", i),
            BlockError::BadTransaction { tx, reason } => write!(f, "transaction {}: {}", tx, reason),
            BlockError::TooManySigOps(n) => write!(f, "{} signature operations", n),
            BlockError::MissingInput(o) => write!(f, "missing input {}:{}", hash_to_hex(&o.txid), o.vout),
            BlockError::DoubleSpend(o) => write!(f, "output {}:{} spent twice", hash_to_hex(&o.txid), o.vout),
            BlockError::ImmatureSpend(o) => {
                write!(f, "immature coinbase {}:{} spent", hash_to_hex(&o.txid), o.vout)
            }
            BlockError::ScriptFailed { tx, input } => write!(f, "script failed on transaction {} input {}", tx, input),
            BlockError::ScriptEngine(e) => write!(f, "script engine: {}", e),
            BlockError::InputsBelowOutputs(i) => write!(f, "transaction {} spends more than its inputs", i),
            BlockError::CoinbaseTooLarge { allowed, actual } => {
                write!(f, "coinbase pays {} but only {} allowed", actual, allowed)
            }
        }
    }
}

impl std::error::Error for BlockError {}

/// Either the block broke a rule or the store failed underneath us.
#[derive(Debug)]
pub enum ValidatorError {
    Rejected(BlockError),
    Storage(StorageError),
}

impl std::fmt::Display for ValidatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidatorError::Rejected(e) => write!(f, "rejected: {}", e),
            ValidatorError::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

impl std::error::Error for ValidatorError {}

impl From<BlockError> for ValidatorError {
    fn from(e: BlockError) -> Self {
        ValidatorError::Rejected(e)
    }
}

impl From<StorageError> for ValidatorError {
    fn from(e: StorageError) -> Self {
        ValidatorError::Storage(e)
    }
}

// ─── Transaction rules ───────────────────────────────────────────────

/// Context-free checks on a single transaction.
pub fn check_transaction(tx: &Transaction, index: usize) -> Result<(), BlockError> {
    let bad = |reason| BlockError::BadTransaction { tx: index, reason };
    if tx.inputs.is_empty() {
        return Err(bad("no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(bad("no outputs"));
    }
    let mut total: u64 = 0;
    for output in &tx.outputs {
        if output.value > MAX_MONEY {
            return Err(bad("output value above maximum"));
        }
        total = total.checked_add(output.value).filter(|t| *t <= MAX_MONEY).ok_or(bad("output total above maximum"))?;
    }
    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT..=MAX_COINBASE_SCRIPT).contains(&len) {
            return Err(bad("coinbase script length"));
        }
    } else {
        let mut seen = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            if input.previous_output.is_null() {
                return Err(bad("null previous output"));
            }
            if !seen.insert(input.previous_output) {
                return Err(bad("duplicate input"));
            }
        }
    }
    Ok(())
}

/// A transaction is final once its lock time has passed or every input
/// opted out with a final sequence number.
pub fn is_final(tx: &Transaction, height: u32, block_time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD { height } else { block_time };
    if tx.lock_time < limit {
        return true;
    }
    tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

fn legacy_sig_ops(tx: &Transaction) -> u32 {
    let inputs: u32 = tx.inputs.iter().map(|i| script::sig_op_count(&i.script_sig, false)).sum();
    let outputs: u32 = tx.outputs.iter().map(|o| script::sig_op_count(&o.script_pubkey, false)).sum();
    inputs + outputs
}

/// Everything [`check_block`] needs besides the block itself.
pub struct CheckContext<'a> {
    pub params: &'a NetworkParams,
    pub store: &'a ChainStore,
    pub engine: &'a dyn ScriptEngine,
    pub verify_scripts: bool,
}

/// Complete validation of a block that would extend the current main chain
/// at `height`. The store must reflect the UTXO set of its parent.
pub fn check_block(ctx: &CheckContext, block: &Block, height: u32) -> Result<(), ValidatorError> {
    let txs = &block.transactions;
    let first = txs.first().ok_or(BlockError::NoTransactions)?;
    if !first.is_coinbase() {
        return Err(BlockError::FirstNotCoinbase.into());
    }
    if let Some(i) = txs.iter().skip(1).position(Transaction::is_coinbase) {
        return Err(BlockError::ExtraCoinbase(i + 1).into());
    }

    let txids: Vec<Hash256> = txs.iter().map(Transaction::hash).collect();
    if !ctx.params.is_bip30_exception(&block.hash()) {
        for txid in &txids {
            if ctx.store.has_unspent_outputs(txid)? {
                return Err(BlockError::OverwritesUnspent(*txid).into());
            }
        }
    }

    let time = block.time();
    let mut sig_ops: u32 = 0;
    for (i, tx) in txs.iter().enumerate() {
        if !is_final(tx, height, time) {
            return Err(BlockError::NonFinal(i).into());
        }
        check_transaction(tx, i)?;
        sig_ops += legacy_sig_ops(tx);
    }
    if sig_ops > MAX_SIG_OPS {
        return Err(BlockError::TooManySigOps(sig_ops).into());
    }

    let p2sh = time >= ctx.params.p2sh_activation_time;
    let mut created: HashMap<OutPoint, (TxOutput, bool)> = HashMap::new();
    let mut spent: HashSet<OutPoint> = HashSet::new();
    let mut fees: u64 = 0;

    for (i, tx) in txs.iter().enumerate() {
        if i > 0 {
            let mut input_total: u64 = 0;
            for (n, input) in tx.inputs.iter().enumerate() {
                let outpoint = input.previous_output;
                if !spent.insert(outpoint) {
                    return Err(BlockError::DoubleSpend(outpoint).into());
                }
                let (prev, prev_height, prev_coinbase) = match created.get(&outpoint) {
                    Some((output, coinbase)) => (output.clone(), height, *coinbase),
                    None => {
                        let entry = ctx.store.load_utxo(&outpoint)?.ok_or(BlockError::MissingInput(outpoint))?;
                        (entry.output(), entry.height, entry.coinbase)
                    }
                };
                if prev_coinbase && height.saturating_sub(prev_height) < COINBASE_MATURITY {
                    return Err(BlockError::ImmatureSpend(outpoint).into());
                }

                if p2sh && script::is_p2sh(&prev.script_pubkey) {
                    sig_ops += script::p2sh_sig_op_count(&input.script_sig);
                    if sig_ops > MAX_SIG_OPS {
                        return Err(BlockError::TooManySigOps(sig_ops).into());
                    }
                }
                if ctx.verify_scripts {
                    match ctx.engine.verify_input(tx, n, &prev, p2sh) {
                        Ok(ScriptOutcome::True) => {}
                        Ok(_) => return Err(BlockError::ScriptFailed { tx: i, input: n }.into()),
                        Err(e) => return Err(BlockError::ScriptEngine(e).into()),
                    }
                }
                input_total = input_total
                    .checked_add(prev.value)
                    .filter(|t| *t <= MAX_MONEY)
                    .ok_or(BlockError::BadTransaction { tx: i, reason: "input total above maximum" })?;
            }
            let output_total = tx.total_output().unwrap_or(u64::MAX);
            if input_total < output_total {
                return Err(BlockError::InputsBelowOutputs(i).into());
            }
            fees += input_total - output_total;
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            created.insert(OutPoint { txid: txids[i], vout: vout as u32 }, (output.clone(), i == 0));
        }
    }

    let allowed = block_reward(height) + fees;
    let actual = first.total_output().unwrap_or(u64::MAX);
    if actual > allowed {
        return Err(BlockError::CoinbaseTooLarge { allowed, actual }.into());
    }
    Ok(())
}

// ─── Applying blocks ─────────────────────────────────────────────────

/// Apply a block to the UTXO set and transaction references.
pub fn connect_block(store: &ChainStore, block: &Block, location: BlockLocation, height: u32) -> Result<(), StorageError> {
    let bytes = codec::encode_block(block, true);
    let spans = codec::block_tx_spans(&bytes)?;

    for (tx, span) in block.transactions.iter().zip(&spans) {
        let txid = tx.hash();
        let coinbase = tx.is_coinbase();
        let instance_count = store.load_tx_ref(&txid)?.map_or(0, |r| r.instance_count) + 1;
        store.save_tx_ref(
            &txid,
            &TxRef {
                instance_count,
                unspent_outputs: tx.outputs.len() as u32,
                branch: location.branch,
                block_index: location.index,
                outputs_offset: span.outputs_offset as u32,
                outputs_len: span.outputs_len as u32,
                coinbase,
                output_count: span.output_count as u32,
            },
        )?;
        for (vout, output) in tx.outputs.iter().enumerate() {
            let entry = UtxoEntry { value: output.value, height, coinbase, script_pubkey: output.script_pubkey.clone() };
            store.save_utxo(&OutPoint { txid, vout: vout as u32 }, &entry)?;
        }

        if coinbase {
            continue;
        }
        for input in &tx.inputs {
            let prev = input.previous_output;
            store.delete_utxo(&prev)?;
            if let Some(mut prev_ref) = store.load_tx_ref(&prev.txid)? {
                prev_ref.unspent_outputs = prev_ref.unspent_outputs.saturating_sub(1);
                store.save_tx_ref(&prev.txid, &prev_ref)?;
            }
        }
    }
    Ok(())
}

/// Undo [`connect_block`]: drop the block's outputs and restore what it
/// spent from the blocks that created those outputs.
pub fn disconnect_block(store: &ChainStore, branches: &Branches, block: &Block) -> Result<(), StorageError> {
    for tx in block.transactions.iter().rev() {
        let txid = tx.hash();
        for vout in 0..tx.outputs.len() as u32 {
            store.delete_utxo(&OutPoint { txid, vout })?;
        }
        if let Some(mut tx_ref) = store.load_tx_ref(&txid)? {
            tx_ref.instance_count = tx_ref.instance_count.saturating_sub(1);
            if tx_ref.instance_count == 0 {
                store.delete_tx_ref(&txid)?;
            } else {
                tx_ref.unspent_outputs = 0;
                store.save_tx_ref(&txid, &tx_ref)?;
            }
        }

        if tx.is_coinbase() {
            continue;
        }
        for input in tx.inputs.iter().rev() {
            let prev = input.previous_output;
            let mut prev_ref = store
                .load_tx_ref(&prev.txid)?
                .ok_or_else(|| StorageError::NotFound(format!("transaction {}", hash_to_hex(&prev.txid))))?;
            let output = store.load_output(&prev_ref, prev.vout)?.ok_or_else(|| {
                StorageError::NotFound(format!("output {}:{}", hash_to_hex(&prev.txid), prev.vout))
            })?;
            let height = branches[prev_ref.branch as usize]
                .as_ref()
                .map(|b| b.height_of(prev_ref.block_index))
                .ok_or_else(|| StorageError::Corrupt(format!("transaction in missing branch {}", prev_ref.branch)))?;
            let entry = UtxoEntry {
                value: output.value,
                height,
                coinbase: prev_ref.coinbase,
                script_pubkey: output.script_pubkey,
            };
            store.save_utxo(&prev, &entry)?;
            prev_ref.unspent_outputs += 1;
            store.save_tx_ref(&prev.txid, &prev_ref)?;
        }
    }
    Ok(())
}
