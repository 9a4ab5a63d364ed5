//! Legacy (pre-segwit) signature hashing.

use crate::core::codec;
use crate::core::script::{next_instruction, OP_CODESEPARATOR};
use crate::core::types::{Hash256, Transaction, TxOutput};
use crate::crypto::hash256;

pub const SIGHASH_ALL: u32 = 1;
pub const SIGHASH_NONE: u32 = 2;
pub const SIGHASH_SINGLE: u32 = 3;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Returned when SIGHASH_SINGLE has no matching output, or the input index
/// is out of range. Consensus signs this constant.
const ONE_HASH: Hash256 = {
    let mut h = [0u8; 32];
    h[0] = 1;
    h
};

fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut pc = 0;
    while pc < script.len() {
        let start = pc;
        match next_instruction(script, &mut pc) {
            Some(ins) if ins.opcode == OP_CODESEPARATOR => {}
            Some(_) => out.extend_from_slice(&script[start..pc]),
            None => {
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
    }
    out
}

/// Digest signed by input `input_index` of `tx` with the given script code
/// and hash type.
pub fn legacy_signature_hash(tx: &Transaction, input_index: usize, script_code: &[u8], hash_type: u32) -> Hash256 {
    if input_index >= tx.inputs.len() {
        return ONE_HASH;
    }
    let base_type = hash_type & 0x1f;
    if base_type == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        return ONE_HASH;
    }

    let mut copy = tx.clone();
    for input in &mut copy.inputs {
        input.script_sig.clear();
    }
    copy.inputs[input_index].script_sig = strip_code_separators(script_code);

    match base_type {
        SIGHASH_NONE => {
            copy.outputs.clear();
            zero_other_sequences(&mut copy, input_index);
        }
        SIGHASH_SINGLE => {
            copy.outputs.truncate(input_index + 1);
            for output in &mut copy.outputs[..input_index] {
                *output = TxOutput { value: u64::MAX, script_pubkey: Vec::new() };
            }
            zero_other_sequences(&mut copy, input_index);
        }
        _ => {}
    }

    if hash_type & SIGHASH_ANYONECANPAY != 0 {
        let input = copy.inputs.swap_remove(input_index);
        copy.inputs = vec![input];
    }

    let mut buf = codec::encode_transaction(&copy);
    buf.extend_from_slice(&hash_type.to_le_bytes());
    hash256(&buf)
}

fn zero_other_sequences(tx: &mut Transaction, input_index: usize) {
    for (i, input) in tx.inputs.iter_mut().enumerate() {
        if i != input_index {
            input.sequence = 0;
        }
    }
}
