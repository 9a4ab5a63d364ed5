// src/core/script.rs
//! Legacy Bitcoin script evaluation.
//!
//! Covers the pre-segwit rule set: pushes, flow control, stack and
//! arithmetic ops, hashing, CHECKSIG/CHECKMULTISIG with legacy signature
//! hashing, and BIP16 pay-to-script-hash. Disabled opcodes fail the script
//! even in unexecuted branches.

use crate::core::types::{Transaction, TxOutput};
use crate::crypto::{self, sighash};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_RESERVED: u8 = 0x50;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_NOP: u8 = 0x61;
pub const OP_VER: u8 = 0x62;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_VERIF: u8 = 0x65;
pub const OP_VERNOTIF: u8 = 0x66;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_TOALTSTACK: u8 = 0x6b;
pub const OP_FROMALTSTACK: u8 = 0x6c;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_2DUP: u8 = 0x6e;
pub const OP_3DUP: u8 = 0x6f;
pub const OP_2OVER: u8 = 0x70;
pub const OP_2ROT: u8 = 0x71;
pub const OP_2SWAP: u8 = 0x72;
pub const OP_IFDUP: u8 = 0x73;
pub const OP_DEPTH: u8 = 0x74;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_NIP: u8 = 0x77;
pub const OP_OVER: u8 = 0x78;
pub const OP_PICK: u8 = 0x79;
pub const OP_ROLL: u8 = 0x7a;
pub const OP_ROT: u8 = 0x7b;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_TUCK: u8 = 0x7d;
pub const OP_SIZE: u8 = 0x82;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_1ADD: u8 = 0x8b;
pub const OP_1SUB: u8 = 0x8c;
pub const OP_NEGATE: u8 = 0x8f;
pub const OP_ABS: u8 = 0x90;
pub const OP_NOT: u8 = 0x91;
pub const OP_0NOTEQUAL: u8 = 0x92;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
pub const OP_BOOLAND: u8 = 0x9a;
pub const OP_BOOLOR: u8 = 0x9b;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
pub const OP_NUMNOTEQUAL: u8 = 0x9e;
pub const OP_LESSTHAN: u8 = 0x9f;
pub const OP_GREATERTHAN: u8 = 0xa0;
pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
pub const OP_MIN: u8 = 0xa3;
pub const OP_MAX: u8 = 0xa4;
pub const OP_WITHIN: u8 = 0xa5;
pub const OP_RIPEMD160: u8 = 0xa6;
pub const OP_SHA1: u8 = 0xa7;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
pub const OP_NOP1: u8 = 0xb0;
pub const OP_NOP10: u8 = 0xb9;

const MAX_SCRIPT_SIZE: usize = 10_000;
const MAX_PUSH_SIZE: usize = 520;
const MAX_OPS_PER_SCRIPT: usize = 201;
const MAX_STACK_SIZE: usize = 1000;
const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

pub type Stack = Vec<Vec<u8>>;

/// Outcome of running a script to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// Ran and left a true value on top
    True,
    /// Ran but the final stack is empty or false
    False,
    /// Failed during execution or is malformed
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// The script needs an operation this engine does not provide
    Unsupported(&'static str),
    InputIndexOutOfRange(usize),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Unsupported(op) => write!(f, "unsupported script operation {}", op),
            ScriptError::InputIndexOutOfRange(i) => write!(f, "input index {} out of range", i),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Verifies signatures found by CHECKSIG-family opcodes.
pub trait SignatureChecker {
    /// `signature` still carries its trailing sighash byte.
    fn check_signature(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool;
}

/// Checks signatures against the legacy signature hash of one input.
pub struct TransactionChecker<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
}

impl SignatureChecker for TransactionChecker<'_> {
    fn check_signature(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
        let Some((&hash_type, der)) = signature.split_last() else {
            return false;
        };
        let hash = sighash::legacy_signature_hash(self.tx, self.input_index, script_code, hash_type as u32);
        crypto::verify_ecdsa(der, &hash, pubkey)
    }
}

/// Script verification as the validator consumes it.
pub trait ScriptEngine: Send {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_output: &TxOutput,
        allow_p2sh: bool,
    ) -> Result<ScriptOutcome, ScriptError>;
}

/// The interpreter in this module, verifying real signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardScriptEngine;

impl ScriptEngine for StandardScriptEngine {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_output: &TxOutput,
        allow_p2sh: bool,
    ) -> Result<ScriptOutcome, ScriptError> {
        let input = tx.inputs.get(input_index).ok_or(ScriptError::InputIndexOutOfRange(input_index))?;
        let checker = TransactionChecker { tx, input_index };
        verify_script(&input.script_sig, &prev_output.script_pubkey, &checker, allow_p2sh)
    }
}

// ─── Parsing ─────────────────────────────────────────────────────────

/// One parsed instruction: opcode and pushed data for push opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: Option<&'a [u8]>,
}

/// Read the instruction at `*pc`, advancing it. `None` on truncated pushes.
pub fn next_instruction<'a>(script: &'a [u8], pc: &mut usize) -> Option<Instruction<'a>> {
    let opcode = *script.get(*pc)?;
    *pc += 1;
    let len = match opcode {
        0x01..=0x4b => opcode as usize,
        OP_PUSHDATA1 => {
            let n = *script.get(*pc)? as usize;
            *pc += 1;
            n
        }
        OP_PUSHDATA2 => {
            let b = script.get(*pc..*pc + 2)?;
            *pc += 2;
            u16::from_le_bytes([b[0], b[1]]) as usize
        }
        OP_PUSHDATA4 => {
            let b = script.get(*pc..*pc + 4)?;
            *pc += 4;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
        }
        _ => return Some(Instruction { opcode, data: None }),
    };
    let data = script.get(*pc..pc.checked_add(len)?)?;
    *pc += len;
    Some(Instruction { opcode, data: Some(data) })
}

/// Instructions of a script; stops at the first malformed push.
pub fn instructions(script: &[u8]) -> impl Iterator<Item = Instruction<'_>> {
    let mut pc = 0;
    std::iter::from_fn(move || next_instruction(script, &mut pc))
}

/// OP_HASH160 <20 bytes> OP_EQUAL
pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// True when every instruction is a push (OP_RESERVED counts as one).
pub fn is_push_only(script: &[u8]) -> bool {
    let mut pc = 0;
    while pc < script.len() {
        match next_instruction(script, &mut pc) {
            Some(ins) if ins.opcode <= OP_16 => {}
            _ => return false,
        }
    }
    true
}

/// Count signature operations. With `accurate`, CHECKMULTISIG preceded by
/// OP_1..OP_16 counts that many keys instead of the maximum.
pub fn sig_op_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0;
    let mut last_opcode = 0xff;
    let mut pc = 0;
    while pc < script.len() {
        let Some(ins) = next_instruction(script, &mut pc) else { break };
        match ins.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    count += (last_opcode - OP_1 + 1) as u32;
                } else {
                    count += MAX_PUBKEYS_PER_MULTISIG as u32;
                }
            }
            _ => {}
        }
        last_opcode = ins.opcode;
    }
    count
}

/// Sigops inside the redeem script of a P2SH spend: the last push of the
/// input script, counted accurately. Zero when the input script is not push-only.
pub fn p2sh_sig_op_count(script_sig: &[u8]) -> u32 {
    if !is_push_only(script_sig) {
        return 0;
    }
    instructions(script_sig)
        .last()
        .and_then(|ins| ins.data)
        .map_or(0, |redeem| sig_op_count(redeem, true))
}

/// Remove every occurrence of the push of `data` from `script`.
pub fn find_and_delete(script: &[u8], data: &[u8]) -> Vec<u8> {
    let mut pattern = Vec::with_capacity(data.len() + 5);
    push_data(&mut pattern, data);
    let mut out = Vec::with_capacity(script.len());
    let mut pc = 0;
    while pc < script.len() {
        let start = pc;
        if next_instruction(script, &mut pc).is_none() {
            out.extend_from_slice(&script[start..]);
            break;
        }
        if script[start..pc] != pattern[..] {
            out.extend_from_slice(&script[start..pc]);
        }
    }
    out
}

/// Append the minimal push of `data`.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0..=0x4b => script.push(data.len() as u8),
        0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
        }
        0x100..=0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
        _ => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

// ─── Numbers ─────────────────────────────────────────────────────────

fn cast_to_bool(v: &[u8]) -> bool {
    for (i, b) in v.iter().enumerate() {
        if *b != 0 {
            // Negative zero is false.
            return !(i == v.len() - 1 && *b == 0x80);
        }
    }
    false
}

fn decode_num(v: &[u8]) -> Option<i64> {
    if v.len() > 4 {
        return None;
    }
    if v.is_empty() {
        return Some(0);
    }
    let mut result: i64 = 0;
    for (i, b) in v.iter().enumerate() {
        result |= (*b as i64) << (8 * i);
    }
    let last = v[v.len() - 1];
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (v.len() - 1)));
        Some(-(result & mask))
    } else {
        Some(result)
    }
}

fn encode_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().map_or(false, |b| b & 0x80 != 0) {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        if let Some(last) = out.last_mut() {
            *last |= 0x80;
        }
    }
    out
}

fn bool_item(b: bool) -> Vec<u8> {
    if b { vec![1] } else { Vec::new() }
}

// ─── Evaluation ──────────────────────────────────────────────────────

fn is_disabled(opcode: u8) -> bool {
    matches!(opcode, 0x7e..=0x81 | 0x83..=0x86 | 0x8d | 0x8e | 0x95..=0x99)
}

/// Execute `script` against `stack`. `Ok(false)` means the script failed.
pub fn eval_script(script: &[u8], stack: &mut Stack, checker: &dyn SignatureChecker) -> Result<bool, ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Ok(false);
    }
    let mut alt: Stack = Vec::new();
    let mut exec: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut code_start = 0usize;
    let mut pc = 0usize;

    macro_rules! pop {
        () => {
            match stack.pop() {
                Some(v) => v,
                None => return Ok(false),
            }
        };
    }
    macro_rules! pop_num {
        () => {
            match decode_num(&pop!()) {
                Some(n) => n,
                None => return Ok(false),
            }
        };
    }

    while pc < script.len() {
        let executing = exec.iter().all(|b| *b);
        let Some(ins) = next_instruction(script, &mut pc) else {
            return Ok(false);
        };
        let op = ins.opcode;

        if let Some(data) = ins.data {
            if data.len() > MAX_PUSH_SIZE {
                return Ok(false);
            }
        }
        if op > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Ok(false);
            }
        }
        if is_disabled(op) || op == OP_VERIF || op == OP_VERNOTIF {
            return Ok(false);
        }

        if !executing && !(OP_IF..=OP_ENDIF).contains(&op) {
            continue;
        }

        if let Some(data) = ins.data {
            stack.push(data.to_vec());
        } else {
            match op {
                OP_0 => stack.push(Vec::new()),
                OP_1NEGATE => stack.push(encode_num(-1)),
                OP_1..=OP_16 => stack.push(encode_num((op - OP_1 + 1) as i64)),
                OP_NOP | OP_NOP1..=OP_NOP10 => {}
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let top = pop!();
                        value = cast_to_bool(&top);
                        if op == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec.push(value);
                }
                OP_ELSE => match exec.last_mut() {
                    Some(top) => *top = !*top,
                    None => return Ok(false),
                },
                OP_ENDIF => {
                    if exec.pop().is_none() {
                        return Ok(false);
                    }
                }
                OP_VERIFY => {
                    if !cast_to_bool(&pop!()) {
                        return Ok(false);
                    }
                }
                OP_RETURN => return Ok(false),
                OP_TOALTSTACK => {
                    let v = pop!();
                    alt.push(v);
                }
                OP_FROMALTSTACK => match alt.pop() {
                    Some(v) => stack.push(v),
                    None => return Ok(false),
                },
                OP_2DROP => {
                    pop!();
                    pop!();
                }
                OP_2DUP | OP_3DUP => {
                    let n = if op == OP_2DUP { 2 } else { 3 };
                    if stack.len() < n {
                        return Ok(false);
                    }
                    let items = stack[stack.len() - n..].to_vec();
                    stack.extend(items);
                }
                OP_2OVER => {
                    if stack.len() < 4 {
                        return Ok(false);
                    }
                    let items = stack[stack.len() - 4..stack.len() - 2].to_vec();
                    stack.extend(items);
                }
                OP_2ROT => {
                    if stack.len() < 6 {
                        return Ok(false);
                    }
                    let at = stack.len() - 6;
                    let items: Vec<Vec<u8>> = stack.drain(at..at + 2).collect();
                    stack.extend(items);
                }
                OP_2SWAP => {
                    if stack.len() < 4 {
                        return Ok(false);
                    }
                    let n = stack.len();
                    stack.swap(n - 4, n - 2);
                    stack.swap(n - 3, n - 1);
                }
                OP_IFDUP => {
                    let Some(top) = stack.last().cloned() else { return Ok(false) };
                    if cast_to_bool(&top) {
                        stack.push(top);
                    }
                }
                OP_DEPTH => stack.push(encode_num(stack.len() as i64)),
                OP_DROP => {
                    pop!();
                }
                OP_DUP => {
                    let Some(top) = stack.last().cloned() else { return Ok(false) };
                    stack.push(top);
                }
                OP_NIP => {
                    if stack.len() < 2 {
                        return Ok(false);
                    }
                    let n = stack.len();
                    stack.remove(n - 2);
                }
                OP_OVER => {
                    if stack.len() < 2 {
                        return Ok(false);
                    }
                    let item = stack[stack.len() - 2].clone();
                    stack.push(item);
                }
                OP_PICK | OP_ROLL => {
                    let n = pop_num!();
                    if n < 0 || n as usize >= stack.len() {
                        return Ok(false);
                    }
                    let idx = stack.len() - 1 - n as usize;
                    let item = if op == OP_ROLL { stack.remove(idx) } else { stack[idx].clone() };
                    stack.push(item);
                }
                OP_ROT => {
                    if stack.len() < 3 {
                        return Ok(false);
                    }
                    let n = stack.len();
                    let item = stack.remove(n - 3);
                    stack.push(item);
                }
                OP_SWAP => {
                    if stack.len() < 2 {
                        return Ok(false);
                    }
                    let n = stack.len();
                    stack.swap(n - 2, n - 1);
                }
                OP_TUCK => {
                    if stack.len() < 2 {
                        return Ok(false);
                    }
                    let top = stack[stack.len() - 1].clone();
                    let n = stack.len();
                    stack.insert(n - 2, top);
                }
                OP_SIZE => {
                    let Some(top) = stack.last() else { return Ok(false) };
                    let size = top.len() as i64;
                    stack.push(encode_num(size));
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let a = pop!();
                    let b = pop!();
                    let equal = a == b;
                    if op == OP_EQUALVERIFY {
                        if !equal {
                            return Ok(false);
                        }
                    } else {
                        stack.push(bool_item(equal));
                    }
                }
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = pop_num!();
                    let r = match op {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.push(encode_num(r));
                }
                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    let b = pop_num!();
                    let a = pop_num!();
                    let r = match op {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if op == OP_NUMEQUALVERIFY {
                        if r == 0 {
                            return Ok(false);
                        }
                    } else {
                        stack.push(encode_num(r));
                    }
                }
                OP_WITHIN => {
                    let max = pop_num!();
                    let min = pop_num!();
                    let x = pop_num!();
                    stack.push(bool_item(min <= x && x < max));
                }
                OP_RIPEMD160 => {
                    let v = pop!();
                    stack.push(crypto::ripemd160(&v).to_vec());
                }
                OP_SHA1 => return Err(ScriptError::Unsupported("OP_SHA1")),
                OP_SHA256 => {
                    let v = pop!();
                    stack.push(crypto::sha256(&v).to_vec());
                }
                OP_HASH160 => {
                    let v = pop!();
                    stack.push(crypto::hash160(&v).to_vec());
                }
                OP_HASH256 => {
                    let v = pop!();
                    stack.push(crypto::hash256(&v).to_vec());
                }
                OP_CODESEPARATOR => code_start = pc,
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = pop!();
                    let sig = pop!();
                    let script_code = find_and_delete(&script[code_start..], &sig);
                    let ok = checker.check_signature(&sig, &pubkey, &script_code);
                    if op == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Ok(false);
                        }
                    } else {
                        stack.push(bool_item(ok));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let key_count = pop_num!();
                    if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
                        return Ok(false);
                    }
                    op_count += key_count as usize;
                    if op_count > MAX_OPS_PER_SCRIPT {
                        return Ok(false);
                    }
                    let mut keys = Vec::with_capacity(key_count as usize);
                    for _ in 0..key_count {
                        keys.push(pop!());
                    }
                    let sig_count = pop_num!();
                    if sig_count < 0 || sig_count > key_count {
                        return Ok(false);
                    }
                    let mut sigs = Vec::with_capacity(sig_count as usize);
                    for _ in 0..sig_count {
                        sigs.push(pop!());
                    }
                    // The historical off-by-one: one extra item is consumed.
                    pop!();

                    let mut script_code = script[code_start..].to_vec();
                    for sig in &sigs {
                        script_code = find_and_delete(&script_code, sig);
                    }
                    // Keys and signatures were popped top-first, matching in that order.
                    let mut ok = true;
                    let mut key_iter = keys.iter();
                    for sig in &sigs {
                        let matched = key_iter.by_ref().any(|key| checker.check_signature(sig, key, &script_code));
                        if !matched {
                            ok = false;
                            break;
                        }
                    }
                    if op == OP_CHECKMULTISIGVERIFY {
                        if !ok {
                            return Ok(false);
                        }
                    } else {
                        stack.push(bool_item(ok));
                    }
                }
                // OP_RESERVED, OP_VER and anything unassigned fail when executed.
                _ => return Ok(false),
            }
        }

        if stack.len() + alt.len() > MAX_STACK_SIZE {
            return Ok(false);
        }
    }

    Ok(exec.is_empty())
}

/// Run an input script then the output script it spends, with the BIP16
/// redeem-script step when `allow_p2sh` is set.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    checker: &dyn SignatureChecker,
    allow_p2sh: bool,
) -> Result<ScriptOutcome, ScriptError> {
    let mut stack: Stack = Vec::new();
    if !eval_script(script_sig, &mut stack, checker)? {
        return Ok(ScriptOutcome::Invalid);
    }
    let p2sh_stack = if allow_p2sh { Some(stack.clone()) } else { None };
    if !eval_script(script_pubkey, &mut stack, checker)? {
        return Ok(ScriptOutcome::Invalid);
    }
    if !stack.last().map_or(false, |top| cast_to_bool(top)) {
        return Ok(ScriptOutcome::False);
    }

    if let Some(mut stack) = p2sh_stack {
        if is_p2sh(script_pubkey) {
            if !is_push_only(script_sig) {
                return Ok(ScriptOutcome::Invalid);
            }
            let Some(redeem) = stack.pop() else {
                return Ok(ScriptOutcome::Invalid);
            };
            if !eval_script(&redeem, &mut stack, checker)? {
                return Ok(ScriptOutcome::Invalid);
            }
            if !stack.last().map_or(false, |top| cast_to_bool(top)) {
                return Ok(ScriptOutcome::False);
            }
        }
    }
    Ok(ScriptOutcome::True)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OutPoint, TxInput};
    use secp256k1::{Secp256k1, SecretKey};

    struct NeverValid;

    impl SignatureChecker for NeverValid {
        fn check_signature(&self, _: &[u8], _: &[u8], _: &[u8]) -> bool {
            false
        }
    }

    fn run(script_sig: &[u8], script_pubkey: &[u8]) -> ScriptOutcome {
        verify_script(script_sig, script_pubkey, &NeverValid, true).unwrap()
    }

    #[test]
    fn test_op_true() {
        assert_eq!(run(&[], &[OP_1]), ScriptOutcome::True);
        assert_eq!(run(&[], &[OP_0]), ScriptOutcome::False);
        assert_eq!(run(&[], &[]), ScriptOutcome::False);
    }

    #[test]
    fn test_arithmetic_and_equal() {
        // 2 3 ADD 5 EQUAL
        assert_eq!(run(&[], &[0x52, 0x53, OP_ADD, 0x55, OP_EQUAL]), ScriptOutcome::True);
        assert_eq!(run(&[], &[0x52, 0x53, OP_SUB, OP_1NEGATE, OP_NUMEQUAL]), ScriptOutcome::True);
    }

    #[test]
    fn test_if_else() {
        let script = [OP_0, OP_IF, OP_0, OP_ELSE, OP_1, OP_ENDIF];
        assert_eq!(run(&[], &script), ScriptOutcome::True);
        assert_eq!(run(&[], &[OP_1, OP_IF, OP_1]), ScriptOutcome::Invalid);
    }

    #[test]
    fn test_disabled_opcode_in_dead_branch() {
        assert_eq!(run(&[], &[OP_0, OP_IF, 0x7e, OP_ENDIF, OP_1]), ScriptOutcome::Invalid);
        assert_eq!(run(&[], &[OP_RETURN]), ScriptOutcome::Invalid);
    }

    #[test]
    fn test_p2sh_redeem_script() {
        let redeem = vec![OP_1];
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&crypto::hash160(&redeem));
        script_pubkey.push(OP_EQUAL);
        assert!(is_p2sh(&script_pubkey));

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &redeem);
        assert_eq!(run(&script_sig, &script_pubkey), ScriptOutcome::True);

        // A false redeem script fails only when BIP16 is enforced.
        let bad_redeem = vec![OP_0];
        let mut bad_pubkey = vec![OP_HASH160, 0x14];
        bad_pubkey.extend_from_slice(&crypto::hash160(&bad_redeem));
        bad_pubkey.push(OP_EQUAL);
        let mut bad_sig = Vec::new();
        push_data(&mut bad_sig, &bad_redeem);
        assert_eq!(run(&bad_sig, &bad_pubkey), ScriptOutcome::False);
        assert_eq!(verify_script(&bad_sig, &bad_pubkey, &NeverValid, false).unwrap(), ScriptOutcome::True);
    }

    #[test]
    fn test_push_only_and_sigops() {
        assert!(is_push_only(&[OP_0, 0x02, 0xaa, 0xbb, OP_16]));
        assert!(!is_push_only(&[OP_DUP]));
        assert!(!is_push_only(&[0x05, 0x01]));

        let multisig = [OP_1, 0x21, OP_CHECKMULTISIG];
        assert_eq!(sig_op_count(&[OP_CHECKSIG, OP_CHECKSIGVERIFY], false), 2);
        assert_eq!(sig_op_count(&[OP_1, OP_CHECKMULTISIG], true), 1);
        assert_eq!(sig_op_count(&[OP_1, OP_CHECKMULTISIG], false), 20);
        assert_eq!(sig_op_count(&multisig, true), 0);
    }

    #[test]
    fn test_script_numbers() {
        for n in [-255i64, -128, -1, 0, 1, 127, 128, 255, 256, 0x7fff_ffff] {
            assert_eq!(decode_num(&encode_num(n)), Some(n));
        }
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x00, 0x01]));
    }

    #[test]
    fn test_find_and_delete() {
        let mut script = Vec::new();
        push_data(&mut script, &[1, 2]);
        script.push(OP_DUP);
        push_data(&mut script, &[1, 2]);
        assert_eq!(find_and_delete(&script, &[1, 2]), vec![OP_DUP]);
    }

    #[test]
    fn test_p2pkh_signature() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let pubkey = secret.public_key(&secp).serialize();

        let mut script_pubkey = vec![OP_DUP, OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&crypto::hash160(&pubkey));
        script_pubkey.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);

        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: [3u8; 32], vout: 0 },
                script_sig: Vec::new(),
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput { value: 10, script_pubkey: vec![OP_1] }],
            lock_time: 0,
        };
        let hash = sighash::legacy_signature_hash(&tx, 0, &script_pubkey, sighash::SIGHASH_ALL);
        let message = secp256k1::Message::from_digest_slice(&hash).unwrap();
        let mut sig = secp.sign_ecdsa(&message, &secret).serialize_der().to_vec();
        sig.push(sighash::SIGHASH_ALL as u8);

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        push_data(&mut script_sig, &pubkey);
        tx.inputs[0].script_sig = script_sig;

        let prev = TxOutput { value: 10, script_pubkey: script_pubkey.clone() };
        assert_eq!(StandardScriptEngine.verify_input(&tx, 0, &prev, true).unwrap(), ScriptOutcome::True);

        // Changing an output invalidates the signature.
        tx.outputs[0].value = 11;
        assert_eq!(StandardScriptEngine.verify_input(&tx, 0, &prev, true).unwrap(), ScriptOutcome::False);
    }
}
