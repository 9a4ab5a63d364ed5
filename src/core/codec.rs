//! Bitcoin wire encoding for headers, transactions and blocks.
//!
//! Integers are little-endian, counts and script lengths use the CompactSize
//! varint. Encoding is written by hand, the same way the signing hashes are
//! built, so the byte layout is explicit and stable.

use crate::core::types::*;

/// Header size on the wire
pub const HEADER_SIZE: usize = 80;

/// Upper bound for any single length field we accept while decoding
const MAX_DECODE_LEN: u64 = 32 * 1024 * 1024;

// ─── Encoding ────────────────────────────────────────────────────────

pub fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xFC => buf.push(n as u8),
        0xFD..=0xFFFF => {
            buf.push(0xFD);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.push(0xFE);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xFF);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn varint_len(n: u64) -> usize {
    match n {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

pub fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn encode_header(header: &BlockHeader) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(&header.version.to_le_bytes());
    out[4..36].copy_from_slice(&header.prev_hash);
    out[36..68].copy_from_slice(&header.merkle_root);
    out[68..72].copy_from_slice(&header.time.to_le_bytes());
    out[72..76].copy_from_slice(&header.target.to_le_bytes());
    out[76..80].copy_from_slice(&header.nonce.to_le_bytes());
    out
}

pub fn write_output(buf: &mut Vec<u8>, output: &TxOutput) {
    buf.extend_from_slice(&output.value.to_le_bytes());
    write_bytes(buf, &output.script_pubkey);
}

pub fn write_transaction(buf: &mut Vec<u8>, tx: &Transaction) {
    buf.extend_from_slice(&tx.version.to_le_bytes());
    write_varint(buf, tx.inputs.len() as u64);
    for input in &tx.inputs {
        buf.extend_from_slice(&input.previous_output.txid);
        buf.extend_from_slice(&input.previous_output.vout.to_le_bytes());
        write_bytes(buf, &input.script_sig);
        buf.extend_from_slice(&input.sequence.to_le_bytes());
    }
    write_varint(buf, tx.outputs.len() as u64);
    for output in &tx.outputs {
        write_output(buf, output);
    }
    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
}

pub fn encode_transaction(tx: &Transaction) -> Vec<u8> {
    let mut buf = Vec::with_capacity(transaction_len(tx));
    write_transaction(&mut buf, tx);
    buf
}

/// Serialize a block; `include_transactions == false` gives the bare header.
pub fn encode_block(block: &Block, include_transactions: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(if include_transactions { block_len(block) } else { HEADER_SIZE });
    buf.extend_from_slice(&encode_header(block.header()));
    if include_transactions {
        write_varint(&mut buf, block.transactions.len() as u64);
        for tx in &block.transactions {
            write_transaction(&mut buf, tx);
        }
    }
    buf
}

fn outputs_len(outputs: &[TxOutput]) -> usize {
    varint_len(outputs.len() as u64)
        + outputs
            .iter()
            .map(|o| 8 + varint_len(o.script_pubkey.len() as u64) + o.script_pubkey.len())
            .sum::<usize>()
}

pub fn transaction_len(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .inputs
        .iter()
        .map(|i| 36 + varint_len(i.script_sig.len() as u64) + i.script_sig.len() + 4)
        .sum();
    4 + varint_len(tx.inputs.len() as u64) + inputs + outputs_len(&tx.outputs) + 4
}

pub fn block_len(block: &Block) -> usize {
    HEADER_SIZE
        + varint_len(block.transactions.len() as u64)
        + block.transactions.iter().map(transaction_len).sum::<usize>()
}

// ─── Decoding ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEnd { needed: usize, remaining: usize },
    LengthTooLarge(u64),
    TrailingBytes(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEnd { needed, remaining } => {
                write!(f, "unexpected end of data (needed {}, {} left)", needed, remaining)
            }
            DecodeError::LengthTooLarge(n) => write!(f, "length field too large: {}", n),
            DecodeError::TrailingBytes(n) => write!(f, "{} trailing bytes", n),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Cursor over a byte slice.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEnd { needed: n, remaining: self.remaining() });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        let mut h = [0u8; 32];
        h.copy_from_slice(self.take(32)?);
        Ok(h)
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        match self.read_u8()? {
            0xFD => Ok(self.read_u16()? as u64),
            0xFE => Ok(self.read_u32()? as u64),
            0xFF => self.read_u64(),
            n => Ok(n as u64),
        }
    }

    /// A varint used as a length or count.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let n = self.read_varint()?;
        if n > MAX_DECODE_LEN {
            return Err(DecodeError::LengthTooLarge(n));
        }
        Ok(n as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let n = self.read_len()?;
        Ok(self.take(n)?.to_vec())
    }
}

pub fn read_header(r: &mut Reader) -> Result<BlockHeader, DecodeError> {
    Ok(BlockHeader {
        version: r.read_u32()?,
        prev_hash: r.read_hash()?,
        merkle_root: r.read_hash()?,
        time: r.read_u32()?,
        target: r.read_u32()?,
        nonce: r.read_u32()?,
    })
}

pub fn decode_header(bytes: &[u8]) -> Result<BlockHeader, DecodeError> {
    read_header(&mut Reader::new(bytes))
}

pub fn read_output(r: &mut Reader) -> Result<TxOutput, DecodeError> {
    Ok(TxOutput { value: r.read_u64()?, script_pubkey: r.read_var_bytes()? })
}

/// Decode the outputs section of a transaction: count varint then outputs.
pub fn decode_outputs(bytes: &[u8]) -> Result<Vec<TxOutput>, DecodeError> {
    let mut r = Reader::new(bytes);
    let count = r.read_len()?;
    let mut outputs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        outputs.push(read_output(&mut r)?);
    }
    Ok(outputs)
}

pub fn read_transaction(r: &mut Reader) -> Result<Transaction, DecodeError> {
    let version = r.read_u32()?;
    let input_count = r.read_len()?;
    let mut inputs = Vec::with_capacity(input_count.min(1024));
    for _ in 0..input_count {
        let txid = r.read_hash()?;
        let vout = r.read_u32()?;
        let script_sig = r.read_var_bytes()?;
        let sequence = r.read_u32()?;
        inputs.push(TxInput { previous_output: OutPoint { txid, vout }, script_sig, sequence });
    }
    let output_count = r.read_len()?;
    let mut outputs = Vec::with_capacity(output_count.min(1024));
    for _ in 0..output_count {
        outputs.push(read_output(r)?);
    }
    let lock_time = r.read_u32()?;
    Ok(Transaction { version, inputs, outputs, lock_time })
}

pub fn decode_transaction(bytes: &[u8]) -> Result<Transaction, DecodeError> {
    let mut r = Reader::new(bytes);
    let tx = read_transaction(&mut r)?;
    if r.remaining() != 0 {
        return Err(DecodeError::TrailingBytes(r.remaining()));
    }
    Ok(tx)
}

/// Decode a block from the front of `bytes`, returning it with the number of
/// bytes consumed. Without transactions only the header is read.
pub fn decode_block(bytes: &[u8], include_transactions: bool) -> Result<(Block, usize), DecodeError> {
    let mut r = Reader::new(bytes);
    let header = read_header(&mut r)?;
    let mut transactions = Vec::new();
    if include_transactions {
        let count = r.read_len()?;
        transactions.reserve(count.min(4096));
        for _ in 0..count {
            transactions.push(read_transaction(&mut r)?);
        }
    }
    Ok((Block::new(header, transactions), r.position()))
}

// ─── Raw layout ──────────────────────────────────────────────────────

/// Byte ranges of one transaction inside a serialized block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSpan {
    pub offset: usize,
    pub len: usize,
    /// Start of the output count varint
    pub outputs_offset: usize,
    /// Length of the output count plus all outputs
    pub outputs_len: usize,
    pub output_count: usize,
}

fn skip_transaction(r: &mut Reader) -> Result<TxSpan, DecodeError> {
    let offset = r.position();
    r.take(4)?;
    let input_count = r.read_len()?;
    for _ in 0..input_count {
        r.take(36)?;
        let script_len = r.read_len()?;
        r.take(script_len + 4)?;
    }
    let outputs_offset = r.position();
    let output_count = r.read_len()?;
    for _ in 0..output_count {
        r.take(8)?;
        let script_len = r.read_len()?;
        r.take(script_len)?;
    }
    let outputs_len = r.position() - outputs_offset;
    r.take(4)?;
    Ok(TxSpan { offset, len: r.position() - offset, outputs_offset, outputs_len, output_count })
}

/// Locate every transaction in a serialized block without decoding it.
pub fn block_tx_spans(bytes: &[u8]) -> Result<Vec<TxSpan>, DecodeError> {
    let mut r = Reader::new(bytes);
    r.take(HEADER_SIZE)?;
    let count = r.read_len()?;
    let mut spans = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        spans.push(skip_transaction(&mut r)?);
    }
    Ok(spans)
}
