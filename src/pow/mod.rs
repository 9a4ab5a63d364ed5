//! Proof-of-work arithmetic: compact targets, block work and retargeting.
//!
//! Compact form: the top byte is a base-256 exponent, the low 23 bits the
//! mantissa, bit 23 a sign bit that is never valid for a target.
//!
//! All arithmetic uses `BigUint`; floating point would break bit-exact
//! agreement on cumulative work.

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::core::params::TARGET_TIMESPAN;
use crate::core::types::Hash256;

/// Decoded compact target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub value: BigUint,
    pub negative: bool,
    pub overflow: bool,
}

pub fn decode_compact(bits: u32) -> Target {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    let value = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3)) as usize
    };
    let negative = mantissa != 0 && bits & 0x0080_0000 != 0;
    let overflow = mantissa != 0
        && (exponent > 34 || (mantissa > 0xff && exponent > 33) || (mantissa > 0xffff && exponent > 32));
    Target { value, negative, overflow }
}

pub fn encode_compact(value: &BigUint) -> u32 {
    let bytes = value.to_bytes_be();
    let mut size = if value.is_zero() { 0 } else { bytes.len() as u32 };
    let mut compact: u32 = if size <= 3 {
        let mut low: u32 = 0;
        for b in &bytes {
            low = (low << 8) | *b as u32;
        }
        low << (8 * (3 - size))
    } else {
        ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Check a header hash against its compact target and the network maximum.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, max_bits: u32) -> bool {
    let target = decode_compact(bits);
    if target.negative || target.overflow || target.value.is_zero() {
        return false;
    }
    if target.value > decode_compact(max_bits).value {
        return false;
    }
    BigUint::from_bytes_le(hash) <= target.value
}

/// Expected number of hashes to meet a target: `2^256 / (target + 1)`.
pub fn block_work(bits: u32) -> BigUint {
    let target = decode_compact(bits);
    if target.negative || target.overflow || target.value.is_zero() {
        return BigUint::zero();
    }
    (BigUint::one() << 256usize) / (target.value + BigUint::one())
}

/// Next compact target from the previous one and the time the last
/// interval took. The adjustment is limited to a factor of four either way
/// and never exceeds the network maximum.
pub fn retarget(old_bits: u32, actual_timespan: u32, max_bits: u32) -> u32 {
    let timespan = actual_timespan.clamp(TARGET_TIMESPAN / 4, TARGET_TIMESPAN * 4);
    let old = decode_compact(old_bits).value;
    let mut new = old * BigUint::from(timespan) / BigUint::from(TARGET_TIMESPAN);
    let max = decode_compact(max_bits).value;
    if new > max {
        new = max;
    }
    encode_compact(&new)
}
