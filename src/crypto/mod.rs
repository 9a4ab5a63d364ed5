//! Hashing and signature primitives.
//!
//! Bitcoin identifies blocks and transactions by double SHA-256 and
//! addresses by HASH160 (RIPEMD-160 of SHA-256). Signatures are ECDSA over
//! secp256k1.

use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::core::types::Hash256;

pub mod sighash;

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Double SHA-256.
pub fn hash256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(data));
    out
}

/// RIPEMD-160 of SHA-256.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&Sha256::digest(data))
}

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static CONTEXT: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::verification_only)
}

/// Verify a DER signature (without the trailing sighash byte) over a 32-byte
/// digest. Non-strict DER is accepted and high-S values are normalised, as
/// the early chain contains both.
pub fn verify_ecdsa(signature: &[u8], hash: &Hash256, pubkey: &[u8]) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(mut sig) = Signature::from_der_lax(signature) else {
        return false;
    };
    sig.normalize_s();
    let Ok(message) = Message::from_digest_slice(hash) else {
        return false;
    };
    secp().verify_ecdsa(&message, &sig, &pubkey).is_ok()
}
