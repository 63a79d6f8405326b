//! Locking-script helpers for the standard script shapes the node cares
//! about: P2PKH payments, P2SH, and unspendable OP_RETURN data carriers.

use crate::{Hash, PubKeyHash};

pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_RETURN: u8 = 0x6a;

/// Builds a P2PKH locking script:
/// `OP_DUP OP_HASH160 <20-byte-hash> OP_EQUALVERIFY OP_CHECKSIG`.
pub fn pay_to_public_key_hash(pubkey_hash: &PubKeyHash) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Builds the collateral commitment script `OP_RETURN <32-byte hash>`.
pub fn op_return_commitment(hash: &Hash) -> Vec<u8> {
    let mut script = Vec::with_capacity(34);
    script.push(OP_RETURN);
    script.push(0x20);
    script.extend_from_slice(hash);
    script
}

/// True for the exact 25-byte P2PKH pattern.
pub fn is_normal_payment_script(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

/// True for the 23-byte P2SH pattern `OP_HASH160 <20 bytes> OP_EQUAL`.
pub fn is_pay_to_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// An output is unspendable when its script starts with OP_RETURN.
pub fn is_unspendable(script: &[u8]) -> bool {
    !script.is_empty() && script[0] == OP_RETURN
}

/// Extracts the public key hash from a P2PKH script, if applicable.
pub fn extract_public_key_hash(script: &[u8]) -> Option<PubKeyHash> {
    if !is_normal_payment_script(script) {
        return None;
    }
    let mut pubkey_hash = [0u8; 20];
    pubkey_hash.copy_from_slice(&script[3..23]);
    Some(pubkey_hash)
}
