//! Shared chain primitives for Ferrite Coin.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod masternode;
pub mod script;

pub type Hash = [u8; 32];
pub type PublicKey = [u8; 32];
pub type Signature = [u8; 64];
pub type PubKeyHash = [u8; 20];

/// One coin in the smallest unit.
pub const COIN: u64 = 100_000_000;

/// Double SHA-256 over a byte slice, the consensus hash for all
/// governance items and transaction ids.
pub fn double_sha256(bytes: &[u8]) -> Hash {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    second.into()
}

/// Represents a reference to a specific transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// The transaction ID (hash) of the transaction containing the output.
    pub txid: Hash,
    /// The index of the output within that transaction.
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// Deterministic hash of the outpoint itself, used to key votes by
    /// voter identity.
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).unwrap_or_default();
        double_sha256(&bytes)
    }

    /// Short human-readable form, `<txid hex>-<vout>`.
    pub fn to_string_short(&self) -> String {
        format!("{}-{}", hex::encode(self.txid), self.vout)
    }
}

/// Represents a transaction input, referencing a previous transaction's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// The `OutPoint` referencing the output being spent.
    pub previous_output: OutPoint,
    /// The script signature, providing proof of ownership.
    pub script_sig: Vec<u8>,
    /// A sequence number, typically used for replace-by-fee or relative lock-times.
    pub sequence: u32,
}

/// Represents a transaction output, specifying a value and a locking script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// The value of the output in the smallest unit.
    pub value: u64,
    /// The locking script (scriptPubKey) that defines the conditions for
    /// spending this output.
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        TxOutput { value, script_pubkey }
    }

    /// Extracts the public key hash from a P2PKH script, if applicable.
    pub fn extract_public_key_hash(&self) -> Option<PubKeyHash> {
        script::extract_public_key_hash(&self.script_pubkey)
    }
}

/// A transaction as seen by the governance engine: enough structure to
/// inspect outputs, lock time and confirm collateral commitments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// The version of the transaction format.
    pub version: u32,
    /// A list of transaction inputs.
    pub inputs: Vec<TxInput>,
    /// A list of transaction outputs.
    pub outputs: Vec<TxOutput>,
    /// The lock time of the transaction.
    pub lock_time: u32,
}

impl Transaction {
    /// Returns the canonical byte representation of the transaction.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
        bincode::serialize(self)
    }

    /// Calculates and returns the transaction ID (hash) of the transaction.
    pub fn txid(&self) -> Hash {
        match self.to_bytes() {
            Ok(bytes) => double_sha256(&bytes),
            Err(_) => [0u8; 32],
        }
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outpoint_hash_is_stable() {
        let op = OutPoint::new([7u8; 32], 1);
        assert_eq!(op.hash(), op.hash());
        assert_ne!(op.hash(), OutPoint::new([7u8; 32], 2).hash());
    }

    #[test]
    fn outpoint_short_string() {
        let op = OutPoint::new([0u8; 32], 3);
        assert!(op.to_string_short().ends_with("-3"));
    }

    #[test]
    fn txid_changes_with_outputs() {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput::new(50, vec![0x6a])],
            lock_time: 0,
        };
        let id = tx.txid();
        tx.outputs[0].value = 51;
        assert_ne!(id, tx.txid());
    }
}
