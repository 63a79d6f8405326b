//! Signed vote envelopes. A masternode is identified by its collateral
//! outpoint; the vote binds that identity to a target item hash and a
//! timestamp, signed with the operator key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ferrite_shared_types::{double_sha256, Hash, OutPoint, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::BudgetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum VoteDirection {
    Abstain = 0,
    Yes = 1,
    No = 2,
}

impl VoteDirection {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(VoteDirection::Abstain),
            1 => Some(VoteDirection::Yes),
            2 => Some(VoteDirection::No),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteDirection::Abstain => "ABSTAIN",
            VoteDirection::Yes => "YES",
            VoteDirection::No => "NO",
        }
    }
}

fn verify_signed_message(
    operator_key: &PublicKey,
    message: &str,
    signature: &[u8; 64],
) -> Result<(), BudgetError> {
    let key = VerifyingKey::from_bytes(operator_key)
        .map_err(|e| BudgetError::BadSignature(format!("bad operator key: {}", e)))?;
    let sig = Signature::from_bytes(signature);
    key.verify(message.as_bytes(), &sig)
        .map_err(|e| BudgetError::BadSignature(e.to_string()))
}

/// A masternode's vote on a budget proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalVote {
    pub voter: OutPoint,
    pub proposal_hash: Hash,
    pub direction: VoteDirection,
    pub time: i64,
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
    /// Whether the voter is currently in the masternode directory.
    /// Recomputed locally, never part of the wire payload.
    #[serde(skip)]
    pub valid: bool,
    /// Whether this vote has been announced to peers since the last sync
    /// reset. Local bookkeeping only.
    #[serde(skip)]
    pub synced: bool,
}

impl ProposalVote {
    pub fn new(voter: OutPoint, proposal_hash: Hash, direction: VoteDirection, time: i64) -> Self {
        ProposalVote {
            voter,
            proposal_hash,
            direction,
            time,
            signature: [0u8; 64],
            valid: true,
            synced: false,
        }
    }

    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(&(
            &self.voter,
            &self.proposal_hash,
            self.direction as u32,
            self.time,
        ))
        .unwrap_or_default();
        double_sha256(&bytes)
    }

    /// The exact string the operator key signs.
    pub fn signed_message(&self) -> String {
        format!(
            "{}{}{}{}",
            self.voter.to_string_short(),
            hex::encode(self.proposal_hash),
            self.direction as u32,
            self.time
        )
    }

    pub fn sign(&mut self, key: &SigningKey) {
        self.signature = key.sign(self.signed_message().as_bytes()).to_bytes();
    }

    pub fn check_signature(&self, operator_key: &PublicKey) -> Result<(), BudgetError> {
        verify_signed_message(operator_key, &self.signed_message(), &self.signature)
    }
}

/// A masternode's vote on a finalized budget. Always an endorsement; there
/// is no direction field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedBudgetVote {
    pub voter: OutPoint,
    pub budget_hash: Hash,
    pub time: i64,
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
    #[serde(skip)]
    pub valid: bool,
    #[serde(skip)]
    pub synced: bool,
}

impl FinalizedBudgetVote {
    pub fn new(voter: OutPoint, budget_hash: Hash, time: i64) -> Self {
        FinalizedBudgetVote {
            voter,
            budget_hash,
            time,
            signature: [0u8; 64],
            valid: true,
            synced: false,
        }
    }

    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(&(&self.voter, &self.budget_hash, self.time))
            .unwrap_or_default();
        double_sha256(&bytes)
    }

    pub fn signed_message(&self) -> String {
        format!(
            "{}{}{}",
            self.voter.to_string_short(),
            hex::encode(self.budget_hash),
            self.time
        )
    }

    pub fn sign(&mut self, key: &SigningKey) {
        self.signature = key.sign(self.signed_message().as_bytes()).to_bytes();
    }

    pub fn check_signature(&self, operator_key: &PublicKey) -> Result<(), BudgetError> {
        verify_signed_message(operator_key, &self.signed_message(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (SigningKey, PublicKey) {
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let public = key.verifying_key().to_bytes();
        (key, public)
    }

    #[test]
    fn proposal_vote_sign_and_verify() {
        let (key, public) = keypair();
        let mut vote = ProposalVote::new(
            OutPoint::new([1u8; 32], 0),
            [2u8; 32],
            VoteDirection::Yes,
            1_700_000_000,
        );
        vote.sign(&key);
        assert!(vote.check_signature(&public).is_ok());

        // Any field change invalidates the signature.
        vote.time += 1;
        assert!(vote.check_signature(&public).is_err());
    }

    #[test]
    fn finalized_vote_sign_and_verify() {
        let (key, public) = keypair();
        let mut vote = FinalizedBudgetVote::new(OutPoint::new([3u8; 32], 1), [4u8; 32], 1_700_000_000);
        vote.sign(&key);
        assert!(vote.check_signature(&public).is_ok());
        assert!(vote.check_signature(&[0u8; 32]).is_err());
    }

    #[test]
    fn vote_hash_ignores_signature() {
        let (key, _) = keypair();
        let mut vote = ProposalVote::new(
            OutPoint::new([1u8; 32], 0),
            [2u8; 32],
            VoteDirection::No,
            77,
        );
        let unsigned = vote.hash();
        vote.sign(&key);
        assert_eq!(unsigned, vote.hash());
    }

    #[test]
    fn direction_round_trip() {
        for d in [VoteDirection::Abstain, VoteDirection::Yes, VoteDirection::No] {
            assert_eq!(VoteDirection::from_u32(d as u32), Some(d));
        }
        assert_eq!(VoteDirection::from_u32(9), None);
    }
}
