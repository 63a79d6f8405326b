//! Wire payloads for the budget gossip sub-protocol and the inventory
//! tags used to announce items.

use ferrite_shared_types::Hash;
use serde::{Deserialize, Serialize};

use crate::finalized::BudgetPayment;
use crate::proposal::proposal_hash;
use crate::finalized::finalized_budget_hash;
use crate::vote::{FinalizedBudgetVote, ProposalVote};

/// Inventory tags for the four gossiped item kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetInvType {
    Proposal,
    ProposalVote,
    FinalizedBudget,
    FinalizedBudgetVote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetInv {
    pub kind: BudgetInvType,
    pub hash: Hash,
}

impl BudgetInv {
    pub fn new(kind: BudgetInvType, hash: Hash) -> Self {
        BudgetInv { kind, hash }
    }
}

/// Sync progress categories reported back to a syncing peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncCategory {
    Proposals,
    FinalizedBudgets,
}

/// Proposal broadcast payload (`mprop`). Votes travel separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalBroadcast {
    pub name: String,
    pub url: String,
    pub start_block: u64,
    pub end_block: u64,
    pub payee_script: Vec<u8>,
    pub amount: u64,
    pub collateral_txid: Hash,
    pub time: i64,
}

impl ProposalBroadcast {
    /// Same identity hash as the domain proposal built from this payload.
    pub fn hash(&self) -> Hash {
        proposal_hash(
            &self.name,
            &self.url,
            self.start_block,
            self.end_block,
            self.amount,
            &self.payee_script,
        )
    }
}

/// Finalized budget broadcast payload (`fbs`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedBudgetBroadcast {
    pub name: String,
    pub start_block: u64,
    pub payments: Vec<BudgetPayment>,
    pub collateral_txid: Hash,
    pub time: i64,
}

impl FinalizedBudgetBroadcast {
    pub fn hash(&self) -> Hash {
        finalized_budget_hash(&self.name, self.start_block, &self.payments)
    }
}

/// The five budget protocol messages, plus the sync progress trailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetMessage {
    /// `mnvs` - request a (re)sync of one item, or everything when the
    /// target is all zero.
    VoteSync { target: Hash },
    /// `mprop`
    Proposal(ProposalBroadcast),
    /// `mvote`
    Vote(ProposalVote),
    /// `fbs`
    FinalizedBudget(FinalizedBudgetBroadcast),
    /// `fbvote`
    FinalizedVote(FinalizedBudgetVote),
    /// `ssc` - closes each category of a sync response.
    SyncStatusCount { category: SyncCategory, count: u32 },
}

impl BudgetMessage {
    /// Protocol command string for the envelope header.
    pub fn command(&self) -> &'static str {
        match self {
            BudgetMessage::VoteSync { .. } => "mnvs",
            BudgetMessage::Proposal(_) => "mprop",
            BudgetMessage::Vote(_) => "mvote",
            BudgetMessage::FinalizedBudget(_) => "fbs",
            BudgetMessage::FinalizedVote(_) => "fbvote",
            BudgetMessage::SyncStatusCount { .. } => "ssc",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::BudgetProposal;
    use ferrite_shared_types::script;

    #[test]
    fn broadcast_hash_matches_domain_hash() {
        let broadcast = ProposalBroadcast {
            name: "gateway".to_string(),
            url: "https://forum.ferritecoin.org/t/gateway".to_string(),
            start_block: 86_400,
            end_block: 129_601,
            payee_script: script::pay_to_public_key_hash(&[7u8; 20]),
            amount: 5_000_000_000,
            collateral_txid: [3u8; 32],
            time: 99,
        };
        let proposal = BudgetProposal::from_broadcast(&broadcast);
        assert_eq!(broadcast.hash(), proposal.hash());
        assert_eq!(proposal.broadcast(), broadcast);
    }

    #[test]
    fn message_round_trip() {
        let msg = BudgetMessage::VoteSync { target: [0u8; 32] };
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: BudgetMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(msg.command(), "mnvs");
    }
}
