//! Finalized budgets: a concrete per-block payout schedule for one cycle,
//! voted on as a unit.

use std::cmp::Ordering;
use std::collections::HashMap;

use ferrite_shared_types::{double_sha256, Hash, Transaction};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::collateral::check_collateral;
use crate::error::BudgetError;
use crate::external::{ChainAccess, MasternodeDirectory};
use crate::params::{BudgetParams, BUDGET_VOTE_MAX_FUTURE, BUDGET_VOTE_UPDATE_MIN, MAX_BUDGET_PAYMENTS};
use crate::protocol::FinalizedBudgetBroadcast;
use crate::vote::FinalizedBudgetVote;

/// One scheduled superblock payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPayment {
    pub proposal_hash: Hash,
    pub payee_script: Vec<u8>,
    pub amount: u64,
}

impl PartialOrd for BudgetPayment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BudgetPayment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.proposal_hash.cmp(&other.proposal_hash)
    }
}

/// Result of validating a block transaction against the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxValidationStatus {
    Valid,
    Invalid,
    /// The scheduled proposal was already paid this cycle.
    DoublePayment,
    /// No finalized budget has enough votes; a masternode payment is
    /// expected instead.
    VoteThreshold,
}

/// A full payout plan for one cycle plus its vote ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedBudget {
    /// Always the literal "main".
    pub name: String,
    /// First block of the paid cycle; must be a cycle boundary.
    pub start_block: u64,
    /// At most one payment per superblock offset within the cycle.
    pub payments: Vec<BudgetPayment>,
    pub collateral_txid: Hash,
    pub time: i64,
    pub votes: HashMap<Hash, FinalizedBudgetVote>,
    /// One-shot latch so a masternode auto-votes at most once.
    #[serde(skip)]
    auto_checked: bool,
    #[serde(skip)]
    valid: bool,
    #[serde(skip)]
    invalid_reason: String,
    /// proposal hash -> height paid, for double-payment detection within
    /// the cycle. Transient.
    #[serde(skip)]
    payment_history: HashMap<Hash, u64>,
    /// Human-readable proposal names for logs.
    #[serde(skip)]
    proposals_str: String,
}

impl FinalizedBudget {
    pub fn new(
        name: String,
        start_block: u64,
        payments: Vec<BudgetPayment>,
        collateral_txid: Hash,
    ) -> Self {
        FinalizedBudget {
            name,
            start_block,
            payments,
            collateral_txid,
            time: 0,
            votes: HashMap::new(),
            auto_checked: false,
            valid: true,
            invalid_reason: String::new(),
            payment_history: HashMap::new(),
            proposals_str: String::new(),
        }
    }

    pub fn from_broadcast(broadcast: &FinalizedBudgetBroadcast) -> Self {
        let mut budget = Self::new(
            broadcast.name.clone(),
            broadcast.start_block,
            broadcast.payments.clone(),
            broadcast.collateral_txid,
        );
        budget.time = broadcast.time;
        budget
    }

    pub fn broadcast(&self) -> FinalizedBudgetBroadcast {
        FinalizedBudgetBroadcast {
            name: self.name.clone(),
            start_block: self.start_block,
            payments: self.payments.clone(),
            collateral_txid: self.collateral_txid,
            time: self.time,
        }
    }

    /// Deterministic item hash over the identity tuple; excludes the
    /// collateral txid (which commits to this hash) and the timestamp.
    pub fn hash(&self) -> Hash {
        finalized_budget_hash(&self.name, self.start_block, &self.payments)
    }

    /// Last paid block of the cycle.
    pub fn block_end(&self) -> u64 {
        (self.start_block + self.payments.len() as u64).saturating_sub(1)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalid_reason(&self) -> &str {
        &self.invalid_reason
    }

    pub fn is_auto_checked(&self) -> bool {
        self.auto_checked
    }

    pub fn set_proposals_str(&mut self, proposals: String) {
        self.proposals_str = proposals;
    }

    pub fn proposals_str(&self) -> &str {
        &self.proposals_str
    }

    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    pub fn total_payout(&self) -> u64 {
        self.payments.iter().map(|p| p.amount).sum()
    }

    pub fn proposal_hashes(&self) -> Vec<Hash> {
        self.payments.iter().map(|p| p.proposal_hash).collect()
    }

    pub fn add_or_update_vote(
        &mut self,
        vote: FinalizedBudgetVote,
        now: i64,
    ) -> Result<(), BudgetError> {
        let voter_hash = vote.voter.hash();

        if let Some(existing) = self.votes.get(&voter_hash) {
            if existing.time > vote.time {
                return Err(BudgetError::RateLimited(format!(
                    "new vote older than existing vote - {}",
                    hex::encode(vote.hash())
                )));
            }
            if vote.time - existing.time < BUDGET_VOTE_UPDATE_MIN {
                return Err(BudgetError::RateLimited(format!(
                    "time between votes is too soon - {} - {} sec < {} sec",
                    hex::encode(vote.hash()),
                    vote.time - existing.time,
                    BUDGET_VOTE_UPDATE_MIN
                )));
            }
        }

        if vote.time > now + BUDGET_VOTE_MAX_FUTURE {
            return Err(BudgetError::RateLimited(format!(
                "new vote is too far ahead of current time - {} - nTime {}",
                hex::encode(vote.hash()),
                vote.time
            )));
        }

        self.votes.insert(voter_hash, vote);
        Ok(())
    }

    /// Re-derives the validity flag at `current_height`.
    pub fn update_valid(
        &mut self,
        current_height: u64,
        chain: &dyn ChainAccess,
        params: &BudgetParams,
        check_collateral_tx: bool,
    ) -> bool {
        self.valid = false;

        if self.start_block == 0 || self.start_block % params.cycle_blocks != 0 {
            self.invalid_reason = "Invalid BlockStart".to_string();
            return false;
        }
        if self.payments.is_empty() || self.payments.len() > MAX_BUDGET_PAYMENTS {
            self.invalid_reason = "Invalid budget payments count".to_string();
            return false;
        }
        if self.name.is_empty() {
            self.invalid_reason = "Invalid Budget Name".to_string();
            return false;
        }
        if self.collateral_txid == [0u8; 32] {
            self.invalid_reason = format!(
                "Budget {} ({}) Invalid FeeTx == 0",
                self.name, self.proposals_str
            );
            return false;
        }
        if self.total_payout() > params.total_budget(self.start_block) {
            self.invalid_reason = format!(
                "Budget {} ({}) Invalid Payout (more than max)",
                self.name, self.proposals_str
            );
            return false;
        }

        if check_collateral_tx {
            match check_collateral(chain, params, &self.collateral_txid, &self.hash(), true) {
                Ok(info) => {
                    if self.time == 0 {
                        self.time = info.block_time;
                    }
                }
                Err(failure) => {
                    self.invalid_reason = format!(
                        "Budget {} ({}) Invalid Collateral : {}",
                        self.name, self.proposals_str, failure.error
                    );
                    return false;
                }
            }
        }

        if self.is_obsolete(current_height, params) {
            self.invalid_reason = format!(
                "Budget {} ({}) (ends at block {}) too old and obsolete",
                self.name,
                self.proposals_str,
                self.block_end()
            );
            return false;
        }

        self.valid = true;
        self.invalid_reason.clear();
        true
    }

    /// Budgets whose last payment ended two cycles before the upcoming one
    /// are obsolete.
    pub fn is_obsolete(&self, current_height: u64, params: &BudgetParams) -> bool {
        let next_cycle_start = params.next_cycle_start(current_height);
        let max_age = next_cycle_start.saturating_sub(2 * params.cycle_blocks);
        self.block_end() < max_age
    }

    /// Deterministic comparison against the node's own proposal selection.
    /// Both sequences are resorted by descending proposal hash so tally
    /// ties cannot flip the comparison. Latches the one-shot flag; returns
    /// whether every payment matches and a yes vote should be cast.
    pub fn auto_check(&mut self, selection: &[BudgetPayment]) -> bool {
        self.auto_checked = true;

        if selection.is_empty() {
            debug!("auto check: no proposals selected, aborting");
            return false;
        }
        if selection.len() != self.payments.len() {
            debug!(
                "auto check: selection length ({}) doesn't match payment length ({})",
                selection.len(),
                self.payments.len()
            );
            return false;
        }

        let mut selection_sorted = selection.to_vec();
        selection_sorted.sort_by(|a, b| b.cmp(a));
        let mut payments_sorted = self.payments.clone();
        payments_sorted.sort_by(|a, b| b.cmp(a));

        for (i, (expected, payment)) in selection_sorted.iter().zip(&payments_sorted).enumerate() {
            if payment.proposal_hash != expected.proposal_hash {
                debug!(
                    "auto check: item #{} doesn't match {} {}",
                    i,
                    hex::encode(payment.proposal_hash),
                    hex::encode(expected.proposal_hash)
                );
                return false;
            }
            if hex::encode(&payment.payee_script) != hex::encode(&expected.payee_script) {
                debug!("auto check: item #{} payee doesn't match", i);
                return false;
            }
            if payment.amount != expected.amount {
                debug!(
                    "auto check: item #{} amount doesn't match {} {}",
                    i, payment.amount, expected.amount
                );
                return false;
            }
        }

        debug!("auto check: finalized budget matches, submitting vote");
        true
    }

    /// Prunes history entries from other cycles, then reports (and records)
    /// whether `proposal_hash` was already paid inside this one.
    fn is_paid_already(&mut self, proposal_hash: Hash, height: u64) -> bool {
        let start = self.start_block;
        let end = self.block_end();
        self.payment_history
            .retain(|_, paid_height| *paid_height >= start && *paid_height <= end);

        if self.payment_history.contains_key(&proposal_hash) {
            return true;
        }
        self.payment_history.insert(proposal_hash, height);
        false
    }

    /// Validates that `tx` carries this budget's scheduled payment for
    /// `height`.
    pub fn check_block_transaction(&mut self, tx: &Transaction, height: u64) -> TxValidationStatus {
        if height > self.block_end() || height < self.start_block {
            debug!(
                "budget {}: block {} outside [{}, {}]",
                self.name,
                height,
                self.start_block,
                self.block_end()
            );
            return TxValidationStatus::Invalid;
        }

        let index = (height - self.start_block) as usize;
        if index >= self.payments.len() {
            return TxValidationStatus::Invalid;
        }

        if self.is_paid_already(self.payments[index].proposal_hash, height) {
            debug!(
                "budget {}: double payment for proposal {} detected",
                self.name,
                hex::encode(self.payments[index].proposal_hash)
            );
            return TxValidationStatus::DoublePayment;
        }

        // The budget payment is usually the last output of a coinstake, so
        // scan from the tail inwards.
        let expected = &self.payments[index];
        for out in tx.outputs.iter().rev() {
            if out.script_pubkey == expected.payee_script && out.value == expected.amount {
                return TxValidationStatus::Valid;
            }
        }

        debug!(
            "budget {}: missing required payment of {} for proposal {}",
            self.name,
            expected.amount,
            hex::encode(expected.proposal_hash)
        );
        TxValidationStatus::Invalid
    }

    pub fn budget_payment_by_block(&self, height: u64) -> Option<&BudgetPayment> {
        if height < self.start_block {
            return None;
        }
        self.payments.get((height - self.start_block) as usize)
    }

    pub fn payee_and_amount(&self, height: u64) -> Option<(Vec<u8>, u64)> {
        self.budget_payment_by_block(height)
            .map(|p| (p.payee_script.clone(), p.amount))
    }

    pub fn clean_and_remove(&mut self, directory: &dyn MasternodeDirectory) {
        for vote in self.votes.values_mut() {
            vote.valid = directory.find(&vote.voter).is_some();
        }
    }

    pub fn set_synced(&mut self, synced: bool) {
        for vote in self.votes.values_mut() {
            if synced {
                if vote.valid {
                    vote.synced = true;
                }
            } else {
                vote.synced = false;
            }
        }
    }

    /// Descending vote count; ties broken by the greater collateral txid to
    /// keep every sort deterministic across hosts.
    pub fn cmp_by_votes(a: &FinalizedBudget, b: &FinalizedBudget) -> Ordering {
        b.vote_count()
            .cmp(&a.vote_count())
            .then_with(|| b.collateral_txid.cmp(&a.collateral_txid))
    }
}

pub(crate) fn finalized_budget_hash(
    name: &str,
    start_block: u64,
    payments: &[BudgetPayment],
) -> Hash {
    let bytes = bincode::serialize(&(name, start_block, payments)).unwrap_or_default();
    double_sha256(&bytes)
}
