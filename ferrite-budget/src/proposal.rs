//! Budget proposals: an immutable spending request plus the votes cast on
//! it by masternodes.

use std::cmp::Ordering;
use std::collections::HashMap;

use ferrite_shared_types::{double_sha256, script, Hash, COIN};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::collateral::check_collateral;
use crate::error::BudgetError;
use crate::external::{ChainAccess, MasternodeDirectory};
use crate::params::{BudgetParams, BUDGET_VOTE_MAX_FUTURE, BUDGET_VOTE_UPDATE_MIN};
use crate::protocol::ProposalBroadcast;
use crate::vote::{ProposalVote, VoteDirection};

/// A spending proposal and its vote ledger. The descriptor fields are
/// immutable once hashed; only the vote map, the validity flag, and the
/// per-tally allotment change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetProposal {
    pub name: String,
    pub url: String,
    pub start_block: u64,
    pub end_block: u64,
    pub payee_script: Vec<u8>,
    pub amount: u64,
    pub collateral_txid: Hash,
    /// Timestamp of the collateral's containing block; set on acceptance
    /// when the broadcast carried none.
    pub time: i64,
    /// Latest accepted vote per voter outpoint hash.
    pub votes: HashMap<Hash, ProposalVote>,
    #[serde(skip)]
    valid: bool,
    #[serde(skip)]
    invalid_reason: String,
    /// Amount selected into the budget by the last tally. Recomputed, never
    /// persisted.
    #[serde(skip)]
    allotted: u64,
}

impl BudgetProposal {
    pub fn new(
        name: String,
        url: String,
        start_block: u64,
        end_block: u64,
        payee_script: Vec<u8>,
        amount: u64,
        collateral_txid: Hash,
    ) -> Self {
        BudgetProposal {
            name,
            url,
            start_block,
            end_block,
            payee_script,
            amount,
            collateral_txid,
            time: 0,
            votes: HashMap::new(),
            valid: true,
            invalid_reason: String::new(),
            allotted: 0,
        }
    }

    /// Builds a proposal paying out over `payment_count` cycles. The end
    /// block lands one block past the last paid cycle so the proposal
    /// outlives its final payment.
    pub fn with_payment_count(
        params: &BudgetParams,
        name: String,
        url: String,
        payment_count: u64,
        payee_script: Vec<u8>,
        amount: u64,
        start_block: u64,
        collateral_txid: Hash,
    ) -> Self {
        let cycle_start = params.cycle_start(start_block);
        let end_block = cycle_start + (params.cycle_blocks + 1) * payment_count;
        Self::new(name, url, start_block, end_block, payee_script, amount, collateral_txid)
    }

    pub fn from_broadcast(broadcast: &ProposalBroadcast) -> Self {
        let mut proposal = Self::new(
            broadcast.name.clone(),
            broadcast.url.clone(),
            broadcast.start_block,
            broadcast.end_block,
            broadcast.payee_script.clone(),
            broadcast.amount,
            broadcast.collateral_txid,
        );
        proposal.time = broadcast.time;
        proposal
    }

    pub fn broadcast(&self) -> ProposalBroadcast {
        ProposalBroadcast {
            name: self.name.clone(),
            url: self.url.clone(),
            start_block: self.start_block,
            end_block: self.end_block,
            payee_script: self.payee_script.clone(),
            amount: self.amount,
            collateral_txid: self.collateral_txid,
            time: self.time,
        }
    }

    /// Deterministic item hash over the identity tuple. The collateral txid
    /// and timestamp are excluded: the collateral commits to this hash, and
    /// the timestamp is read back from the chain.
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

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalid_reason(&self) -> &str {
        &self.invalid_reason
    }

    pub fn allotted(&self) -> u64 {
        self.allotted
    }

    pub fn set_allotted(&mut self, amount: u64) {
        self.allotted = amount;
    }

    /// Stores `vote`, replacing any previous vote from the same masternode.
    /// A replacement must be newer, at least the update interval newer, and
    /// not run ahead of the adjusted clock.
    pub fn add_or_update_vote(&mut self, vote: ProposalVote, now: i64) -> Result<(), BudgetError> {
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

        debug!(
            "proposal {}: vote {} from {}",
            self.name,
            vote.direction.as_str(),
            vote.voter.to_string_short()
        );
        self.votes.insert(voter_hash, vote);
        Ok(())
    }

    fn count_votes(&self, direction: VoteDirection) -> u64 {
        self.votes
            .values()
            .filter(|v| v.valid && v.direction == direction)
            .count() as u64
    }

    pub fn yeas(&self) -> u64 {
        self.count_votes(VoteDirection::Yes)
    }

    pub fn nays(&self) -> u64 {
        self.count_votes(VoteDirection::No)
    }

    pub fn abstains(&self) -> u64 {
        self.count_votes(VoteDirection::Abstain)
    }

    /// Net approval, may be negative.
    pub fn net_yes(&self) -> i64 {
        self.yeas() as i64 - self.nays() as i64
    }

    pub fn ratio(&self) -> f64 {
        let yeas = self.yeas();
        let nays = self.nays();
        if yeas + nays == 0 {
            return 0.0;
        }
        yeas as f64 / (yeas + nays) as f64
    }

    pub fn is_heavily_downvoted(&mut self, enabled_masternodes: u64) -> bool {
        if self.nays() as i64 - self.yeas() as i64 > (enabled_masternodes / 10) as i64 {
            self.invalid_reason = format!("Proposal {}: Active removal", self.name);
            return true;
        }
        false
    }

    fn check_start_end(&mut self, params: &BudgetParams) -> bool {
        if self.end_block < self.start_block {
            self.invalid_reason =
                format!("Proposal {}: Invalid end_block (end before start)", self.name);
            return false;
        }

        let cycle_start = params.cycle_start(self.start_block);
        let payment_count = self.total_payment_count(params);
        if payment_count == 0
            || self.end_block != cycle_start + (params.cycle_blocks + 1) * payment_count
        {
            self.invalid_reason = format!(
                "Proposal {}: Invalid end_block (mismatch with payments count)",
                self.name
            );
            return false;
        }
        true
    }

    fn check_amount(&mut self, total_budget: u64) -> bool {
        if self.amount < 10 * COIN {
            self.invalid_reason = format!("Proposal {}: Invalid amount (too low)", self.name);
            return false;
        }
        if self.amount > total_budget {
            self.invalid_reason = format!("Proposal {}: Invalid amount (too high)", self.name);
            return false;
        }
        true
    }

    fn check_address(&mut self) -> bool {
        if self.payee_script.is_empty() {
            self.invalid_reason =
                format!("Proposal {}: Invalid payment address (null)", self.name);
            return false;
        }
        // Multisig payees are not supported in the coinstake.
        if script::is_pay_to_script_hash(&self.payee_script) {
            self.invalid_reason =
                format!("Proposal {}: Multisig is not currently supported.", self.name);
            return false;
        }
        if !script::is_normal_payment_script(&self.payee_script) {
            self.invalid_reason =
                format!("Proposal {}: Invalid payment address (not P2PKH)", self.name);
            return false;
        }
        true
    }

    pub fn is_well_formed(&mut self, params: &BudgetParams, total_budget: u64) -> bool {
        self.check_start_end(params) && self.check_amount(total_budget) && self.check_address()
    }

    pub fn is_expired(&mut self, current_height: u64) -> bool {
        if self.end_block < current_height {
            self.invalid_reason = format!("Proposal {}: Proposal expired", self.name);
            return true;
        }
        false
    }

    /// Re-derives the validity flag at `current_height`.
    pub fn update_valid(
        &mut self,
        current_height: u64,
        chain: &dyn ChainAccess,
        directory: &dyn MasternodeDirectory,
        params: &BudgetParams,
        check_collateral_tx: bool,
    ) -> bool {
        self.valid = false;

        if self.is_heavily_downvoted(directory.count_enabled()) {
            return false;
        }
        if !self.is_well_formed(params, params.total_budget(self.start_block)) {
            return false;
        }
        if self.is_expired(current_height) {
            return false;
        }
        if check_collateral_tx {
            match check_collateral(chain, params, &self.collateral_txid, &self.hash(), false) {
                Ok(info) => {
                    if self.time == 0 {
                        self.time = info.block_time;
                    }
                }
                Err(failure) => {
                    self.invalid_reason =
                        format!("Proposal {}: Invalid collateral ({})", self.name, failure.error);
                    return false;
                }
            }
        }

        self.valid = true;
        self.invalid_reason.clear();
        true
    }

    /// Anti-spam waiting period: a proposal only passes once it has been
    /// public for the establishment interval.
    pub fn is_established(&self, now: i64, params: &BudgetParams) -> bool {
        self.time < now - params.establishment_interval
    }

    /// Whether this proposal qualifies for the cycle `[cycle_start, cycle_end]`.
    pub fn is_passing(
        &self,
        cycle_start: u64,
        cycle_end: u64,
        enabled_masternodes: u64,
        now: i64,
        params: &BudgetParams,
    ) -> bool {
        if !self.valid {
            return false;
        }
        if self.start_block > cycle_start {
            return false;
        }
        if self.end_block < cycle_end {
            return false;
        }
        if self.net_yes() <= (enabled_masternodes / 10) as i64 {
            return false;
        }
        if !self.is_established(now, params) {
            return false;
        }
        true
    }

    /// Re-marks each vote's validity against the current masternode
    /// directory. Votes from departed masternodes stay stored but stop
    /// counting.
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

    pub fn first_payment_cycle(&self, params: &BudgetParams) -> u64 {
        params.cycle_start(self.start_block)
    }

    /// The proposal's final cycle boundary. Returned verbatim from
    /// `end_block`; payment counts derive from it.
    pub fn end_cycle(&self) -> u64 {
        self.end_block
    }

    pub fn total_payment_count(&self, params: &BudgetParams) -> u64 {
        (self.end_cycle() - self.first_payment_cycle(params)) / params.cycle_blocks
    }

    pub fn remaining_payment_count(&self, current_height: u64, params: &BudgetParams) -> u64 {
        let end = self.end_cycle();
        let current_cycle = params.cycle_start(current_height);
        let remaining = (end.saturating_sub(current_cycle) / params.cycle_blocks).saturating_sub(1);
        remaining.min(self.total_payment_count(params))
    }

    /// Descending net yes; ties broken by the greater collateral txid so the
    /// order is total and identical on every host.
    pub fn cmp_by_net_yes(a: &BudgetProposal, b: &BudgetProposal) -> Ordering {
        b.net_yes()
            .cmp(&a.net_yes())
            .then_with(|| b.collateral_txid.cmp(&a.collateral_txid))
    }

    /// Descending by hash, used by the deterministic auto-check comparison.
    pub fn cmp_by_hash_desc(a: &BudgetProposal, b: &BudgetProposal) -> Ordering {
        b.hash().cmp(&a.hash())
    }
}

pub(crate) fn proposal_hash(
    name: &str,
    url: &str,
    start_block: u64,
    end_block: u64,
    amount: u64,
    payee_script: &[u8],
) -> Hash {
    let bytes = bincode::serialize(&(name, url, start_block, end_block, amount, payee_script))
        .unwrap_or_default();
    double_sha256(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_shared_types::OutPoint;

    fn payee() -> Vec<u8> {
        script::pay_to_public_key_hash(&[7u8; 20])
    }

    fn test_proposal() -> BudgetProposal {
        BudgetProposal::with_payment_count(
            &BudgetParams::mainnet(),
            "gateway".to_string(),
            "https://forum.ferritecoin.org/t/gateway".to_string(),
            1,
            payee(),
            50 * COIN,
            86_400,
            [3u8; 32],
        )
    }

    fn vote_at(voter_seed: u8, direction: VoteDirection, time: i64) -> ProposalVote {
        ProposalVote::new(OutPoint::new([voter_seed; 32], 0), [0u8; 32], direction, time)
    }

    #[test]
    fn end_block_derivation() {
        let p = test_proposal();
        assert_eq!(p.end_block, 86_400 + (43_200 + 1));
        assert_eq!(p.total_payment_count(&BudgetParams::mainnet()), 1);
    }

    #[test]
    fn hash_ignores_votes_and_collateral() {
        let mut p = test_proposal();
        let h = p.hash();
        p.add_or_update_vote(vote_at(1, VoteDirection::Yes, 100), 200).unwrap();
        assert_eq!(h, p.hash());

        let mut other = test_proposal();
        other.collateral_txid = [9u8; 32];
        other.time = 12345;
        assert_eq!(h, other.hash());

        other.amount += 1;
        assert_ne!(h, other.hash());
    }

    #[test]
    fn vote_monotonicity() {
        let mut p = test_proposal();
        let now = 1_000_000;
        p.add_or_update_vote(vote_at(1, VoteDirection::Yes, 10_000), now).unwrap();

        // Older vote rejected.
        assert!(matches!(
            p.add_or_update_vote(vote_at(1, VoteDirection::No, 9_000), now),
            Err(BudgetError::RateLimited(_))
        ));
        // Same-time and under-interval updates rejected.
        assert!(p.add_or_update_vote(vote_at(1, VoteDirection::No, 10_000), now).is_err());
        assert!(p
            .add_or_update_vote(vote_at(1, VoteDirection::No, 10_000 + BUDGET_VOTE_UPDATE_MIN - 1), now)
            .is_err());
        // Past the interval the replacement lands.
        p.add_or_update_vote(vote_at(1, VoteDirection::No, 10_000 + BUDGET_VOTE_UPDATE_MIN), now)
            .unwrap();
        assert_eq!(p.nays(), 1);
        assert_eq!(p.yeas(), 0);
        assert_eq!(p.votes.len(), 1);
    }

    #[test]
    fn future_votes_rejected() {
        let mut p = test_proposal();
        let now = 1_000_000;
        assert!(p
            .add_or_update_vote(vote_at(1, VoteDirection::Yes, now + BUDGET_VOTE_MAX_FUTURE + 1), now)
            .is_err());
        assert!(p
            .add_or_update_vote(vote_at(1, VoteDirection::Yes, now + BUDGET_VOTE_MAX_FUTURE), now)
            .is_ok());
    }

    #[test]
    fn heavily_downvoted() {
        let mut p = test_proposal();
        for i in 0..15 {
            p.add_or_update_vote(vote_at(i, VoteDirection::No, 10_000), 20_000).unwrap();
        }
        for i in 15..17 {
            p.add_or_update_vote(vote_at(i, VoteDirection::Yes, 10_000), 20_000).unwrap();
        }
        assert!(p.is_heavily_downvoted(100));
        assert!(!p.is_heavily_downvoted(200));
    }

    #[test]
    fn passing_requires_margin_window_and_establishment() {
        let params = BudgetParams::mainnet();
        let mut p = test_proposal();
        p.valid = true;
        p.time = 0;
        let now = params.establishment_interval + 1;

        for i in 0..12 {
            p.add_or_update_vote(vote_at(i, VoteDirection::Yes, 1), now).unwrap();
        }
        p.add_or_update_vote(vote_at(12, VoteDirection::No, 1), now).unwrap();

        assert!(p.is_passing(86_400, 129_599, 100, now, &params));
        // Margin exactly at the tenth fails.
        assert!(!p.is_passing(86_400, 129_599, 110, now, &params));
        // Cycle outside the proposal window fails.
        assert!(!p.is_passing(129_600, 172_799, 100, now, &params));
        // Too young fails.
        assert!(!p.is_passing(86_400, 129_599, 100, 0, &params));
    }

    #[test]
    fn p2sh_payee_is_malformed() {
        let params = BudgetParams::mainnet();
        let mut p = test_proposal();
        let mut p2sh = vec![script::OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[2u8; 20]);
        p2sh.push(script::OP_EQUAL);
        p.payee_script = p2sh;
        assert!(!p.is_well_formed(&params, params.total_budget(p.start_block)));
        assert!(p.invalid_reason().contains("Multisig"));
    }

    #[test]
    fn ordering_is_total() {
        let mut a = test_proposal();
        let mut b = test_proposal();
        b.name = "relay".to_string();
        a.collateral_txid = [1u8; 32];
        b.collateral_txid = [2u8; 32];

        // Equal net yes falls back to greater collateral txid.
        assert_eq!(BudgetProposal::cmp_by_net_yes(&a, &b), Ordering::Greater);

        a.add_or_update_vote(vote_at(1, VoteDirection::Yes, 1), 100).unwrap();
        assert_eq!(BudgetProposal::cmp_by_net_yes(&a, &b), Ordering::Less);
    }
}
