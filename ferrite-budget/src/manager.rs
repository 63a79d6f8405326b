//! The budget registry: tracks proposals, finalized budgets and their
//! votes, reconciles orphans, answers the consensus-facing queries
//! (payment block, expected payee, block-transaction validity) and drives
//! the per-block housekeeping.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use ferrite_shared_types::{Hash, OutPoint, Transaction};
use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::collateral::check_collateral;
use crate::error::BudgetError;
use crate::external::{
    BudgetRelay, BudgetWallet, ChainAccess, MasternodeDirectory, PeerId, SyncTracker,
};
use crate::finalized::{BudgetPayment, FinalizedBudget, TxValidationStatus};
use crate::params::{BudgetParams, Network, ASK_WINDOW_SECS, MISBEHAVING_SCORE};
use crate::proposal::BudgetProposal;
use crate::protocol::{
    BudgetInv, BudgetInvType, BudgetMessage, FinalizedBudgetBroadcast, ProposalBroadcast,
    SyncCategory,
};
use crate::vote::{FinalizedBudgetVote, ProposalVote};

const FULFILLED_BUDGET_SYNC: &str = "budgetvotesync";

/// How the node participates in budget finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetMode {
    /// Track and validate only.
    Observe,
    /// Masternodes: vote automatically on a finalized budget that matches
    /// the local proposal selection.
    Auto,
    /// Additionally construct and submit a finalized budget each cycle.
    Suggest,
}

/// The local masternode identity, when this node is one.
#[derive(Clone)]
pub struct ActiveMasternode {
    pub outpoint: OutPoint,
    pub operator_key: SigningKey,
}

/// External collaborators, wired in by the host node at startup.
#[derive(Clone)]
pub struct BudgetHost {
    pub chain: Arc<dyn ChainAccess>,
    pub directory: Arc<dyn MasternodeDirectory>,
    pub wallet: Arc<dyn BudgetWallet>,
    pub relay: Arc<dyn BudgetRelay>,
    pub sync: Arc<dyn SyncTracker>,
}

#[derive(Default)]
struct ProposalStore {
    active: HashMap<Hash, BudgetProposal>,
    seen: HashMap<Hash, ProposalBroadcast>,
    immature: Vec<ProposalBroadcast>,
}

#[derive(Default)]
struct FinalizedStore {
    active: HashMap<Hash, FinalizedBudget>,
    seen: HashMap<Hash, FinalizedBudgetBroadcast>,
    immature: Vec<FinalizedBudgetBroadcast>,
}

#[derive(Default)]
struct ProposalVoteStore {
    seen: HashMap<Hash, ProposalVote>,
    /// Keyed by the missing target hash; at most one parked vote per target.
    orphans: HashMap<Hash, ProposalVote>,
}

#[derive(Default)]
struct FinalizedVoteStore {
    seen: HashMap<Hash, FinalizedBudgetVote>,
    orphans: HashMap<Hash, FinalizedBudgetVote>,
}

/// Persisted manager state: the active sets with their votes. Seen sets are
/// rebuilt from these at load; orphan queues, the ask throttle and payment
/// history always start empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub proposals: Vec<BudgetProposal>,
    pub finalized_budgets: Vec<FinalizedBudget>,
}

pub struct BudgetManager {
    params: BudgetParams,
    host: BudgetHost,
    mode: BudgetMode,
    local_masternode: Option<ActiveMasternode>,

    proposals: Mutex<ProposalStore>,
    finalized: Mutex<FinalizedStore>,
    proposal_votes: Mutex<ProposalVoteStore>,
    finalized_votes: Mutex<FinalizedVoteStore>,

    /// target hash -> time we last asked a peer for it.
    ask_throttle: Mutex<HashMap<Hash, i64>>,
    /// budget hash -> collateral txid for budgets this node submitted.
    own_collateral_txids: Mutex<HashMap<Hash, Hash>>,
    submitted_height: Mutex<u64>,
    best_height: Mutex<u64>,
    rng: Mutex<StdRng>,
}

impl BudgetManager {
    pub fn new(
        params: BudgetParams,
        host: BudgetHost,
        mode: BudgetMode,
        local_masternode: Option<ActiveMasternode>,
    ) -> Self {
        Self::with_rng(params, host, mode, local_masternode, StdRng::from_entropy())
    }

    /// Like [`BudgetManager::new`] but with a seeded RNG, so tests can
    /// drive the probabilistic auto-vote and sync-reset branches.
    pub fn with_rng_seed(
        params: BudgetParams,
        host: BudgetHost,
        mode: BudgetMode,
        local_masternode: Option<ActiveMasternode>,
        seed: u64,
    ) -> Self {
        Self::with_rng(params, host, mode, local_masternode, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        params: BudgetParams,
        host: BudgetHost,
        mode: BudgetMode,
        local_masternode: Option<ActiveMasternode>,
        rng: StdRng,
    ) -> Self {
        BudgetManager {
            params,
            host,
            mode,
            local_masternode,
            proposals: Mutex::new(ProposalStore::default()),
            finalized: Mutex::new(FinalizedStore::default()),
            proposal_votes: Mutex::new(ProposalVoteStore::default()),
            finalized_votes: Mutex::new(FinalizedVoteStore::default()),
            ask_throttle: Mutex::new(HashMap::new()),
            own_collateral_txids: Mutex::new(HashMap::new()),
            submitted_height: Mutex::new(0),
            best_height: Mutex::new(0),
            rng: Mutex::new(rng),
        }
    }

    pub fn params(&self) -> &BudgetParams {
        &self.params
    }

    pub fn mode(&self) -> BudgetMode {
        self.mode
    }

    pub fn best_height(&self) -> u64 {
        *self.best_height.lock().unwrap()
    }

    pub fn set_best_height(&self, height: u64) {
        *self.best_height.lock().unwrap() = height;
    }

    fn adjusted_time(&self) -> i64 {
        self.host.chain.adjusted_time()
    }

    // ---- seen-set queries ------------------------------------------------

    pub fn have_seen_proposal(&self, hash: &Hash) -> bool {
        self.proposals.lock().unwrap().seen.contains_key(hash)
    }

    pub fn have_seen_proposal_vote(&self, hash: &Hash) -> bool {
        self.proposal_votes.lock().unwrap().seen.contains_key(hash)
    }

    pub fn have_seen_finalized_budget(&self, hash: &Hash) -> bool {
        self.finalized.lock().unwrap().seen.contains_key(hash)
    }

    pub fn have_seen_finalized_budget_vote(&self, hash: &Hash) -> bool {
        self.finalized_votes.lock().unwrap().seen.contains_key(hash)
    }

    /// Bincode payload of a seen proposal, for serving a getdata request.
    pub fn proposal_serialized(&self, hash: &Hash) -> Option<Vec<u8>> {
        let store = self.proposals.lock().unwrap();
        store.seen.get(hash).and_then(|p| bincode::serialize(p).ok())
    }

    pub fn proposal_vote_serialized(&self, hash: &Hash) -> Option<Vec<u8>> {
        let store = self.proposal_votes.lock().unwrap();
        store.seen.get(hash).and_then(|v| bincode::serialize(v).ok())
    }

    pub fn finalized_budget_serialized(&self, hash: &Hash) -> Option<Vec<u8>> {
        let store = self.finalized.lock().unwrap();
        store.seen.get(hash).and_then(|b| bincode::serialize(b).ok())
    }

    pub fn finalized_budget_vote_serialized(&self, hash: &Hash) -> Option<Vec<u8>> {
        let store = self.finalized_votes.lock().unwrap();
        store.seen.get(hash).and_then(|v| bincode::serialize(v).ok())
    }

    pub fn proposal(&self, hash: &Hash) -> Option<BudgetProposal> {
        self.proposals.lock().unwrap().active.get(hash).cloned()
    }

    pub fn finalized_budget(&self, hash: &Hash) -> Option<FinalizedBudget> {
        self.finalized.lock().unwrap().active.get(hash).cloned()
    }

    // ---- item insertion --------------------------------------------------

    /// Validates and inserts a proposal into the active set.
    pub fn add_proposal(&self, mut proposal: BudgetProposal) -> Result<(), BudgetError> {
        let hash = proposal.hash();
        let valid = proposal.update_valid(
            self.best_height(),
            &*self.host.chain,
            &*self.host.directory,
            &self.params,
            true,
        );
        if !valid {
            let reason = proposal.invalid_reason().to_string();
            debug!("invalid budget proposal - {}", reason);
            return Err(if proposal.is_expired(self.best_height()) {
                BudgetError::StaleItem(reason)
            } else {
                BudgetError::MalformedItem(reason)
            });
        }

        let mut store = self.proposals.lock().unwrap();
        if store.active.contains_key(&hash) {
            return Err(BudgetError::DuplicateSeen(hash));
        }
        info!("proposal {} added", proposal.name);
        store.active.insert(hash, proposal);
        Ok(())
    }

    /// Validates and inserts a finalized budget into the active set.
    pub fn add_finalized_budget(&self, mut budget: FinalizedBudget) -> Result<(), BudgetError> {
        let hash = budget.hash();
        if self.finalized.lock().unwrap().active.contains_key(&hash) {
            debug!("finalized budget {} already added", hex::encode(hash));
            return Err(BudgetError::DuplicateSeen(hash));
        }

        let valid = budget.update_valid(self.best_height(), &*self.host.chain, &self.params, true);
        if !valid {
            let reason = budget.invalid_reason().to_string();
            debug!("invalid finalized budget - {}", reason);
            return Err(if budget.is_obsolete(self.best_height(), &self.params) {
                BudgetError::StaleItem(reason)
            } else {
                BudgetError::MalformedItem(reason)
            });
        }

        budget.set_proposals_str(self.proposal_names(&budget.proposal_hashes()));
        self.finalized.lock().unwrap().active.insert(hash, budget);
        Ok(())
    }

    /// Comma-joined proposal names (hashes for unknown ones) for logs.
    fn proposal_names(&self, hashes: &[Hash]) -> String {
        let store = self.proposals.lock().unwrap();
        hashes
            .iter()
            .map(|h| match store.active.get(h) {
                Some(p) => p.name.clone(),
                None => hex::encode(h),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    // ---- vote ingestion --------------------------------------------------

    /// Routes a proposal vote to its target. Unknown targets are parked in
    /// the orphan queue and (throttled) requested from the sending peer.
    pub fn update_proposal_vote(
        &self,
        vote: ProposalVote,
        from: Option<PeerId>,
    ) -> Result<(), BudgetError> {
        let target = vote.proposal_hash;
        let now = self.adjusted_time();
        {
            let mut store = self.proposals.lock().unwrap();
            if let Some(proposal) = store.active.get_mut(&target) {
                return proposal.add_or_update_vote(vote, now);
            }
        }

        if let Some(peer) = from {
            // Only ask for missing items after our own sync completed,
            // otherwise a full sync would look successful when it was not.
            if !self.host.sync.is_synced() {
                return Err(BudgetError::UnknownTarget(target));
            }
            debug!(
                "unknown proposal {}, asking peer {} for the source",
                hex::encode(target),
                peer
            );
            self.proposal_votes.lock().unwrap().orphans.insert(target, vote);
            self.ask_for_source(peer, target, now);
        }

        Err(BudgetError::UnknownTarget(target))
    }

    /// Routes a finalized-budget vote to its target, parking orphans like
    /// [`BudgetManager::update_proposal_vote`].
    pub fn update_finalized_budget_vote(
        &self,
        vote: FinalizedBudgetVote,
        from: Option<PeerId>,
    ) -> Result<(), BudgetError> {
        let target = vote.budget_hash;
        let now = self.adjusted_time();
        {
            let mut store = self.finalized.lock().unwrap();
            if let Some(budget) = store.active.get_mut(&target) {
                return budget.add_or_update_vote(vote, now);
            }
        }

        if let Some(peer) = from {
            if !self.host.sync.is_synced() {
                return Err(BudgetError::UnknownTarget(target));
            }
            debug!(
                "unknown finalized budget {}, asking peer {} for the source",
                hex::encode(target),
                peer
            );
            self.finalized_votes.lock().unwrap().orphans.insert(target, vote);
            self.ask_for_source(peer, target, now);
        }

        Err(BudgetError::UnknownTarget(target))
    }

    /// Sends one `mnvs` for `target`, at most once per ask window.
    fn ask_for_source(&self, peer: PeerId, target: Hash, now: i64) {
        let should_ask = {
            let mut throttle = self.ask_throttle.lock().unwrap();
            if throttle.contains_key(&target) {
                false
            } else {
                throttle.insert(target, now);
                true
            }
        };
        if should_ask {
            self.host
                .relay
                .send_message(peer, &BudgetMessage::VoteSync { target });
        }
    }

    /// Re-plays parked votes whose target arrived in the meantime.
    pub fn check_orphan_votes(&self) {
        let now = self.adjusted_time();

        let parked: Vec<(Hash, ProposalVote)> = {
            let store = self.proposal_votes.lock().unwrap();
            store.orphans.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        let mut adopted = Vec::new();
        for (target, vote) in parked {
            let ok = {
                let mut store = self.proposals.lock().unwrap();
                match store.active.get_mut(&target) {
                    Some(proposal) => proposal.add_or_update_vote(vote, now).is_ok(),
                    None => false,
                }
            };
            if ok {
                adopted.push(target);
            }
        }
        if !adopted.is_empty() {
            let mut store = self.proposal_votes.lock().unwrap();
            for target in adopted {
                store.orphans.remove(&target);
            }
        }

        let parked: Vec<(Hash, FinalizedBudgetVote)> = {
            let store = self.finalized_votes.lock().unwrap();
            store.orphans.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        let mut adopted = Vec::new();
        for (target, vote) in parked {
            let ok = {
                let mut store = self.finalized.lock().unwrap();
                match store.active.get_mut(&target) {
                    Some(budget) => budget.add_or_update_vote(vote, now).is_ok(),
                    None => false,
                }
            };
            if ok {
                adopted.push(target);
            }
        }
        if !adopted.is_empty() {
            let mut store = self.finalized_votes.lock().unwrap();
            for target in adopted {
                store.orphans.remove(&target);
            }
        }
    }

    // ---- tally and selection ---------------------------------------------

    /// All active proposals, vote-revalidated, sorted by descending net yes.
    pub fn get_all_proposals(&self) -> Vec<BudgetProposal> {
        let mut store = self.proposals.lock().unwrap();
        for proposal in store.active.values_mut() {
            proposal.clean_and_remove(&*self.host.directory);
        }
        let mut all: Vec<BudgetProposal> = store.active.values().cloned().collect();
        all.sort_by(BudgetProposal::cmp_by_net_yes);
        all
    }

    /// The proposals selected for the next cycle, in selection order, with
    /// their allotted amounts set. Greedy by net yes under the cycle budget
    /// cap.
    pub fn get_budget(&self) -> Vec<BudgetProposal> {
        let height = self.best_height();
        if height == 0 {
            return Vec::new();
        }
        let now = self.adjusted_time();
        let enabled = self.host.directory.count_enabled();
        let cycle_start = self.params.next_cycle_start(height);
        let cycle_end = cycle_start + self.params.cycle_blocks - 1;
        let total_budget = self.params.total_budget(cycle_start);

        let mut store = self.proposals.lock().unwrap();
        for proposal in store.active.values_mut() {
            proposal.clean_and_remove(&*self.host.directory);
        }

        let mut sorted: Vec<BudgetProposal> = store.active.values().cloned().collect();
        sorted.sort_by(BudgetProposal::cmp_by_net_yes);

        let mut selected = Vec::new();
        let mut allocated: u64 = 0;
        for mut proposal in sorted {
            let hash = proposal.hash();
            if !proposal.is_passing(cycle_start, cycle_end, enabled, now, &self.params) {
                continue;
            }
            if allocated + proposal.amount <= total_budget {
                proposal.set_allotted(proposal.amount);
                allocated += proposal.amount;
                if let Some(stored) = store.active.get_mut(&hash) {
                    stored.set_allotted(proposal.amount);
                }
                selected.push(proposal);
            } else if let Some(stored) = store.active.get_mut(&hash) {
                stored.set_allotted(0);
            }
        }
        selected
    }

    /// Active finalized budgets sorted by descending vote count.
    pub fn get_finalized_budgets(&self) -> Vec<FinalizedBudget> {
        let store = self.finalized.lock().unwrap();
        let mut all: Vec<FinalizedBudget> = store.active.values().cloned().collect();
        all.sort_by(FinalizedBudget::cmp_by_votes);
        all
    }

    /// Highest net-yes proposal carrying `name`.
    pub fn find_proposal_by_name(&self, name: &str) -> Option<BudgetProposal> {
        let store = self.proposals.lock().unwrap();
        store
            .active
            .values()
            .filter(|p| p.name == name)
            .max_by(|a, b| BudgetProposal::cmp_by_net_yes(b, a))
            .cloned()
    }

    /// The in-range finalized budget with the most votes, if any.
    fn budget_with_highest_vote_count(&self, height: u64) -> Option<FinalizedBudget> {
        let store = self.finalized.lock().unwrap();
        let mut best: Option<&FinalizedBudget> = None;
        for budget in store.active.values() {
            if budget.vote_count() == 0 {
                continue;
            }
            if height < budget.start_block || height > budget.block_end() {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    FinalizedBudget::cmp_by_votes(budget, current) == std::cmp::Ordering::Less
                }
            };
            if better {
                best = Some(budget);
            }
        }
        best.cloned()
    }

    fn highest_vote_count(&self, height: u64) -> i64 {
        self.budget_with_highest_vote_count(height)
            .map(|b| b.vote_count() as i64)
            .unwrap_or(-1)
    }

    /// Whether `height` is expected to carry a budget payment, i.e. the
    /// leading finalized budget holds more than 5% of the masternodes.
    pub fn is_budget_payment_block(&self, height: u64) -> bool {
        let (highest, five_percent) = self.payment_block_counts(height);
        highest > five_percent
    }

    fn payment_block_counts(&self, height: u64) -> (i64, i64) {
        let highest = self.highest_vote_count(height);
        let five_percent = (self.host.directory.count_enabled() / 20) as i64;
        debug!(
            "highest vote count {}, 5% of masternodes {}",
            highest, five_percent
        );
        (highest, five_percent)
    }

    /// The payee and amount a coinstake at `height` must include, if any.
    pub fn get_payee_and_amount(&self, height: u64) -> Option<(Vec<u8>, u64)> {
        self.budget_with_highest_vote_count(height)
            .and_then(|b| b.payee_and_amount(height))
    }

    /// Appends (proof of stake) or grafts (proof of work) the expected
    /// budget payment onto a block transaction being assembled.
    pub fn fill_block_payee(&self, tx: &mut Transaction, proof_of_stake: bool) {
        let height = self.host.chain.best_height();
        if height == 0 {
            return;
        }
        let Some((payee, amount)) = self.get_payee_and_amount(height + 1) else {
            return;
        };

        if proof_of_stake {
            tx.outputs.push(ferrite_shared_types::TxOutput::new(amount, payee.clone()));
        } else {
            if tx.outputs.is_empty() {
                warn!("fill_block_payee: empty coinbase");
                return;
            }
            // Miners keep the full block value; the superblock payment is
            // added as a second output.
            tx.outputs[0].value = self.host.chain.block_value(height + 1);
            tx.outputs.truncate(1);
            tx.outputs.push(ferrite_shared_types::TxOutput::new(amount, payee.clone()));
        }
        info!(
            "budget payment of {} to {} filled into block template",
            amount,
            hex::encode(&payee)
        );
    }

    /// Validates a candidate block transaction at `height` against every
    /// finalized budget within 10% of the leader's vote count. Gossip is
    /// not instantaneously consistent, so any sufficiently-supported budget
    /// may legitimately be the one a block pays.
    pub fn is_transaction_valid(&self, tx: &Transaction, height: u64) -> TxValidationStatus {
        let (highest, five_percent) = self.payment_block_counts(height);
        if highest <= five_percent {
            // Not a budget block at all; a masternode payment is expected.
            return TxValidationStatus::VoteThreshold;
        }

        let threshold = highest - 2 * five_percent;
        let mut in_band = false;
        let mut store = self.finalized.lock().unwrap();
        let mut hashes: Vec<Hash> = store.active.keys().copied().collect();
        hashes.sort();
        for hash in hashes {
            let Some(budget) = store.active.get_mut(&hash) else {
                continue;
            };
            if (budget.vote_count() as i64) > threshold {
                in_band = true;
                if budget.check_block_transaction(tx, height) == TxValidationStatus::Valid {
                    return TxValidationStatus::Valid;
                }
                debug!(
                    "ignoring budget {}: out of range or tx not valid",
                    budget.proposals_str()
                );
            }
        }

        if in_band {
            TxValidationStatus::Invalid
        } else {
            TxValidationStatus::VoteThreshold
        }
    }

    /// Comma-joined proposal hashes every in-range finalized budget pays at
    /// `height`, `"unknown-budget"` when none.
    pub fn required_payments_string(&self, height: u64) -> String {
        let store = self.finalized.lock().unwrap();
        let mut parts = Vec::new();
        let mut hashes: Vec<&Hash> = store.active.keys().collect();
        hashes.sort();
        for hash in hashes {
            let budget = &store.active[hash];
            if height >= budget.start_block && height <= budget.block_end() {
                if let Some(payment) = budget.budget_payment_by_block(height) {
                    parts.push(hex::encode(payment.proposal_hash));
                }
            }
        }
        if parts.is_empty() {
            "unknown-budget".to_string()
        } else {
            parts.join(",")
        }
    }

    /// Cross-checks a finalized budget's payments against the local
    /// proposal set, reporting unknown proposals and payee/amount
    /// mismatches.
    pub fn finalized_budget_status(&self, hash: &Hash) -> String {
        let Some(budget) = self.finalized_budget(hash) else {
            return format!("ERROR: cannot find finalized budget {}", hex::encode(hash));
        };

        let mut bad_hashes = Vec::new();
        let mut bad_payee_or_amount = Vec::new();
        for height in budget.start_block..=budget.block_end() {
            let Some(payment) = budget.budget_payment_by_block(height) else {
                continue;
            };
            match self.proposal(&payment.proposal_hash) {
                None => bad_hashes.push(hex::encode(payment.proposal_hash)),
                Some(proposal) => {
                    if proposal.payee_script != payment.payee_script
                        || proposal.amount != payment.amount
                    {
                        bad_payee_or_amount.push(hex::encode(payment.proposal_hash));
                    }
                }
            }
        }

        if bad_hashes.is_empty() && bad_payee_or_amount.is_empty() {
            return "OK".to_string();
        }
        let mut report = String::new();
        if !bad_hashes.is_empty() {
            report.push_str(&format!(
                "Unknown proposal(s) hash! Check this proposal(s) before voting: {}",
                bad_hashes.join(", ")
            ));
        }
        if !bad_payee_or_amount.is_empty() {
            if !report.is_empty() {
                report.push_str(" -- ");
            }
            report.push_str(&format!(
                "Budget payee/amount doesn't match our proposal(s)! {}",
                bad_payee_or_amount.join(", ")
            ));
        }
        report
    }

    // ---- message processing ----------------------------------------------

    /// Ingress dispatch for the five budget protocol messages.
    pub fn process_message(&self, peer: PeerId, message: BudgetMessage) -> Result<(), BudgetError> {
        if !self.host.sync.is_blockchain_synced() {
            return Ok(());
        }

        match message {
            BudgetMessage::VoteSync { target } => {
                let target = (target != [0u8; 32]).then_some(target);
                if self.params.network == Network::Mainnet && target.is_none() {
                    if self.host.relay.has_fulfilled_request(peer, FULFILLED_BUDGET_SYNC) {
                        debug!("mnvs - peer {} already asked for the list", peer);
                        self.host.relay.misbehaving(peer, MISBEHAVING_SCORE);
                        return Ok(());
                    }
                    self.host.relay.fulfilled_request(peer, FULFILLED_BUDGET_SYNC);
                }
                self.sync_peer(peer, target, false);
                debug!("mnvs - sent budget votes to peer {}", peer);
                Ok(())
            }
            BudgetMessage::Proposal(broadcast) => self.process_proposal(peer, broadcast),
            BudgetMessage::Vote(vote) => self.process_proposal_vote(peer, vote),
            BudgetMessage::FinalizedBudget(broadcast) => {
                self.process_finalized_budget(peer, broadcast)
            }
            BudgetMessage::FinalizedVote(vote) => self.process_finalized_vote(peer, vote),
            BudgetMessage::SyncStatusCount { .. } => Ok(()),
        }
    }

    fn process_proposal(
        &self,
        peer: PeerId,
        mut broadcast: ProposalBroadcast,
    ) -> Result<(), BudgetError> {
        let hash = broadcast.hash();
        if self.have_seen_proposal(&hash) {
            self.host.sync.note_budget_item(&hash);
            return Ok(());
        }

        match check_collateral(
            &*self.host.chain,
            &self.params,
            &broadcast.collateral_txid,
            &hash,
            false,
        ) {
            Err(failure) => {
                debug!(
                    "proposal fee tx is not valid - {} - {}",
                    hex::encode(broadcast.collateral_txid),
                    failure.error
                );
                if failure.confirmations >= 1 {
                    // Exists on chain but not deep enough yet; park it.
                    self.proposals.lock().unwrap().immature.push(broadcast);
                } else {
                    self.host.relay.misbehaving(peer, MISBEHAVING_SCORE);
                }
                return Err(failure.error);
            }
            Ok(info) => {
                if broadcast.time == 0 {
                    broadcast.time = info.block_time;
                }
            }
        }

        self.proposals.lock().unwrap().seen.insert(hash, broadcast.clone());

        let proposal = BudgetProposal::from_broadcast(&broadcast);
        match self.add_proposal(proposal) {
            Ok(()) => {
                self.host
                    .relay
                    .relay_inventory(&BudgetInv::new(BudgetInvType::Proposal, hash));
                info!("mprop - new budget - {}", hex::encode(hash));
            }
            Err(err) => debug!("mprop - {}", err),
        }
        self.host.sync.note_budget_item(&hash);

        // We might already hold votes for this proposal.
        self.check_orphan_votes();
        Ok(())
    }

    fn process_proposal_vote(&self, peer: PeerId, mut vote: ProposalVote) -> Result<(), BudgetError> {
        vote.valid = true;
        vote.synced = false;
        let vote_hash = vote.hash();
        if self.have_seen_proposal_vote(&vote_hash) {
            self.host.sync.note_budget_item(&vote_hash);
            return Ok(());
        }

        let Some(masternode) = self.host.directory.find(&vote.voter) else {
            debug!("mvote - unknown masternode - {}", vote.voter.to_string_short());
            self.host.directory.ask_for_masternode(peer, &vote.voter);
            return Err(BudgetError::UnknownMasternode(vote.voter.to_string_short()));
        };

        self.proposal_votes.lock().unwrap().seen.insert(vote_hash, vote.clone());

        if let Err(err) = vote.check_signature(&masternode.operator_public_key) {
            // During bootstrap the vote may come from a masternode we have
            // stale keys for; only punish once we are synced.
            if self.host.sync.is_synced() {
                warn!("mvote - signature invalid from {}", vote.voter.to_string_short());
                self.host.relay.misbehaving(peer, MISBEHAVING_SCORE);
            }
            self.host.directory.ask_for_masternode(peer, &vote.voter);
            return Err(err);
        }

        match self.update_proposal_vote(vote, Some(peer)) {
            Ok(()) => {
                self.host
                    .relay
                    .relay_inventory(&BudgetInv::new(BudgetInvType::ProposalVote, vote_hash));
                self.host.sync.note_budget_item(&vote_hash);
                Ok(())
            }
            Err(err) => {
                debug!("mvote - rejected - {}", err);
                Err(err)
            }
        }
    }

    fn process_finalized_budget(
        &self,
        peer: PeerId,
        mut broadcast: FinalizedBudgetBroadcast,
    ) -> Result<(), BudgetError> {
        let hash = broadcast.hash();
        if self.have_seen_finalized_budget(&hash) {
            self.host.sync.note_budget_item(&hash);
            return Ok(());
        }

        match check_collateral(
            &*self.host.chain,
            &self.params,
            &broadcast.collateral_txid,
            &hash,
            true,
        ) {
            Err(failure) => {
                debug!(
                    "fbs - finalized budget fee tx is not valid - {} - {}",
                    hex::encode(broadcast.collateral_txid),
                    failure.error
                );
                if failure.confirmations >= 1 {
                    self.finalized.lock().unwrap().immature.push(broadcast);
                } else {
                    self.host.relay.misbehaving(peer, MISBEHAVING_SCORE);
                }
                return Err(failure.error);
            }
            Ok(info) => {
                if broadcast.time == 0 {
                    broadcast.time = info.block_time;
                }
            }
        }

        self.finalized.lock().unwrap().seen.insert(hash, broadcast.clone());

        let budget = FinalizedBudget::from_broadcast(&broadcast);
        match self.add_finalized_budget(budget) {
            Ok(()) => {
                self.host
                    .relay
                    .relay_inventory(&BudgetInv::new(BudgetInvType::FinalizedBudget, hash));
                info!("fbs - new finalized budget - {}", hex::encode(hash));
            }
            Err(err) => debug!("fbs - {}", err),
        }
        self.host.sync.note_budget_item(&hash);

        self.check_orphan_votes();
        Ok(())
    }

    fn process_finalized_vote(
        &self,
        peer: PeerId,
        mut vote: FinalizedBudgetVote,
    ) -> Result<(), BudgetError> {
        vote.valid = true;
        vote.synced = false;
        let vote_hash = vote.hash();
        if self.have_seen_finalized_budget_vote(&vote_hash) {
            self.host.sync.note_budget_item(&vote_hash);
            return Ok(());
        }

        let Some(masternode) = self.host.directory.find(&vote.voter) else {
            debug!("fbvote - unknown masternode - {}", vote.voter.to_string_short());
            self.host.directory.ask_for_masternode(peer, &vote.voter);
            return Err(BudgetError::UnknownMasternode(vote.voter.to_string_short()));
        };

        self.finalized_votes.lock().unwrap().seen.insert(vote_hash, vote.clone());

        if let Err(err) = vote.check_signature(&masternode.operator_public_key) {
            if self.host.sync.is_synced() {
                warn!("fbvote - signature invalid from {}", vote.voter.to_string_short());
                self.host.relay.misbehaving(peer, MISBEHAVING_SCORE);
            }
            self.host.directory.ask_for_masternode(peer, &vote.voter);
            return Err(err);
        }

        match self.update_finalized_budget_vote(vote, Some(peer)) {
            Ok(()) => {
                self.host.relay.relay_inventory(&BudgetInv::new(
                    BudgetInvType::FinalizedBudgetVote,
                    vote_hash,
                ));
                self.host.sync.note_budget_item(&vote_hash);
                Ok(())
            }
            Err(err) => {
                debug!("fbvote - rejected - {}", err);
                Err(err)
            }
        }
    }

    // ---- gossip sync -----------------------------------------------------

    /// Streams our seen, valid items (or just `target`) to `peer` as
    /// inventory, closing each category with a sync count. With `partial`,
    /// only votes not yet marked synced are announced.
    pub fn sync_peer(&self, peer: PeerId, target: Option<Hash>, partial: bool) {
        let mut invs = Vec::new();
        {
            let store = self.proposals.lock().unwrap();
            for hash in store.seen.keys() {
                let Some(proposal) = store.active.get(hash) else {
                    continue;
                };
                if !proposal.is_valid() || target.map_or(false, |t| t != *hash) {
                    continue;
                }
                invs.push(BudgetInv::new(BudgetInvType::Proposal, *hash));
                for vote in proposal.votes.values() {
                    if vote.valid && (!partial || !vote.synced) {
                        invs.push(BudgetInv::new(BudgetInvType::ProposalVote, vote.hash()));
                    }
                }
            }
        }
        let count = invs.len() as u32;
        for inv in &invs {
            self.host.relay.push_inventory(peer, inv);
        }
        self.host.relay.send_message(
            peer,
            &BudgetMessage::SyncStatusCount {
                category: SyncCategory::Proposals,
                count,
            },
        );
        debug!("sync: sent {} proposal items to peer {}", count, peer);

        let mut invs = Vec::new();
        {
            let store = self.finalized.lock().unwrap();
            for hash in store.seen.keys() {
                let Some(budget) = store.active.get(hash) else {
                    continue;
                };
                if !budget.is_valid() || target.map_or(false, |t| t != *hash) {
                    continue;
                }
                invs.push(BudgetInv::new(BudgetInvType::FinalizedBudget, *hash));
                for vote in budget.votes.values() {
                    if vote.valid && (!partial || !vote.synced) {
                        invs.push(BudgetInv::new(
                            BudgetInvType::FinalizedBudgetVote,
                            vote.hash(),
                        ));
                    }
                }
            }
        }
        let count = invs.len() as u32;
        for inv in &invs {
            self.host.relay.push_inventory(peer, inv);
        }
        self.host.relay.send_message(
            peer,
            &BudgetMessage::SyncStatusCount {
                category: SyncCategory::FinalizedBudgets,
                count,
            },
        );
        debug!("sync: sent {} finalized items to peer {}", count, peer);
    }

    fn set_synced(&self, synced: bool) {
        let mut store = self.proposals.lock().unwrap();
        for proposal in store.active.values_mut() {
            proposal.set_synced(synced);
        }
        drop(store);
        let mut store = self.finalized.lock().unwrap();
        for budget in store.active.values_mut() {
            budget.set_synced(synced);
        }
    }

    /// Marks every announced vote as synced after a broadcast round.
    pub fn mark_synced(&self) {
        self.set_synced(true);
    }

    /// Clears sync flags so the next partial sync re-announces everything.
    pub fn reset_sync(&self) {
        self.set_synced(false);
    }

    /// Drops the relay dedup sets, forcing a re-broadcast round.
    pub fn clear_seen(&self) {
        self.proposals.lock().unwrap().seen.clear();
        self.finalized.lock().unwrap().seen.clear();
        self.proposal_votes.lock().unwrap().seen.clear();
        self.finalized_votes.lock().unwrap().seen.clear();
    }

    // ---- per-block housekeeping ------------------------------------------

    /// Per-block tick. Heavy work runs every fourteenth block only.
    pub fn new_block(&self, height: u64) {
        self.set_best_height(height);

        if !self.host.sync.is_blockchain_synced() {
            return;
        }

        if self.mode == BudgetMode::Suggest {
            self.submit_final_budget();
        }

        if height % 14 != 0 {
            return;
        }

        if self.host.sync.is_synced() {
            // Rarely force a full re-broadcast round so long-lived nodes
            // refresh each other.
            let reset = self.rng.lock().unwrap().gen::<u32>() % 1440 == 0;
            if reset {
                self.clear_seen();
                self.reset_sync();
            }
            for peer in self.host.relay.peers() {
                self.sync_peer(peer, None, true);
            }
            self.mark_synced();
        }

        self.check_and_remove();

        let now = self.adjusted_time();
        self.ask_throttle
            .lock()
            .unwrap()
            .retain(|_, asked| *asked > now - ASK_WINDOW_SECS);

        self.promote_immature();
    }

    /// Moves parked items whose collateral matured into the active sets.
    /// Skipped when the stores are contended; the next block retries.
    fn promote_immature(&self) {
        let promoted = {
            let Ok(mut store) = self.proposals.try_lock() else {
                return;
            };
            for proposal in store.active.values_mut() {
                proposal.clean_and_remove(&*self.host.directory);
            }
            let mut ready = Vec::new();
            let mut waiting = Vec::new();
            for mut broadcast in std::mem::take(&mut store.immature) {
                let hash = broadcast.hash();
                match check_collateral(
                    &*self.host.chain,
                    &self.params,
                    &broadcast.collateral_txid,
                    &hash,
                    false,
                ) {
                    Ok(info) => {
                        if broadcast.time == 0 {
                            broadcast.time = info.block_time;
                        }
                        store.seen.insert(hash, broadcast.clone());
                        ready.push(broadcast);
                    }
                    Err(_) => waiting.push(broadcast),
                }
            }
            store.immature = waiting;
            ready
        };
        for broadcast in promoted {
            let hash = broadcast.hash();
            if self.add_proposal(BudgetProposal::from_broadcast(&broadcast)).is_ok() {
                info!("mprop (immature) - new budget - {}", hex::encode(hash));
                self.host
                    .relay
                    .relay_inventory(&BudgetInv::new(BudgetInvType::Proposal, hash));
            }
        }

        let promoted = {
            let Ok(mut store) = self.finalized.try_lock() else {
                return;
            };
            for budget in store.active.values_mut() {
                budget.clean_and_remove(&*self.host.directory);
            }
            let mut ready = Vec::new();
            let mut waiting = Vec::new();
            for mut broadcast in std::mem::take(&mut store.immature) {
                let hash = broadcast.hash();
                match check_collateral(
                    &*self.host.chain,
                    &self.params,
                    &broadcast.collateral_txid,
                    &hash,
                    true,
                ) {
                    Ok(info) => {
                        if broadcast.time == 0 {
                            broadcast.time = info.block_time;
                        }
                        store.seen.insert(hash, broadcast.clone());
                        ready.push(broadcast);
                    }
                    Err(_) => waiting.push(broadcast),
                }
            }
            store.immature = waiting;
            ready
        };
        for broadcast in promoted {
            let hash = broadcast.hash();
            if self
                .add_finalized_budget(FinalizedBudget::from_broadcast(&broadcast))
                .is_ok()
            {
                info!("fbs (immature) - new finalized budget - {}", hex::encode(hash));
                self.host
                    .relay
                    .relay_inventory(&BudgetInv::new(BudgetInvType::FinalizedBudget, hash));
            }
        }
    }

    /// Revalidates every active item at the current height, drops the
    /// failures, and lets the local masternode auto-vote on a matching
    /// finalized budget.
    pub fn check_and_remove(&self) {
        let height = self.best_height();

        // Snapshot the selection before sweeping the budgets; the
        // comparison must not run while holding both stores.
        let selection: Option<Vec<BudgetPayment>> =
            if self.mode == BudgetMode::Auto && self.local_masternode.is_some() {
                Some(
                    self.get_budget()
                        .iter()
                        .map(|p| BudgetPayment {
                            proposal_hash: p.hash(),
                            payee_script: p.payee_script.clone(),
                            amount: p.amount,
                        })
                        .collect(),
                )
            } else {
                None
            };

        let mut to_vote = Vec::new();
        {
            let mut store = self.finalized.lock().unwrap();
            debug!("budget cleanup - size before: {}", store.active.len());
            let mut kept = HashMap::new();
            for (hash, mut budget) in store.active.drain() {
                if !budget.update_valid(height, &*self.host.chain, &self.params, true) {
                    debug!("removing invalid finalized budget: {}", budget.invalid_reason());
                    continue;
                }
                if let Some(selection) = &selection {
                    // Spread the voting activity out over time.
                    if !budget.is_auto_checked()
                        && self.rng.lock().unwrap().gen::<u32>() % 4 == 0
                        && budget.auto_check(selection)
                    {
                        to_vote.push(hash);
                    }
                }
                kept.insert(hash, budget);
            }
            store.active = kept;
            debug!("budget cleanup - size after: {}", store.active.len());
        }

        {
            let mut store = self.proposals.lock().unwrap();
            debug!("proposal cleanup - size before: {}", store.active.len());
            let mut kept = HashMap::new();
            for (hash, mut proposal) in store.active.drain() {
                if proposal.update_valid(
                    height,
                    &*self.host.chain,
                    &*self.host.directory,
                    &self.params,
                    true,
                ) {
                    kept.insert(hash, proposal);
                } else {
                    debug!("removing invalid budget proposal - {}", proposal.invalid_reason());
                }
            }
            store.active = kept;
            debug!("proposal cleanup - size after: {}", store.active.len());
        }

        for hash in to_vote {
            self.submit_finalized_budget_vote(hash);
        }
    }

    /// Signs and records the local masternode's yes vote on `budget_hash`.
    fn submit_finalized_budget_vote(&self, budget_hash: Hash) {
        let Some(local) = &self.local_masternode else {
            return;
        };
        let mut vote = FinalizedBudgetVote::new(
            local.outpoint.clone(),
            budget_hash,
            self.adjusted_time(),
        );
        vote.sign(&local.operator_key);
        let vote_hash = vote.hash();

        match self.update_finalized_budget_vote(vote.clone(), None) {
            Ok(()) => {
                info!("new finalized budget vote - {}", hex::encode(vote_hash));
                self.finalized_votes.lock().unwrap().seen.insert(vote_hash, vote);
                self.host.relay.relay_inventory(&BudgetInv::new(
                    BudgetInvType::FinalizedBudgetVote,
                    vote_hash,
                ));
            }
            Err(err) => warn!("error submitting finalized budget vote - {}", err),
        }
    }

    /// Constructs and broadcasts this node's finalized budget for the next
    /// cycle, once per cycle within the finalization window.
    pub fn submit_final_budget(&self) {
        let height = self.best_height();
        if height == 0 {
            return;
        }
        let block_start = self.params.next_cycle_start(height);
        {
            let submitted = self.submitted_height.lock().unwrap();
            if *submitted >= block_start {
                return;
            }
        }

        if block_start - height > self.params.finalization_window() {
            debug!(
                "too early for finalization, current block {} next superblock {}",
                height, block_start
            );
            return;
        }

        let payments: Vec<BudgetPayment> = self
            .get_budget()
            .iter()
            .map(|p| BudgetPayment {
                proposal_hash: p.hash(),
                payee_script: p.payee_script.clone(),
                amount: p.allotted(),
            })
            .collect();
        if payments.is_empty() {
            debug!("found no proposals for period");
            return;
        }

        let template = FinalizedBudget::new(
            "main".to_string(),
            block_start,
            payments.clone(),
            [0u8; 32],
        );
        let budget_hash = template.hash();
        if self.have_seen_finalized_budget(&budget_hash) {
            debug!("budget already exists - {}", hex::encode(budget_hash));
            *self.submitted_height.lock().unwrap() = height;
            return;
        }

        // Reuse the collateral we already paid for this budget, if any.
        let existing = self.own_collateral_txids.lock().unwrap().get(&budget_hash).copied();
        let collateral_txid = match existing {
            Some(txid) => txid,
            None => match self.host.wallet.create_fee_transaction(&budget_hash, true) {
                Ok(txid) => {
                    self.own_collateral_txids.lock().unwrap().insert(budget_hash, txid);
                    txid
                }
                Err(err) => {
                    warn!("can't make collateral transaction - {}", err);
                    return;
                }
            },
        };

        let mut broadcast = FinalizedBudgetBroadcast {
            name: "main".to_string(),
            start_block: block_start,
            payments,
            collateral_txid,
            time: 0,
        };

        // The fresh collateral needs confirmations; until it has them this
        // simply retries next block.
        match check_collateral(&*self.host.chain, &self.params, &collateral_txid, &budget_hash, true)
        {
            Err(failure) => {
                debug!("invalid collateral for finalized budget - {}", failure.error);
                return;
            }
            Ok(info) => broadcast.time = info.block_time,
        }

        self.finalized.lock().unwrap().seen.insert(budget_hash, broadcast.clone());
        self.host
            .relay
            .relay_inventory(&BudgetInv::new(BudgetInvType::FinalizedBudget, budget_hash));
        if let Err(err) = self.add_finalized_budget(FinalizedBudget::from_broadcast(&broadcast)) {
            warn!("submitted finalized budget rejected locally - {}", err);
            return;
        }
        *self.submitted_height.lock().unwrap() = height;
        info!("submitted finalized budget {}", hex::encode(budget_hash));
    }

    // ---- persistence support ---------------------------------------------

    /// Clones the persistable state.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let proposals = self.proposals.lock().unwrap().active.values().cloned().collect();
        let finalized_budgets = self.finalized.lock().unwrap().active.values().cloned().collect();
        BudgetSnapshot {
            proposals,
            finalized_budgets,
        }
    }

    /// Replaces in-memory state with `snapshot`, rebuilding the seen sets
    /// from the active items so they stay supersets of the active sets.
    pub fn restore(&self, snapshot: BudgetSnapshot) {
        let mut active_proposals = HashMap::new();
        let mut seen_proposals = HashMap::new();
        let mut seen_proposal_votes = HashMap::new();
        for proposal in snapshot.proposals {
            let hash = proposal.hash();
            seen_proposals.insert(hash, proposal.broadcast());
            for vote in proposal.votes.values() {
                seen_proposal_votes.insert(vote.hash(), vote.clone());
            }
            active_proposals.insert(hash, proposal);
        }

        let mut active_budgets = HashMap::new();
        let mut seen_budgets = HashMap::new();
        let mut seen_finalized_votes = HashMap::new();
        for budget in snapshot.finalized_budgets {
            let hash = budget.hash();
            seen_budgets.insert(hash, budget.broadcast());
            for vote in budget.votes.values() {
                seen_finalized_votes.insert(vote.hash(), vote.clone());
            }
            active_budgets.insert(hash, budget);
        }

        {
            let mut store = self.proposals.lock().unwrap();
            store.active = active_proposals;
            store.seen = seen_proposals;
            store.immature.clear();
        }
        {
            let mut store = self.proposal_votes.lock().unwrap();
            store.seen = seen_proposal_votes;
            store.orphans.clear();
        }
        {
            let mut store = self.finalized.lock().unwrap();
            store.active = active_budgets;
            store.seen = seen_budgets;
            store.immature.clear();
        }
        {
            let mut store = self.finalized_votes.lock().unwrap();
            store.seen = seen_finalized_votes;
            store.orphans.clear();
        }
        self.ask_throttle.lock().unwrap().clear();
    }

    /// Drops all in-memory state, as after a corrupt load.
    pub fn clear(&self) {
        self.restore(BudgetSnapshot {
            proposals: Vec::new(),
            finalized_budgets: Vec::new(),
        });
    }
}

impl fmt::Display for BudgetManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (proposals, seen_proposals) = {
            let store = self.proposals.lock().unwrap();
            (store.active.len(), store.seen.len())
        };
        let (budgets, seen_budgets) = {
            let store = self.finalized.lock().unwrap();
            (store.active.len(), store.seen.len())
        };
        let (seen_votes, orphan_votes) = {
            let store = self.proposal_votes.lock().unwrap();
            (store.seen.len(), store.orphans.len())
        };
        let (seen_finalized_votes, orphan_finalized_votes) = {
            let store = self.finalized_votes.lock().unwrap();
            (store.seen.len(), store.orphans.len())
        };
        write!(
            f,
            "Proposals: {} (seen: {}) - Finalized Budgets: {} (seen: {}) - \
             Proposal Votes: {} (orphan: {}) - Finalized Budget Votes: {} (orphan: {})",
            proposals,
            seen_proposals,
            budgets,
            seen_budgets,
            seen_votes,
            orphan_votes,
            seen_finalized_votes,
            orphan_finalized_votes
        )
    }
}
