//! End-to-end tests for the budget manager: gossip ingestion, tally and
//! selection, superblock validation, orphan reconciliation, and the dump
//! file round trip.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use ferrite_budget::external::{
    BudgetRelay, BudgetWallet, ChainAccess, ChainTx, MasternodeDirectory, PeerId, SyncTracker,
};
use ferrite_budget::finalized::{BudgetPayment, TxValidationStatus};
use ferrite_budget::manager::{ActiveMasternode, BudgetHost, BudgetManager, BudgetMode};
use ferrite_budget::params::BudgetParams;
use ferrite_budget::persistence::BudgetDb;
use ferrite_budget::protocol::{
    BudgetInv, BudgetMessage, FinalizedBudgetBroadcast, ProposalBroadcast,
};
use ferrite_budget::vote::{FinalizedBudgetVote, ProposalVote, VoteDirection};
use ferrite_shared_types::masternode::{MasternodeEntry, MasternodeStatus};
use ferrite_shared_types::{script, Hash, OutPoint, Transaction, TxOutput, COIN};

const NOW: i64 = 1_700_000_000;

// ---- mock host -----------------------------------------------------------

#[derive(Default)]
struct MockChain {
    txs: Mutex<HashMap<Hash, ChainTx>>,
    tip: Mutex<u64>,
}

impl MockChain {
    fn set_tip(&self, height: u64) {
        *self.tip.lock().unwrap() = height;
    }

    /// Mines a collateral transaction committing to `item_hash` at `height`
    /// and returns its txid.
    fn mine_collateral(&self, item_hash: &Hash, fee: u64, height: u64) -> Hash {
        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput::new(fee, script::op_return_commitment(item_hash))],
            lock_time: 0,
        };
        let txid = tx.txid();
        self.txs.lock().unwrap().insert(
            txid,
            ChainTx {
                tx,
                block_height: Some(height),
                block_time: Some(NOW - 200_000),
            },
        );
        txid
    }
}

impl ChainAccess for MockChain {
    fn transaction(&self, txid: &Hash) -> Option<ChainTx> {
        self.txs.lock().unwrap().get(txid).cloned()
    }
    fn best_height(&self) -> u64 {
        *self.tip.lock().unwrap()
    }
    fn adjusted_time(&self) -> i64 {
        NOW
    }
    fn block_value(&self, _height: u64) -> u64 {
        450 * COIN
    }
}

#[derive(Default)]
struct MockDirectory {
    masternodes: Mutex<HashMap<OutPoint, MasternodeEntry>>,
    asked: Mutex<Vec<(PeerId, OutPoint)>>,
}

impl MasternodeDirectory for MockDirectory {
    fn find(&self, outpoint: &OutPoint) -> Option<MasternodeEntry> {
        self.masternodes.lock().unwrap().get(outpoint).cloned()
    }
    fn count_enabled(&self) -> u64 {
        self.masternodes
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.is_enabled())
            .count() as u64
    }
    fn ask_for_masternode(&self, peer: PeerId, outpoint: &OutPoint) {
        self.asked.lock().unwrap().push((peer, outpoint.clone()));
    }
}

/// Wallet that mines its collateral six blocks under the current tip, so
/// the submit path sees a mature fee transaction at once.
struct MockWallet {
    chain: Arc<MockChain>,
    params: BudgetParams,
    created: Mutex<Vec<Hash>>,
}

impl BudgetWallet for MockWallet {
    fn create_fee_transaction(&self, item_hash: &Hash, finalization: bool) -> Result<Hash, String> {
        let fee = if finalization {
            self.params.finalization_fee
        } else {
            self.params.proposal_fee
        };
        let height = self.chain.best_height().saturating_sub(self.params.fee_confirmations - 1);
        let txid = self.chain.mine_collateral(item_hash, fee, height);
        self.created.lock().unwrap().push(*item_hash);
        Ok(txid)
    }
}

#[derive(Default)]
struct MockRelay {
    relayed: Mutex<Vec<BudgetInv>>,
    pushed: Mutex<Vec<(PeerId, BudgetInv)>>,
    sent: Mutex<Vec<(PeerId, BudgetMessage)>>,
    scores: Mutex<HashMap<PeerId, i32>>,
    fulfilled: Mutex<HashSet<(PeerId, String)>>,
    peer_list: Mutex<Vec<PeerId>>,
}

impl MockRelay {
    fn sent_vote_syncs(&self, peer: PeerId) -> Vec<Hash> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(p, m)| match m {
                BudgetMessage::VoteSync { target } if *p == peer => Some(*target),
                _ => None,
            })
            .collect()
    }

    fn score(&self, peer: PeerId) -> i32 {
        self.scores.lock().unwrap().get(&peer).copied().unwrap_or(0)
    }
}

impl BudgetRelay for MockRelay {
    fn relay_inventory(&self, inv: &BudgetInv) {
        self.relayed.lock().unwrap().push(*inv);
    }
    fn push_inventory(&self, peer: PeerId, inv: &BudgetInv) {
        self.pushed.lock().unwrap().push((peer, *inv));
    }
    fn send_message(&self, peer: PeerId, msg: &BudgetMessage) {
        self.sent.lock().unwrap().push((peer, msg.clone()));
    }
    fn misbehaving(&self, peer: PeerId, score: i32) {
        *self.scores.lock().unwrap().entry(peer).or_insert(0) += score;
    }
    fn peers(&self) -> Vec<PeerId> {
        self.peer_list.lock().unwrap().clone()
    }
    fn has_fulfilled_request(&self, peer: PeerId, kind: &str) -> bool {
        self.fulfilled.lock().unwrap().contains(&(peer, kind.to_string()))
    }
    fn fulfilled_request(&self, peer: PeerId, kind: &str) {
        self.fulfilled.lock().unwrap().insert((peer, kind.to_string()));
    }
}

struct MockSync {
    blockchain_synced: AtomicBool,
    synced: AtomicBool,
    noted: Mutex<Vec<Hash>>,
}

impl Default for MockSync {
    fn default() -> Self {
        MockSync {
            blockchain_synced: AtomicBool::new(true),
            synced: AtomicBool::new(true),
            noted: Mutex::new(Vec::new()),
        }
    }
}

impl SyncTracker for MockSync {
    fn is_blockchain_synced(&self) -> bool {
        self.blockchain_synced.load(Ordering::SeqCst)
    }
    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
    fn note_budget_item(&self, hash: &Hash) {
        self.noted.lock().unwrap().push(*hash);
    }
}

// ---- fixture -------------------------------------------------------------

struct Fixture {
    params: BudgetParams,
    chain: Arc<MockChain>,
    directory: Arc<MockDirectory>,
    wallet: Arc<MockWallet>,
    relay: Arc<MockRelay>,
    sync: Arc<MockSync>,
    keys: Vec<SigningKey>,
}

impl Fixture {
    /// A mainnet-parameter world with `masternodes` enabled masternodes.
    fn new(masternodes: usize) -> Self {
        let params = BudgetParams::mainnet();
        let chain = Arc::new(MockChain::default());
        let directory = Arc::new(MockDirectory::default());
        let wallet = Arc::new(MockWallet {
            chain: chain.clone(),
            params: params.clone(),
            created: Mutex::new(Vec::new()),
        });
        let relay = Arc::new(MockRelay::default());
        let sync = Arc::new(MockSync::default());

        let mut keys = Vec::new();
        for i in 0..masternodes {
            let key = SigningKey::from_bytes(&[i as u8 + 1; 32]);
            let outpoint = Self::mn_outpoint(i);
            directory.masternodes.lock().unwrap().insert(
                outpoint.clone(),
                MasternodeEntry {
                    collateral_outpoint: outpoint,
                    operator_public_key: key.verifying_key().to_bytes(),
                    network_address: format!("10.0.0.{}:51472", i),
                    status: MasternodeStatus::Enabled,
                    protocol_version: 70923,
                },
            );
            keys.push(key);
        }

        Fixture {
            params,
            chain,
            directory,
            wallet,
            relay,
            sync,
            keys,
        }
    }

    fn mn_outpoint(index: usize) -> OutPoint {
        OutPoint::new([index as u8 + 1; 32], 0)
    }

    fn pushed_for(&self, peer: PeerId) -> Vec<BudgetInv> {
        self.relay
            .pushed
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, inv)| *inv)
            .collect()
    }

    fn host(&self) -> BudgetHost {
        BudgetHost {
            chain: self.chain.clone(),
            directory: self.directory.clone(),
            wallet: self.wallet.clone(),
            relay: self.relay.clone(),
            sync: self.sync.clone(),
        }
    }

    fn manager(&self) -> BudgetManager {
        self.manager_with_mode(BudgetMode::Observe, None)
    }

    fn manager_with_mode(
        &self,
        mode: BudgetMode,
        local: Option<ActiveMasternode>,
    ) -> BudgetManager {
        BudgetManager::with_rng_seed(self.params.clone(), self.host(), mode, local, 7)
    }

    fn payee() -> Vec<u8> {
        script::pay_to_public_key_hash(&[0x77; 20])
    }

    /// A 50-coin single-payment proposal for the cycle starting at 86_400,
    /// with a matured collateral on chain.
    fn gateway_proposal(&self) -> ProposalBroadcast {
        let mut broadcast = ProposalBroadcast {
            name: "gateway".to_string(),
            url: "https://forum.ferritecoin.org/t/gateway".to_string(),
            start_block: 86_400,
            end_block: 86_400 + (self.params.cycle_blocks + 1),
            payee_script: Self::payee(),
            amount: 50 * COIN,
            collateral_txid: [0u8; 32],
            time: 0,
        };
        let tip = self.chain.best_height();
        broadcast.collateral_txid = self.chain.mine_collateral(
            &broadcast.hash(),
            self.params.proposal_fee,
            tip.saturating_sub(self.params.fee_confirmations - 1),
        );
        broadcast
    }

    fn signed_proposal_vote(
        &self,
        voter: usize,
        target: Hash,
        direction: VoteDirection,
        time: i64,
    ) -> ProposalVote {
        let mut vote = ProposalVote::new(Self::mn_outpoint(voter), target, direction, time);
        vote.sign(&self.keys[voter]);
        vote
    }

    fn signed_finalized_vote(&self, voter: usize, target: Hash, time: i64) -> FinalizedBudgetVote {
        let mut vote = FinalizedBudgetVote::new(Self::mn_outpoint(voter), target, time);
        vote.sign(&self.keys[voter]);
        vote
    }

    /// Builds and ingests a finalized budget with the given payments and
    /// `votes` yes-votes from distinct masternodes.
    fn ingest_finalized(
        &self,
        manager: &BudgetManager,
        payments: Vec<BudgetPayment>,
        votes: std::ops::Range<usize>,
    ) -> Hash {
        let mut broadcast = FinalizedBudgetBroadcast {
            name: "main".to_string(),
            start_block: 86_400,
            payments,
            collateral_txid: [0u8; 32],
            time: 0,
        };
        let tip = self.chain.best_height();
        broadcast.collateral_txid = self.chain.mine_collateral(
            &broadcast.hash(),
            self.params.finalization_fee,
            tip.saturating_sub(self.params.fee_confirmations - 1),
        );
        let hash = broadcast.hash();
        manager
            .process_message(1, BudgetMessage::FinalizedBudget(broadcast))
            .unwrap();
        for voter in votes {
            manager
                .process_message(
                    1,
                    BudgetMessage::FinalizedVote(self.signed_finalized_vote(voter, hash, NOW)),
                )
                .unwrap();
        }
        hash
    }
}

fn payment_for(broadcast: &ProposalBroadcast) -> BudgetPayment {
    BudgetPayment {
        proposal_hash: broadcast.hash(),
        payee_script: broadcast.payee_script.clone(),
        amount: broadcast.amount,
    }
}

// ---- scenarios -----------------------------------------------------------

/// S1: a matured, established, well-supported proposal is selected and the
/// superblock coinstake gets its payee appended.
#[test]
fn s1_happy_path_selection_and_payee() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let broadcast = fx.gateway_proposal();
    let hash = broadcast.hash();
    manager
        .process_message(1, BudgetMessage::Proposal(broadcast.clone()))
        .unwrap();
    assert!(manager.proposal(&hash).is_some());

    for voter in 0..12 {
        manager
            .process_message(
                1,
                BudgetMessage::Vote(fx.signed_proposal_vote(voter, hash, VoteDirection::Yes, NOW)),
            )
            .unwrap();
    }
    manager
        .process_message(
            1,
            BudgetMessage::Vote(fx.signed_proposal_vote(12, hash, VoteDirection::No, NOW)),
        )
        .unwrap();

    let selected = manager.get_budget();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].hash(), hash);
    assert_eq!(selected[0].allotted(), 50 * COIN);

    // A finalized budget backing the selection, supported by >5% of the
    // masternodes, makes 86_400 a payment block.
    fx.ingest_finalized(&manager, vec![payment_for(&broadcast)], 0..6);
    assert!(manager.is_budget_payment_block(86_400));

    let mut coinstake = Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![TxOutput::new(0, vec![]), TxOutput::new(400 * COIN, Fixture::payee())],
        lock_time: 0,
    };
    manager.fill_block_payee(&mut coinstake, true);
    let last = coinstake.outputs.last().unwrap();
    assert_eq!(last.script_pubkey, Fixture::payee());
    assert_eq!(last.value, 50 * COIN);
}

/// S2: a heavily downvoted proposal fails revalidation and is dropped.
#[test]
fn s2_heavy_downvote_expires_proposal() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let broadcast = fx.gateway_proposal();
    let hash = broadcast.hash();
    manager
        .process_message(1, BudgetMessage::Proposal(broadcast))
        .unwrap();

    for voter in 0..15 {
        manager
            .process_message(
                1,
                BudgetMessage::Vote(fx.signed_proposal_vote(voter, hash, VoteDirection::No, NOW)),
            )
            .unwrap();
    }
    for voter in 15..17 {
        manager
            .process_message(
                1,
                BudgetMessage::Vote(fx.signed_proposal_vote(voter, hash, VoteDirection::Yes, NOW)),
            )
            .unwrap();
    }

    manager.check_and_remove();
    assert!(manager.proposal(&hash).is_none());
    assert!(manager.get_budget().is_empty());
}

/// S3: a block paying any finalized budget within 10% of the leader's vote
/// count validates.
#[test]
fn s3_band_acceptance() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let proposal_a = fx.gateway_proposal();
    let mut payment_b = payment_for(&proposal_a);
    payment_b.amount = 40 * COIN;

    let _a = fx.ingest_finalized(&manager, vec![payment_for(&proposal_a)], 0..60);
    let _b = fx.ingest_finalized(&manager, vec![payment_b.clone()], 0..55);

    let block_tx = Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![
            TxOutput::new(0, vec![]),
            TxOutput::new(payment_b.amount, payment_b.payee_script.clone()),
        ],
        lock_time: 0,
    };
    assert_eq!(
        manager.is_transaction_valid(&block_tx, 86_400),
        TxValidationStatus::Valid
    );

    // A payout matching no budget in the band is invalid.
    let stray_tx = Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![TxOutput::new(1 * COIN, Fixture::payee())],
        lock_time: 0,
    };
    assert_eq!(
        manager.is_transaction_valid(&stray_tx, 86_400),
        TxValidationStatus::Invalid
    );
}

/// S4: with the best budget under 5% support there is no payment block and
/// validation defers to the masternode payment rules.
#[test]
fn s4_below_vote_threshold() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let proposal = fx.gateway_proposal();
    fx.ingest_finalized(&manager, vec![payment_for(&proposal)], 0..4);

    assert!(!manager.is_budget_payment_block(86_400));
    let tx = Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![TxOutput::new(50 * COIN, Fixture::payee())],
        lock_time: 0,
    };
    assert_eq!(
        manager.is_transaction_valid(&tx, 86_400),
        TxValidationStatus::VoteThreshold
    );
}

/// S5: a vote arriving before its proposal is parked, one throttled `mnvs`
/// goes out, and the vote is adopted once the proposal lands.
#[test]
fn s5_orphan_vote_reconciliation() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let broadcast = fx.gateway_proposal();
    let hash = broadcast.hash();
    let peer = 3;

    let vote = fx.signed_proposal_vote(0, hash, VoteDirection::Yes, NOW);
    assert!(manager.process_message(peer, BudgetMessage::Vote(vote)).is_err());
    assert_eq!(fx.relay.sent_vote_syncs(peer), vec![hash]);

    // A second orphan for the same target inside the ask window stays quiet.
    let vote = fx.signed_proposal_vote(1, hash, VoteDirection::Yes, NOW);
    assert!(manager.process_message(peer, BudgetMessage::Vote(vote)).is_err());
    assert_eq!(fx.relay.sent_vote_syncs(peer).len(), 1);

    // The proposal arrives; ingestion reconciles the parked vote.
    manager
        .process_message(peer, BudgetMessage::Proposal(broadcast))
        .unwrap();
    let proposal = manager.proposal(&hash).unwrap();
    assert_eq!(proposal.yeas(), 1);
}

/// S6: the dump file round-trips the active sets and the tally they imply.
#[test]
fn s6_persistence_round_trip() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    // Three proposals with differing support; two finalized budgets.
    let mut hashes = Vec::new();
    for (i, amount) in [50u64, 120, 300].iter().enumerate() {
        let mut broadcast = fx.gateway_proposal();
        broadcast.name = format!("proposal-{}", i);
        broadcast.amount = amount * COIN;
        broadcast.collateral_txid = fx.chain.mine_collateral(
            &broadcast.hash(),
            fx.params.proposal_fee,
            86_394,
        );
        let hash = broadcast.hash();
        manager
            .process_message(1, BudgetMessage::Proposal(broadcast))
            .unwrap();
        for voter in 0..(12 + i) {
            manager
                .process_message(
                    1,
                    BudgetMessage::Vote(fx.signed_proposal_vote(
                        voter,
                        hash,
                        VoteDirection::Yes,
                        NOW,
                    )),
                )
                .unwrap();
        }
        hashes.push(hash);
    }
    let proposal = manager.proposal(&hashes[0]).unwrap();
    fx.ingest_finalized(
        &manager,
        vec![BudgetPayment {
            proposal_hash: hashes[0],
            payee_script: proposal.payee_script.clone(),
            amount: proposal.amount,
        }],
        0..8,
    );
    fx.ingest_finalized(
        &manager,
        vec![BudgetPayment {
            proposal_hash: hashes[1],
            payee_script: proposal.payee_script.clone(),
            amount: 120 * COIN,
        }],
        0..6,
    );

    manager.check_and_remove();
    let budget_before: Vec<(Hash, u64)> =
        manager.get_budget().iter().map(|p| (p.hash(), p.allotted())).collect();
    let finalized_before: Vec<Hash> =
        manager.get_finalized_budgets().iter().map(|b| b.hash()).collect();

    let dir = std::env::temp_dir().join("ferrite-budget-s6");
    std::fs::create_dir_all(&dir).unwrap();
    let db = BudgetDb::new(dir.join("budget.dat"), fx.params.network);
    db.write(&manager).unwrap();

    let restored = fx.manager();
    restored.set_best_height(86_399);
    db.load(&restored).unwrap();
    restored.check_and_remove();

    let budget_after: Vec<(Hash, u64)> =
        restored.get_budget().iter().map(|p| (p.hash(), p.allotted())).collect();
    let finalized_after: Vec<Hash> =
        restored.get_finalized_budgets().iter().map(|b| b.hash()).collect();

    assert_eq!(budget_before, budget_after);
    assert_eq!(finalized_before, finalized_after);
    for hash in &hashes {
        let a = manager.proposal(hash).unwrap();
        let b = restored.proposal(hash).unwrap();
        assert_eq!(a.votes.len(), b.votes.len());
    }
}

// ---- additional properties ----------------------------------------------

/// Selection is a pure function of the stored state.
#[test]
fn selection_is_deterministic_and_budget_capped() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    for i in 0..5u8 {
        let mut broadcast = fx.gateway_proposal();
        broadcast.name = format!("p{}", i);
        broadcast.amount = (200_000 - i as u64 * 13) * COIN;
        broadcast.collateral_txid = fx.chain.mine_collateral(
            &broadcast.hash(),
            fx.params.proposal_fee,
            86_394,
        );
        let hash = broadcast.hash();
        manager
            .process_message(1, BudgetMessage::Proposal(broadcast))
            .unwrap();
        for voter in 0..(12 + i as usize) {
            manager
                .process_message(
                    1,
                    BudgetMessage::Vote(fx.signed_proposal_vote(
                        voter,
                        hash,
                        VoteDirection::Yes,
                        NOW,
                    )),
                )
                .unwrap();
        }
    }

    let first = manager.get_budget();
    let second = manager.get_budget();
    assert_eq!(
        first.iter().map(|p| p.hash()).collect::<Vec<_>>(),
        second.iter().map(|p| p.hash()).collect::<Vec<_>>()
    );

    let total: u64 = first.iter().map(|p| p.allotted()).sum();
    assert!(total <= fx.params.total_budget(86_400));
    // 5 * 200k exceeds the 648k cap, so not everything fits.
    assert!(first.len() < 5);
}

/// A second full `mnvs` from the same peer on mainnet raises its ban score.
#[test]
fn full_sync_is_once_per_peer_on_mainnet() {
    let fx = Fixture::new(10);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let full = BudgetMessage::VoteSync { target: [0u8; 32] };
    manager.process_message(4, full.clone()).unwrap();
    assert_eq!(fx.relay.score(4), 0);
    manager.process_message(4, full).unwrap();
    assert_eq!(fx.relay.score(4), 20);
}

/// A bad vote signature from a synced peer costs 20 ban points; the same
/// message during bootstrap is forgiven.
#[test]
fn bad_signature_scores_only_after_sync() {
    let fx = Fixture::new(10);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let broadcast = fx.gateway_proposal();
    let hash = broadcast.hash();
    manager
        .process_message(1, BudgetMessage::Proposal(broadcast))
        .unwrap();

    fx.sync.synced.store(false, Ordering::SeqCst);
    let mut vote = fx.signed_proposal_vote(0, hash, VoteDirection::Yes, NOW);
    vote.signature[0] ^= 0xff;
    assert!(manager.process_message(2, BudgetMessage::Vote(vote.clone())).is_err());
    assert_eq!(fx.relay.score(2), 0);

    fx.sync.synced.store(true, Ordering::SeqCst);
    vote.time += 3600; // new vote hash, not deduped by the seen set
    let mut vote = fx.signed_proposal_vote(0, hash, VoteDirection::Yes, vote.time);
    vote.signature[0] ^= 0xff;
    assert!(manager.process_message(2, BudgetMessage::Vote(vote)).is_err());
    assert_eq!(fx.relay.score(2), 20);
}

/// Votes from unknown masternodes trigger a directory ask, not a score.
#[test]
fn unknown_voter_is_asked_for() {
    let fx = Fixture::new(3);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let broadcast = fx.gateway_proposal();
    let hash = broadcast.hash();
    manager
        .process_message(1, BudgetMessage::Proposal(broadcast))
        .unwrap();

    let stranger = SigningKey::from_bytes(&[0xAA; 32]);
    let mut vote = ProposalVote::new(OutPoint::new([0xAA; 32], 0), hash, VoteDirection::Yes, NOW);
    vote.sign(&stranger);
    assert!(manager.process_message(6, BudgetMessage::Vote(vote)).is_err());
    assert_eq!(fx.directory.asked.lock().unwrap().len(), 1);
    assert_eq!(fx.relay.score(6), 0);
}

/// An immature proposal is parked and promoted once its collateral has the
/// required depth.
#[test]
fn immature_collateral_parks_then_promotes() {
    let fx = Fixture::new(10);
    fx.chain.set_tip(86_380);
    let manager = fx.manager();
    manager.set_best_height(86_380);

    // Collateral mined at the tip: one confirmation.
    let mut broadcast = fx.gateway_proposal();
    broadcast.collateral_txid =
        fx.chain.mine_collateral(&broadcast.hash(), fx.params.proposal_fee, 86_380);
    let hash = broadcast.hash();

    assert!(manager.process_message(1, BudgetMessage::Proposal(broadcast)).is_err());
    assert!(manager.proposal(&hash).is_none());
    assert_eq!(fx.relay.score(1), 0);

    // By the next heavy tick (86_394 is divisible by 14) the collateral is
    // deep enough and the proposal is promoted.
    fx.chain.set_tip(86_394);
    manager.new_block(86_394);
    assert!(manager.proposal(&hash).is_some());
    assert!(manager.have_seen_proposal(&hash));
}

/// In suggest mode the node finalizes its own budget inside the window.
#[test]
fn suggest_mode_submits_final_budget() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_390);
    let manager = fx.manager_with_mode(BudgetMode::Suggest, None);
    manager.set_best_height(86_390);

    let broadcast = fx.gateway_proposal();
    let hash = broadcast.hash();
    manager
        .process_message(1, BudgetMessage::Proposal(broadcast.clone()))
        .unwrap();
    for voter in 0..12 {
        manager
            .process_message(
                1,
                BudgetMessage::Vote(fx.signed_proposal_vote(voter, hash, VoteDirection::Yes, NOW)),
            )
            .unwrap();
    }

    manager.submit_final_budget();

    assert_eq!(fx.wallet.created.lock().unwrap().len(), 1);
    let budgets = manager.get_finalized_budgets();
    assert_eq!(budgets.len(), 1);
    assert_eq!(budgets[0].start_block, 86_400);
    assert_eq!(budgets[0].payments.len(), 1);
    assert_eq!(budgets[0].payments[0].proposal_hash, hash);
    assert_eq!(budgets[0].payments[0].amount, 50 * COIN);

    // Submitting again in the same cycle is a no-op.
    manager.submit_final_budget();
    assert_eq!(fx.wallet.created.lock().unwrap().len(), 1);
}

/// A masternode in auto mode eventually votes yes on a finalized budget
/// that matches its own selection, exactly once, and never on one that
/// does not.
#[test]
fn auto_mode_votes_on_matching_budget() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_399);

    let local = ActiveMasternode {
        outpoint: Fixture::mn_outpoint(0),
        operator_key: fx.keys[0].clone(),
    };

    let mut voted_seed = None;
    for seed in 0..64 {
        let manager = BudgetManager::with_rng_seed(
            fx.params.clone(),
            fx.host(),
            BudgetMode::Auto,
            Some(local.clone()),
            seed,
        );
        manager.set_best_height(86_399);

        let broadcast = fx.gateway_proposal();
        let hash = broadcast.hash();
        manager
            .process_message(1, BudgetMessage::Proposal(broadcast.clone()))
            .unwrap();
        for voter in 1..13 {
            manager
                .process_message(
                    1,
                    BudgetMessage::Vote(fx.signed_proposal_vote(
                        voter,
                        hash,
                        VoteDirection::Yes,
                        NOW,
                    )),
                )
                .unwrap();
        }
        let budget_hash = fx.ingest_finalized(&manager, vec![payment_for(&broadcast)], 1..7);

        manager.check_and_remove();
        let budget = manager.finalized_budget(&budget_hash).unwrap();
        if budget.votes.values().any(|v| v.voter == local.outpoint) {
            // The 1-in-4 draw fired and the budget matched.
            voted_seed = Some(seed);
            assert!(budget.is_auto_checked());
            let count = budget.vote_count();
            // The latch prevents a second auto-vote.
            manager.check_and_remove();
            assert_eq!(manager.finalized_budget(&budget_hash).unwrap().vote_count(), count);
            break;
        }
    }
    assert!(voted_seed.is_some(), "auto vote never fired across 64 seeds");

    // A budget whose amount disagrees with the selection never gets the
    // local vote, whatever the RNG does.
    for seed in 0..16 {
        let manager = BudgetManager::with_rng_seed(
            fx.params.clone(),
            fx.host(),
            BudgetMode::Auto,
            Some(local.clone()),
            seed,
        );
        manager.set_best_height(86_399);

        let broadcast = fx.gateway_proposal();
        let hash = broadcast.hash();
        manager
            .process_message(1, BudgetMessage::Proposal(broadcast.clone()))
            .unwrap();
        for voter in 1..13 {
            manager
                .process_message(
                    1,
                    BudgetMessage::Vote(fx.signed_proposal_vote(
                        voter,
                        hash,
                        VoteDirection::Yes,
                        NOW,
                    )),
                )
                .unwrap();
        }
        let mut mismatched = payment_for(&broadcast);
        mismatched.amount -= COIN;
        let budget_hash = fx.ingest_finalized(&manager, vec![mismatched], 1..7);

        manager.check_and_remove();
        let budget = manager.finalized_budget(&budget_hash).unwrap();
        assert!(!budget.votes.values().any(|v| v.voter == local.outpoint));
    }
}

/// Serving a sync pushes the item inventory, its votes, and the two
/// category counts.
#[test]
fn sync_serves_items_votes_and_counts() {
    let fx = Fixture::new(20);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let broadcast = fx.gateway_proposal();
    let hash = broadcast.hash();
    manager
        .process_message(1, BudgetMessage::Proposal(broadcast))
        .unwrap();
    for voter in 0..3 {
        manager
            .process_message(
                1,
                BudgetMessage::Vote(fx.signed_proposal_vote(voter, hash, VoteDirection::Yes, NOW)),
            )
            .unwrap();
    }

    let peer = 9;
    manager.process_message(peer, BudgetMessage::VoteSync { target: hash }).unwrap();

    let pushed = fx.pushed_for(peer);
    assert_eq!(pushed.len(), 4); // proposal + 3 votes

    let counts: Vec<(PeerId, BudgetMessage)> = fx
        .relay
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|(p, m)| *p == peer && matches!(m, BudgetMessage::SyncStatusCount { .. }))
        .cloned()
        .collect();
    assert_eq!(counts.len(), 2);
}

/// Double payment inside one cycle is refused on the second check.
#[test]
fn double_payment_rejected_at_manager_level() {
    let fx = Fixture::new(100);
    fx.chain.set_tip(86_399);
    let manager = fx.manager();
    manager.set_best_height(86_399);

    let proposal = fx.gateway_proposal();
    let payment = payment_for(&proposal);
    fx.ingest_finalized(&manager, vec![payment.clone(), payment.clone()], 0..20);

    let tx = Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![TxOutput::new(payment.amount, payment.payee_script.clone())],
        lock_time: 0,
    };
    assert_eq!(manager.is_transaction_valid(&tx, 86_400), TxValidationStatus::Valid);
    // The same proposal scheduled on the next block of the cycle is a
    // double payment, which never validates.
    assert_eq!(
        manager.is_transaction_valid(&tx, 86_401),
        TxValidationStatus::Invalid
    );
}
