//! Interfaces to the host node. The engine never reaches into the chain,
//! the masternode directory, the wallet, or the transport directly; the
//! node wires these in at startup.

use ferrite_shared_types::masternode::MasternodeEntry;
use ferrite_shared_types::{Hash, OutPoint, Transaction};

use crate::protocol::{BudgetInv, BudgetMessage};

pub type PeerId = u64;

/// A transaction as located by the chain, with its containing block's
/// height and timestamp when confirmed.
#[derive(Debug, Clone)]
pub struct ChainTx {
    pub tx: Transaction,
    pub block_height: Option<u64>,
    pub block_time: Option<i64>,
}

/// Read-only view of the active chain.
pub trait ChainAccess: Send + Sync {
    fn transaction(&self, txid: &Hash) -> Option<ChainTx>;
    fn best_height(&self) -> u64;
    /// Network-adjusted unix time.
    fn adjusted_time(&self) -> i64;
    /// Full block reward at `height`, used when a superblock payee is
    /// grafted onto a proof-of-work coinbase.
    fn block_value(&self, height: u64) -> u64;
}

/// Read-only view of the masternode directory.
pub trait MasternodeDirectory: Send + Sync {
    fn find(&self, outpoint: &OutPoint) -> Option<MasternodeEntry>;
    /// Enabled masternodes speaking at least the active protocol.
    fn count_enabled(&self) -> u64;
    /// Ask `peer` to announce a masternode we do not know about.
    fn ask_for_masternode(&self, peer: PeerId, outpoint: &OutPoint);
}

/// The slice of the wallet the engine needs when it submits its own
/// finalized budget.
pub trait BudgetWallet: Send + Sync {
    /// Create, sign and broadcast a collateral transaction committing to
    /// `item_hash` via OP_RETURN and paying the applicable fee floor.
    /// Returns the collateral txid.
    fn create_fee_transaction(&self, item_hash: &Hash, finalization: bool) -> Result<Hash, String>;
}

/// Outbound half of the P2P transport.
pub trait BudgetRelay: Send + Sync {
    /// Announce an item to every connected peer.
    fn relay_inventory(&self, inv: &BudgetInv);
    fn push_inventory(&self, peer: PeerId, inv: &BudgetInv);
    fn send_message(&self, peer: PeerId, msg: &BudgetMessage);
    fn misbehaving(&self, peer: PeerId, score: i32);
    fn peers(&self) -> Vec<PeerId>;
    /// One-shot request bookkeeping (a peer may ask for a full budget sync
    /// only once on mainnet).
    fn has_fulfilled_request(&self, peer: PeerId, kind: &str) -> bool;
    fn fulfilled_request(&self, peer: PeerId, kind: &str);
}

/// Progress of the node's initial masternode/budget sync.
pub trait SyncTracker: Send + Sync {
    fn is_blockchain_synced(&self) -> bool;
    fn is_synced(&self) -> bool;
    /// Record a received budget item for sync progress accounting.
    fn note_budget_item(&self, hash: &Hash);
}
