//! Collateral (fee transaction) validation. A governance item is only
//! accepted once a confirmed on-chain transaction commits to the item's
//! hash through an `OP_RETURN <hash>` output paying the applicable fee.
//! Any change to the item's content changes its hash and voids the
//! collateral, which makes spam expensive and verification deterministic.

use ferrite_shared_types::{script, Hash};
use log::debug;

use crate::error::BudgetError;
use crate::external::ChainAccess;
use crate::params::BudgetParams;

/// What a successful collateral check yields: the containing block's
/// timestamp (used to seed the item's `created_time` when missing) and the
/// confirmation count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollateralInfo {
    pub block_time: i64,
    pub confirmations: u64,
}

/// A failed check still reports how deep the transaction is, so callers can
/// park an item whose collateral exists but has not matured yet.
#[derive(Debug, Clone)]
pub struct CollateralFailure {
    pub error: BudgetError,
    pub confirmations: u64,
}

impl CollateralFailure {
    fn new(reason: String) -> Self {
        CollateralFailure {
            error: BudgetError::InvalidCollateral(reason),
            confirmations: 0,
        }
    }
}

impl From<CollateralFailure> for BudgetError {
    fn from(failure: CollateralFailure) -> Self {
        failure.error
    }
}

/// Validates the collateral transaction `collateral_txid` against
/// `expected_hash`. `finalization` selects the finalized-budget fee floor
/// over the proposal fee floor.
pub fn check_collateral(
    chain: &dyn ChainAccess,
    params: &BudgetParams,
    collateral_txid: &Hash,
    expected_hash: &Hash,
    finalization: bool,
) -> Result<CollateralInfo, CollateralFailure> {
    let located = chain.transaction(collateral_txid).ok_or_else(|| {
        CollateralFailure::new(format!(
            "can't find collateral tx {}",
            hex::encode(collateral_txid)
        ))
    })?;

    let tx = &located.tx;
    if tx.outputs.is_empty() {
        return Err(CollateralFailure::new("collateral tx has no outputs".to_string()));
    }
    if tx.lock_time != 0 {
        return Err(CollateralFailure::new("collateral tx has nonzero locktime".to_string()));
    }

    let commitment = script::op_return_commitment(expected_hash);
    let required_fee = if finalization {
        params.finalization_fee
    } else {
        params.proposal_fee
    };

    let mut found_commitment = false;
    for out in &tx.outputs {
        if !script::is_normal_payment_script(&out.script_pubkey)
            && !script::is_unspendable(&out.script_pubkey)
        {
            return Err(CollateralFailure::new(format!(
                "invalid script {}",
                hex::encode(&out.script_pubkey)
            )));
        }
        if out.script_pubkey == commitment && out.value >= required_fee {
            found_commitment = true;
        }
    }

    if !found_commitment {
        return Err(CollateralFailure::new(format!(
            "couldn't find opReturn {} in {}",
            hex::encode(expected_hash),
            hex::encode(collateral_txid)
        )));
    }

    let (confirmations, block_time) = match (located.block_height, located.block_time) {
        (Some(height), time) => {
            let tip = chain.best_height();
            let conf = if tip >= height { tip - height + 1 } else { 0 };
            (conf, time.unwrap_or(0))
        }
        _ => (0, 0),
    };

    if confirmations < params.fee_confirmations {
        debug!(
            "collateral {} requires at least {} confirmations - {} confirmations",
            hex::encode(collateral_txid),
            params.fee_confirmations,
            confirmations
        );
        return Err(CollateralFailure {
            error: BudgetError::InvalidCollateral(format!(
                "collateral requires at least {} confirmations - {} confirmations",
                params.fee_confirmations, confirmations
            )),
            confirmations,
        });
    }

    Ok(CollateralInfo {
        block_time,
        confirmations,
    })
}
