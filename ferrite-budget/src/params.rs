//! Network parameters for the budget engine: cycle geometry, fee floors,
//! and the total-budget schedule.

use ferrite_shared_types::COIN;
use serde::{Deserialize, Serialize};

/// Minimum time between two votes from the same masternode on the same item.
pub const BUDGET_VOTE_UPDATE_MIN: i64 = 60 * 60;

/// A vote time may not run ahead of the adjusted clock by more than this.
pub const BUDGET_VOTE_MAX_FUTURE: i64 = 60 * 60;

/// How long an unanswered budget-vote-sync request stays throttled.
pub const ASK_WINDOW_SECS: i64 = 60 * 60 * 24;

/// A finalized budget pays at most one superblock per cycle block offset.
pub const MAX_BUDGET_PAYMENTS: usize = 100;

/// Ban-score increment for collateral/signature misbehavior.
pub const MISBEHAVING_SCORE: i32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Network-specific message-start bytes, written into the budget dump
    /// header so a testnet file cannot be loaded on mainnet.
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xfe, 0x42, 0x11, 0x90],
            Network::Testnet => [0xba, 0x1d, 0xfa, 0xce],
            Network::Regtest => [0x4e, 0x9e, 0x57, 0x01],
        }
    }
}

/// Consensus-level knobs for the budget system. Use one of the network
/// presets; the fields are public so tests can shrink the geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetParams {
    pub network: Network,
    /// Blocks per budget cycle (one superblock window per cycle).
    pub cycle_blocks: u64,
    /// Confirmations a collateral transaction needs before acceptance.
    pub fee_confirmations: u64,
    /// Fee floor for a proposal collateral.
    pub proposal_fee: u64,
    /// Fee floor for a finalized-budget collateral.
    pub finalization_fee: u64,
    /// Seconds a proposal must age before it can pass.
    pub establishment_interval: i64,
    /// Height of the proof-of-stake switchover.
    pub pos_activation_height: u64,
    /// Height of the second subsidy schedule revision.
    pub subsidy_v2_height: u64,
}

impl BudgetParams {
    pub fn mainnet() -> Self {
        BudgetParams {
            network: Network::Mainnet,
            cycle_blocks: 43_200,
            fee_confirmations: 6,
            proposal_fee: 50 * COIN,
            finalization_fee: 5 * COIN,
            establishment_interval: 60 * 60 * 24,
            pos_activation_height: 259_201,
            subsidy_v2_height: 1_153_160,
        }
    }

    pub fn testnet() -> Self {
        BudgetParams {
            network: Network::Testnet,
            cycle_blocks: 144,
            fee_confirmations: 3,
            proposal_fee: 50 * COIN,
            finalization_fee: 5 * COIN,
            establishment_interval: 60 * 5,
            pos_activation_height: 201,
            subsidy_v2_height: 300,
        }
    }

    pub fn regtest() -> Self {
        BudgetParams {
            network: Network::Regtest,
            ..Self::testnet()
        }
    }

    /// First block of the cycle containing `height`.
    pub fn cycle_start(&self, height: u64) -> u64 {
        height - height % self.cycle_blocks
    }

    /// First block of the cycle after `height`.
    pub fn next_cycle_start(&self, height: u64) -> u64 {
        height - height % self.cycle_blocks + self.cycle_blocks
    }

    /// Blocks before a cycle start during which a final budget may be
    /// submitted.
    pub fn finalization_window(&self) -> u64 {
        ((self.cycle_blocks / 30) * 2).max(64)
    }

    /// Total budget available for the cycle starting at `height`.
    ///
    /// Mainnet derives it from the block-subsidy curve (10% of one month of
    /// subsidy at one-minute blocks); test networks use a fixed value.
    pub fn total_budget(&self, height: u64) -> u64 {
        if self.network != Network::Mainnet {
            let subsidy = 500 * COIN;
            return ((subsidy / 100) * 10) * 146;
        }

        let pos_active = height >= self.pos_activation_height;
        let subsidy = if height >= 151_200 && !pos_active {
            50 * COIN
        } else if pos_active && height <= 302_399 {
            50 * COIN
        } else if (302_400..=345_599).contains(&height) {
            45 * COIN
        } else if (345_600..=388_799).contains(&height) {
            40 * COIN
        } else if (388_800..=431_999).contains(&height) {
            35 * COIN
        } else if (432_000..=475_199).contains(&height) {
            30 * COIN
        } else if (475_200..=518_399).contains(&height) {
            25 * COIN
        } else if (518_400..=561_599).contains(&height) {
            20 * COIN
        } else if (561_600..=604_799).contains(&height) {
            15 * COIN
        } else if (604_800..=647_999).contains(&height) {
            10 * COIN
        } else if height >= self.subsidy_v2_height {
            10 * COIN
        } else {
            5 * COIN
        };

        // One month of one-minute blocks.
        if height <= 172_800 {
            648_000 * COIN
        } else {
            ((subsidy / 100) * 10) * 1440 * 30
        }
    }
}
