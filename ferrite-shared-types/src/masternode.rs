//! Masternode identity types shared between the directory and the
//! governance engine.

use serde::{Deserialize, Serialize};

use crate::{OutPoint, PublicKey};

/// Represents the unique identifier for a masternode, derived from its
/// collateral UTXO.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasternodeID(pub OutPoint);

impl MasternodeID {
    pub fn as_bytes(&self) -> Vec<u8> {
        bincode::serialize(&self.0).unwrap_or_default()
    }
}

impl From<OutPoint> for MasternodeID {
    fn from(outpoint: OutPoint) -> Self {
        MasternodeID(outpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasternodeStatus {
    Enabled,
    PreEnabled,
    Expired,
    Removed,
}

/// Directory entry for one masternode as the governance engine sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasternodeEntry {
    pub collateral_outpoint: OutPoint,
    /// Ed25519 key the operator signs governance votes with.
    pub operator_public_key: PublicKey,
    pub network_address: String,
    pub status: MasternodeStatus,
    pub protocol_version: u32,
}

impl MasternodeEntry {
    pub fn id(&self) -> MasternodeID {
        MasternodeID(self.collateral_outpoint.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.status == MasternodeStatus::Enabled
    }
}
