// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use serde::{Deserialize, Serialize};

use crate::client::MarketDeal;
use crate::error::{VaultError, VaultResult};
use crate::utils::cid::{cid_string, cid_string::option as cid_option};
use crate::utils::units::atto_string;

/// Lifecycle of a storage deal. `Failed` and `Terminated` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    Pending,
    Published,
    Active,
    Expired,
    Failed,
    Terminated,
}

/// What the chain says about a deal, independent of the current epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainState {
    /// Nothing known beyond the proposed epochs
    #[default]
    Unknown,
    Proposed,
    Published,
    Sealed,
    Slashed,
    Failed,
}

impl ChainState {
    /// Map a Lotus storage deal state code
    pub fn from_lotus_state(code: u64) -> Self {
        match code {
            // ProposalNotFound, ProposalRejected, Rejecting, Failing, Error
            1 | 2 | 10 | 11 | 26 => ChainState::Failed,
            9 => ChainState::Slashed,
            // Sealing, Finalizing, Active, Expired, AwaitingPreCommit
            5..=8 | 29 => ChainState::Sealed,
            _ => ChainState::Proposed,
        }
    }

    /// Chain state of a deal present in the market actor
    pub fn from_market_deal(deal: &MarketDeal) -> Self {
        if deal.state.slash_epoch >= 0 {
            ChainState::Slashed
        } else if deal.state.sector_start_epoch >= 0 {
            ChainState::Sealed
        } else {
            ChainState::Published
        }
    }
}

/// Status from epochs alone
pub fn deal_status(current: ChainEpoch, start: ChainEpoch, end: ChainEpoch) -> DealStatus {
    if current < start {
        DealStatus::Pending
    } else if current <= end {
        DealStatus::Active
    } else {
        DealStatus::Expired
    }
}

impl DealStatus {
    /// Combine the epoch window with the chain's view of the deal
    pub fn resolve(
        current: ChainEpoch,
        start: ChainEpoch,
        end: ChainEpoch,
        chain: ChainState,
    ) -> Self {
        match chain {
            ChainState::Failed => return DealStatus::Failed,
            ChainState::Slashed => return DealStatus::Terminated,
            _ => {}
        }
        match deal_status(current, start, end) {
            DealStatus::Pending => match chain {
                ChainState::Published | ChainState::Sealed => DealStatus::Published,
                _ => DealStatus::Pending,
            },
            // a proposal that never reached the chain cannot be active
            DealStatus::Active if chain == ChainState::Proposed => DealStatus::Pending,
            status => status,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DealStatus::Expired | DealStatus::Failed | DealStatus::Terminated
        )
    }
}

impl std::fmt::Display for DealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DealStatus::Pending => "pending",
            DealStatus::Published => "published",
            DealStatus::Active => "active",
            DealStatus::Expired => "expired",
            DealStatus::Failed => "failed",
            DealStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A deal as tracked by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDeal {
    /// Proposal CID, or the intermediary's upload reference
    pub proposal_id: String,
    pub deal_id: Option<u64>,
    #[serde(with = "cid_option")]
    pub piece_cid: Option<Cid>,
    /// Padded, power of two
    pub piece_size: u64,
    #[serde(with = "cid_string")]
    pub data_cid: Cid,
    pub provider: String,
    pub client: String,
    #[serde(with = "atto_string")]
    pub price_atto_fil_per_epoch: TokenAmount,
    pub verified: bool,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub status: DealStatus,
    #[serde(default)]
    pub chain_state: ChainState,
}

impl StorageDeal {
    pub fn validate(&self) -> VaultResult<()> {
        if self.end_epoch <= self.start_epoch {
            return Err(VaultError::validation(format!(
                "deal end epoch {} must be after start epoch {}",
                self.end_epoch, self.start_epoch
            )));
        }
        Ok(())
    }

    pub fn duration(&self) -> ChainEpoch {
        self.end_epoch - self.start_epoch
    }

    /// Epochs left before expiry, never negative
    pub fn remaining(&self, current: ChainEpoch) -> ChainEpoch {
        (self.end_epoch - current.max(self.start_epoch)).max(0)
    }

    pub fn status_at(&self, current: ChainEpoch) -> DealStatus {
        DealStatus::resolve(current, self.start_epoch, self.end_epoch, self.chain_state)
    }

    /// Recompute `status` for `current`; absorbing states never change
    pub fn refresh(&mut self, current: ChainEpoch) -> DealStatus {
        if !matches!(self.status, DealStatus::Failed | DealStatus::Terminated) {
            self.status = self.status_at(current);
        }
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_boundaries() {
        assert_eq!(deal_status(99, 100, 200), DealStatus::Pending);
        assert_eq!(deal_status(100, 100, 200), DealStatus::Active);
        assert_eq!(deal_status(200, 100, 200), DealStatus::Active);
        assert_eq!(deal_status(201, 100, 200), DealStatus::Expired);
    }

    #[test]
    fn chain_state_overrides() {
        assert_eq!(
            DealStatus::resolve(150, 100, 200, ChainState::Failed),
            DealStatus::Failed
        );
        assert_eq!(
            DealStatus::resolve(50, 100, 200, ChainState::Slashed),
            DealStatus::Terminated
        );
        assert_eq!(
            DealStatus::resolve(50, 100, 200, ChainState::Published),
            DealStatus::Published
        );
        assert_eq!(
            DealStatus::resolve(150, 100, 200, ChainState::Proposed),
            DealStatus::Pending
        );
        assert_eq!(
            DealStatus::resolve(150, 100, 200, ChainState::Sealed),
            DealStatus::Active
        );
        assert_eq!(
            DealStatus::resolve(250, 100, 200, ChainState::Sealed),
            DealStatus::Expired
        );
    }

    #[test]
    fn lotus_state_codes() {
        assert_eq!(ChainState::from_lotus_state(7), ChainState::Sealed);
        assert_eq!(ChainState::from_lotus_state(9), ChainState::Slashed);
        assert_eq!(ChainState::from_lotus_state(26), ChainState::Failed);
        assert_eq!(ChainState::from_lotus_state(3), ChainState::Proposed);
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&DealStatus::Terminated).unwrap(),
            "\"terminated\""
        );
        assert_eq!(DealStatus::Active.to_string(), "active");
    }
}
