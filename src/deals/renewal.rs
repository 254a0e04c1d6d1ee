// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use serde::Serialize;

use super::status::{DealStatus, StorageDeal};
use crate::error::{VaultError, VaultResult};
use crate::utils::units::{atto_string, atto_to_fil};

/// Remaining epochs below which a deal should be renewed:
/// a quarter of its duration, capped at `lookahead`
pub fn renewal_threshold(duration: ChainEpoch, lookahead: ChainEpoch) -> ChainEpoch {
    (duration / 4).min(lookahead)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealStatusReport {
    pub deal: StorageDeal,
    pub status: DealStatus,
    pub current_epoch: ChainEpoch,
    pub remaining_epochs: ChainEpoch,
    pub renewal_threshold: ChainEpoch,
    pub renewal_recommended: bool,
}

impl DealStatusReport {
    pub fn new(mut deal: StorageDeal, current: ChainEpoch, lookahead: ChainEpoch) -> Self {
        let status = deal.refresh(current);
        let remaining = deal.remaining(current);
        let threshold = renewal_threshold(deal.duration(), lookahead);
        let renewal_recommended =
            matches!(status, DealStatus::Active | DealStatus::Published) && remaining < threshold;
        Self {
            deal,
            status,
            current_epoch: current,
            remaining_epochs: remaining,
            renewal_threshold: threshold,
            renewal_recommended,
        }
    }
}

/// Duration of a replacement deal that keeps coverage for `additional`
/// epochs past the current end
pub fn extension_duration(
    deal: &StorageDeal,
    current: ChainEpoch,
    additional: ChainEpoch,
    min_duration: ChainEpoch,
    max_duration: ChainEpoch,
) -> VaultResult<ChainEpoch> {
    if additional <= 0 {
        return Err(VaultError::validation(format!(
            "extension must be positive, got {additional}"
        )));
    }
    if current > deal.end_epoch {
        return Err(VaultError::validation(format!(
            "deal {} expired at epoch {}; create a new deal instead",
            deal.proposal_id, deal.end_epoch
        )));
    }
    let duration = (deal.remaining(current) + additional).max(min_duration);
    if duration > max_duration {
        return Err(VaultError::validation(format!(
            "extended duration {duration} exceeds maximum {max_duration}"
        )));
    }
    Ok(duration)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRenewal {
    pub deal: StorageDeal,
    /// First epoch at which renewal becomes due
    pub renew_at_epoch: ChainEpoch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalPlan {
    pub current_epoch: ChainEpoch,
    pub due_now: Vec<StorageDeal>,
    pub scheduled: Vec<ScheduledRenewal>,
    pub expired: Vec<StorageDeal>,
    /// Renewing every due deal for its original duration
    #[serde(with = "atto_string")]
    pub estimated_cost: TokenAmount,
    pub estimated_cost_fil: String,
}

/// Partition deals into due-now, scheduled and expired buckets. Failed
/// and terminated deals are left out.
pub fn create_renewal_plan(
    deals: &[StorageDeal],
    current: ChainEpoch,
    lookahead: ChainEpoch,
) -> RenewalPlan {
    let mut due_now = Vec::new();
    let mut scheduled = Vec::new();
    let mut expired = Vec::new();
    let mut cost = BigInt::from(0);

    for deal in deals {
        let report = DealStatusReport::new(deal.clone(), current, lookahead);
        match report.status {
            DealStatus::Expired => expired.push(report.deal),
            DealStatus::Failed | DealStatus::Terminated => {}
            _ if report.renewal_recommended => {
                cost += report.deal.price_atto_fil_per_epoch.atto()
                    * BigInt::from(report.deal.duration());
                due_now.push(report.deal);
            }
            _ => scheduled.push(ScheduledRenewal {
                renew_at_epoch: report.deal.end_epoch - report.renewal_threshold,
                deal: report.deal,
            }),
        }
    }
    scheduled.sort_by_key(|s| s.renew_at_epoch);

    let estimated_cost = TokenAmount::from_atto(cost);
    RenewalPlan {
        current_epoch: current,
        due_now,
        scheduled,
        expired,
        estimated_cost_fil: atto_to_fil(&estimated_cost),
        estimated_cost,
    }
}
