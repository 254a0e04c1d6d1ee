// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use serde::Serialize;

use super::providers::ProviderProfile;
use crate::error::{VaultError, VaultResult};
use crate::utils::units::{atto_string, atto_to_fil, bytes_to_gib_ceil, padded_piece_size};

/// `price * ceil(padded GiB) * epochs`, exact
pub fn storage_cost(price_per_gib_epoch: &TokenAmount, size_bytes: u64, epochs: ChainEpoch) -> TokenAmount {
    let gib = bytes_to_gib_ceil(padded_piece_size(size_bytes));
    TokenAmount::from_atto(price_per_gib_epoch.atto() * BigInt::from(gib) * BigInt::from(epochs))
}

/// Per-epoch price of a whole piece: `price * ceil(padded GiB)`
pub fn epoch_price(price_per_gib_epoch: &TokenAmount, size_bytes: u64) -> TokenAmount {
    storage_cost(price_per_gib_epoch, size_bytes, 1)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCost {
    pub miner_id: String,
    #[serde(with = "atto_string")]
    pub price_per_gib_epoch: TokenAmount,
    #[serde(with = "atto_string")]
    pub total: TokenAmount,
    pub total_fil: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub size_bytes: u64,
    pub padded_size: u64,
    pub size_gib: u64,
    pub duration_epochs: ChainEpoch,
    pub verified: bool,
    pub providers: Vec<ProviderCost>,
    #[serde(with = "atto_string")]
    pub min: TokenAmount,
    /// Integer mean, rounded down
    #[serde(with = "atto_string")]
    pub avg: TokenAmount,
    #[serde(with = "atto_string")]
    pub max: TokenAmount,
}

/// Cost of storing `size_bytes` for `duration` epochs with each provider
pub fn estimate_cost(
    providers: &[ProviderProfile],
    size_bytes: u64,
    duration: ChainEpoch,
    verified: bool,
) -> VaultResult<CostEstimate> {
    if duration <= 0 {
        return Err(VaultError::validation(format!(
            "duration must be positive, got {duration}"
        )));
    }
    if providers.is_empty() {
        return Err(VaultError::not_found("storage providers to price against"));
    }

    let breakdown: Vec<ProviderCost> = providers
        .iter()
        .map(|p| {
            let price = p.price_for(verified).clone();
            let total = storage_cost(&price, size_bytes, duration);
            ProviderCost {
                miner_id: p.miner_id.clone(),
                total_fil: atto_to_fil(&total),
                price_per_gib_epoch: price,
                total,
            }
        })
        .collect();

    let mut min = breakdown[0].total.atto().clone();
    let mut max = min.clone();
    let mut sum = BigInt::from(0);
    for cost in &breakdown {
        let atto = cost.total.atto();
        if atto < &min {
            min = atto.clone();
        }
        if atto > &max {
            max = atto.clone();
        }
        sum += atto;
    }
    let avg = sum / BigInt::from(breakdown.len());
    let padded = padded_piece_size(size_bytes);

    Ok(CostEstimate {
        size_bytes,
        padded_size: padded,
        size_gib: bytes_to_gib_ceil(padded),
        duration_epochs: duration,
        verified,
        providers: breakdown,
        min: TokenAmount::from_atto(min),
        avg: TokenAmount::from_atto(avg),
        max: TokenAmount::from_atto(max),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::units::GIB;

    fn provider(id: &str, price: u64) -> ProviderProfile {
        ProviderProfile {
            miner_id: id.to_string(),
            peer_id: String::new(),
            raw_power: 0,
            network_raw_power: 0,
            price: TokenAmount::from_atto(price),
            verified_price: TokenAmount::from_atto(0),
            min_piece_size: 0,
            max_piece_size: u64::MAX,
            sector_size: 0,
            region: None,
            probe_latency_ms: 0,
            reputation_score: 0.0,
        }
    }

    #[test]
    fn linear_in_duration_and_gib() {
        let price = TokenAmount::from_atto(7u64);
        let one = storage_cost(&price, GIB, 100);
        assert_eq!(storage_cost(&price, GIB, 300).atto(), &(one.atto() * BigInt::from(3)));
        // 3 GiB pads to 4 GiB
        assert_eq!(storage_cost(&price, 3 * GIB, 100).atto(), &(one.atto() * BigInt::from(4)));
    }

    #[test]
    fn ten_mib_across_three_providers() {
        let providers = vec![
            provider("f01", 100_000_000_000),
            provider("f02", 200_000_000_000),
            provider("f03", 300_000_000_000),
        ];
        let estimate = estimate_cost(&providers, 10 * 1024 * 1024, 1000, false).unwrap();
        assert_eq!(estimate.padded_size, 16 * 1024 * 1024);
        assert_eq!(estimate.size_gib, 1);
        let totals: Vec<_> = estimate.providers.iter().map(|p| p.total.atto().clone()).collect();
        assert!(totals[0] < totals[1] && totals[1] < totals[2]);
        assert_eq!(totals[0], BigInt::from(100_000_000_000_000u64));
        assert!(estimate.min.atto() <= estimate.avg.atto());
        assert!(estimate.avg.atto() <= estimate.max.atto());
        assert_eq!(estimate.avg.atto(), &BigInt::from(200_000_000_000_000u64));
    }

    #[test]
    fn rejects_empty_sets_and_bad_durations() {
        assert!(estimate_cost(&[], 1, 1, false).unwrap_err().is_not_found());
        assert!(estimate_cost(&[provider("f01", 1)], 1, 0, false).is_err());
    }
}
