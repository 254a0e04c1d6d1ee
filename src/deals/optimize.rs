// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::str::FromStr;

use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::cost::storage_cost;
use super::providers::{rank_by_price, rank_by_reputation, ProviderProfile};
use crate::config::{DealConfig, EPOCHS_PER_DAY};
use crate::error::{VaultError, VaultResult};
use crate::utils::units::{atto_string, padded_piece_size, GIB, TIB};

/// Datasets above this size are split across several deals
pub const CHUNKING_THRESHOLD: u64 = 32 * GIB;

/// One year, the medium duration candidate before clamping
const MEDIUM_DURATION_EPOCHS: ChainEpoch = 365 * EPOCHS_PER_DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityFactor {
    Cost,
    Reliability,
    #[default]
    Balanced,
}

impl FromStr for PriorityFactor {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cost" => Ok(PriorityFactor::Cost),
            "reliability" => Ok(PriorityFactor::Reliability),
            "balanced" => Ok(PriorityFactor::Balanced),
            other => Err(VaultError::validation(format!(
                "unknown priority factor '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationLabel {
    Short,
    Medium,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationCandidate {
    pub label: DurationLabel,
    pub epochs: ChainEpoch,
}

/// Short, medium and long candidates within the configured bounds
pub fn duration_candidates(config: &DealConfig) -> [DurationCandidate; 3] {
    let min = config.min_duration_epochs;
    let max = config.max_duration_epochs.max(min);
    [
        DurationCandidate {
            label: DurationLabel::Short,
            epochs: min,
        },
        DurationCandidate {
            label: DurationLabel::Medium,
            epochs: MEDIUM_DURATION_EPOCHS.clamp(min, max),
        },
        DurationCandidate {
            label: DurationLabel::Long,
            epochs: max,
        },
    ]
}

/// Pick a duration for `priority`.
///
/// Storage is billed linearly per epoch, so no candidate is cheaper per
/// epoch than another. `Cost` therefore takes the smallest total
/// commitment, which is the shortest candidate; ties go to the shorter.
pub fn select_duration(
    candidates: &[DurationCandidate; 3],
    priority: PriorityFactor,
    price: &TokenAmount,
    size_bytes: u64,
) -> DurationCandidate {
    match priority {
        PriorityFactor::Reliability => candidates[2],
        PriorityFactor::Balanced => candidates[1],
        PriorityFactor::Cost => candidates
            .iter()
            .copied()
            .min_by_key(|c| (storage_cost(price, size_bytes, c.epochs).atto().clone(), c.epochs))
            .unwrap_or(candidates[0]),
    }
}

/// Replication for a priority, bounded by an optional budget.
///
/// With a budget: `min(max, floor(budget / per_replica))`, never below
/// `min`. Without one, each priority has a fixed target.
pub fn replication_factor(
    priority: PriorityFactor,
    budget: Option<&TokenAmount>,
    per_replica: &TokenAmount,
    min: usize,
    max: usize,
) -> usize {
    let max = max.max(min);
    let target = match budget {
        Some(budget) if !per_replica.atto().is_zero() => {
            let affordable = (budget.atto() / per_replica.atto())
                .to_usize()
                .unwrap_or(if budget.atto().sign() == fvm_shared::bigint::Sign::Minus {
                    0
                } else {
                    usize::MAX
                });
            affordable.min(max)
        }
        Some(_) => max,
        None => match priority {
            PriorityFactor::Cost => min,
            PriorityFactor::Balanced => 2,
            PriorityFactor::Reliability => 3,
        },
    };
    target.clamp(min, max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingPlan {
    pub chunks: u64,
    pub chunk_size: u64,
    pub last_chunk_size: u64,
    pub padded_size_per_chunk: u64,
    pub total_padded_size: u64,
}

impl ChunkingPlan {
    /// Split `size` into `chunk_size` pieces
    pub fn new(size: u64, chunk_size: u64) -> VaultResult<Self> {
        if chunk_size == 0 {
            return Err(VaultError::validation("chunk size must be positive"));
        }
        let chunks = size.div_ceil(chunk_size).max(1);
        let last_chunk_size = size - (chunks - 1) * chunk_size;
        let padded_size_per_chunk = padded_piece_size(chunk_size);
        let total_padded_size =
            padded_size_per_chunk * (chunks - 1) + padded_piece_size(last_chunk_size);
        Ok(Self {
            chunks,
            chunk_size,
            last_chunk_size,
            padded_size_per_chunk,
            total_padded_size,
        })
    }

    /// Byte range of chunk `index`
    pub fn range(&self, index: u64) -> std::ops::Range<u64> {
        let start = index * self.chunk_size;
        let len = if index + 1 == self.chunks {
            self.last_chunk_size
        } else {
            self.chunk_size
        };
        start..start + len
    }
}

/// Graduated chunk size for datasets over the threshold
pub fn chunk_size_for(size: u64) -> u64 {
    if size <= 512 * GIB {
        16 * GIB
    } else if size <= TIB {
        32 * GIB
    } else {
        64 * GIB
    }
}

/// Chunking plan when `size` exceeds the threshold
pub fn chunking_plan(size: u64) -> VaultResult<Option<ChunkingPlan>> {
    if size <= CHUNKING_THRESHOLD {
        return Ok(None);
    }
    ChunkingPlan::new(size, chunk_size_for(size)).map(Some)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OptimizeOptions {
    pub priority: PriorityFactor,
    #[serde(with = "atto_string::option")]
    pub budget: Option<TokenAmount>,
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedParams {
    pub priority: PriorityFactor,
    pub duration: DurationCandidate,
    pub replication: usize,
    pub providers: Vec<ProviderProfile>,
    /// Cost of one replica with the first selected provider
    #[serde(with = "atto_string")]
    pub per_replica_cost: TokenAmount,
    #[serde(with = "atto_string")]
    pub total_cost: TokenAmount,
    pub chunking: Option<ChunkingPlan>,
    pub verified: bool,
}

/// Choose duration, replication, providers and chunking for a dataset
pub fn optimize(
    size_bytes: u64,
    mut providers: Vec<ProviderProfile>,
    options: &OptimizeOptions,
    config: &DealConfig,
) -> VaultResult<OptimizedParams> {
    if providers.is_empty() {
        return Err(VaultError::not_found("storage providers to optimize over"));
    }
    match options.priority {
        PriorityFactor::Reliability => rank_by_reputation(&mut providers, options.verified),
        PriorityFactor::Cost | PriorityFactor::Balanced => {
            rank_by_price(&mut providers, options.verified)
        }
    }

    let chunking = chunking_plan(size_bytes)?;
    // with chunking, every deal carries one chunk
    let billed_size = match &chunking {
        Some(plan) => plan.total_padded_size,
        None => size_bytes,
    };

    let candidates = duration_candidates(config);
    let lead_price = providers[0].price_for(options.verified).clone();
    let duration = select_duration(&candidates, options.priority, &lead_price, billed_size);
    let per_replica = replica_cost(&lead_price, &chunking, billed_size, duration.epochs);

    let replication = replication_factor(
        options.priority,
        options.budget.as_ref(),
        &per_replica,
        config.min_replication,
        config.max_replication,
    );
    if providers.len() < replication {
        warn!(
            "replication {replication} requested but only {} providers qualify",
            providers.len()
        );
    }
    providers.truncate(replication);

    let total = providers.iter().fold(BigInt::zero(), |acc, p| {
        acc + replica_cost(p.price_for(options.verified), &chunking, billed_size, duration.epochs)
            .atto()
    });
    debug!(
        "optimized {size_bytes} bytes: {:?} duration, replication {replication}",
        duration.label
    );

    Ok(OptimizedParams {
        priority: options.priority,
        duration,
        replication,
        providers,
        per_replica_cost: per_replica,
        total_cost: TokenAmount::from_atto(total),
        chunking,
        verified: options.verified,
    })
}

fn replica_cost(
    price: &TokenAmount,
    chunking: &Option<ChunkingPlan>,
    size_bytes: u64,
    epochs: ChainEpoch,
) -> TokenAmount {
    match chunking {
        Some(plan) => {
            let full = storage_cost(price, plan.chunk_size, epochs);
            let last = storage_cost(price, plan.last_chunk_size, epochs);
            TokenAmount::from_atto(
                full.atto() * BigInt::from(plan.chunks - 1) + last.atto(),
            )
        }
        None => storage_cost(price, size_bytes, epochs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str, price: u64, score: f64) -> ProviderProfile {
        ProviderProfile {
            miner_id: id.to_string(),
            peer_id: String::new(),
            raw_power: 0,
            network_raw_power: 0,
            price: TokenAmount::from_atto(price),
            verified_price: TokenAmount::from_atto(price),
            min_piece_size: 0,
            max_piece_size: u64::MAX,
            sector_size: 0,
            region: None,
            probe_latency_ms: 0,
            reputation_score: score,
        }
    }

    #[test]
    fn duration_by_priority() {
        let config = DealConfig::default();
        let c = duration_candidates(&config);
        let price = TokenAmount::from_atto(10u64);
        assert_eq!(select_duration(&c, PriorityFactor::Cost, &price, GIB).label, DurationLabel::Short);
        assert_eq!(
            select_duration(&c, PriorityFactor::Balanced, &price, GIB).label,
            DurationLabel::Medium
        );
        assert_eq!(
            select_duration(&c, PriorityFactor::Reliability, &price, GIB).epochs,
            config.max_duration_epochs
        );
        assert_eq!(c[1].epochs, 1_051_200);
    }

    #[test]
    fn cost_priority_takes_the_smallest_commitment() {
        let c = [
            DurationCandidate {
                label: DurationLabel::Long,
                epochs: 2_000_000,
            },
            DurationCandidate {
                label: DurationLabel::Short,
                epochs: 600_000,
            },
            DurationCandidate {
                label: DurationLabel::Medium,
                epochs: 1_000_000,
            },
        ];
        let price = TokenAmount::from_atto(10u64);
        let picked = select_duration(&c, PriorityFactor::Cost, &price, GIB);
        assert_eq!(picked.label, DurationLabel::Short);
        let total = storage_cost(&price, GIB, picked.epochs);
        assert!(c.iter().all(|other| storage_cost(&price, GIB, other.epochs) >= total));

        // free storage ties every candidate; the shortest still wins
        let free = select_duration(&c, PriorityFactor::Cost, &TokenAmount::zero(), GIB);
        assert_eq!(free.epochs, 600_000);
    }

    #[test]
    fn replication_bounded_by_budget() {
        let per = TokenAmount::from_atto(100u64);
        let budget = TokenAmount::from_atto(350u64);
        assert_eq!(replication_factor(PriorityFactor::Cost, Some(&budget), &per, 1, 5), 3);
        let big = TokenAmount::from_atto(10_000u64);
        assert_eq!(replication_factor(PriorityFactor::Cost, Some(&big), &per, 1, 5), 5);
        let tiny = TokenAmount::from_atto(10u64);
        assert_eq!(replication_factor(PriorityFactor::Cost, Some(&tiny), &per, 2, 5), 2);
        assert_eq!(replication_factor(PriorityFactor::Reliability, None, &per, 1, 5), 3);
        assert_eq!(replication_factor(PriorityFactor::Cost, None, &per, 1, 5), 1);
    }

    #[test]
    fn chunking_sizes_are_graduated() {
        assert!(chunking_plan(32 * GIB).unwrap().is_none());
        let plan = chunking_plan(100 * GIB).unwrap().unwrap();
        assert_eq!(plan.chunk_size, 16 * GIB);
        assert_eq!(plan.chunks, 7);
        assert_eq!(plan.last_chunk_size, 4 * GIB);
        assert_eq!(plan.total_padded_size, 6 * 16 * GIB + 4 * GIB);
        assert_eq!(plan.range(6), 96 * GIB..100 * GIB);

        assert_eq!(chunk_size_for(600 * GIB), 32 * GIB);
        assert_eq!(chunk_size_for(2 * TIB), 64 * GIB);
    }

    #[test]
    fn chunk_count_is_ceiling() {
        let plan = ChunkingPlan::new(10, 3).unwrap();
        assert_eq!(plan.chunks, 4);
        assert_eq!(plan.last_chunk_size, 1);
        let exact = ChunkingPlan::new(9, 3).unwrap();
        assert_eq!(exact.chunks, 3);
        assert_eq!(exact.last_chunk_size, 3);
    }

    #[test]
    fn cost_priority_picks_cheapest_providers() {
        let providers = vec![
            provider("f03", 300, 90.0),
            provider("f01", 100, 20.0),
            provider("f02", 200, 50.0),
        ];
        let options = OptimizeOptions {
            priority: PriorityFactor::Cost,
            budget: None,
            verified: false,
        };
        let out = optimize(10 << 20, providers.clone(), &options, &DealConfig::default()).unwrap();
        assert_eq!(out.replication, 1);
        assert_eq!(out.providers[0].miner_id, "f01");
        assert!(out.chunking.is_none());

        let reliable = OptimizeOptions {
            priority: PriorityFactor::Reliability,
            ..options
        };
        let out = optimize(10 << 20, providers, &reliable, &DealConfig::default()).unwrap();
        assert_eq!(out.replication, 3);
        assert_eq!(out.providers[0].miner_id, "f03");
    }
}
