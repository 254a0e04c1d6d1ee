// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use fvm_shared::econ::TokenAmount;
use futures::future::join_all;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::StorageNode;
use crate::config::DealConfig;
use crate::error::{VaultError, VaultResult};
use crate::utils::units::{atto_string, parse_atto, GIB};

/// Reputation component caps; they sum to 100
const POWER_WEIGHT: f64 = 40.0;
const PRICE_WEIGHT: f64 = 25.0;
const VERIFIED_PRICE_WEIGHT: f64 = 15.0;
const REACHABILITY_WEIGHT: f64 = 10.0;
const SECTOR_WEIGHT: f64 = 10.0;

/// Network power share at which the power component saturates
const POWER_SHARE_CAP: f64 = 0.01;

/// A provider as seen during one discovery pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProfile {
    pub miner_id: String,
    pub peer_id: String,
    pub raw_power: u128,
    pub network_raw_power: u128,
    /// attoFIL per GiB per epoch
    #[serde(with = "atto_string")]
    pub price: TokenAmount,
    #[serde(with = "atto_string")]
    pub verified_price: TokenAmount,
    pub min_piece_size: u64,
    pub max_piece_size: u64,
    pub sector_size: u64,
    pub region: Option<String>,
    pub probe_latency_ms: u64,
    /// 0 to 100
    pub reputation_score: f64,
}

impl ProviderProfile {
    pub fn power_share(&self) -> f64 {
        if self.network_raw_power == 0 {
            return 0.0;
        }
        self.raw_power as f64 / self.network_raw_power as f64
    }

    /// Ask price for the deal type
    pub fn price_for(&self, verified: bool) -> &TokenAmount {
        if verified {
            &self.verified_price
        } else {
            &self.price
        }
    }

    pub fn accepts_piece(&self, padded_size: u64) -> bool {
        padded_size >= self.min_piece_size && padded_size <= self.max_piece_size
    }
}

/// Filters applied after probing; unset fields do not filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderCriteria {
    /// Bytes the provider must accept in a single piece
    pub min_free_space: Option<u64>,
    #[serde(with = "atto_string::option")]
    pub max_price: Option<TokenAmount>,
    pub region: Option<String>,
    pub min_reputation: Option<f64>,
    /// Padded piece size the provider must accept
    pub piece_size: Option<u64>,
    pub verified: bool,
    pub limit: Option<usize>,
}

impl ProviderCriteria {
    pub fn matches(&self, profile: &ProviderProfile) -> bool {
        if let Some(space) = self.min_free_space {
            if profile.max_piece_size < space {
                return false;
            }
        }
        if let Some(max) = &self.max_price {
            if profile.price_for(self.verified).atto() > max.atto() {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if profile.region.as_deref() != Some(region.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_reputation {
            if profile.reputation_score < min {
                return false;
            }
        }
        if let Some(size) = self.piece_size {
            if !profile.accepts_piece(size) {
                return false;
            }
        }
        true
    }
}

fn atto_f64(amount: &TokenAmount) -> f64 {
    amount.atto().to_f64().unwrap_or(f64::MAX)
}

/// 1.0 for the cheapest price in the set, 0.0 for the most expensive
fn attractiveness(price: f64, min: f64, max: f64) -> f64 {
    if max <= min {
        return 1.0;
    }
    ((max - price) / (max - min)).clamp(0.0, 1.0)
}

fn sector_component(sector_size: u64) -> f64 {
    match sector_size {
        s if s >= 64 * GIB => SECTOR_WEIGHT,
        s if s >= 32 * GIB => SECTOR_WEIGHT / 2.0,
        _ => 0.0,
    }
}

/// Fill in `reputation_score` for every profile, relative to the set
pub fn score_providers(profiles: &mut [ProviderProfile], probe_timeout: Duration) {
    let (mut min, mut max) = (f64::MAX, f64::MIN);
    let (mut vmin, mut vmax) = (f64::MAX, f64::MIN);
    for p in profiles.iter() {
        let price = atto_f64(&p.price);
        let verified = atto_f64(&p.verified_price);
        min = min.min(price);
        max = max.max(price);
        vmin = vmin.min(verified);
        vmax = vmax.max(verified);
    }
    let timeout_ms = probe_timeout.as_millis().max(1) as f64;

    for p in profiles.iter_mut() {
        let power = POWER_WEIGHT * (p.power_share() / POWER_SHARE_CAP).min(1.0);
        let price = PRICE_WEIGHT * attractiveness(atto_f64(&p.price), min, max);
        let verified =
            VERIFIED_PRICE_WEIGHT * attractiveness(atto_f64(&p.verified_price), vmin, vmax);
        let reach = REACHABILITY_WEIGHT * (1.0 - p.probe_latency_ms as f64 / timeout_ms).clamp(0.0, 1.0);
        let sector = sector_component(p.sector_size);
        p.reputation_score = (power + price + verified + reach + sector).clamp(0.0, 100.0);
    }
}

/// Price ascending, then reputation descending
pub fn rank_by_price(profiles: &mut [ProviderProfile], verified: bool) {
    profiles.sort_by(|a, b| {
        a.price_for(verified)
            .atto()
            .cmp(b.price_for(verified).atto())
            .then_with(|| {
                b.reputation_score
                    .partial_cmp(&a.reputation_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.miner_id.cmp(&b.miner_id))
    });
}

/// Reputation descending, then price ascending
pub fn rank_by_reputation(profiles: &mut [ProviderProfile], verified: bool) {
    profiles.sort_by(|a, b| {
        b.reputation_score
            .partial_cmp(&a.reputation_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.price_for(verified).atto().cmp(b.price_for(verified).atto()))
            .then_with(|| a.miner_id.cmp(&b.miner_id))
    });
}

fn parse_power(value: &str, field: &str, miner: &str) -> VaultResult<u128> {
    value
        .parse()
        .map_err(|_| VaultError::validation(format!("{miner}: bad {field} '{value}'")))
}

/// Collect power, info and ask for one miner; any missing field fails
pub async fn probe_provider(
    node: &dyn StorageNode,
    miner: &str,
    regions: &HashMap<String, String>,
) -> VaultResult<ProviderProfile> {
    let started = Instant::now();
    let power = node.miner_power(miner).await?;
    let info = node.miner_info(miner).await?;
    let peer_id = info
        .peer_id
        .clone()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| VaultError::not_found(format!("peer id of {miner}")))?;
    let ask = node.query_ask(&peer_id, miner).await?;
    let latency = started.elapsed();

    Ok(ProviderProfile {
        miner_id: miner.to_string(),
        peer_id,
        raw_power: parse_power(&power.miner_power.raw_byte_power, "raw power", miner)?,
        network_raw_power: parse_power(&power.total_power.raw_byte_power, "total power", miner)?,
        price: parse_atto(&ask.price)?,
        verified_price: parse_atto(&ask.verified_price)?,
        min_piece_size: ask.min_piece_size,
        max_piece_size: ask.max_piece_size,
        sector_size: info.sector_size,
        region: regions.get(miner).cloned(),
        probe_latency_ms: latency.as_millis() as u64,
        reputation_score: 0.0,
    })
}

/// Probe the first `provider_fanout` miners concurrently, each under its
/// own timeout. Failed probes are skipped; if every probe fails the
/// result is `ExhaustedProviders`.
pub async fn find_storage_providers(
    node: &dyn StorageNode,
    config: &DealConfig,
    criteria: &ProviderCriteria,
) -> VaultResult<Vec<ProviderProfile>> {
    let miners = node.list_miners().await?;
    let candidates: Vec<String> = miners.into_iter().take(config.provider_fanout).collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let timeout = config.probe_timeout();

    let probes = candidates.iter().map(|miner| async move {
        let result = match tokio::time::timeout(
            timeout,
            probe_provider(node, miner, &config.provider_regions),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(VaultError::network(format!("probe timed out after {timeout:?}"))),
        };
        (miner, result)
    });

    let mut profiles = Vec::new();
    let mut failures = Vec::new();
    for (miner, result) in join_all(probes).await {
        match result {
            Ok(profile) => profiles.push(profile),
            Err(e) => {
                warn!("skipping provider {miner}: {e}");
                failures.push(format!("{miner}: {e}"));
            }
        }
    }
    if profiles.is_empty() {
        return Err(VaultError::exhausted(failures));
    }

    score_providers(&mut profiles, timeout);
    let probed = profiles.len();
    profiles.retain(|p| criteria.matches(p));
    rank_by_price(&mut profiles, criteria.verified);
    if let Some(limit) = criteria.limit {
        profiles.truncate(limit);
    }
    debug!(
        "{} of {} probed providers match criteria",
        profiles.len(),
        probed
    );
    info!("found {} storage providers", profiles.len());
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryNode;

    fn profile(id: &str, price: u64, score: f64) -> ProviderProfile {
        ProviderProfile {
            miner_id: id.to_string(),
            peer_id: format!("peer-{id}"),
            raw_power: 1,
            network_raw_power: 100,
            price: TokenAmount::from_atto(price),
            verified_price: TokenAmount::from_atto(price / 2),
            min_piece_size: 256,
            max_piece_size: 32 * GIB,
            sector_size: 32 * GIB,
            region: None,
            probe_latency_ms: 0,
            reputation_score: score,
        }
    }

    #[test]
    fn ranking_breaks_price_ties_by_reputation() {
        let mut list = vec![
            profile("f03", 300, 90.0),
            profile("f02", 100, 10.0),
            profile("f01", 100, 50.0),
        ];
        rank_by_price(&mut list, false);
        let ids: Vec<_> = list.iter().map(|p| p.miner_id.as_str()).collect();
        assert_eq!(ids, vec!["f01", "f02", "f03"]);

        rank_by_reputation(&mut list, false);
        assert_eq!(list[0].miner_id, "f03");
    }

    #[test]
    fn scores_are_bounded() {
        let mut list = vec![
            profile("f01", 100, 0.0),
            profile("f02", 200, 0.0),
            profile("f03", 300, 0.0),
        ];
        list[0].raw_power = 100;
        list[0].sector_size = 64 * GIB;
        score_providers(&mut list, Duration::from_secs(10));
        for p in &list {
            assert!((0.0..=100.0).contains(&p.reputation_score));
        }
        assert!(list[0].reputation_score > list[2].reputation_score);
        // saturated power, cheapest on both asks, instant probe, 64 GiB sectors
        assert!((list[0].reputation_score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn criteria_filter() {
        let mut p = profile("f01", 100, 60.0);
        p.region = Some("eu".to_string());
        let mut c = ProviderCriteria::default();
        assert!(c.matches(&p));
        c.region = Some("us".to_string());
        assert!(!c.matches(&p));
        c.region = Some("eu".to_string());
        c.max_price = Some(TokenAmount::from_atto(99));
        assert!(!c.matches(&p));
        c.verified = true;
        assert!(c.matches(&p));
        c.min_reputation = Some(70.0);
        assert!(!c.matches(&p));
        c.min_reputation = None;
        c.min_free_space = Some(64 * GIB);
        assert!(!c.matches(&p));
    }

    #[tokio::test]
    async fn discovery_skips_failing_providers() {
        let node = MemoryNode::new(0);
        node.add_miner("f01000", 300, 1 << 40);
        node.add_miner("f01001", 100, 1 << 40);
        node.add_miner("f01002", 200, 1 << 40);
        node.set_reachable("f01002", false);

        let found = find_storage_providers(&node, &DealConfig::default(), &ProviderCriteria::default())
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|p| p.miner_id.as_str()).collect();
        assert_eq!(ids, vec!["f01001", "f01000"]);
    }

    #[tokio::test]
    async fn all_probes_failing_is_exhaustion() {
        let node = MemoryNode::new(0);
        node.add_miner("f01000", 300, 1);
        node.set_reachable("f01000", false);
        let err = find_storage_providers(&node, &DealConfig::default(), &ProviderCriteria::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::ExhaustedProviders { .. }));
    }
}
