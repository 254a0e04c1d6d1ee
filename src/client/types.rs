// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// Helper struct to interact with lotus node
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CIDMap {
    #[serde(rename = "/")]
    pub cid: String,
}

impl From<Cid> for CIDMap {
    fn from(cid: Cid) -> Self {
        Self {
            cid: cid.to_string(),
        }
    }
}

impl From<&Cid> for CIDMap {
    fn from(cid: &Cid) -> Self {
        Self {
            cid: cid.to_string(),
        }
    }
}

impl TryFrom<&CIDMap> for Cid {
    type Error = VaultError;

    fn try_from(cid_map: &CIDMap) -> VaultResult<Self> {
        crate::utils::cid::parse_cid(&cid_map.cid)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ApiVersion {
    pub version: String,
    #[serde(rename = "APIVersion")]
    pub api_version: u64,
    #[serde(default)]
    pub block_delay: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ChainHead {
    pub cids: Vec<CIDMap>,
    pub height: ChainEpoch,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PowerClaim {
    pub raw_byte_power: String,
    pub quality_adj_power: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MinerPower {
    pub miner_power: PowerClaim,
    pub total_power: PowerClaim,
    #[serde(default)]
    pub has_min_power: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MinerInfo {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub worker: String,
    #[serde(rename = "PeerId", default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub multiaddrs: Option<Vec<String>>,
    #[serde(default)]
    pub sector_size: u64,
}

/// Provider ask: `{Price, VerifiedPrice, MinPieceSize, MaxPieceSize}`
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct StorageAsk {
    /// attoFIL per GiB per epoch
    pub price: String,
    pub verified_price: String,
    pub min_piece_size: u64,
    pub max_piece_size: u64,
    #[serde(default)]
    pub miner: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct FileRef {
    pub path: String,
    #[serde(rename = "IsCAR")]
    pub is_car: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct ImportResult {
    pub root: CIDMap,
    #[serde(rename = "ImportID", default)]
    pub import_id: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct CommPResult {
    pub root: CIDMap,
    pub size: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DataRef {
    pub transfer_type: String,
    pub root: CIDMap,
    #[serde(rename = "PieceCid", skip_serializing_if = "Option::is_none")]
    pub piece_cid: Option<CIDMap>,
    #[serde(default)]
    pub piece_size: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct StartDealParams {
    pub data: DataRef,
    pub wallet: String,
    pub miner: String,
    /// attoFIL per epoch for the whole piece
    pub epoch_price: String,
    pub min_blocks_duration: u64,
    #[serde(default)]
    pub provider_collateral: String,
    pub deal_start_epoch: ChainEpoch,
    pub fast_retrieval: bool,
    pub verified_deal: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DealInfo {
    pub proposal_cid: CIDMap,
    pub state: u64,
    #[serde(default)]
    pub message: String,
    pub provider: String,
    #[serde(rename = "PieceCID", default)]
    pub piece_cid: Option<CIDMap>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub price_per_epoch: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(rename = "DealID", default)]
    pub deal_id: u64,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DealProposal {
    #[serde(rename = "PieceCID")]
    pub piece_cid: CIDMap,
    pub piece_size: u64,
    pub verified_deal: bool,
    pub client: String,
    pub provider: String,
    #[serde(default)]
    pub label: String,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: String,
}

/// On-chain deal state; epochs are -1 when unset
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct MarketDealState {
    pub sector_start_epoch: ChainEpoch,
    pub last_updated_epoch: ChainEpoch,
    pub slash_epoch: ChainEpoch,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct MarketDeal {
    pub proposal: DealProposal,
    pub state: MarketDealState,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct QueryOffer {
    #[serde(default)]
    pub err: String,
    pub root: CIDMap,
    #[serde(default)]
    pub piece: Option<CIDMap>,
    pub size: u64,
    #[serde(default)]
    pub min_price: String,
    #[serde(default)]
    pub unseal_price: String,
    #[serde(default)]
    pub price_per_byte: String,
    #[serde(default)]
    pub payment_interval: u64,
    #[serde(default)]
    pub payment_interval_increase: u64,
    pub miner: String,
    #[serde(default)]
    pub miner_peer: Option<serde_json::Value>,
}

impl QueryOffer {
    pub fn is_usable(&self) -> bool {
        self.err.is_empty()
    }
}
