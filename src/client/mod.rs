// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

pub mod lotus;
pub mod memory;
pub mod types;

use std::path::Path;

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::clock::ChainEpoch;

pub use lotus::LotusClient;
pub use memory::MemoryNode;
pub use types::{
    ApiVersion, CIDMap, ChainHead, CommPResult, DataRef, DealInfo, ImportResult, MarketDeal,
    MinerInfo, MinerPower, QueryOffer, StartDealParams, StorageAsk,
};

use crate::error::VaultResult;

/// Node calls the deal and retrieval layers depend on.
///
/// `LotusClient` is the production implementation; tests substitute
/// in-memory nodes.
#[async_trait]
pub trait StorageNode: Send + Sync {
    async fn version(&self) -> VaultResult<ApiVersion>;

    async fn chain_head(&self) -> VaultResult<ChainHead>;

    /// Every miner actor known to the chain
    async fn list_miners(&self) -> VaultResult<Vec<String>>;

    async fn miner_power(&self, miner: &str) -> VaultResult<MinerPower>;

    async fn miner_info(&self, miner: &str) -> VaultResult<MinerInfo>;

    async fn query_ask(&self, peer_id: &str, miner: &str) -> VaultResult<StorageAsk>;

    /// Import a file (or CAR) into the node's client store
    async fn import(&self, path: &Path, is_car: bool) -> VaultResult<ImportResult>;

    /// Piece commitment and padded size of a file
    async fn calc_commp(&self, path: &Path) -> VaultResult<CommPResult>;

    /// Submit a deal proposal; returns the proposal CID
    async fn start_deal(&self, params: &StartDealParams) -> VaultResult<Cid>;

    async fn deal_info(&self, proposal: &Cid) -> VaultResult<DealInfo>;

    async fn market_deal(&self, deal_id: u64) -> VaultResult<MarketDeal>;

    /// Retrieval offers for a payload CID
    async fn find_data(&self, root: &Cid) -> VaultResult<Vec<QueryOffer>>;

    async fn query_offer(&self, miner: &str, root: &Cid) -> VaultResult<QueryOffer>;

    /// Retrieve an offer's payload to `out`
    async fn retrieve(&self, offer: &QueryOffer, out: &Path, is_car: bool) -> VaultResult<()>;

    async fn current_epoch(&self) -> VaultResult<ChainEpoch> {
        Ok(self.chain_head().await?.height)
    }

    async fn is_connected(&self) -> bool {
        self.version().await.is_ok()
    }
}
