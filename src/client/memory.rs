// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! In-memory node for tests and offline runs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use multihash_codetable::{Code, MultihashDigest};
use parking_lot::Mutex;

use super::types::{
    ApiVersion, CIDMap, ChainHead, CommPResult, DealInfo, DealProposal, ImportResult, MarketDeal,
    MarketDealState, MinerInfo, MinerPower, PowerClaim, QueryOffer, StartDealParams, StorageAsk,
};
use super::StorageNode;
use crate::error::{VaultError, VaultResult};
use crate::utils::cid::{dag_cbor_cid, raw_cid};
use crate::utils::units::padded_piece_size;

/// Multicodec of an unsealed piece commitment
const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;

/// Lotus state code of an accepted, not yet published proposal
const STATE_PROPOSAL_ACCEPTED: u64 = 3;
/// Lotus state code of an active deal
const STATE_ACTIVE: u64 = 7;

#[derive(Debug, Clone)]
pub struct MemoryMiner {
    pub power: MinerPower,
    pub info: MinerInfo,
    pub ask: Option<StorageAsk>,
    /// Calls against an unreachable miner fail with a network error
    pub reachable: bool,
}

#[derive(Debug, Default)]
struct State {
    head: ChainEpoch,
    miners: BTreeMap<String, MemoryMiner>,
    content: HashMap<Cid, Vec<u8>>,
    offers: HashMap<Cid, Vec<QueryOffer>>,
    deals: HashMap<Cid, DealInfo>,
    proposals: Vec<StartDealParams>,
    market: HashMap<u64, MarketDeal>,
    polls: HashMap<Cid, u32>,
    next_deal_id: u64,
    /// `None` keeps proposals pending forever
    publish_after_polls: Option<u32>,
    failing_retrievals: HashSet<String>,
}

/// A `StorageNode` backed by maps. Proposals are published after a
/// configurable number of `deal_info` polls.
#[derive(Debug, Default)]
pub struct MemoryNode {
    state: Mutex<State>,
}

impl MemoryNode {
    pub fn new(head: ChainEpoch) -> Self {
        let node = Self::default();
        {
            let mut state = node.state.lock();
            state.head = head;
            state.next_deal_id = 1_000;
            state.publish_after_polls = Some(1);
        }
        node
    }

    pub fn set_head(&self, head: ChainEpoch) {
        self.state.lock().head = head;
    }

    /// Register a miner with a peer id, 32 GiB sectors and an ask at
    /// `price` attoFIL per GiB per epoch
    pub fn add_miner(&self, id: &str, price: u64, raw_power: u128) {
        let miner = MemoryMiner {
            power: MinerPower {
                miner_power: PowerClaim {
                    raw_byte_power: raw_power.to_string(),
                    quality_adj_power: raw_power.to_string(),
                },
                total_power: PowerClaim {
                    raw_byte_power: (raw_power * 100).max(1).to_string(),
                    quality_adj_power: (raw_power * 100).max(1).to_string(),
                },
                has_min_power: true,
            },
            info: MinerInfo {
                owner: id.to_string(),
                worker: id.to_string(),
                peer_id: Some(format!("12D3KooW{id}")),
                multiaddrs: None,
                sector_size: 32 << 30,
            },
            ask: Some(StorageAsk {
                price: price.to_string(),
                verified_price: (price / 10).to_string(),
                min_piece_size: 256,
                max_piece_size: 32 << 30,
                miner: id.to_string(),
            }),
            reachable: true,
        };
        self.insert_miner(id, miner);
    }

    pub fn insert_miner(&self, id: &str, miner: MemoryMiner) {
        self.state.lock().miners.insert(id.to_string(), miner);
    }

    pub fn set_reachable(&self, id: &str, reachable: bool) {
        if let Some(miner) = self.state.lock().miners.get_mut(id) {
            miner.reachable = reachable;
        }
    }

    /// Publish proposals after `polls` status queries, or never
    pub fn publish_after(&self, polls: Option<u32>) {
        self.state.lock().publish_after_polls = polls;
    }

    /// Offer `data` under `root` from `miner`
    pub fn add_offer(&self, root: Cid, miner: &str, data: Vec<u8>, unseal_price: u64, price_per_byte: u64) {
        let mut state = self.state.lock();
        let offer = QueryOffer {
            err: String::new(),
            root: CIDMap::from(root),
            piece: None,
            size: data.len() as u64,
            min_price: String::new(),
            unseal_price: unseal_price.to_string(),
            price_per_byte: price_per_byte.to_string(),
            payment_interval: 1 << 20,
            payment_interval_increase: 1 << 20,
            miner: miner.to_string(),
            miner_peer: None,
        };
        state.offers.entry(root).or_default().push(offer);
        state.content.insert(root, data);
    }

    pub fn fail_retrievals_from(&self, miner: &str) {
        self.state.lock().failing_retrievals.insert(miner.to_string());
    }

    /// Insert an on-chain deal directly
    pub fn insert_market_deal(&self, deal_id: u64, deal: MarketDeal) {
        self.state.lock().market.insert(deal_id, deal);
    }

    /// Every proposal submitted so far
    pub fn proposals(&self) -> Vec<StartDealParams> {
        self.state.lock().proposals.clone()
    }

    /// Bytes imported under `root`
    pub fn content(&self, root: &Cid) -> Option<Vec<u8>> {
        self.state.lock().content.get(root).cloned()
    }

    fn with_miner<T>(&self, miner: &str, f: impl FnOnce(&MemoryMiner) -> T) -> VaultResult<T> {
        let state = self.state.lock();
        let entry = state
            .miners
            .get(miner)
            .ok_or_else(|| VaultError::not_found(format!("miner {miner}")))?;
        if !entry.reachable {
            return Err(VaultError::network(format!("miner {miner} unreachable")));
        }
        Ok(f(entry))
    }
}

#[async_trait]
impl StorageNode for MemoryNode {
    async fn version(&self) -> VaultResult<ApiVersion> {
        Ok(ApiVersion {
            version: "memory".to_string(),
            api_version: 0x0001_0000,
            block_delay: 30,
        })
    }

    async fn chain_head(&self) -> VaultResult<ChainHead> {
        let height = self.state.lock().head;
        Ok(ChainHead {
            cids: vec![CIDMap::from(raw_cid(&height.to_be_bytes()))],
            height,
        })
    }

    async fn list_miners(&self) -> VaultResult<Vec<String>> {
        Ok(self.state.lock().miners.keys().cloned().collect())
    }

    async fn miner_power(&self, miner: &str) -> VaultResult<MinerPower> {
        self.with_miner(miner, |m| m.power.clone())
    }

    async fn miner_info(&self, miner: &str) -> VaultResult<MinerInfo> {
        self.with_miner(miner, |m| m.info.clone())
    }

    async fn query_ask(&self, _peer_id: &str, miner: &str) -> VaultResult<StorageAsk> {
        self.with_miner(miner, |m| m.ask.clone())?
            .ok_or_else(|| VaultError::not_found(format!("ask for {miner}")))
    }

    async fn import(&self, path: &Path, is_car: bool) -> VaultResult<ImportResult> {
        let data = tokio::fs::read(path).await?;
        let root = if is_car {
            crate::car::get_root_cid(&data)?
        } else {
            raw_cid(&data)
        };
        let mut state = self.state.lock();
        state.content.insert(root, data);
        let import_id = state.content.len() as u64;
        Ok(ImportResult {
            root: CIDMap::from(root),
            import_id,
        })
    }

    async fn calc_commp(&self, path: &Path) -> VaultResult<CommPResult> {
        let data = tokio::fs::read(path).await?;
        let piece = Cid::new_v1(FIL_COMMITMENT_UNSEALED, Code::Sha2_256.digest(&data));
        Ok(CommPResult {
            root: CIDMap::from(piece),
            size: padded_piece_size(data.len() as u64),
        })
    }

    async fn start_deal(&self, params: &StartDealParams) -> VaultResult<Cid> {
        let mut encoded = serde_json::to_vec(params)?;
        let mut state = self.state.lock();
        encoded.extend_from_slice(&(state.proposals.len() as u64).to_be_bytes());
        if !state.miners.contains_key(&params.miner) {
            return Err(VaultError::not_found(format!("miner {}", params.miner)));
        }
        let proposal = dag_cbor_cid(&encoded);
        state.proposals.push(params.clone());
        state.deals.insert(
            proposal,
            DealInfo {
                proposal_cid: CIDMap::from(proposal),
                state: STATE_PROPOSAL_ACCEPTED,
                message: String::new(),
                provider: params.miner.clone(),
                piece_cid: params.data.piece_cid.clone(),
                size: params.data.piece_size,
                price_per_epoch: params.epoch_price.clone(),
                duration: params.min_blocks_duration,
                deal_id: 0,
                verified: params.verified_deal,
            },
        );
        Ok(proposal)
    }

    async fn deal_info(&self, proposal: &Cid) -> VaultResult<DealInfo> {
        let mut state = self.state.lock();
        let polls = {
            let count = state.polls.entry(*proposal).or_insert(0);
            *count += 1;
            *count
        };
        let publish = state.publish_after_polls.is_some_and(|after| polls >= after);
        let mut info = state
            .deals
            .get(proposal)
            .cloned()
            .ok_or_else(|| VaultError::not_found(format!("proposal {proposal}")))?;
        if publish && info.deal_id == 0 {
            info.deal_id = state.next_deal_id;
            info.state = STATE_ACTIVE;
            state.next_deal_id += 1;
            let params = state
                .proposals
                .iter()
                .find(|p| p.miner == info.provider && p.data.piece_cid == info.piece_cid)
                .cloned();
            if let Some(params) = params {
                let market = MarketDeal {
                    proposal: DealProposal {
                        piece_cid: params.data.piece_cid.clone().unwrap_or_else(|| params.data.root.clone()),
                        piece_size: padded_piece_size(params.data.piece_size),
                        verified_deal: params.verified_deal,
                        client: params.wallet.clone(),
                        provider: params.miner.clone(),
                        label: params.data.root.cid.clone(),
                        start_epoch: params.deal_start_epoch,
                        end_epoch: params.deal_start_epoch + params.min_blocks_duration as ChainEpoch,
                        storage_price_per_epoch: params.epoch_price.clone(),
                    },
                    state: MarketDealState {
                        sector_start_epoch: -1,
                        last_updated_epoch: -1,
                        slash_epoch: -1,
                    },
                };
                state.market.insert(info.deal_id, market);
            }
            state.deals.insert(*proposal, info.clone());
        }
        Ok(info)
    }

    async fn market_deal(&self, deal_id: u64) -> VaultResult<MarketDeal> {
        self.state
            .lock()
            .market
            .get(&deal_id)
            .cloned()
            .ok_or_else(|| VaultError::not_found(format!("deal {deal_id}")))
    }

    async fn find_data(&self, root: &Cid) -> VaultResult<Vec<QueryOffer>> {
        Ok(self.state.lock().offers.get(root).cloned().unwrap_or_default())
    }

    async fn query_offer(&self, miner: &str, root: &Cid) -> VaultResult<QueryOffer> {
        self.state
            .lock()
            .offers
            .get(root)
            .and_then(|offers| offers.iter().find(|o| o.miner == miner).cloned())
            .ok_or_else(|| VaultError::not_found(format!("offer for {root} from {miner}")))
    }

    async fn retrieve(&self, offer: &QueryOffer, out: &Path, _is_car: bool) -> VaultResult<()> {
        let root = Cid::try_from(&offer.root)?;
        let data = {
            let state = self.state.lock();
            if state.failing_retrievals.contains(&offer.miner) {
                return Err(VaultError::network(format!(
                    "retrieval from {} failed",
                    offer.miner
                )));
            }
            state
                .content
                .get(&root)
                .cloned()
                .ok_or_else(|| VaultError::not_found(format!("content {root}")))?
        };
        tokio::fs::write(out, data).await?;
        Ok(())
    }
}
