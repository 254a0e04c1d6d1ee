// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use cid::Cid;
use fvm_shared::bigint::Sign;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cost::{epoch_price, estimate_cost, CostEstimate};
use super::intermediary::StorageIntermediary;
use super::optimize::{optimize, ChunkingPlan, OptimizeOptions, OptimizedParams};
use super::poll::{poll_until, PollPolicy};
use super::providers::{find_storage_providers, ProviderCriteria, ProviderProfile};
use super::renewal::{create_renewal_plan, extension_duration, DealStatusReport, RenewalPlan};
use super::status::{ChainState, DealStatus, StorageDeal};
use crate::car::{CarPacker, PackInput, PackedCar};
use crate::client::{CIDMap, DataRef, DealInfo, StartDealParams, StorageNode};
use crate::config::{CarConfig, DealConfig};
use crate::error::{VaultError, VaultResult};
use crate::utils::cid::{cid_string, parse_cid};
use crate::utils::units::{atto_string, padded_piece_size, unpadded_piece_size, GIB};

/// Largest padded piece a single deal may carry
pub const MAX_PIECE_SIZE: u64 = 64 * GIB;

const TRANSFER_GRAPHSYNC: &str = "graphsync";
const TRANSFER_MANUAL: &str = "manual";

/// Per-call deal options; unset fields fall back to configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DealParams {
    /// Direct deal with this miner; `None` routes through the intermediary
    pub provider: Option<String>,
    pub duration_epochs: Option<ChainEpoch>,
    /// attoFIL per GiB per epoch; defaults to the provider's ask
    #[serde(with = "atto_string::option")]
    pub price_per_gib_epoch: Option<TokenAmount>,
    pub verified: Option<bool>,
    pub wallet: Option<String>,
    pub start_epoch: Option<ChainEpoch>,
    pub fast_retrieval: Option<bool>,
}

impl DealParams {
    pub fn with_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self, config: &DealConfig) -> VaultResult<()> {
        if let Some(duration) = self.duration_epochs {
            if duration < config.min_duration_epochs || duration > config.max_duration_epochs {
                return Err(VaultError::validation(format!(
                    "duration {duration} outside [{}, {}]",
                    config.min_duration_epochs, config.max_duration_epochs
                )));
            }
        }
        if let Some(price) = &self.price_per_gib_epoch {
            if price.atto().sign() == Sign::Minus {
                return Err(VaultError::validation("price must not be negative"));
            }
        }
        if let Some(provider) = &self.provider {
            crate::utils::address::parse_address(provider)?;
        }
        Ok(())
    }

    fn duration(&self, config: &DealConfig) -> ChainEpoch {
        self.duration_epochs.unwrap_or(config.default_duration_epochs)
    }
}

/// Deals created for one chunk of a large dataset
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDeals {
    pub index: u64,
    #[serde(with = "cid_string")]
    pub data_cid: Cid,
    pub size: u64,
    pub deals: Vec<StorageDeal>,
}

/// A packed payload on disk, removed when dropped
struct StagedCar {
    packed: PackedCar,
    path: PathBuf,
    _dir: TempDir,
}

/// Turns data into storage deals and tracks them
pub struct DealManager {
    node: Arc<dyn StorageNode>,
    config: DealConfig,
    car: CarConfig,
    intermediary: Option<Arc<dyn StorageIntermediary>>,
    cancel: CancellationToken,
}

impl DealManager {
    pub fn new(node: Arc<dyn StorageNode>, config: DealConfig, car: CarConfig) -> Self {
        Self {
            node,
            config,
            car,
            intermediary: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_intermediary(mut self, intermediary: Arc<dyn StorageIntermediary>) -> Self {
        self.intermediary = Some(intermediary);
        self
    }

    /// Token that aborts in-flight publication polling
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &DealConfig {
        &self.config
    }

    async fn stage(&self, input: PackInput) -> VaultResult<StagedCar> {
        let packer = CarPacker::new(self.car.chunk_size);
        let packed = tokio::task::spawn_blocking(move || packer.pack(&input))
            .await
            .context("packing task panicked")??;
        let dir = tempfile::Builder::new()
            .prefix("fil-vault-deal-")
            .tempdir()?;
        let path = dir.path().join(format!("{}.car", packed.root()));
        tokio::fs::write(&path, &packed.bytes).await?;
        debug!("staged {} byte CAR at {}", packed.bytes.len(), path.display());
        Ok(StagedCar {
            packed,
            path,
            _dir: dir,
        })
    }

    fn wallet(&self, params: &DealParams) -> VaultResult<String> {
        params
            .wallet
            .clone()
            .or_else(|| self.config.client_address.clone())
            .ok_or_else(|| VaultError::validation("no client wallet configured"))
    }

    /// Pack `input` and store it. Without a provider the CAR goes to the
    /// intermediary and the deal is reported active; with one, a direct
    /// deal is proposed and polled until it gets an on-chain id.
    pub async fn create_storage_deal(
        &self,
        input: PackInput,
        params: &DealParams,
    ) -> VaultResult<StorageDeal> {
        params.validate(&self.config)?;
        let staged = self.stage(input).await?;
        match &params.provider {
            None => self.hand_to_intermediary(&staged, params).await,
            Some(provider) => self.propose(&staged, provider, params).await,
        }
    }

    /// One deal per provider over a single packing of `input`. Failing
    /// providers are skipped; if all fail the result is `ExhaustedProviders`.
    pub async fn create_storage_deals(
        &self,
        input: PackInput,
        params: &DealParams,
        providers: &[String],
    ) -> VaultResult<Vec<StorageDeal>> {
        params.validate(&self.config)?;
        if providers.is_empty() {
            return Err(VaultError::validation("no providers given"));
        }
        let staged = self.stage(input).await?;
        self.propose_to_all(&staged, params, providers).await
    }

    async fn propose_to_all(
        &self,
        staged: &StagedCar,
        params: &DealParams,
        providers: &[String],
    ) -> VaultResult<Vec<StorageDeal>> {
        let mut deals = Vec::new();
        let mut failures = Vec::new();
        for provider in providers {
            match self.propose(staged, provider, params).await {
                Ok(deal) => deals.push(deal),
                Err(e) => {
                    warn!("deal with {provider} failed: {e}");
                    failures.push(format!("{provider}: {e}"));
                }
            }
        }
        if deals.is_empty() {
            return Err(VaultError::exhausted(failures));
        }
        Ok(deals)
    }

    /// Split a file per `plan` and place every chunk with `providers`
    pub async fn create_chunked_deals(
        &self,
        file: &Path,
        plan: &ChunkingPlan,
        params: &DealParams,
        providers: &[String],
    ) -> VaultResult<Vec<ChunkDeals>> {
        params.validate(&self.config)?;
        if providers.is_empty() {
            return Err(VaultError::validation("no providers given"));
        }
        let mut out = Vec::with_capacity(plan.chunks as usize);
        for index in 0..plan.chunks {
            let range = plan.range(index);
            let data = read_range(file.to_path_buf(), range.clone()).await?;
            let staged = self.stage(PackInput::Bytes(data)).await?;
            info!(
                "chunk {}/{} ({} bytes) packed as {}",
                index + 1,
                plan.chunks,
                range.end - range.start,
                staged.packed.root()
            );
            let deals = self.propose_to_all(&staged, params, providers).await?;
            out.push(ChunkDeals {
                index,
                data_cid: staged.packed.root(),
                size: range.end - range.start,
                deals,
            });
        }
        Ok(out)
    }

    async fn hand_to_intermediary(
        &self,
        staged: &StagedCar,
        params: &DealParams,
    ) -> VaultResult<StorageDeal> {
        let intermediary = self.intermediary.as_ref().ok_or_else(|| {
            VaultError::validation("no provider given and no storage intermediary configured")
        })?;
        let root = staged.packed.root();
        let receipt = intermediary
            .upload_car(staged.packed.bytes.clone(), &root)
            .await?;
        let start = match self.node.current_epoch().await {
            Ok(epoch) => epoch,
            Err(e) => {
                warn!("chain head unavailable, recording deal from epoch 0: {e}");
                0
            }
        };
        info!(
            "{} accepted {} as request {}",
            intermediary.name(),
            receipt.cid,
            receipt.request_id
        );
        Ok(StorageDeal {
            proposal_id: receipt.request_id,
            deal_id: None,
            piece_cid: None,
            piece_size: padded_piece_size(staged.packed.bytes.len() as u64),
            data_cid: receipt.cid,
            provider: intermediary.name().to_string(),
            client: params
                .wallet
                .clone()
                .or_else(|| self.config.client_address.clone())
                .unwrap_or_default(),
            price_atto_fil_per_epoch: TokenAmount::default(),
            verified: false,
            start_epoch: start,
            end_epoch: start + params.duration(&self.config),
            status: DealStatus::Active,
            chain_state: ChainState::Unknown,
        })
    }

    async fn ask_price(&self, provider: &str, verified: bool) -> VaultResult<TokenAmount> {
        let info = self.node.miner_info(provider).await?;
        let peer_id = info
            .peer_id
            .ok_or_else(|| VaultError::not_found(format!("peer id of {provider}")))?;
        let ask = self.node.query_ask(&peer_id, provider).await?;
        let price = if verified {
            &ask.verified_price
        } else {
            &ask.price
        };
        crate::utils::units::parse_atto(price)
    }

    async fn propose(
        &self,
        staged: &StagedCar,
        provider: &str,
        params: &DealParams,
    ) -> VaultResult<StorageDeal> {
        let verified = params.verified.unwrap_or(self.config.verified);
        let wallet = self.wallet(params)?;
        let price = match &params.price_per_gib_epoch {
            Some(price) => price.clone(),
            None => self.ask_price(provider, verified).await?,
        };

        let import = self.node.import(&staged.path, true).await?;
        let data_cid = Cid::try_from(&import.root)?;
        let commp = self.node.calc_commp(&staged.path).await?;
        let piece_cid = Cid::try_from(&commp.root)?;
        if commp.size > MAX_PIECE_SIZE {
            return Err(VaultError::validation(format!(
                "piece of {} bytes exceeds the {MAX_PIECE_SIZE} byte deal maximum",
                commp.size
            )));
        }

        let current = self.node.current_epoch().await?;
        let start = params
            .start_epoch
            .unwrap_or(current + self.config.start_delay_epochs);
        let duration = params.duration(&self.config);
        let per_epoch = epoch_price(&price, commp.size);

        let proposal = StartDealParams {
            data: DataRef {
                transfer_type: TRANSFER_GRAPHSYNC.to_string(),
                root: CIDMap::from(data_cid),
                piece_cid: Some(CIDMap::from(piece_cid)),
                piece_size: unpadded_piece_size(commp.size)?,
            },
            wallet: wallet.clone(),
            miner: provider.to_string(),
            epoch_price: per_epoch.atto().to_string(),
            min_blocks_duration: duration as u64,
            provider_collateral: "0".to_string(),
            deal_start_epoch: start,
            fast_retrieval: params.fast_retrieval.unwrap_or(self.config.fast_retrieval),
            verified_deal: verified,
        };
        let proposal_cid = self.node.start_deal(&proposal).await?;
        info!("proposed deal {proposal_cid} to {provider} for {data_cid}");

        let mut deal = StorageDeal {
            proposal_id: proposal_cid.to_string(),
            deal_id: None,
            piece_cid: Some(piece_cid),
            piece_size: commp.size,
            data_cid,
            provider: provider.to_string(),
            client: wallet,
            price_atto_fil_per_epoch: per_epoch,
            verified,
            start_epoch: start,
            end_epoch: start + duration,
            status: DealStatus::Pending,
            chain_state: ChainState::Proposed,
        };

        match self.await_publication(&proposal_cid).await? {
            Some(info) => {
                deal.chain_state = ChainState::from_lotus_state(info.state);
                if info.deal_id != 0 {
                    deal.deal_id = Some(info.deal_id);
                    if deal.chain_state == ChainState::Proposed {
                        deal.chain_state = ChainState::Published;
                    }
                    info!("deal {proposal_cid} published as {}", info.deal_id);
                } else {
                    warn!("deal {proposal_cid} failed: {}", info.message);
                }
                deal.refresh(current);
            }
            None => {
                info!("deal {proposal_cid} has no on-chain id yet; returning pending");
            }
        }
        Ok(deal)
    }

    /// Poll until the proposal has a deal id or has failed
    async fn await_publication(&self, proposal: &Cid) -> VaultResult<Option<DealInfo>> {
        let policy = PollPolicy::from_config(&self.config);
        let node = &self.node;
        poll_until(&policy, &self.cancel, |attempt| async move {
            let info = node.deal_info(proposal).await?;
            debug!(
                "poll {attempt}: proposal {proposal} state {} deal id {}",
                info.state, info.deal_id
            );
            let failed = ChainState::from_lotus_state(info.state) == ChainState::Failed;
            Ok((info.deal_id != 0 || failed).then_some(info))
        })
        .await
    }

    pub async fn find_storage_providers(
        &self,
        criteria: &ProviderCriteria,
    ) -> VaultResult<Vec<ProviderProfile>> {
        find_storage_providers(self.node.as_ref(), &self.config, criteria).await
    }

    pub async fn calculate_storage_cost(
        &self,
        size_bytes: u64,
        duration: ChainEpoch,
        verified: bool,
    ) -> VaultResult<CostEstimate> {
        let criteria = ProviderCriteria {
            piece_size: Some(padded_piece_size(size_bytes)),
            verified,
            ..Default::default()
        };
        let providers = self.find_storage_providers(&criteria).await?;
        estimate_cost(&providers, size_bytes, duration, verified)
    }

    pub async fn optimize_storage_params(
        &self,
        size_bytes: u64,
        options: &OptimizeOptions,
    ) -> VaultResult<OptimizedParams> {
        let criteria = ProviderCriteria {
            verified: options.verified,
            ..Default::default()
        };
        let providers = self.find_storage_providers(&criteria).await?;
        optimize(size_bytes, providers, options, &self.config)
    }

    async fn chain_state(&self, deal: &mut StorageDeal) -> VaultResult<ChainState> {
        if let Some(id) = deal.deal_id {
            return match self.node.market_deal(id).await {
                Ok(market) => Ok(ChainState::from_market_deal(&market)),
                // expired deals are pruned from the market actor
                Err(e) if e.is_not_found() => Ok(ChainState::Unknown),
                Err(e) => Err(e),
            };
        }
        let Ok(proposal) = parse_cid(&deal.proposal_id) else {
            return Ok(deal.chain_state);
        };
        match self.node.deal_info(&proposal).await {
            Ok(info) => {
                if info.deal_id != 0 {
                    deal.deal_id = Some(info.deal_id);
                }
                Ok(ChainState::from_lotus_state(info.state))
            }
            Err(e) if e.is_not_found() => Ok(deal.chain_state),
            Err(e) => Err(e),
        }
    }

    /// Recompute a deal's status at the chain head
    pub async fn check_deal_status(&self, deal: &StorageDeal) -> VaultResult<DealStatusReport> {
        let current = self.node.current_epoch().await?;
        let mut deal = deal.clone();
        deal.chain_state = self.chain_state(&mut deal).await?;
        Ok(DealStatusReport::new(
            deal,
            current,
            self.config.renewal_lookahead_epochs,
        ))
    }

    /// Status of every deal at one chain head. A deal whose chain lookup
    /// fails keeps its last known chain state.
    pub async fn check_deal_statuses(
        &self,
        deals: &[StorageDeal],
    ) -> VaultResult<Vec<DealStatusReport>> {
        let current = self.node.current_epoch().await?;
        let mut reports = Vec::with_capacity(deals.len());
        for deal in deals {
            let mut deal = deal.clone();
            match self.chain_state(&mut deal).await {
                Ok(state) => deal.chain_state = state,
                Err(e) => warn!("chain lookup for {} failed: {e}", deal.proposal_id),
            }
            reports.push(DealStatusReport::new(
                deal,
                current,
                self.config.renewal_lookahead_epochs,
            ));
        }
        Ok(reports)
    }

    /// Propose a replacement deal on the same piece covering
    /// `additional` epochs beyond the current end. Expired deals cannot
    /// be extended.
    pub async fn extend_deal(
        &self,
        deal: &StorageDeal,
        additional: ChainEpoch,
    ) -> VaultResult<StorageDeal> {
        let current = self.node.current_epoch().await?;
        if matches!(deal.status, DealStatus::Failed | DealStatus::Terminated) {
            return Err(VaultError::validation(format!(
                "deal {} is {} and cannot be extended",
                deal.proposal_id, deal.status
            )));
        }
        let duration = extension_duration(
            deal,
            current,
            additional,
            self.config.min_duration_epochs,
            self.config.max_duration_epochs,
        )?;
        let piece_cid = deal.piece_cid.ok_or_else(|| {
            VaultError::validation(format!(
                "deal {} has no piece CID to extend",
                deal.proposal_id
            ))
        })?;
        let start = current + self.config.start_delay_epochs;
        let wallet = if deal.client.is_empty() {
            self.wallet(&DealParams::default())?
        } else {
            deal.client.clone()
        };

        let proposal = StartDealParams {
            data: DataRef {
                transfer_type: TRANSFER_MANUAL.to_string(),
                root: CIDMap::from(deal.data_cid),
                piece_cid: Some(CIDMap::from(piece_cid)),
                piece_size: unpadded_piece_size(deal.piece_size)?,
            },
            wallet: wallet.clone(),
            miner: deal.provider.clone(),
            epoch_price: deal.price_atto_fil_per_epoch.atto().to_string(),
            min_blocks_duration: duration as u64,
            provider_collateral: "0".to_string(),
            deal_start_epoch: start,
            fast_retrieval: self.config.fast_retrieval,
            verified_deal: deal.verified,
        };
        let proposal_cid = self.node.start_deal(&proposal).await?;
        info!(
            "proposed extension {proposal_cid} of {} for {duration} epochs",
            deal.proposal_id
        );

        Ok(StorageDeal {
            proposal_id: proposal_cid.to_string(),
            deal_id: None,
            piece_cid: Some(piece_cid),
            piece_size: deal.piece_size,
            data_cid: deal.data_cid,
            provider: deal.provider.clone(),
            client: wallet,
            price_atto_fil_per_epoch: deal.price_atto_fil_per_epoch.clone(),
            verified: deal.verified,
            start_epoch: start,
            end_epoch: start + duration,
            status: DealStatus::Pending,
            chain_state: ChainState::Proposed,
        })
    }

    pub async fn create_renewal_plan(&self, deals: &[StorageDeal]) -> VaultResult<RenewalPlan> {
        let current = self.node.current_epoch().await?;
        Ok(create_renewal_plan(
            deals,
            current,
            self.config.renewal_lookahead_epochs,
        ))
    }
}

async fn read_range(path: PathBuf, range: std::ops::Range<u64>) -> VaultResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> VaultResult<Vec<u8>> {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    })
    .await
    .context("read task panicked")?
}
