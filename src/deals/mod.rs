// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Storage deals: provider discovery, pricing, proposal and lifecycle

pub mod cost;
pub mod intermediary;
pub mod manager;
pub mod optimize;
pub mod poll;
pub mod providers;
pub mod renewal;
pub mod status;

pub use cost::{epoch_price, estimate_cost, storage_cost, CostEstimate, ProviderCost};
pub use intermediary::{HttpIntermediary, StorageIntermediary, UploadReceipt};
pub use manager::{ChunkDeals, DealManager, DealParams, MAX_PIECE_SIZE};
pub use optimize::{
    chunking_plan, ChunkingPlan, DurationCandidate, DurationLabel, OptimizeOptions,
    OptimizedParams, PriorityFactor,
};
pub use poll::{poll_until, PollPolicy};
pub use providers::{find_storage_providers, ProviderCriteria, ProviderProfile};
pub use renewal::{
    create_renewal_plan, extension_duration, DealStatusReport, RenewalPlan, ScheduledRenewal,
};
pub use status::{deal_status, ChainState, DealStatus, StorageDeal};
