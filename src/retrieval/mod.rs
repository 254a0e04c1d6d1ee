// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Getting content back: HTTP gateways, pinning service, storage providers

pub mod engine;
pub mod sources;

pub use engine::{
    RetrievalCost, RetrievalEngine, RetrievalOptions, RetrievalResult, RetrievedData,
    PROVIDER_LABEL_PREFIX,
};
pub use sources::{
    offer_total, provider_offers, ContentSource, FetchFormat, HttpGateway, HttpPinningService,
};
