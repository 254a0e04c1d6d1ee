// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Durable storage on Filecoin: CAR packing, storage deals, multi-source
//! retrieval and Merkle-based inclusion and possession proofs.

pub mod car;
pub mod client;
pub mod config;
pub mod context;
pub mod deals;
pub mod error;
pub mod merkle;
pub mod proofs;
pub mod retrieval;
pub mod utils;

// Re-export the main entry points
pub use client::{LotusClient, StorageNode};
pub use config::VaultConfig;
pub use context::VaultContext;
pub use deals::{DealManager, DealParams, DealStatus, StorageDeal};
pub use error::{VaultError, VaultResult};
pub use merkle::{MerkleProof, MerkleTree};
pub use proofs::{InclusionProof, PossessionProof, ProofEngine, ProofEnvelope};
pub use retrieval::{RetrievalEngine, RetrievalOptions, RetrievalResult};
