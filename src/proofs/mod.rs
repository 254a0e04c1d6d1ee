// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Inclusion and possession proofs over stored content

pub mod bundle;
pub mod codec;
pub mod generator;
pub mod signer;
pub mod verifier;

pub use bundle::{InclusionProof, PossessionProof, PossessionSample};
pub use codec::{deserialize_proof, serialize_proof, serialize_proof_compact, ProofEnvelope};
pub use generator::{
    build_inclusion_proof, build_possession_proof, inclusion_leaf, inclusion_payload,
    ChallengeRegistry, PossessionOptions, ProofEngine,
};
pub use signer::{EthSigner, EthVerifier, SignatureVerifier, Signer};
pub use verifier::{verify_inclusion_proof, verify_possession_proof};
