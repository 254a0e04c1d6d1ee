// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

pub mod hash;
pub mod multi;
pub mod tree;

pub use hash::{
    hex_digest, keccak256, keccak256_concat, Blake2b256Hasher, Digest, Keccak256Hasher,
    MerkleHasher, Sha256Hasher,
};
pub use multi::{MultiLevelProof, MultiLevelTree};
pub use tree::{verify_proof, MerkleProof, MerkleTree};
