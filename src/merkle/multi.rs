// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Tree of trees: leaves are split into fixed-size groups, each with its
//! own tree, and a top tree is built over the group roots.

use serde::{Deserialize, Serialize};

use super::hash::{Digest, Keccak256Hasher, MerkleHasher};
use super::tree::{MerkleProof, MerkleTree};
use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiLevelProof {
    pub group_index: u64,
    pub element_index: u64,
    pub intra_group: MerkleProof,
    pub inter_group: MerkleProof,
}

impl MultiLevelProof {
    /// Both sub-proofs must hold, and the group root must be the leaf of
    /// the top-level proof
    pub fn verify_with<H: MerkleHasher + ?Sized>(&self, hasher: &H, root: &Digest) -> bool {
        self.intra_group.leaf_index == self.element_index
            && self.inter_group.leaf_index == self.group_index
            && self.intra_group.root == self.inter_group.leaf
            && &self.inter_group.root == root
            && self.intra_group.verify_with(hasher)
            && self.inter_group.verify_with(hasher)
    }
}

#[derive(Debug, Clone)]
pub struct MultiLevelTree<H = Keccak256Hasher> {
    group_size: usize,
    groups: Vec<MerkleTree<H>>,
    top: MerkleTree<H>,
}

impl MultiLevelTree<Keccak256Hasher> {
    pub fn build<T: AsRef<[u8]>>(items: &[T], group_size: usize) -> VaultResult<Self> {
        Self::with_hasher(items, group_size, Keccak256Hasher)
    }
}

impl<H: MerkleHasher + Clone> MultiLevelTree<H> {
    pub fn with_hasher<T: AsRef<[u8]>>(
        items: &[T],
        group_size: usize,
        hasher: H,
    ) -> VaultResult<Self> {
        if group_size == 0 {
            return Err(VaultError::validation("group size must be positive"));
        }
        if items.is_empty() {
            return Err(VaultError::validation("Merkle tree needs at least one leaf"));
        }
        let groups = items
            .chunks(group_size)
            .map(|chunk| MerkleTree::with_hasher(chunk, hasher.clone()))
            .collect::<VaultResult<Vec<_>>>()?;
        let group_roots = groups.iter().map(MerkleTree::root).collect();
        let top = MerkleTree::from_leaf_hashes(group_roots, hasher)?;
        Ok(Self {
            group_size,
            groups,
            top,
        })
    }

    pub fn root(&self) -> Digest {
        self.top.root()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(MerkleTree::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Proof for the leaf at global position `index`
    pub fn proof(&self, index: usize) -> VaultResult<MultiLevelProof> {
        let group_index = index / self.group_size;
        let element_index = index % self.group_size;
        let group = self.groups.get(group_index).ok_or_else(|| {
            VaultError::validation(format!(
                "leaf index {index} out of range for {} leaves",
                self.len()
            ))
        })?;
        Ok(MultiLevelProof {
            group_index: group_index as u64,
            element_index: element_index as u64,
            intra_group: group.proof(element_index)?,
            inter_group: self.top.proof(group_index)?,
        })
    }

    pub fn verify(&self, proof: &MultiLevelProof) -> bool {
        proof.verify_with(self.top.hasher(), &self.root())
    }
}
