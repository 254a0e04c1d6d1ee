// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

use super::hash::{hex_digest, Digest, Keccak256Hasher, MerkleHasher};
use crate::error::{VaultError, VaultResult};

/// Sibling sits to the left of the running hash
pub const SIBLING_LEFT: u8 = 0;
/// Sibling sits to the right of the running hash
pub const SIBLING_RIGHT: u8 = 1;

/// Path from one leaf to the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    #[serde(with = "hex_digest")]
    pub leaf: Digest,
    pub leaf_index: u64,
    #[serde(with = "hex_digest::vec")]
    pub siblings: Vec<Digest>,
    pub positions: Vec<u8>,
    #[serde(with = "hex_digest")]
    pub root: Digest,
}

impl MerkleProof {
    /// Check the proof against its own declared root
    pub fn verify_with<H: MerkleHasher + ?Sized>(&self, hasher: &H) -> bool {
        verify_proof(hasher, &self.leaf, &self.siblings, &self.positions, &self.root)
    }

    pub fn verify(&self) -> bool {
        self.verify_with(&Keccak256Hasher)
    }
}

/// Fold `leaf` with each sibling and compare against `root`
pub fn verify_proof<H: MerkleHasher + ?Sized>(
    hasher: &H,
    leaf: &Digest,
    siblings: &[Digest],
    positions: &[u8],
    root: &Digest,
) -> bool {
    if siblings.len() != positions.len() {
        return false;
    }
    let mut acc = *leaf;
    for (sibling, position) in siblings.iter().zip(positions) {
        acc = match *position {
            SIBLING_LEFT => hasher.hash_pair(sibling, &acc),
            SIBLING_RIGHT => hasher.hash_pair(&acc, sibling),
            _ => return false,
        };
    }
    &acc == root
}

/// Binary Merkle tree. Layer 0 holds the hashed leaves; an odd layer gets
/// its last node duplicated before pairing, and the top layer is the root.
#[derive(Debug, Clone)]
pub struct MerkleTree<H = Keccak256Hasher> {
    hasher: H,
    leaves: Vec<Digest>,
    layers: Vec<Vec<Digest>>,
}

impl MerkleTree<Keccak256Hasher> {
    /// Hash each item and build a Keccak-256 tree
    pub fn build<T: AsRef<[u8]>>(items: &[T]) -> VaultResult<Self> {
        Self::with_hasher(items, Keccak256Hasher)
    }
}

impl<H: MerkleHasher> MerkleTree<H> {
    pub fn with_hasher<T: AsRef<[u8]>>(items: &[T], hasher: H) -> VaultResult<Self> {
        let leaves = items.iter().map(|i| hasher.hash(i.as_ref())).collect();
        Self::from_leaf_hashes(leaves, hasher)
    }

    /// Build over leaves that are already hashed
    pub fn from_leaf_hashes(leaves: Vec<Digest>, hasher: H) -> VaultResult<Self> {
        if leaves.is_empty() {
            return Err(VaultError::validation("Merkle tree needs at least one leaf"));
        }
        let mut layers = Vec::new();
        let mut layer = leaves.clone();
        while layer.len() > 1 {
            if layer.len() % 2 == 1 {
                if let Some(last) = layer.last().copied() {
                    layer.push(last);
                }
            }
            let next = layer
                .chunks_exact(2)
                .map(|pair| hasher.hash_pair(&pair[0], &pair[1]))
                .collect();
            layers.push(std::mem::replace(&mut layer, next));
        }
        layers.push(layer);
        Ok(Self {
            hasher,
            leaves,
            layers,
        })
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    pub fn root(&self) -> Digest {
        // never empty: construction rejects zero leaves
        self.layers[self.layers.len() - 1][0]
    }

    pub fn leaves(&self) -> &[Digest] {
        &self.leaves
    }

    pub fn layers(&self) -> &[Vec<Digest>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Number of hashing levels between a leaf and the root
    pub fn height(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn proof(&self, index: usize) -> VaultResult<MerkleProof> {
        if index >= self.leaves.len() {
            return Err(VaultError::validation(format!(
                "leaf index {index} out of range for {} leaves",
                self.leaves.len()
            )));
        }
        let mut siblings = Vec::with_capacity(self.height());
        let mut positions = Vec::with_capacity(self.height());
        let mut idx = index;
        for layer in &self.layers[..self.height()] {
            if idx % 2 == 0 {
                siblings.push(layer[idx + 1]);
                positions.push(SIBLING_RIGHT);
            } else {
                siblings.push(layer[idx - 1]);
                positions.push(SIBLING_LEFT);
            }
            idx /= 2;
        }
        Ok(MerkleProof {
            leaf: self.leaves[index],
            leaf_index: index as u64,
            siblings,
            positions,
            root: self.root(),
        })
    }

    /// Verify against this tree's root with this tree's hash function
    pub fn verify(&self, proof: &MerkleProof) -> bool {
        proof.root == self.root() && proof.verify_with(&self.hasher)
    }

    /// Index of the first leaf equal to `leaf`
    pub fn position(&self, leaf: &Digest) -> Option<usize> {
        self.leaves.iter().position(|l| l == leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::hash::Sha256Hasher;

    fn items(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("leaf-{i}").into_bytes()).collect()
    }

    #[test]
    fn layers_are_even_below_the_root() {
        for n in 1..40 {
            let tree = MerkleTree::build(&items(n)).unwrap();
            let layers = tree.layers();
            assert_eq!(layers[layers.len() - 1].len(), 1);
            for layer in &layers[..layers.len() - 1] {
                assert_eq!(layer.len() % 2, 0, "n = {n}");
            }
        }
    }

    #[test]
    fn every_proof_verifies() {
        for n in 1..=1000usize {
            let tree = MerkleTree::build(&items(n)).unwrap();
            let indices: Vec<usize> = if n <= 64 {
                (0..n).collect()
            } else {
                vec![0, 1, n / 2, n - 2, n - 1]
            };
            for i in indices {
                let proof = tree.proof(i).unwrap();
                assert_eq!(proof.siblings.len(), tree.height());
                assert_eq!(proof.positions.len(), tree.height());
                assert!(tree.verify(&proof), "n = {n}, i = {i}");
            }
        }
    }

    #[test]
    fn single_byte_mutation_breaks_proof() {
        let tree = MerkleTree::build(&items(13)).unwrap();
        let proof = tree.proof(6).unwrap();

        let mut bad_leaf = proof.clone();
        bad_leaf.leaf[0] ^= 0x01;
        assert!(!tree.verify(&bad_leaf));

        for s in 0..proof.siblings.len() {
            let mut bad_sibling = proof.clone();
            bad_sibling.siblings[s][31] ^= 0x80;
            assert!(!tree.verify(&bad_sibling));
        }

        let mut flipped = proof.clone();
        flipped.positions[0] ^= 1;
        assert!(!tree.verify(&flipped));
    }

    #[test]
    fn single_leaf_tree_root_is_the_leaf() {
        let tree = MerkleTree::build(&[b"only"]).unwrap();
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.root(), tree.leaves()[0]);
        let proof = tree.proof(0).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(tree.verify(&proof));
    }

    #[test]
    fn verification_is_tied_to_the_hasher() {
        let tree = MerkleTree::with_hasher(&items(8), Sha256Hasher).unwrap();
        let proof = tree.proof(3).unwrap();
        assert!(tree.verify(&proof));
        assert!(!proof.verify_with(&Keccak256Hasher));
    }

    #[test]
    fn empty_and_out_of_range() {
        let empty: Vec<Vec<u8>> = Vec::new();
        assert!(MerkleTree::build(&empty).is_err());
        let tree = MerkleTree::build(&items(4)).unwrap();
        assert!(tree.proof(4).is_err());
    }

    #[test]
    fn proof_json_uses_hex() {
        let tree = MerkleTree::build(&items(3)).unwrap();
        let proof = tree.proof(2).unwrap();
        let json = serde_json::to_value(&proof).unwrap();
        assert!(json["root"].as_str().unwrap().starts_with("0x"));
        assert_eq!(json["leafIndex"], 2);
        let back: MerkleProof = serde_json::from_value(json).unwrap();
        assert_eq!(back, proof);
    }
}
