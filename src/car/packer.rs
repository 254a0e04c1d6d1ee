// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use tracing::{debug, warn};

use super::dag::{walk, DagNode, Link};
use super::format::{encode_car, CarBlock};
use super::store::CarStore;
use crate::error::{VaultError, VaultResult};
use crate::utils::cid::raw_cid;

/// Source material for an archive
#[derive(Debug, Clone)]
pub enum PackInput {
    Bytes(Vec<u8>),
    /// A regular file or a directory tree
    Path(PathBuf),
}

/// A packed archive and its root
#[derive(Debug, Clone)]
pub struct PackedCar {
    pub roots: Vec<Cid>,
    pub bytes: Vec<u8>,
    pub block_count: usize,
    /// Payload bytes before framing
    pub payload_size: u64,
}

impl PackedCar {
    pub fn root(&self) -> Cid {
        self.roots[0]
    }
}

/// Deterministic archive builder: identical input always yields the same
/// root CID and byte-identical archive
#[derive(Debug, Clone)]
pub struct CarPacker {
    chunk_size: usize,
}

impl CarPacker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn pack(&self, input: &PackInput) -> VaultResult<PackedCar> {
        self.pack_many(std::slice::from_ref(input))
    }

    /// One root per input, blocks shared between inputs stored once
    pub fn pack_many(&self, inputs: &[PackInput]) -> VaultResult<PackedCar> {
        if inputs.is_empty() {
            return Err(VaultError::validation("nothing to pack"));
        }
        let store = CarStore::trusted();
        let mut roots = Vec::with_capacity(inputs.len());
        for input in inputs {
            let link = match input {
                PackInput::Bytes(data) => self.add_bytes(&store, data)?,
                PackInput::Path(path) => self.add_path(&store, path)?,
            };
            roots.push(link.cid);
        }

        let mut seen = HashSet::new();
        let mut blocks = Vec::with_capacity(store.len());
        for root in &roots {
            for cid in walk(&store, root)? {
                if !seen.insert(cid) {
                    continue;
                }
                let data = store
                    .get(&cid)?
                    .ok_or_else(|| VaultError::not_found(format!("block {cid}")))?;
                blocks.push(CarBlock { cid, data });
            }
        }

        let payload_size = blocks.iter().map(|b| b.data.len() as u64).sum();
        let bytes = encode_car(&roots, &blocks)?;
        debug!(
            "packed {} blocks under {} root(s), {} bytes",
            blocks.len(),
            roots.len(),
            bytes.len()
        );
        Ok(PackedCar {
            roots,
            bytes,
            block_count: blocks.len(),
            payload_size,
        })
    }

    /// Pack and write the archive to `out`
    pub fn pack_to_file(&self, input: &PackInput, out: &Path) -> VaultResult<PackedCar> {
        let packed = self.pack(input)?;
        std::fs::write(out, &packed.bytes)
            .with_context(|| format!("write archive {}", out.display()))?;
        Ok(packed)
    }

    fn add_bytes(&self, store: &CarStore, data: &[u8]) -> VaultResult<Link> {
        let mut chunks = Vec::new();
        for chunk in data.chunks(self.chunk_size) {
            let cid = raw_cid(chunk);
            store.put_keyed(&cid, chunk)?;
            chunks.push(Link {
                cid,
                name: String::new(),
                size: chunk.len() as u64,
            });
        }
        let node = DagNode::file(chunks);
        let cid = node.put(store)?;
        Ok(Link {
            cid,
            name: String::new(),
            size: node.size,
        })
    }

    fn add_path(&self, store: &CarStore, path: &Path) -> VaultResult<Link> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?;
        if meta.is_file() {
            let data =
                std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
            return self.add_bytes(store, &data);
        }
        if !meta.is_dir() {
            return Err(VaultError::validation(format!(
                "{} is neither a file nor a directory",
                path.display()
            )));
        }

        let mut entries = Vec::new();
        let mut names: Vec<(String, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("list {}", path.display()))?
        {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                warn!("skipping symlink {}", entry.path().display());
                continue;
            }
            let name = entry.file_name().into_string().map_err(|n| {
                VaultError::validation(format!("non UTF-8 file name {n:?}"))
            })?;
            names.push((name, entry.path()));
        }
        names.sort();

        for (name, child) in names {
            let link = self.add_path(store, &child)?;
            entries.push(Link {
                cid: link.cid,
                name,
                size: link.size,
            });
        }

        let node = DagNode::directory(entries);
        let cid = node.put(store)?;
        Ok(Link {
            cid,
            name: String::new(),
            size: node.size,
        })
    }
}

impl Default for CarPacker {
    fn default() -> Self {
        Self::new(crate::config::CarConfig::default().chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::format::decode_car;

    #[test]
    fn identical_bytes_give_identical_roots() {
        let packer = CarPacker::new(4);
        let a = packer.pack(&PackInput::Bytes(b"hello world".to_vec())).unwrap();
        let b = packer.pack(&PackInput::Bytes(b"hello world".to_vec())).unwrap();
        assert_eq!(a.root(), b.root());
        assert_eq!(a.bytes, b.bytes);

        let c = packer.pack(&PackInput::Bytes(b"hello worle".to_vec())).unwrap();
        assert_ne!(a.root(), c.root());
    }

    #[test]
    fn root_is_first_block() {
        let packer = CarPacker::new(3);
        let packed = packer.pack(&PackInput::Bytes(b"abcdefgh".to_vec())).unwrap();
        let (header, blocks) = decode_car(&packed.bytes).unwrap();
        assert_eq!(header.roots, vec![packed.root()]);
        assert_eq!(blocks[0].cid, packed.root());
        // file node + 3 chunks
        assert_eq!(blocks.len(), 4);
        assert_eq!(packed.payload_size as usize, blocks.iter().map(|b| b.data.len()).sum::<usize>());
    }

    #[test]
    fn repeated_chunks_are_stored_once() {
        let packer = CarPacker::new(2);
        let packed = packer.pack(&PackInput::Bytes(b"abababab".to_vec())).unwrap();
        assert_eq!(packed.block_count, 2);
    }

    #[test]
    fn empty_input_packs_to_single_node() {
        let packer = CarPacker::new(16);
        let packed = packer.pack(&PackInput::Bytes(Vec::new())).unwrap();
        assert_eq!(packed.block_count, 1);
    }

    #[test]
    fn multi_root_archive() {
        let packer = CarPacker::new(8);
        let packed = packer
            .pack_many(&[
                PackInput::Bytes(b"one".to_vec()),
                PackInput::Bytes(b"two".to_vec()),
            ])
            .unwrap();
        assert_eq!(packed.roots.len(), 2);
        assert!(packer.pack_many(&[]).is_err());
    }
}
