// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::path::{Path, PathBuf};

use anyhow::Context;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::DAG_CBOR;
use serde::Serialize;
use tracing::debug;

use super::dag::{read_file, resolve_path, DagNode, NodeKind};
use super::format::{decode_car, decode_header, CarBlock, CarHeader};
use super::store::CarStore;
use crate::error::{VaultError, VaultResult};
use crate::utils::cid::verify_block;

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// Re-hash every block against its CID
    pub verify: bool,
}

impl ParseOptions {
    /// Skip block hashing for archives from a trusted source
    pub fn trusted() -> Self {
        Self { verify: false }
    }
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { verify: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    #[serde(with = "crate::utils::cid::cid_string")]
    pub cid: Cid,
    pub size: usize,
}

/// A file or block written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedEntry {
    pub path: PathBuf,
    #[serde(with = "crate::utils::cid::cid_string")]
    pub cid: Cid,
    pub size: u64,
}

/// Decoded archive
#[derive(Debug, Clone)]
pub struct CarArchive {
    pub header: CarHeader,
    pub blocks: Vec<CarBlock>,
}

impl CarArchive {
    pub fn roots(&self) -> &[Cid] {
        &self.header.roots
    }

    pub fn root(&self) -> VaultResult<Cid> {
        self.header
            .roots
            .first()
            .copied()
            .ok_or_else(|| VaultError::validation("archive declares no roots"))
    }

    pub fn get(&self, cid: &Cid) -> Option<&CarBlock> {
        self.blocks.iter().find(|b| &b.cid == cid)
    }

    pub fn position(&self, cid: &Cid) -> Option<usize> {
        self.blocks.iter().position(|b| &b.cid == cid)
    }

    /// Blockstore view over the archive's blocks
    pub fn store(&self) -> VaultResult<CarStore> {
        let store = CarStore::trusted();
        for block in &self.blocks {
            store.put_keyed(&block.cid, &block.data)?;
        }
        Ok(store)
    }

    /// Contents of a single member below the first root
    pub fn find_path(&self, path: &str) -> VaultResult<Option<Vec<u8>>> {
        let store = self.store()?;
        let root = self.root()?;
        match resolve_path(&store, &root, path)? {
            Some(cid) => Ok(Some(read_file(&store, &cid)?)),
            None => Ok(None),
        }
    }
}

pub fn parse_car(bytes: &[u8], options: ParseOptions) -> VaultResult<CarArchive> {
    let (header, blocks) = decode_car(bytes)?;
    if options.verify {
        for block in &blocks {
            verify_block(&block.cid, &block.data)?;
        }
    }
    debug!(
        "parsed archive with {} root(s) and {} blocks",
        header.roots.len(),
        blocks.len()
    );
    Ok(CarArchive { header, blocks })
}

pub fn list_blocks(bytes: &[u8], options: ParseOptions) -> VaultResult<Vec<BlockInfo>> {
    let archive = parse_car(bytes, options)?;
    Ok(archive
        .blocks
        .iter()
        .map(|b| BlockInfo {
            cid: b.cid,
            size: b.data.len(),
        })
        .collect())
}

/// First declared root; only the header is decoded
pub fn get_root_cid(bytes: &[u8]) -> VaultResult<Cid> {
    let (header, _) = decode_header(bytes)?;
    header
        .roots
        .first()
        .copied()
        .ok_or_else(|| VaultError::validation("archive declares no roots"))
}

/// True iff the archive declares a root and carries at least one block.
/// Undecodable input is reported as `false`; a block whose bytes do not
/// match its CID is an error when verification is enabled.
pub fn verify_integrity(bytes: &[u8], options: ParseOptions) -> VaultResult<bool> {
    let archive = match parse_car(bytes, options) {
        Ok(archive) => archive,
        Err(e @ VaultError::Verification { .. }) => return Err(e),
        Err(e) => {
            debug!("archive failed to decode: {e}");
            return Ok(false);
        }
    };
    Ok(!archive.header.roots.is_empty() && !archive.blocks.is_empty())
}

/// Write every block to `dest/<cid>`
pub fn extract_blocks(
    bytes: &[u8],
    dest: &Path,
    options: ParseOptions,
) -> VaultResult<Vec<ExtractedEntry>> {
    let archive = parse_car(bytes, options)?;
    std::fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut out = Vec::with_capacity(archive.blocks.len());
    for block in &archive.blocks {
        let path = dest.join(block.cid.to_string());
        std::fs::write(&path, &block.data)
            .with_context(|| format!("write block {}", path.display()))?;
        out.push(ExtractedEntry {
            path,
            cid: block.cid,
            size: block.data.len() as u64,
        });
    }
    Ok(out)
}

/// Rebuild the packed file tree under `dest`.
///
/// A single directory root unpacks into `dest` itself; any other root is
/// written to `dest/<root cid>`. Returns one entry per file written.
pub fn unpack(bytes: &[u8], dest: &Path, options: ParseOptions) -> VaultResult<Vec<ExtractedEntry>> {
    let archive = parse_car(bytes, options)?;
    let store = archive.store()?;
    std::fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;

    let mut written = Vec::new();
    let roots = archive.roots();
    if roots.is_empty() {
        return Err(VaultError::validation("archive declares no roots"));
    }
    if roots.len() == 1 && is_directory(&store, &roots[0])? {
        write_directory(&store, &roots[0], dest, &mut written)?;
    } else {
        for root in roots {
            write_node(&store, root, &dest.join(root.to_string()), &mut written)?;
        }
    }
    Ok(written)
}

fn is_directory(store: &CarStore, cid: &Cid) -> VaultResult<bool> {
    if cid.codec() != DAG_CBOR {
        return Ok(false);
    }
    Ok(DagNode::load(store, cid)?.kind == NodeKind::Directory)
}

fn write_node(
    store: &CarStore,
    cid: &Cid,
    path: &Path,
    written: &mut Vec<ExtractedEntry>,
) -> VaultResult<()> {
    if is_directory(store, cid)? {
        std::fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
        return write_directory(store, cid, path, written);
    }
    let data = read_file(store, cid)?;
    std::fs::write(path, &data).with_context(|| format!("write {}", path.display()))?;
    written.push(ExtractedEntry {
        path: path.to_path_buf(),
        cid: *cid,
        size: data.len() as u64,
    });
    Ok(())
}

fn write_directory(
    store: &CarStore,
    cid: &Cid,
    dir: &Path,
    written: &mut Vec<ExtractedEntry>,
) -> VaultResult<()> {
    let node = DagNode::load(store, cid)?;
    for link in &node.links {
        if link.name.is_empty()
            || link.name == "."
            || link.name == ".."
            || link.name.contains(['/', '\\'])
        {
            return Err(VaultError::validation(format!(
                "refusing to unpack entry named {:?}",
                link.name
            )));
        }
        write_node(store, &link.cid, &dir.join(&link.name), written)?;
    }
    Ok(())
}
