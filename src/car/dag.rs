// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! File and directory nodes. Files link to raw leaf chunks; directories
//! link to named children sorted by name.

use anyhow::{anyhow, Context, Result};
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{DAG_CBOR, IPLD_RAW};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::utils::cid::dag_cbor_cid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// Link to a child block; chunk links of a file carry an empty name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub cid: Cid,
    pub name: String,
    /// Cumulative payload size below this link
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNode {
    pub kind: NodeKind,
    pub size: u64,
    pub links: Vec<Link>,
}

impl DagNode {
    pub fn file(chunks: Vec<Link>) -> Self {
        let size = chunks.iter().map(|l| l.size).sum();
        Self {
            kind: NodeKind::File,
            size,
            links: chunks,
        }
    }

    pub fn directory(mut entries: Vec<Link>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let size = entries.iter().map(|l| l.size).sum();
        Self {
            kind: NodeKind::Directory,
            size,
            links: entries,
        }
    }

    /// Encode and store the node, returning its CID
    pub fn put<BS: Blockstore>(&self, store: &BS) -> Result<Cid> {
        let encoded = fvm_ipld_encoding::to_vec(self).context("encode DAG node")?;
        let cid = dag_cbor_cid(&encoded);
        store.put_keyed(&cid, &encoded)?;
        Ok(cid)
    }

    pub fn load<BS: Blockstore>(store: &BS, cid: &Cid) -> Result<Self> {
        if cid.codec() != DAG_CBOR {
            return Err(anyhow!("{cid} is not a DAG-CBOR node"));
        }
        let raw = store
            .get(cid)?
            .ok_or_else(|| anyhow!("missing block {cid}"))?;
        let node: Self = fvm_ipld_encoding::from_slice(&raw)
            .with_context(|| format!("decode DAG node {cid}"))?;
        node.check_size(cid)?;
        Ok(node)
    }

    /// A node's size must equal the sum of its link sizes
    fn check_size(&self, cid: &Cid) -> Result<()> {
        let linked = self
            .links
            .iter()
            .try_fold(0u64, |acc, l| acc.checked_add(l.size));
        if linked != Some(self.size) {
            return Err(VaultError::validation(format!(
                "node {cid} declares {} bytes but its links sum to {}",
                self.size,
                linked.map_or_else(|| "more than u64::MAX".to_string(), |n| n.to_string())
            ))
            .into());
        }
        Ok(())
    }
}

/// Concatenate the leaves of a file node (or return a raw block as-is)
pub fn read_file<BS: Blockstore>(store: &BS, cid: &Cid) -> Result<Vec<u8>> {
    if cid.codec() == IPLD_RAW {
        return store
            .get(cid)?
            .ok_or_else(|| anyhow!("missing block {cid}"));
    }
    let node = DagNode::load(store, cid)?;
    if node.kind != NodeKind::File {
        return Err(anyhow!("{cid} is a directory, not a file"));
    }
    let mut out = Vec::new();
    for link in &node.links {
        let chunk = read_file(store, &link.cid)?;
        if chunk.len() as u64 != link.size {
            return Err(VaultError::validation(format!(
                "link {} in {cid} declares {} bytes, found {}",
                link.cid,
                link.size,
                chunk.len()
            ))
            .into());
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Resolve a slash-separated path below `root`
pub fn resolve_path<BS: Blockstore>(store: &BS, root: &Cid, path: &str) -> Result<Option<Cid>> {
    let mut current = *root;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if current.codec() != DAG_CBOR {
            return Ok(None);
        }
        let node = DagNode::load(store, &current)?;
        if node.kind != NodeKind::Directory {
            return Ok(None);
        }
        match node.links.iter().find(|l| l.name == segment) {
            Some(link) => current = link.cid,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Pre-order CIDs reachable from `root`, each listed once
pub fn walk<BS: Blockstore>(store: &BS, root: &Cid) -> Result<Vec<Cid>> {
    let mut seen = std::collections::HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![*root];
    while let Some(cid) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        order.push(cid);
        if cid.codec() == DAG_CBOR {
            let node = DagNode::load(store, &cid)?;
            for link in node.links.iter().rev() {
                stack.push(link.cid);
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::format::{encode_car, CarBlock};
    use crate::car::parser::{unpack, ParseOptions};
    use crate::car::store::CarStore;
    use crate::utils::cid::raw_cid;

    fn leaf(store: &CarStore, data: &[u8]) -> Link {
        let cid = raw_cid(data);
        store.put_keyed(&cid, data).unwrap();
        Link {
            cid,
            name: String::new(),
            size: data.len() as u64,
        }
    }

    #[test]
    fn file_reads_back_its_chunks() {
        let store = CarStore::new();
        let chunks = vec![leaf(&store, b"abcd"), leaf(&store, b"efg")];
        let root = DagNode::file(chunks).put(&store).unwrap();
        assert_eq!(read_file(&store, &root).unwrap(), b"abcdefg");
    }

    #[test]
    fn oversized_node_is_rejected() {
        let store = CarStore::new();
        let node = DagNode {
            kind: NodeKind::File,
            size: u64::MAX,
            links: vec![leaf(&store, b"data")],
        };
        let root = node.put(&store).unwrap();
        let err = read_file(&store, &root).unwrap_err();
        assert!(err.to_string().contains("links sum to 4"), "{err}");
    }

    #[test]
    fn link_size_must_match_its_chunk() {
        let store = CarStore::new();
        let mut chunk = leaf(&store, b"data");
        chunk.size = 1 << 40;
        let root = DagNode::file(vec![chunk]).put(&store).unwrap();
        assert!(read_file(&store, &root).is_err());
    }

    #[test]
    fn unpack_refuses_a_hash_valid_archive_with_a_bogus_size() {
        let store = CarStore::new();
        let node = DagNode {
            kind: NodeKind::File,
            size: u64::MAX,
            links: vec![leaf(&store, b"data")],
        };
        let root = node.put(&store).unwrap();
        let blocks: Vec<CarBlock> = store.blocks();
        let car = encode_car(&[root], &blocks).unwrap();

        let dir = tempfile::tempdir().unwrap();
        assert!(unpack(&car, dir.path(), ParseOptions::default()).is_err());
    }
}
