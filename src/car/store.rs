// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use anyhow::Result;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use parking_lot::RwLock;

use super::format::CarBlock;
use crate::utils::cid::verify_block;

#[derive(Default)]
struct Inner {
    order: Vec<Cid>,
    data: HashMap<Cid, Vec<u8>>,
}

/// In-memory blockstore that remembers insertion order and, unless
/// built as trusted, checks every block against its CID on put
pub struct CarStore {
    inner: RwLock<Inner>,
    verify: bool,
}

impl CarStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            verify: true,
        }
    }

    /// Skip hash verification on put, for blocks from a trusted source
    pub fn trusted() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            verify: false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks in first-insertion order
    pub fn blocks(&self) -> Vec<CarBlock> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|cid| {
                inner.data.get(cid).map(|data| CarBlock {
                    cid: *cid,
                    data: data.clone(),
                })
            })
            .collect()
    }

    /// Total payload bytes held
    pub fn total_size(&self) -> usize {
        self.inner.read().data.values().map(Vec::len).sum()
    }
}

impl Default for CarStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockstore for CarStore {
    fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().data.get(cid).cloned())
    }

    fn put_keyed(&self, cid: &Cid, data: &[u8]) -> Result<()> {
        if self.verify {
            verify_block(cid, data)?;
        }
        let mut inner = self.inner.write();
        if !inner.data.contains_key(cid) {
            inner.order.push(*cid);
            inner.data.insert(*cid, data.to_vec());
        }
        Ok(())
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.inner.read().data.contains_key(cid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::cid::raw_cid;

    #[test]
    fn rejects_mismatched_block() {
        let store = CarStore::new();
        let cid = raw_cid(b"good");
        assert!(store.put_keyed(&cid, b"evil").is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn trusted_store_accepts_anything() {
        let store = CarStore::trusted();
        let cid = raw_cid(b"good");
        store.put_keyed(&cid, b"evil").unwrap();
        assert_eq!(store.get(&cid).unwrap().unwrap(), b"evil");
    }

    #[test]
    fn keeps_first_insertion_order_and_dedups() {
        let store = CarStore::new();
        let a = raw_cid(b"a");
        let b = raw_cid(b"b");
        store.put_keyed(&b, b"b").unwrap();
        store.put_keyed(&a, b"a").unwrap();
        store.put_keyed(&b, b"b").unwrap();
        let order: Vec<Cid> = store.blocks().into_iter().map(|b| b.cid).collect();
        assert_eq!(order, vec![b, a]);
    }
}
