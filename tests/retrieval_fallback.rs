// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use fil_vault::client::MemoryNode;
use fil_vault::config::RetrievalConfig;
use fil_vault::error::{VaultError, VaultResult};
use fil_vault::retrieval::{
    ContentSource, FetchFormat, RetrievalEngine, RetrievalOptions, RetrievedData,
};
use fil_vault::utils::cid::raw_cid;

/// Serves a fixed map and counts every request
struct CountingSource {
    label: String,
    content: HashMap<Cid, Vec<u8>>,
    fetches: AtomicUsize,
}

impl CountingSource {
    fn empty(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            content: HashMap::new(),
            fetches: AtomicUsize::new(0),
        })
    }

    fn serving(label: &str, cid: Cid, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            content: HashMap::from([(cid, data)]),
            fetches: AtomicUsize::new(0),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for CountingSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self, cid: &Cid, _format: FetchFormat) -> VaultResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.content
            .get(cid)
            .cloned()
            .ok_or_else(|| VaultError::network(format!("{}: HTTP 502", self.label)))
    }

    async fn has(&self, cid: &Cid) -> VaultResult<bool> {
        Ok(self.content.contains_key(cid))
    }
}

fn config() -> RetrievalConfig {
    RetrievalConfig {
        gateways: Vec::new(),
        return_buffer: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn pinning_serves_after_every_gateway_fails() {
    let data = b"pinned content".to_vec();
    let cid = raw_cid(&data);
    let g1 = CountingSource::empty("gw1");
    let g2 = CountingSource::empty("gw2");
    let pin = CountingSource::serving("pinning", cid, data.clone());
    let engine = RetrievalEngine::new(config())
        .with_gateways(vec![g1.clone(), g2.clone()])
        .with_pinning(pin.clone());

    let result = engine.retrieve_data(&cid, &RetrievalOptions::default()).await.unwrap();
    assert_eq!(result.source, "pinning");
    assert_eq!(result.data, RetrievedData::Buffer(data));
    assert_eq!((g1.fetches(), g2.fetches(), pin.fetches()), (1, 1, 1));
}

#[tokio::test]
async fn providers_serve_after_http_sources_fail() {
    let data = b"only on filecoin".to_vec();
    let cid = raw_cid(&data);
    let node = Arc::new(MemoryNode::new(0));
    node.add_offer(cid, "f01002", data.clone(), 0, 5);
    node.add_offer(cid, "f01001", data.clone(), 0, 1);
    let gateway = CountingSource::empty("gw1");
    let pin = CountingSource::empty("pinning");
    let engine = RetrievalEngine::new(config())
        .with_gateways(vec![gateway.clone()])
        .with_pinning(pin.clone())
        .with_node(node);

    let result = engine.retrieve_data(&cid, &RetrievalOptions::default()).await.unwrap();
    // cheapest offer first
    assert_eq!(result.source, "provider:f01001");
    assert_eq!(result.bytes().await.unwrap(), data);
    assert_eq!(gateway.fetches(), 1);
    assert_eq!(pin.fetches(), 1);
}

#[tokio::test]
async fn skipped_stages_are_not_contacted() {
    let data = b"skip the web".to_vec();
    let cid = raw_cid(&data);
    let node = Arc::new(MemoryNode::new(0));
    node.add_offer(cid, "f01001", data.clone(), 0, 0);
    let gateway = CountingSource::serving("gw1", cid, data.clone());
    let pin = CountingSource::serving("pinning", cid, data);
    let engine = RetrievalEngine::new(config())
        .with_gateways(vec![gateway.clone()])
        .with_pinning(pin.clone())
        .with_node(node);

    let options = RetrievalOptions {
        skip_gateways: true,
        skip_pinning: true,
        ..Default::default()
    };
    let result = engine.retrieve_data(&cid, &options).await.unwrap();
    assert_eq!(result.source, "provider:f01001");
    assert_eq!(gateway.fetches() + pin.fetches(), 0);
}

#[tokio::test]
async fn every_stage_failing_is_exhausted() {
    let data = b"lost".to_vec();
    let cid = raw_cid(&data);
    let node = Arc::new(MemoryNode::new(0));
    node.add_offer(cid, "f01001", data, 0, 0);
    node.fail_retrievals_from("f01001");
    let engine = RetrievalEngine::new(config())
        .with_gateways(vec![CountingSource::empty("gw1"), CountingSource::empty("gw2")])
        .with_pinning(CountingSource::empty("pinning"))
        .with_node(node);

    let err = engine
        .retrieve_data(&cid, &RetrievalOptions::default())
        .await
        .unwrap_err();
    let VaultError::ExhaustedProviders { attempts } = err else {
        panic!("expected exhausted providers");
    };
    assert_eq!(attempts.len(), 4);
    assert!(attempts[0].starts_with("gw1"));
    assert!(attempts[2].starts_with("pinning"));
    assert!(attempts[3].starts_with("provider:f01001"));

    // an offer still advertises the content
    assert!(engine.check_data_availability(&cid).await);
    assert!(!engine.check_data_availability(&raw_cid(b"never stored")).await);
}

#[tokio::test]
async fn file_delivery_writes_output_path() {
    let data = b"to disk".to_vec();
    let cid = raw_cid(&data);
    let engine = RetrievalEngine::new(config())
        .with_gateways(vec![CountingSource::serving("gw1", cid, data.clone())]);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("nested/out.bin");

    let options = RetrievalOptions {
        return_buffer: Some(false),
        output_path: Some(out.clone()),
        ..Default::default()
    };
    let result = engine.retrieve_data(&cid, &options).await.unwrap();
    assert_eq!(result.data, RetrievedData::File(out.clone()));
    assert_eq!(result.size, data.len() as u64);
    assert_eq!(std::fs::read(out).unwrap(), data);
}
