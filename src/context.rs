// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use url::Url;

use crate::client::{LotusClient, StorageNode};
use crate::config::VaultConfig;
use crate::deals::{DealManager, HttpIntermediary, StorageIntermediary};
use crate::error::{VaultError, VaultResult};
use crate::proofs::{ChallengeRegistry, ProofEngine, Signer};
use crate::retrieval::RetrievalEngine;

/// Everything the engines share, built once and handed to each call site
pub struct VaultContext {
    config: VaultConfig,
    node: Arc<dyn StorageNode>,
    retrieval: Arc<RetrievalEngine>,
    intermediary: Option<Arc<dyn StorageIntermediary>>,
    signer: Option<Arc<dyn Signer>>,
    challenges: Arc<ChallengeRegistry>,
}

impl VaultContext {
    /// Lotus client, HTTP gateways, pinning service and intermediary as
    /// configured
    pub fn from_config(config: VaultConfig) -> VaultResult<Self> {
        let node: Arc<dyn StorageNode> = Arc::new(LotusClient::from_config(&config.node)?);
        let mut context = Self::with_node(config, node)?;
        if let Some(url) = &context.config.retrieval.intermediary_url {
            let base = Url::parse(url)
                .map_err(|e| VaultError::validation(format!("intermediary_url '{url}': {e}")))?;
            context.intermediary = Some(Arc::new(HttpIntermediary::new(
                base,
                context.config.retrieval.pinning_token.as_deref(),
                context.config.node.request_timeout(),
            )));
        }
        Ok(context)
    }

    /// Configured HTTP sources around an existing node
    pub fn with_node(config: VaultConfig, node: Arc<dyn StorageNode>) -> VaultResult<Self> {
        let retrieval = RetrievalEngine::from_config(config.retrieval.clone())?.with_node(node.clone());
        Ok(Self {
            config,
            node,
            retrieval: Arc::new(retrieval),
            intermediary: None,
            signer: None,
            challenges: Arc::default(),
        })
    }

    /// Replace the retrieval chain, e.g. with custom sources
    pub fn with_retrieval(mut self, retrieval: RetrievalEngine) -> Self {
        self.retrieval = Arc::new(retrieval);
        self
    }

    pub fn with_intermediary(mut self, intermediary: Arc<dyn StorageIntermediary>) -> Self {
        self.intermediary = Some(intermediary);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn node(&self) -> &Arc<dyn StorageNode> {
        &self.node
    }

    pub fn deals(&self) -> DealManager {
        let manager = DealManager::new(
            self.node.clone(),
            self.config.deals.clone(),
            self.config.car.clone(),
        );
        match &self.intermediary {
            Some(intermediary) => manager.with_intermediary(intermediary.clone()),
            None => manager,
        }
    }

    pub fn retrieval(&self) -> Arc<RetrievalEngine> {
        self.retrieval.clone()
    }

    /// Proof engines from one context share replay protection
    pub fn proofs(&self) -> ProofEngine {
        let engine = ProofEngine::new(
            self.node.clone(),
            self.retrieval.clone(),
            self.config.proofs.clone(),
        )
        .with_challenge_registry(self.challenges.clone());
        match &self.signer {
            Some(signer) => engine.with_signer(signer.clone()),
            None => engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::PackInput;
    use crate::client::MemoryNode;
    use crate::deals::DealParams;
    use crate::proofs::{EthSigner, PossessionOptions};
    use crate::retrieval::RetrievalOptions;
    use crate::utils::cid::raw_cid;

    fn context(node: Arc<MemoryNode>) -> VaultContext {
        let mut config = VaultConfig::default();
        config.retrieval.gateways.clear();
        config.deals.client_address = Some("f1client".to_string());
        VaultContext::with_node(config, node).unwrap()
    }

    #[tokio::test]
    async fn deal_then_retrieve_from_the_provider() {
        let node = Arc::new(MemoryNode::new(100));
        node.add_miner("f01000", 10, 1 << 40);
        let ctx = context(node.clone());

        let data = b"round trip through a deal".to_vec();
        let deal = ctx
            .deals()
            .create_storage_deal(PackInput::Bytes(data.clone()), &DealParams::with_provider("f01000"))
            .await
            .unwrap();
        assert!(deal.deal_id.is_some());

        let cid = raw_cid(&data);
        node.add_offer(cid, "f01000", data.clone(), 0, 0);
        let result = ctx
            .retrieval()
            .retrieve_data(&cid, &RetrievalOptions::default())
            .await
            .unwrap();
        assert_eq!(result.bytes().await.unwrap(), data);
    }

    #[tokio::test]
    async fn replayed_seed_is_rejected_across_engines() {
        let node = Arc::new(MemoryNode::new(0));
        let data = b"custody".to_vec();
        let cid = raw_cid(&data);
        node.add_offer(cid, "f01000", data, 0, 0);
        let ctx = context(node).with_signer(Arc::new(EthSigner::random()));

        let options = PossessionOptions {
            random_seed: Some([3; 32]),
            ..Default::default()
        };
        ctx.proofs().generate_possession_proof(&cid, &options).await.unwrap();
        let err = ctx
            .proofs()
            .generate_possession_proof(&cid, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation { .. }));
    }
}
