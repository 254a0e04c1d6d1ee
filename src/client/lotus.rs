// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::time::Duration;
use url::Url;

use super::types::{
    ApiVersion, CIDMap, ChainHead, CommPResult, DealInfo, FileRef, ImportResult, MarketDeal,
    MinerInfo, MinerPower, QueryOffer, StartDealParams, StorageAsk,
};
use super::StorageNode;
use crate::config::NodeConfig;
use crate::error::{VaultError, VaultResult};

/// Request timeout of the RPC client
const DEFAULT_REQ_TIMEOUT: Duration = Duration::from_secs(250);

/// A simple Lotus RPC client
#[derive(Clone)]
pub struct LotusClient {
    http_client: reqwest::Client,
    url: Url,
    bearer_token: Option<String>,
    timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl LotusClient {
    /// Creates a new Lotus client that sends requests to `url`
    pub fn new(url: Url, bearer_token: Option<&str>) -> Self {
        Self {
            http_client: reqwest::Client::default(),
            url,
            bearer_token: bearer_token.map(String::from),
            timeout: DEFAULT_REQ_TIMEOUT,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn from_config(config: &NodeConfig) -> VaultResult<Self> {
        let url = Url::parse(&config.rpc_url)
            .map_err(|e| VaultError::validation(format!("rpc_url '{}': {e}", config.rpc_url)))?;
        Ok(Self::new(url, config.bearer_token.as_deref()).with_timeout(config.request_timeout()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Make a generic RPC request
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> VaultResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        });

        tracing::debug!("{} request #{}: {}", method, id, request_body);

        let mut builder = self
            .http_client
            .post(self.url.as_str())
            .json(&request_body)
            .timeout(self.timeout);

        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let response_body = response.text().await?;
        tracing::debug!("{} raw response: {}", method, response_body);

        // Parse the JSON-RPC response
        let value: Value = match serde_json::from_str(&response_body) {
            Ok(value) => value,
            Err(_) if !status.is_success() => {
                return Err(VaultError::network(format!("{method} failed with HTTP {status}")));
            }
            Err(e) => {
                return Err(VaultError::network(format!("{method} returned invalid JSON: {e}")));
            }
        };

        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let error_msg = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            Err(VaultError::network(format!("{method} RPC error: {error_msg}")))
        } else if let Some(result) = value.get("result") {
            serde_json::from_value(result.clone()).map_err(|e| {
                VaultError::network(format!("{method} returned an unexpected result shape: {e}"))
            })
        } else if !status.is_success() {
            Err(VaultError::network(format!("{method} failed with HTTP {status}")))
        } else {
            Err(VaultError::network(format!(
                "{method} response has neither result nor error"
            )))
        }
    }

    /// Probe the node with a lightweight version call; never fails
    pub async fn is_connected(&self) -> bool {
        match self.version().await {
            Ok(v) => {
                tracing::debug!("connected to node {}", v.version);
                true
            }
            Err(e) => {
                tracing::debug!("node unreachable at {}: {e}", self.url);
                false
            }
        }
    }
}

#[async_trait]
impl StorageNode for LotusClient {
    async fn version(&self) -> VaultResult<ApiVersion> {
        self.request("Filecoin.Version", json!([])).await
    }

    async fn chain_head(&self) -> VaultResult<ChainHead> {
        let r = self
            .request::<ChainHead>("Filecoin.ChainHead", json!([]))
            .await?;
        tracing::debug!("received chain_head at height {}", r.height);
        Ok(r)
    }

    async fn list_miners(&self) -> VaultResult<Vec<String>> {
        self.request("Filecoin.StateListMiners", json!([null])).await
    }

    async fn miner_power(&self, miner: &str) -> VaultResult<MinerPower> {
        self.request("Filecoin.StateMinerPower", json!([miner, null]))
            .await
    }

    async fn miner_info(&self, miner: &str) -> VaultResult<MinerInfo> {
        self.request("Filecoin.StateMinerInfo", json!([miner, null]))
            .await
    }

    async fn query_ask(&self, peer_id: &str, miner: &str) -> VaultResult<StorageAsk> {
        self.request("Filecoin.ClientQueryAsk", json!([peer_id, miner]))
            .await
    }

    async fn import(&self, path: &Path, is_car: bool) -> VaultResult<ImportResult> {
        let file_ref = FileRef {
            path: path.display().to_string(),
            is_car,
        };
        self.request("Filecoin.ClientImport", json!([file_ref])).await
    }

    async fn calc_commp(&self, path: &Path) -> VaultResult<CommPResult> {
        self.request("Filecoin.ClientCalcCommP", json!([path.display().to_string()]))
            .await
    }

    async fn start_deal(&self, params: &StartDealParams) -> VaultResult<Cid> {
        let proposal: CIDMap = self
            .request("Filecoin.ClientStartDeal", json!([params]))
            .await?;
        Cid::try_from(&proposal)
    }

    async fn deal_info(&self, proposal: &Cid) -> VaultResult<DealInfo> {
        self.request("Filecoin.ClientGetDealInfo", json!([CIDMap::from(proposal)]))
            .await
    }

    async fn market_deal(&self, deal_id: u64) -> VaultResult<MarketDeal> {
        self.request("Filecoin.StateMarketStorageDeal", json!([deal_id, null]))
            .await
            .map_err(|e| match e {
                VaultError::Network { message, .. } if message.contains("not found") => {
                    VaultError::not_found(format!("deal {deal_id}"))
                }
                other => other,
            })
    }

    async fn find_data(&self, root: &Cid) -> VaultResult<Vec<QueryOffer>> {
        let offers: Option<Vec<QueryOffer>> = self
            .request("Filecoin.ClientFindData", json!([CIDMap::from(root), null]))
            .await?;
        Ok(offers.unwrap_or_default())
    }

    async fn query_offer(&self, miner: &str, root: &Cid) -> VaultResult<QueryOffer> {
        self.request(
            "Filecoin.ClientMinerQueryOffer",
            json!([miner, CIDMap::from(root), null]),
        )
        .await
    }

    async fn retrieve(&self, offer: &QueryOffer, out: &Path, is_car: bool) -> VaultResult<()> {
        let order = json!({
            "Root": offer.root,
            "Piece": offer.piece,
            "Size": offer.size,
            "Total": offer.min_price,
            "UnsealPrice": offer.unseal_price,
            "PaymentInterval": offer.payment_interval,
            "PaymentIntervalIncrease": offer.payment_interval_increase,
            "Miner": offer.miner,
            "MinerPeer": offer.miner_peer,
        });
        let file_ref = FileRef {
            path: out.display().to_string(),
            is_car,
        };
        let _: Option<Value> = self
            .request("Filecoin.ClientRetrieve", json!([order, file_ref]))
            .await?;
        Ok(())
    }

    async fn current_epoch(&self) -> VaultResult<ChainEpoch> {
        Ok(self.chain_head().await?.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_node_is_not_connected() {
        let client = LotusClient::new(Url::parse("http://127.0.0.1:9/rpc/v0").unwrap(), None)
            .with_timeout(Duration::from_millis(200));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn request_failures_surface_as_network_errors() {
        let client = LotusClient::new(Url::parse("http://127.0.0.1:9/rpc/v0").unwrap(), None)
            .with_timeout(Duration::from_millis(200));
        let err = client.chain_head().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn request_ids_increase() {
        let client = LotusClient::new(Url::parse("http://localhost:1234/rpc/v0").unwrap(), None);
        let a = client.next_id.fetch_add(1, Ordering::Relaxed);
        let b = client.next_id.fetch_add(1, Ordering::Relaxed);
        assert!(b > a);
    }
}
