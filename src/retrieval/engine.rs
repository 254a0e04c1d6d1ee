// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cid::Cid;
use fvm_shared::econ::TokenAmount;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::sources::{
    offer_total, provider_offers, ContentSource, FetchFormat, HttpGateway, HttpPinningService,
};
use crate::car::{parse_car, ParseOptions};
use crate::client::StorageNode;
use crate::config::RetrievalConfig;
use crate::error::{VaultError, VaultResult};
use crate::utils::cid::{cid_string, verify_block};
use crate::utils::units::{atto_string, parse_atto};

/// Multicodec of raw leaves; these can be checked against their CID directly
const RAW_CODEC: u64 = 0x55;

/// Label prefix of results served by a storage provider
pub const PROVIDER_LABEL_PREFIX: &str = "provider:";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrievalOptions {
    /// Return bytes instead of a file; defaults to the configured value
    pub return_buffer: Option<bool>,
    pub output_path: Option<PathBuf>,
    /// Per-source timeout; defaults to the gateway timeout
    #[serde(skip)]
    pub timeout: Option<Duration>,
    pub skip_gateways: bool,
    pub skip_pinning: bool,
    /// Restrict provider retrieval to these miners
    pub providers: Vec<String>,
    pub format: FetchFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievedData {
    Buffer(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub cid: Cid,
    /// Which source served the content
    pub source: String,
    pub size: u64,
    pub data: RetrievedData,
}

impl RetrievalResult {
    /// The content, reading it back from disk if it was written out
    pub async fn bytes(&self) -> VaultResult<Vec<u8>> {
        match &self.data {
            RetrievedData::Buffer(b) => Ok(b.clone()),
            RetrievedData::File(p) => Ok(tokio::fs::read(p).await?),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalCost {
    #[serde(with = "cid_string")]
    pub cid: Cid,
    pub miner: String,
    #[serde(with = "atto_string")]
    pub unseal_price: TokenAmount,
    #[serde(with = "atto_string")]
    pub price_per_byte: TokenAmount,
    pub size: u64,
    #[serde(with = "atto_string")]
    pub total: TokenAmount,
}

/// Fetches content by CID from gateways, then the pinning service, then
/// storage providers. The first source to return verified bytes wins.
pub struct RetrievalEngine {
    gateways: Vec<Arc<dyn ContentSource>>,
    pinning: Option<Arc<dyn ContentSource>>,
    node: Option<Arc<dyn StorageNode>>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            gateways: Vec::new(),
            pinning: None,
            node: None,
            config,
        }
    }

    /// Gateways and pinning service as configured
    pub fn from_config(config: RetrievalConfig) -> VaultResult<Self> {
        let timeout = config.gateway_timeout();
        let gateways = HttpGateway::from_templates(&config.gateways, timeout);
        let pinning = match &config.pinning_url {
            Some(url) => {
                let base = Url::parse(url)
                    .map_err(|e| VaultError::validation(format!("pinning_url '{url}': {e}")))?;
                Some(Arc::new(HttpPinningService::new(
                    base,
                    config.pinning_token.as_deref(),
                    timeout,
                )) as Arc<dyn ContentSource>)
            }
            None => None,
        };
        Ok(Self {
            gateways,
            pinning,
            node: None,
            config,
        })
    }

    pub fn with_gateways(mut self, gateways: Vec<Arc<dyn ContentSource>>) -> Self {
        self.gateways = gateways;
        self
    }

    pub fn with_pinning(mut self, pinning: Arc<dyn ContentSource>) -> Self {
        self.pinning = Some(pinning);
        self
    }

    pub fn with_node(mut self, node: Arc<dyn StorageNode>) -> Self {
        self.node = Some(node);
        self
    }

    fn timeout(&self, options: &RetrievalOptions) -> Duration {
        options.timeout.unwrap_or_else(|| self.config.gateway_timeout())
    }

    fn http_stages<'a>(&'a self, options: &RetrievalOptions) -> Vec<&'a Arc<dyn ContentSource>> {
        let mut stages = Vec::new();
        if !options.skip_gateways {
            stages.extend(self.gateways.iter());
        }
        if !options.skip_pinning {
            stages.extend(self.pinning.iter());
        }
        stages
    }

    /// Retrieve `cid` through the fallback chain. Each failing source is
    /// logged and skipped; `ExhaustedProviders` lists every attempt when
    /// nothing served the content.
    pub async fn retrieve_data(
        &self,
        cid: &Cid,
        options: &RetrievalOptions,
    ) -> VaultResult<RetrievalResult> {
        let timeout = self.timeout(options);
        let mut attempts = Vec::new();

        for source in self.http_stages(options) {
            let fetched = match tokio::time::timeout(timeout, source.fetch(cid, options.format)).await
            {
                Ok(result) => result,
                Err(_) => Err(VaultError::network(format!("timed out after {timeout:?}"))),
            };
            match fetched.and_then(|bytes| check_content(cid, options.format, bytes)) {
                Ok(bytes) => return self.deliver(cid, source.label(), bytes, options).await,
                Err(e) => {
                    warn!("{} could not serve {cid}: {e}", source.label());
                    attempts.push(format!("{}: {e}", source.label()));
                }
            }
        }

        match &self.node {
            Some(node) => {
                let served = self
                    .from_providers(node.as_ref(), cid, options, timeout, &mut attempts)
                    .await;
                if let Some((label, bytes)) = served {
                    return self.deliver(cid, &label, bytes, options).await;
                }
            }
            None => attempts.push("providers: no storage node configured".to_string()),
        }

        Err(VaultError::exhausted(attempts))
    }

    async fn from_providers(
        &self,
        node: &dyn StorageNode,
        cid: &Cid,
        options: &RetrievalOptions,
        timeout: Duration,
        attempts: &mut Vec<String>,
    ) -> Option<(String, Vec<u8>)> {
        let offers = match provider_offers(node, cid, &options.providers).await {
            Ok(offers) if offers.is_empty() => {
                attempts.push(format!("providers: no offers for {cid}"));
                return None;
            }
            Ok(offers) => offers,
            Err(e) => {
                warn!("provider lookup for {cid} failed: {e}");
                attempts.push(format!("providers: {e}"));
                return None;
            }
        };

        for offer in offers {
            let label = format!("{PROVIDER_LABEL_PREFIX}{}", offer.miner);
            let result = async {
                let dir = tempfile::Builder::new().prefix("fil-vault-retrieve-").tempdir()?;
                let out = dir.path().join(cid.to_string());
                let is_car = options.format == FetchFormat::Car;
                tokio::time::timeout(timeout, node.retrieve(&offer, &out, is_car))
                    .await
                    .map_err(|_| VaultError::network(format!("timed out after {timeout:?}")))??;
                let bytes = tokio::fs::read(&out).await?;
                check_content(cid, options.format, bytes)
            }
            .await;
            match result {
                Ok(bytes) => return Some((label, bytes)),
                Err(e) => {
                    warn!("{label} could not serve {cid}: {e}");
                    attempts.push(format!("{label}: {e}"));
                }
            }
        }
        None
    }

    async fn deliver(
        &self,
        cid: &Cid,
        source: &str,
        bytes: Vec<u8>,
        options: &RetrievalOptions,
    ) -> VaultResult<RetrievalResult> {
        let size = bytes.len() as u64;
        info!("retrieved {cid} ({size} bytes) from {source}");
        let return_buffer = options.return_buffer.unwrap_or(self.config.return_buffer);
        let data = if return_buffer {
            RetrievedData::Buffer(bytes)
        } else {
            let path = match &options.output_path {
                Some(path) => path.clone(),
                None => self
                    .config
                    .download_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir)
                    .join(cid.to_string()),
            };
            write_atomically(path.clone(), bytes).await?;
            RetrievedData::File(path)
        };
        Ok(RetrievalResult {
            cid: *cid,
            source: source.to_string(),
            size,
            data,
        })
    }

    /// The first `max_bytes` of `cid` from up to `count` distinct sources,
    /// walking the chain in its usual order
    pub async fn collect_samples(
        &self,
        cid: &Cid,
        count: usize,
        max_bytes: usize,
    ) -> VaultResult<Vec<(String, Vec<u8>)>> {
        let options = RetrievalOptions::default();
        let timeout = self.timeout(&options);
        let mut samples = Vec::new();
        let mut attempts = Vec::new();

        for source in self.http_stages(&options) {
            if samples.len() >= count {
                break;
            }
            let fetched = match tokio::time::timeout(timeout, source.fetch(cid, FetchFormat::Raw)).await
            {
                Ok(result) => result,
                Err(_) => Err(VaultError::network(format!("timed out after {timeout:?}"))),
            };
            match fetched.and_then(|bytes| check_content(cid, FetchFormat::Raw, bytes)) {
                Ok(mut bytes) => {
                    bytes.truncate(max_bytes);
                    samples.push((source.label().to_string(), bytes));
                }
                Err(e) => {
                    debug!("{} gave no sample of {cid}: {e}", source.label());
                    attempts.push(format!("{}: {e}", source.label()));
                }
            }
        }
        if samples.len() < count {
            if let Some(node) = &self.node {
                let served = self
                    .from_providers(node.as_ref(), cid, &options, timeout, &mut attempts)
                    .await;
                if let Some((label, mut bytes)) = served {
                    bytes.truncate(max_bytes);
                    samples.push((label, bytes));
                }
            }
        }
        if samples.is_empty() {
            return Err(VaultError::exhausted(attempts));
        }
        Ok(samples)
    }

    /// Whether any source in the chain reports the content. Never fails.
    pub async fn check_data_availability(&self, cid: &Cid) -> bool {
        let options = RetrievalOptions::default();
        let timeout = self.timeout(&options);
        for source in self.http_stages(&options) {
            match tokio::time::timeout(timeout, source.has(cid)).await {
                Ok(Ok(true)) => {
                    debug!("{cid} available from {}", source.label());
                    return true;
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => debug!("availability check on {} failed: {e}", source.label()),
                Err(_) => debug!("availability check on {} timed out", source.label()),
            }
        }
        if let Some(node) = &self.node {
            match tokio::time::timeout(timeout, provider_offers(node.as_ref(), cid, &[])).await {
                Ok(Ok(offers)) => return !offers.is_empty(),
                Ok(Err(e)) => debug!("provider lookup for {cid} failed: {e}"),
                Err(_) => debug!("provider lookup for {cid} timed out"),
            }
        }
        false
    }

    /// `unseal + price_per_byte * size` for retrieving `cid` from `miner`.
    /// The offer's size is used when known, else the first size a source
    /// reports.
    pub async fn get_retrieval_cost(&self, cid: &Cid, miner: &str) -> VaultResult<RetrievalCost> {
        let node = self
            .node
            .as_ref()
            .ok_or_else(|| VaultError::validation("no storage node configured"))?;
        let mut offer = node.query_offer(miner, cid).await?;
        if !offer.is_usable() {
            return Err(VaultError::not_found(format!(
                "retrieval offer for {cid} from {miner}: {}",
                offer.err
            )));
        }
        if offer.size == 0 {
            offer.size = self.estimate_size(cid).await.unwrap_or(0);
        }
        Ok(RetrievalCost {
            cid: *cid,
            miner: miner.to_string(),
            unseal_price: parse_atto(&offer.unseal_price)?,
            price_per_byte: parse_atto(&offer.price_per_byte)?,
            size: offer.size,
            total: offer_total(&offer)?,
        })
    }

    async fn estimate_size(&self, cid: &Cid) -> Option<u64> {
        for source in self.http_stages(&RetrievalOptions::default()) {
            if let Ok(Some(size)) = source.size(cid).await {
                return Some(size);
            }
        }
        None
    }

    /// Retrieve one file inside a directory DAG. Sources that resolve
    /// paths are asked first; otherwise the whole CAR is fetched and
    /// searched locally.
    pub async fn retrieve_file_from_cid(
        &self,
        cid: &Cid,
        path: &str,
        options: &RetrievalOptions,
    ) -> VaultResult<RetrievalResult> {
        let timeout = self.timeout(options);
        for source in self.http_stages(options) {
            match tokio::time::timeout(timeout, source.fetch_path(cid, path)).await {
                Ok(Ok(Some(bytes))) => {
                    let label = format!("{}:{path}", source.label());
                    return self.deliver(cid, &label, bytes, options).await;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!("{} could not resolve {cid}/{path}: {e}", source.label()),
                Err(_) => debug!("{} timed out resolving {cid}/{path}", source.label()),
            }
        }

        let whole = RetrievalOptions {
            return_buffer: Some(true),
            format: FetchFormat::Car,
            ..options.clone()
        };
        let archive = self.retrieve_data(cid, &whole).await?;
        let RetrievedData::Buffer(car) = &archive.data else {
            return Err(VaultError::validation("archive was not returned in memory"));
        };
        let bytes = parse_car(car, ParseOptions::default())?
            .find_path(path)?
            .ok_or_else(|| VaultError::not_found(format!("{path} under {cid}")))?;
        self.deliver(cid, &archive.source, bytes, options).await
    }
}

/// Reject content that does not match `cid`. Raw blocks are re-hashed,
/// CARs must parse with verified blocks and declare `cid` as a root.
fn check_content(cid: &Cid, format: FetchFormat, bytes: Vec<u8>) -> VaultResult<Vec<u8>> {
    match format {
        FetchFormat::Raw if cid.codec() == RAW_CODEC => verify_block(cid, &bytes)?,
        FetchFormat::Raw => {}
        FetchFormat::Car => {
            let archive = parse_car(&bytes, ParseOptions::default())?;
            if !archive.roots().contains(cid) {
                return Err(VaultError::verification(format!(
                    "archive roots {:?} do not include {cid}",
                    archive.roots()
                )));
            }
        }
    }
    Ok(bytes)
}

/// Write through a temporary file in the target directory and rename it
/// into place, so readers never observe a partial file
async fn write_atomically(path: PathBuf, bytes: Vec<u8>) -> VaultResult<()> {
    tokio::task::spawn_blocking(move || -> VaultResult<()> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("create {}", parent.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&path)
            .map_err(|e| VaultError::from(e.error))?;
        Ok(())
    })
    .await
    .context("write task panicked")?
}
