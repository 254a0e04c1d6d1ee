// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::client::{QueryOffer, StorageNode};
use crate::error::{VaultError, VaultResult};
use crate::utils::cid::format_for_network;
use crate::utils::units::parse_atto;

const CAR_CONTENT_TYPE: &str = "application/vnd.ipld.car";

/// Shape of the bytes a source returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchFormat {
    /// The file content itself
    #[default]
    Raw,
    /// A CAR holding the DAG under the CID
    Car,
}

/// Something that can hand back content by CID
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Short name reported with retrieval results
    fn label(&self) -> &str;

    async fn fetch(&self, cid: &Cid, format: FetchFormat) -> VaultResult<Vec<u8>>;

    /// One member of a directory DAG. `Ok(None)` means the source cannot
    /// resolve paths and the caller must fetch the whole archive.
    async fn fetch_path(&self, _cid: &Cid, _path: &str) -> VaultResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn has(&self, cid: &Cid) -> VaultResult<bool>;

    /// Content length when the source can tell without a download
    async fn size(&self, _cid: &Cid) -> VaultResult<Option<u64>> {
        Ok(None)
    }
}

fn status_error(what: &str, status: StatusCode) -> VaultError {
    if status == StatusCode::NOT_FOUND {
        VaultError::not_found(what.to_string())
    } else {
        VaultError::network(format!("{what}: HTTP {status}"))
    }
}

/// A public IPFS HTTP gateway addressed by a `{cid}` URL template
#[derive(Clone)]
pub struct HttpGateway {
    http_client: reqwest::Client,
    template: String,
    label: String,
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(template: impl Into<String>, timeout: Duration) -> VaultResult<Self> {
        let template = template.into();
        if !template.contains("{cid}") {
            return Err(VaultError::validation(format!(
                "gateway template '{template}' has no {{cid}} placeholder"
            )));
        }
        let probe = Url::parse(&template.replace("{cid}", "cid"))
            .map_err(|e| VaultError::validation(format!("gateway template '{template}': {e}")))?;
        let label = probe.host_str().unwrap_or("gateway").trim_start_matches("cid.").to_string();
        Ok(Self {
            http_client: reqwest::Client::default(),
            template,
            label,
            timeout,
        })
    }

    /// Gateways for every template in the list; malformed ones are skipped
    pub fn from_templates(templates: &[String], timeout: Duration) -> Vec<Arc<dyn ContentSource>> {
        templates
            .iter()
            .filter_map(|t| match Self::new(t.clone(), timeout) {
                Ok(g) => Some(Arc::new(g) as Arc<dyn ContentSource>),
                Err(e) => {
                    warn!("skipping gateway: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn url_for(&self, cid: &Cid, path: Option<&str>) -> VaultResult<Url> {
        let encoded = format_for_network(cid)?;
        let mut url = Url::parse(&self.template.replace("{cid}", &encoded))
            .map_err(|e| VaultError::validation(format!("gateway url for {cid}: {e}")))?;
        if let Some(path) = path {
            let base = url.path().trim_end_matches('/').to_string();
            url.set_path(&format!("{base}/{}", path.trim_start_matches('/')));
        }
        Ok(url)
    }

    async fn head(&self, cid: &Cid) -> VaultResult<reqwest::Response> {
        let url = self.url_for(cid, None)?;
        Ok(self
            .http_client
            .request(Method::HEAD, url)
            .timeout(self.timeout)
            .send()
            .await?)
    }
}

#[async_trait]
impl ContentSource for HttpGateway {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self, cid: &Cid, format: FetchFormat) -> VaultResult<Vec<u8>> {
        let mut url = self.url_for(cid, None)?;
        if format == FetchFormat::Car {
            url.query_pairs_mut().append_pair("format", "car");
        }
        let mut builder = self.http_client.get(url).timeout(self.timeout);
        if format == FetchFormat::Car {
            builder = builder.header(reqwest::header::ACCEPT, CAR_CONTENT_TYPE);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&format!("{} for {cid}", self.label), status));
        }
        let body = response.bytes().await?;
        debug!("{} served {} bytes for {cid}", self.label, body.len());
        Ok(body.to_vec())
    }

    async fn fetch_path(&self, cid: &Cid, path: &str) -> VaultResult<Option<Vec<u8>>> {
        let url = self.url_for(cid, Some(path))?;
        let response = self.http_client.get(url).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&format!("{} for {cid}/{path}", self.label), status));
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    async fn has(&self, cid: &Cid) -> VaultResult<bool> {
        let status = self.head(cid).await?.status();
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(&format!("{} for {cid}", self.label), s)),
        }
    }

    async fn size(&self, cid: &Cid) -> VaultResult<Option<u64>> {
        let response = self.head(cid).await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(response.content_length())
    }
}

/// A hosted pinning service serving `GET {base}/{cid}` behind a bearer token
#[derive(Clone)]
pub struct HttpPinningService {
    http_client: reqwest::Client,
    base: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpPinningService {
    pub fn new(base: Url, token: Option<&str>, timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::default(),
            base,
            token: token.map(String::from),
            timeout,
        }
    }

    fn request(&self, method: Method, cid: &Cid) -> VaultResult<reqwest::RequestBuilder> {
        let url = self
            .base
            .join(&format_for_network(cid)?)
            .map_err(|e| VaultError::validation(format!("pinning url for {cid}: {e}")))?;
        let mut builder = self.http_client.request(method, url).timeout(self.timeout);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }
}

#[async_trait]
impl ContentSource for HttpPinningService {
    fn label(&self) -> &str {
        "pinning"
    }

    async fn fetch(&self, cid: &Cid, format: FetchFormat) -> VaultResult<Vec<u8>> {
        let mut builder = self.request(Method::GET, cid)?;
        if format == FetchFormat::Car {
            builder = builder.header(reqwest::header::ACCEPT, CAR_CONTENT_TYPE);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&format!("pinning service for {cid}"), status));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn has(&self, cid: &Cid) -> VaultResult<bool> {
        let status = self.request(Method::HEAD, cid)?.send().await?.status();
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(&format!("pinning service for {cid}"), s)),
        }
    }
}

/// Retrieval offers from storage providers, cheapest first
pub async fn provider_offers(
    node: &dyn StorageNode,
    cid: &Cid,
    allowed: &[String],
) -> VaultResult<Vec<QueryOffer>> {
    let mut offers: Vec<QueryOffer> = node
        .find_data(cid)
        .await?
        .into_iter()
        .filter(|o| {
            if !o.is_usable() {
                debug!("ignoring offer from {}: {}", o.miner, o.err);
                return false;
            }
            allowed.is_empty() || allowed.iter().any(|m| m == &o.miner)
        })
        .collect();
    offers.sort_by_key(|o| offer_total(o).map(|t| t.atto().clone()).unwrap_or_default());
    Ok(offers)
}

/// `unseal + price_per_byte * size` of an offer
pub fn offer_total(offer: &QueryOffer) -> VaultResult<TokenAmount> {
    let unseal = parse_atto(&offer.unseal_price)?;
    let per_byte = parse_atto(&offer.price_per_byte)?;
    Ok(TokenAmount::from_atto(
        unseal.atto() + per_byte.atto() * BigInt::from(offer.size),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CIDMap, MemoryNode};
    use crate::utils::cid::raw_cid;

    #[test]
    fn gateway_urls() {
        let cid = raw_cid(b"hello");
        let encoded = format_for_network(&cid).unwrap();

        let path_style = HttpGateway::new("https://ipfs.io/ipfs/{cid}", Duration::from_secs(1)).unwrap();
        assert_eq!(path_style.label(), "ipfs.io");
        assert_eq!(
            path_style.url_for(&cid, Some("docs/a.txt")).unwrap().as_str(),
            format!("https://ipfs.io/ipfs/{encoded}/docs/a.txt")
        );

        let subdomain = HttpGateway::new("https://{cid}.ipfs.w3s.link", Duration::from_secs(1)).unwrap();
        assert_eq!(subdomain.label(), "ipfs.w3s.link");
        assert_eq!(
            subdomain.url_for(&cid, None).unwrap().as_str(),
            format!("https://{encoded}.ipfs.w3s.link/")
        );
    }

    #[test]
    fn templates_need_placeholder() {
        assert!(HttpGateway::new("https://ipfs.io/ipfs/", Duration::from_secs(1)).is_err());
        let sources = HttpGateway::from_templates(
            &["bogus".to_string(), "https://dweb.link/ipfs/{cid}".to_string()],
            Duration::from_secs(1),
        );
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn offer_cost() {
        let offer = QueryOffer {
            err: String::new(),
            root: CIDMap::from(raw_cid(b"x")),
            piece: None,
            size: 1_000,
            min_price: "0".to_string(),
            unseal_price: "500".to_string(),
            price_per_byte: "2".to_string(),
            payment_interval: 0,
            payment_interval_increase: 0,
            miner: "f01000".to_string(),
            miner_peer: None,
        };
        assert_eq!(offer_total(&offer).unwrap().atto().to_string(), "2500");
    }

    #[tokio::test]
    async fn offers_are_filtered_and_sorted() {
        let node = MemoryNode::new(0);
        let data = b"payload".to_vec();
        let root = raw_cid(&data);
        node.add_offer(root, "f01000", data.clone(), 900, 1);
        node.add_offer(root, "f01001", data.clone(), 10, 1);
        node.add_offer(root, "f01002", data, 0, 0);

        let all = provider_offers(&node, &root, &[]).await.unwrap();
        let miners: Vec<_> = all.iter().map(|o| o.miner.as_str()).collect();
        assert_eq!(miners, ["f01002", "f01001", "f01000"]);

        let only = provider_offers(&node, &root, &["f01000".to_string()]).await.unwrap();
        assert_eq!(only.len(), 1);
    }
}
