// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::{VaultError, VaultResult};
use crate::utils::cid::{cid_string, parse_cid};

/// Acknowledgement from a hosted storage service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    #[serde(with = "cid_string")]
    pub cid: Cid,
    /// Service-assigned upload identifier
    pub request_id: String,
}

/// A hosted service that takes a CAR and arranges deals on the client's
/// behalf
#[async_trait]
pub trait StorageIntermediary: Send + Sync {
    fn name(&self) -> &str;

    async fn upload_car(&self, car: Vec<u8>, root: &Cid) -> VaultResult<UploadReceipt>;
}

/// Uploads to `POST {base}/car` with an optional bearer token
#[derive(Clone)]
pub struct HttpIntermediary {
    http_client: reqwest::Client,
    base: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpIntermediary {
    pub fn new(base: Url, token: Option<&str>, timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::default(),
            base,
            token: token.map(String::from),
            timeout,
        }
    }

    fn upload_url(&self) -> VaultResult<Url> {
        self.base
            .join("car")
            .map_err(|e| VaultError::validation(format!("intermediary url {}: {e}", self.base)))
    }
}

#[async_trait]
impl StorageIntermediary for HttpIntermediary {
    fn name(&self) -> &str {
        self.base.host_str().unwrap_or("intermediary")
    }

    async fn upload_car(&self, car: Vec<u8>, root: &Cid) -> VaultResult<UploadReceipt> {
        let url = self.upload_url()?;
        debug!("uploading {} byte CAR for {root} to {url}", car.len());

        let mut builder = self
            .http_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/vnd.ipld.car")
            .body(car)
            .timeout(self.timeout);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VaultError::network(format!(
                "upload failed with HTTP {status}: {body}"
            )));
        }
        let body: Value = response.json().await?;

        let cid = match body.get("cid").and_then(Value::as_str) {
            Some(s) => parse_cid(s)?,
            None => *root,
        };
        if &cid != root {
            warn!("intermediary reported root {cid}, expected {root}");
        }
        let request_id = ["requestId", "requestid", "id"]
            .iter()
            .find_map(|k| body.get(*k))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| cid.to_string());

        Ok(UploadReceipt { cid, request_id })
    }
}
