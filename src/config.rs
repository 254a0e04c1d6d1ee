// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{VaultError, VaultResult};

/// Epochs per day at a 30 second block time
pub const EPOCHS_PER_DAY: i64 = 2_880;

/// Complete runtime configuration, loaded from an optional TOML file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct VaultConfig {
    pub node: NodeConfig,
    pub deals: DealConfig,
    pub retrieval: RetrievalConfig,
    pub car: CarConfig,
    pub proofs: ProofConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub rpc_url: String,
    pub bearer_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.calibration.node.glif.io/rpc/v1".to_string(),
            bearer_token: None,
            request_timeout_secs: 250,
        }
    }
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DealConfig {
    pub client_address: Option<String>,
    pub default_duration_epochs: i64,
    pub min_duration_epochs: i64,
    pub max_duration_epochs: i64,
    /// Delay between proposal and the deal start epoch
    pub start_delay_epochs: i64,
    pub min_replication: usize,
    pub max_replication: usize,
    pub provider_fanout: usize,
    pub probe_timeout_secs: u64,
    pub poll_attempts: u32,
    pub poll_base_delay_ms: u64,
    pub poll_max_delay_ms: u64,
    pub renewal_lookahead_epochs: i64,
    pub verified: bool,
    pub fast_retrieval: bool,
    /// Known miner regions; the chain does not publish them
    pub provider_regions: HashMap<String, String>,
}

impl Default for DealConfig {
    fn default() -> Self {
        Self {
            client_address: None,
            default_duration_epochs: 180 * EPOCHS_PER_DAY,
            min_duration_epochs: 180 * EPOCHS_PER_DAY,
            max_duration_epochs: 540 * EPOCHS_PER_DAY,
            start_delay_epochs: 2 * EPOCHS_PER_DAY,
            min_replication: 1,
            max_replication: 5,
            provider_fanout: 50,
            probe_timeout_secs: 10,
            poll_attempts: 10,
            poll_base_delay_ms: 2_000,
            poll_max_delay_ms: 60_000,
            renewal_lookahead_epochs: 30 * EPOCHS_PER_DAY,
            verified: false,
            fast_retrieval: true,
            provider_regions: HashMap::new(),
        }
    }
}

impl DealConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// URL templates; `{cid}` is substituted
    pub gateways: Vec<String>,
    pub gateway_timeout_secs: u64,
    pub pinning_url: Option<String>,
    pub pinning_token: Option<String>,
    pub intermediary_url: Option<String>,
    pub return_buffer: bool,
    pub download_dir: Option<PathBuf>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            gateways: vec![
                "https://ipfs.io/ipfs/{cid}".to_string(),
                "https://dweb.link/ipfs/{cid}".to_string(),
                "https://{cid}.ipfs.w3s.link".to_string(),
            ],
            gateway_timeout_secs: 30,
            pinning_url: None,
            pinning_token: None,
            intermediary_url: None,
            return_buffer: true,
            download_dir: None,
        }
    }
}

impl RetrievalConfig {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CarConfig {
    pub chunk_size: usize,
    /// Re-hash every block against its CID when reading archives
    pub verify_blocks: bool,
}

impl Default for CarConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            verify_blocks: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProofConfig {
    pub possession_samples: usize,
    pub sample_bytes: usize,
    /// Addresses whose proofs are accepted besides the engine's own signer
    pub trusted_provers: Vec<String>,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            possession_samples: 2,
            sample_bytes: 1024 * 1024,
            trusted_provers: Vec::new(),
        }
    }
}

impl VaultConfig {
    /// Load from a TOML file and apply environment overrides
    pub fn load(path: Option<&Path>) -> VaultResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                let config: VaultConfig = toml::from_str(&raw)
                    .map_err(|e| VaultError::validation(format!("config {}: {e}", path.display())))?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            None => VaultConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("FIL_VAULT_RPC_URL") {
            self.node.rpc_url = url;
        }
        if let Ok(token) = std::env::var("FIL_VAULT_RPC_TOKEN") {
            self.node.bearer_token = Some(token);
        }
        if let Ok(token) = std::env::var("FIL_VAULT_PINNING_TOKEN") {
            self.retrieval.pinning_token = Some(token);
        }
    }

    pub fn validate(&self) -> VaultResult<()> {
        let deals = &self.deals;
        if deals.min_duration_epochs <= 0 || deals.min_duration_epochs > deals.max_duration_epochs {
            return Err(VaultError::validation(format!(
                "invalid duration bounds [{}, {}]",
                deals.min_duration_epochs, deals.max_duration_epochs
            )));
        }
        if deals.min_replication == 0 || deals.min_replication > deals.max_replication {
            return Err(VaultError::validation(format!(
                "invalid replication bounds [{}, {}]",
                deals.min_replication, deals.max_replication
            )));
        }
        if self.car.chunk_size == 0 {
            return Err(VaultError::validation("car.chunk_size must be positive"));
        }
        for template in &self.retrieval.gateways {
            if !template.contains("{cid}") {
                return Err(VaultError::validation(format!(
                    "gateway template '{template}' lacks a {{cid}} placeholder"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        VaultConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: VaultConfig = toml::from_str(
            r#"
            [deals]
            min_replication = 2
            [car]
            verify_blocks = false
            "#,
        )
        .unwrap();
        assert_eq!(config.deals.min_replication, 2);
        assert_eq!(config.deals.max_replication, 5);
        assert!(!config.car.verify_blocks);
        assert_eq!(config.node.request_timeout_secs, 250);
    }

    #[test]
    fn rejects_gateway_without_placeholder() {
        let mut config = VaultConfig::default();
        config.retrieval.gateways = vec!["https://ipfs.io/ipfs/".into()];
        assert!(matches!(
            config.validate(),
            Err(VaultError::Validation { .. })
        ));
    }
}
