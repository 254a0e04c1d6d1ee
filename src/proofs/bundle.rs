// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use cid::Cid;
use serde::{Deserialize, Serialize};

use crate::merkle::{hex_digest, Digest, MerkleProof};
use crate::utils::cid::cid_string;

/// Serde helpers for raw bytes carried as standard base64 strings
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as B64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&B64.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        B64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Evidence that a block is part of the CAR stored under a deal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    pub deal_id: u64,
    #[serde(with = "cid_string")]
    pub piece_cid: Cid,
    /// Root of the stored payload
    #[serde(with = "cid_string")]
    pub data_cid: Cid,
    /// The block being proven
    #[serde(with = "cid_string")]
    pub block_cid: Cid,
    pub merkle_proof: MerkleProof,
    /// Address of the signer
    pub prover: String,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    /// Unix seconds at issuance
    pub timestamp: i64,
}

/// Hash of one content sample and where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PossessionSample {
    pub source: String,
    pub length: u64,
    #[serde(with = "hex_digest")]
    pub hash: Digest,
}

/// Challenge/response evidence of current custody of some content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PossessionProof {
    #[serde(with = "cid_string")]
    pub cid: Cid,
    pub prover: String,
    #[serde(with = "hex_digest")]
    pub seed: Digest,
    #[serde(with = "hex_digest")]
    pub challenge: Digest,
    #[serde(with = "hex_digest")]
    pub response: Digest,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub samples: Vec<PossessionSample>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::cid::raw_cid;

    #[test]
    fn possession_proof_json_shape() {
        let proof = PossessionProof {
            cid: raw_cid(b"content"),
            prover: "0xabc".to_string(),
            seed: [1u8; 32],
            challenge: [2u8; 32],
            response: [3u8; 32],
            signature: vec![0xff, 0x00, 0x10],
            samples: vec![PossessionSample {
                source: "ipfs.io".to_string(),
                length: 7,
                hash: [4u8; 32],
            }],
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json["signature"], "/wAQ");
        assert_eq!(json["seed"], format!("0x{}", "01".repeat(32)));
        assert_eq!(json["samples"][0]["source"], "ipfs.io");
        let back: PossessionProof = serde_json::from_value(json).unwrap();
        assert_eq!(back, proof);
    }

    #[test]
    fn rejects_short_digest() {
        let err = serde_json::from_str::<PossessionSample>(r#"{"source":"x","length":1,"hash":"0x12"}"#);
        assert!(err.is_err());
    }
}
