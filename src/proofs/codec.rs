// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::bundle::{InclusionProof, PossessionProof};
use crate::error::{VaultError, VaultResult};
use crate::merkle::MerkleProof;

/// Any proof this crate issues, tagged with its kind on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProofEnvelope {
    Inclusion(InclusionProof),
    Possession(PossessionProof),
    Merkle(MerkleProof),
}

impl ProofEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ProofEnvelope::Inclusion(_) => "inclusion",
            ProofEnvelope::Possession(_) => "possession",
            ProofEnvelope::Merkle(_) => "merkle",
        }
    }
}

impl From<InclusionProof> for ProofEnvelope {
    fn from(proof: InclusionProof) -> Self {
        ProofEnvelope::Inclusion(proof)
    }
}

impl From<PossessionProof> for ProofEnvelope {
    fn from(proof: PossessionProof) -> Self {
        ProofEnvelope::Possession(proof)
    }
}

impl From<MerkleProof> for ProofEnvelope {
    fn from(proof: MerkleProof) -> Self {
        ProofEnvelope::Merkle(proof)
    }
}

/// Tagged JSON
pub fn serialize_proof(proof: &ProofEnvelope) -> VaultResult<String> {
    Ok(serde_json::to_string(proof)?)
}

/// Tagged JSON in base64, for transports that want a single token
pub fn serialize_proof_compact(proof: &ProofEnvelope) -> VaultResult<String> {
    Ok(B64.encode(serde_json::to_vec(proof)?))
}

/// Decode tagged proofs, and untagged ones issued before the tag existed.
///
/// Untagged objects are tried as inclusion, possession, then bare Merkle
/// proof. Input that is not JSON is tried once as base64-wrapped JSON.
/// Nothing else is guessed: an unrecognized shape is a validation error.
pub fn deserialize_proof(input: &str) -> VaultResult<ProofEnvelope> {
    let value = match serde_json::from_str::<Value>(input.trim()) {
        Ok(value) => value,
        Err(json_err) => {
            let decoded = B64.decode(input.trim().as_bytes()).map_err(|_| {
                VaultError::validation(format!("proof is neither JSON nor base64: {json_err}"))
            })?;
            serde_json::from_slice::<Value>(&decoded).map_err(|e| {
                VaultError::validation(format!("base64 proof does not hold JSON: {e}"))
            })?
        }
    };
    decode_value(value)
}

fn decode_value(value: Value) -> VaultResult<ProofEnvelope> {
    if !value.is_object() {
        return Err(VaultError::validation("proof must be a JSON object"));
    }
    if value.get("kind").is_some() {
        return serde_json::from_value(value)
            .map_err(|e| VaultError::validation(format!("malformed tagged proof: {e}")));
    }

    if let Ok(proof) = serde_json::from_value::<InclusionProof>(value.clone()) {
        debug!("decoded untagged inclusion proof");
        return Ok(ProofEnvelope::Inclusion(proof));
    }
    if let Ok(proof) = serde_json::from_value::<PossessionProof>(value.clone()) {
        debug!("decoded untagged possession proof");
        return Ok(ProofEnvelope::Possession(proof));
    }
    if let Ok(proof) = serde_json::from_value::<MerkleProof>(value) {
        debug!("decoded untagged merkle proof");
        return Ok(ProofEnvelope::Merkle(proof));
    }
    Err(VaultError::validation("unrecognized proof shape"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::MerkleTree;

    fn merkle() -> MerkleProof {
        MerkleTree::build(&[b"a", b"b", b"c"]).unwrap().proof(1).unwrap()
    }

    #[test]
    fn tagged_round_trip() {
        let envelope = ProofEnvelope::from(merkle());
        let json = serialize_proof(&envelope).unwrap();
        assert!(json.contains(r#""kind":"merkle""#));
        assert_eq!(deserialize_proof(&json).unwrap(), envelope);

        let compact = serialize_proof_compact(&envelope).unwrap();
        assert_eq!(deserialize_proof(&compact).unwrap(), envelope);
    }

    #[test]
    fn untagged_legacy_merkle_is_probed() {
        let proof = merkle();
        let legacy = serde_json::to_string(&proof).unwrap();
        assert_eq!(deserialize_proof(&legacy).unwrap(), ProofEnvelope::Merkle(proof));
    }

    #[test]
    fn unknown_shapes_are_rejected() {
        for input in [
            r#"{"hello":"world"}"#,
            r#"[1,2,3]"#,
            r#"{"kind":"telepathy"}"#,
            "not a proof at all",
            "bm90IGpzb24=",
        ] {
            let err = deserialize_proof(input).unwrap_err();
            assert!(matches!(err, VaultError::Validation { .. }), "{input}");
        }
    }
}
