// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use cid::Cid;
use tracing::{debug, warn};

use super::bundle::{InclusionProof, PossessionProof};
use super::codec::{deserialize_proof, ProofEnvelope};
use super::generator::{inclusion_payload, possession_challenge, possession_response, ProofEngine};
use super::signer::SignatureVerifier;
use crate::error::{VaultError, VaultResult};
use crate::merkle::Digest;

/// Check an inclusion proof offline.
///
/// `expected_prover` pins the signer; without it the signature only has
/// to recover to the prover named in the proof. Any mismatch is `false`.
pub fn verify_inclusion_proof(
    proof: &InclusionProof,
    deal_id: u64,
    cid: &Cid,
    expected_prover: Option<&str>,
    verifier: &dyn SignatureVerifier,
) -> bool {
    // Step 1: the proof must be about this deal and block
    if proof.deal_id != deal_id || &proof.block_cid != cid {
        debug!("inclusion proof is for deal {} block {}", proof.deal_id, proof.block_cid);
        return false;
    }

    // Step 2: Merkle path from the block leaf to the root
    if !proof.merkle_proof.verify() {
        debug!("merkle path does not reach the declared root");
        return false;
    }

    // Step 3: signer
    if let Some(expected) = expected_prover {
        if !expected.eq_ignore_ascii_case(&proof.prover) {
            return false;
        }
    }
    let payload = inclusion_payload(
        proof.deal_id,
        &proof.piece_cid,
        &proof.data_cid,
        &proof.merkle_proof.root,
        proof.merkle_proof.leaf_index,
    );
    verifier.verify(&payload, &proof.signature, &proof.prover)
}

/// Check a possession proof for `cid` by `prover`. Any mismatch is `false`.
pub fn verify_possession_proof(
    proof: &PossessionProof,
    cid: &Cid,
    prover: &str,
    verifier: &dyn SignatureVerifier,
) -> bool {
    if &proof.cid != cid || !proof.prover.eq_ignore_ascii_case(prover) {
        return false;
    }
    if possession_challenge(cid, &proof.seed, prover) != proof.challenge {
        debug!("challenge does not match seed and prover");
        return false;
    }
    if proof.samples.is_empty() {
        return false;
    }
    let hashes: Vec<Digest> = proof.samples.iter().map(|s| s.hash).collect();
    if possession_response(&proof.challenge, &hashes) != proof.response {
        debug!("response does not match the sampled content");
        return false;
    }
    verifier.verify(&proof.response, &proof.signature, prover)
}

impl ProofEngine {
    /// Offline checks plus the deal's on-chain piece CID. The proof must be
    /// signed by this engine's signer or one of `trusted_provers`; with
    /// neither configured nothing verifies. A deal the chain no longer
    /// knows yields `false`; node failures propagate.
    pub async fn verify_inclusion_proof(
        &self,
        proof: &InclusionProof,
        deal_id: u64,
        cid: &Cid,
    ) -> VaultResult<bool> {
        if !self.is_trusted_prover(&proof.prover) {
            warn!("inclusion proof signed by untrusted prover {}", proof.prover);
            return Ok(false);
        }
        self.verify_inclusion_proof_by(proof, deal_id, cid, &proof.prover)
            .await
    }

    async fn verify_inclusion_proof_by(
        &self,
        proof: &InclusionProof,
        deal_id: u64,
        cid: &Cid,
        prover: &str,
    ) -> VaultResult<bool> {
        if !verify_inclusion_proof(proof, deal_id, cid, Some(prover), self.verifier.as_ref()) {
            return Ok(false);
        }
        match self.deal_cids(deal_id).await {
            Ok((piece_cid, data_cid)) => {
                if piece_cid != proof.piece_cid {
                    warn!("deal {deal_id} stores piece {piece_cid}, proof claims {}", proof.piece_cid);
                    return Ok(false);
                }
                Ok(data_cid.map_or(true, |d| d == proof.data_cid))
            }
            Err(e) if e.is_not_found() => {
                debug!("deal {deal_id} not found: {e}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn verify_possession_proof(&self, proof: &PossessionProof, cid: &Cid, prover: &str) -> bool {
        verify_possession_proof(proof, cid, prover, self.verifier.as_ref())
    }

    /// The prover a decoded proof is checked against: the caller's pin, or
    /// the named prover when it is trusted
    fn expected_prover(&self, pinned: Option<&str>, named: &str) -> Option<String> {
        match pinned {
            Some(prover) => Some(prover.to_string()),
            None if self.is_trusted_prover(named) => Some(named.to_string()),
            None => {
                warn!("proof signed by untrusted prover {named}");
                None
            }
        }
    }

    /// Decode an inclusion or possession proof and verify it against `cid`.
    /// `deal_id` defaults to the deal the proof names. Without `prover` the
    /// signer must be trusted by this engine. Bare Merkle proofs name no
    /// CID or signer and are rejected with a validation error.
    pub async fn verify_serialized_proof(
        &self,
        input: &str,
        cid: &Cid,
        deal_id: Option<u64>,
        prover: Option<&str>,
    ) -> VaultResult<bool> {
        match deserialize_proof(input)? {
            ProofEnvelope::Inclusion(proof) => {
                let Some(expected) = self.expected_prover(prover, &proof.prover) else {
                    return Ok(false);
                };
                let deal_id = deal_id.unwrap_or(proof.deal_id);
                self.verify_inclusion_proof_by(&proof, deal_id, cid, &expected)
                    .await
            }
            ProofEnvelope::Possession(proof) => {
                let Some(expected) = self.expected_prover(prover, &proof.prover) else {
                    return Ok(false);
                };
                Ok(self.verify_possession_proof(&proof, cid, &expected))
            }
            ProofEnvelope::Merkle(_) => Err(VaultError::validation(format!(
                "a bare merkle proof cannot be verified against {cid}; check it against a known root"
            ))),
        }
    }
}
