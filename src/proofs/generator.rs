// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::collections::HashSet;
use std::sync::Arc;

use cid::Cid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::bundle::{InclusionProof, PossessionProof, PossessionSample};
use super::signer::{EthVerifier, SignatureVerifier, Signer};
use crate::car::{parse_car, CarArchive, ParseOptions};
use crate::client::StorageNode;
use crate::config::ProofConfig;
use crate::error::{VaultError, VaultResult};
use crate::merkle::{hex_digest, keccak256, keccak256_concat, Digest, Keccak256Hasher, MerkleTree};
use crate::retrieval::{FetchFormat, RetrievalEngine, RetrievalOptions, RetrievedData};
use crate::utils::cid::parse_cid;

/// Leaf of the inclusion tree: `keccak(cid bytes || block bytes)`
pub fn inclusion_leaf(cid: &Cid, data: &[u8]) -> Digest {
    keccak256_concat(&[&cid.to_bytes(), data])
}

/// Bytes signed for an inclusion proof
pub fn inclusion_payload(
    deal_id: u64,
    piece_cid: &Cid,
    data_cid: &Cid,
    root: &Digest,
    leaf_index: u64,
) -> Digest {
    keccak256_concat(&[
        &deal_id.to_be_bytes(),
        &piece_cid.to_bytes(),
        &data_cid.to_bytes(),
        root,
        &leaf_index.to_be_bytes(),
    ])
}

/// `keccak(cid || seed || prover)`, prover taken in lowercase
pub fn possession_challenge(cid: &Cid, seed: &Digest, prover: &str) -> Digest {
    keccak256_concat(&[&cid.to_bytes(), seed, prover.to_ascii_lowercase().as_bytes()])
}

/// `keccak(challenge || sample hashes...)`
pub fn possession_response(challenge: &Digest, sample_hashes: &[Digest]) -> Digest {
    let mut buf = Vec::with_capacity(32 * (sample_hashes.len() + 1));
    buf.extend_from_slice(challenge);
    for hash in sample_hashes {
        buf.extend_from_slice(hash);
    }
    keccak256(&buf)
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Build and sign an inclusion proof for `cid` inside `archive`
pub fn build_inclusion_proof(
    archive: &CarArchive,
    deal_id: u64,
    piece_cid: Cid,
    cid: &Cid,
    signer: &dyn Signer,
) -> VaultResult<InclusionProof> {
    let data_cid = archive.root()?;
    let index = archive
        .position(cid)
        .ok_or_else(|| VaultError::not_found(format!("block {cid} in deal {deal_id}")))?;
    let leaves = archive
        .blocks
        .iter()
        .map(|b| inclusion_leaf(&b.cid, &b.data))
        .collect();
    let tree = MerkleTree::from_leaf_hashes(leaves, Keccak256Hasher)?;
    let merkle_proof = tree.proof(index)?;
    let payload = inclusion_payload(
        deal_id,
        &piece_cid,
        &data_cid,
        &merkle_proof.root,
        merkle_proof.leaf_index,
    );
    let signature = signer.sign(&payload)?;
    debug!(
        "inclusion proof for {cid}: leaf {index} of {} under root 0x{}",
        tree.len(),
        hex::encode(tree.root())
    );
    Ok(InclusionProof {
        deal_id,
        piece_cid,
        data_cid,
        block_cid: *cid,
        merkle_proof,
        prover: signer.identity(),
        signature,
        timestamp: unix_now(),
    })
}

/// Build and sign a possession proof from already collected samples
pub fn build_possession_proof(
    cid: &Cid,
    seed: Digest,
    samples: &[(String, Vec<u8>)],
    signer: &dyn Signer,
) -> VaultResult<PossessionProof> {
    if samples.is_empty() {
        return Err(VaultError::validation("possession proof needs at least one sample"));
    }
    let prover = signer.identity();
    let challenge = possession_challenge(cid, &seed, &prover);
    let samples: Vec<PossessionSample> = samples
        .iter()
        .map(|(source, data)| PossessionSample {
            source: source.clone(),
            length: data.len() as u64,
            hash: keccak256(data),
        })
        .collect();
    let hashes: Vec<Digest> = samples.iter().map(|s| s.hash).collect();
    let response = possession_response(&challenge, &hashes);
    let signature = signer.sign(&response)?;
    Ok(PossessionProof {
        cid: *cid,
        prover,
        seed,
        challenge,
        response,
        signature,
        samples,
        timestamp: unix_now(),
    })
}

/// Challenges already issued by this process
#[derive(Debug, Default)]
pub struct ChallengeRegistry {
    seen: Mutex<HashSet<Digest>>,
}

impl ChallengeRegistry {
    /// Record a challenge; a repeat is rejected
    pub fn register(&self, challenge: &Digest) -> VaultResult<()> {
        if !self.seen.lock().insert(*challenge) {
            return Err(VaultError::validation(format!(
                "challenge 0x{} was already used",
                hex::encode(challenge)
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PossessionOptions {
    /// Must match the signer's identity when given
    pub prover_address: Option<String>,
    /// Random when unset
    #[serde(with = "hex_digest::option")]
    pub random_seed: Option<Digest>,
    pub samples: Option<usize>,
}

/// Generates and checks inclusion and possession proofs
pub struct ProofEngine {
    node: Arc<dyn StorageNode>,
    retrieval: Arc<RetrievalEngine>,
    signer: Option<Arc<dyn Signer>>,
    pub(super) verifier: Arc<dyn SignatureVerifier>,
    config: ProofConfig,
    challenges: Arc<ChallengeRegistry>,
}

impl ProofEngine {
    pub fn new(
        node: Arc<dyn StorageNode>,
        retrieval: Arc<RetrievalEngine>,
        config: ProofConfig,
    ) -> Self {
        Self {
            node,
            retrieval,
            signer: None,
            verifier: Arc::new(EthVerifier),
            config,
            challenges: Arc::default(),
        }
    }

    /// Share replay protection with other engines in the process
    pub fn with_challenge_registry(mut self, challenges: Arc<ChallengeRegistry>) -> Self {
        self.challenges = challenges;
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    fn signer(&self) -> VaultResult<&Arc<dyn Signer>> {
        self.signer
            .as_ref()
            .ok_or_else(|| VaultError::validation("no signer configured"))
    }

    /// This engine's signer identity followed by the configured trusted provers
    pub fn trusted_provers(&self) -> Vec<String> {
        self.signer
            .iter()
            .map(|s| s.identity())
            .chain(self.config.trusted_provers.iter().cloned())
            .collect()
    }

    pub(super) fn is_trusted_prover(&self, prover: &str) -> bool {
        self.trusted_provers()
            .iter()
            .any(|t| t.eq_ignore_ascii_case(prover))
    }

    /// Piece and payload CIDs recorded on chain for a deal
    pub(super) async fn deal_cids(&self, deal_id: u64) -> VaultResult<(Cid, Option<Cid>)> {
        let deal = self.node.market_deal(deal_id).await?;
        let piece_cid = Cid::try_from(&deal.proposal.piece_cid)?;
        let data_cid = parse_cid(&deal.proposal.label).ok();
        Ok((piece_cid, data_cid))
    }

    /// Prove that block `cid` belongs to the payload stored under `deal_id`
    pub async fn generate_inclusion_proof(
        &self,
        deal_id: u64,
        cid: &Cid,
    ) -> VaultResult<InclusionProof> {
        let signer = self.signer()?;
        let (piece_cid, data_cid) = self.deal_cids(deal_id).await?;
        let data_cid = data_cid.ok_or_else(|| {
            VaultError::not_found(format!("payload CID in the label of deal {deal_id}"))
        })?;

        let options = RetrievalOptions {
            return_buffer: Some(true),
            format: FetchFormat::Car,
            ..Default::default()
        };
        let retrieved = self.retrieval.retrieve_data(&data_cid, &options).await?;
        let RetrievedData::Buffer(car) = retrieved.data else {
            return Err(VaultError::validation("archive was not returned in memory"));
        };
        let archive = parse_car(&car, ParseOptions::default())?;
        let proof = build_inclusion_proof(&archive, deal_id, piece_cid, cid, signer.as_ref())?;
        info!("generated inclusion proof for {cid} in deal {deal_id}");
        Ok(proof)
    }

    /// Sample `cid` from distinct sources and sign a response to a fresh
    /// challenge
    pub async fn generate_possession_proof(
        &self,
        cid: &Cid,
        options: &PossessionOptions,
    ) -> VaultResult<PossessionProof> {
        let signer = self.signer()?;
        let prover = signer.identity();
        if let Some(claimed) = &options.prover_address {
            if !claimed.eq_ignore_ascii_case(&prover) {
                return Err(VaultError::validation(format!(
                    "cannot prove as {claimed}; signer is {prover}"
                )));
            }
        }
        let seed = options.random_seed.unwrap_or_else(rand::random);
        self.challenges
            .register(&possession_challenge(cid, &seed, &prover))?;

        let count = options.samples.unwrap_or(self.config.possession_samples).max(1);
        let samples = self
            .retrieval
            .collect_samples(cid, count, self.config.sample_bytes)
            .await?;
        let proof = build_possession_proof(cid, seed, &samples, signer.as_ref())?;
        info!(
            "generated possession proof for {cid} from {} sample(s)",
            proof.samples.len()
        );
        Ok(proof)
    }
}
