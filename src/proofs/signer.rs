// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;

use crate::error::{VaultError, VaultResult};
use crate::merkle::{keccak256, keccak256_concat, Digest};

/// Length of an `r || s || v` signature
pub const SIGNATURE_LEN: usize = 65;

/// Produces signatures that a matching `SignatureVerifier` can attribute
pub trait Signer: Send + Sync {
    /// Identity that signatures recover to
    fn identity(&self) -> String;

    fn sign(&self, message: &[u8]) -> VaultResult<Vec<u8>>;
}

/// Recovers the identity behind a signature
pub trait SignatureVerifier: Send + Sync {
    fn recover(&self, message: &[u8], signature: &[u8]) -> VaultResult<String>;

    /// True iff `signature` over `message` recovers to `identity`
    fn verify(&self, message: &[u8], signature: &[u8], identity: &str) -> bool {
        match self.recover(message, signature) {
            Ok(recovered) => recovered.eq_ignore_ascii_case(identity),
            Err(_) => false,
        }
    }
}

/// EIP-191 personal-sign digest of `message`
pub fn personal_message_hash(message: &[u8]) -> Digest {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    keccak256_concat(&[prefix.as_bytes(), message])
}

/// 0x-prefixed lowercase address of a public key
pub fn eth_address(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// secp256k1 personal-sign signer
#[derive(Clone)]
pub struct EthSigner {
    key: SigningKey,
    address: String,
}

impl EthSigner {
    pub fn new(key: SigningKey) -> Self {
        let address = eth_address(key.verifying_key());
        Self { key, address }
    }

    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut rand::rngs::OsRng))
    }

    pub fn from_slice(secret: &[u8]) -> VaultResult<Self> {
        let key = SigningKey::from_slice(secret)
            .map_err(|e| VaultError::validation(format!("invalid secp256k1 key: {e}")))?;
        Ok(Self::new(key))
    }

    /// Parse a hex secret key, with or without 0x
    pub fn from_hex(secret: &str) -> VaultResult<Self> {
        let bytes = hex::decode(secret.trim().trim_start_matches("0x"))
            .map_err(|e| VaultError::validation(format!("invalid key hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Debug for EthSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Signer for EthSigner {
    fn identity(&self) -> String {
        self.address.clone()
    }

    fn sign(&self, message: &[u8]) -> VaultResult<Vec<u8>> {
        let digest = personal_message_hash(message);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| VaultError::Other(anyhow::anyhow!("signing failed: {e}")))?;
        let mut out = Vec::with_capacity(SIGNATURE_LEN);
        out.extend_from_slice(&signature.to_bytes());
        out.push(27 + recovery_id.to_byte());
        Ok(out)
    }
}

/// Recovers addresses from `EthSigner` signatures
#[derive(Debug, Clone, Copy, Default)]
pub struct EthVerifier;

impl SignatureVerifier for EthVerifier {
    fn recover(&self, message: &[u8], signature: &[u8]) -> VaultResult<String> {
        if signature.len() != SIGNATURE_LEN {
            return Err(VaultError::verification(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                signature.len()
            )));
        }
        let v = signature[64];
        let recovery_id = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })
            .ok_or_else(|| VaultError::verification(format!("bad recovery byte {v}")))?;
        let signature = Signature::from_slice(&signature[..64])
            .map_err(|e| VaultError::verification(format!("malformed signature: {e}")))?;
        let digest = personal_message_hash(message);
        let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
            .map_err(|e| VaultError::verification(format!("recovery failed: {e}")))?;
        Ok(eth_address(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known development key (Hardhat account #0)
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    #[test]
    fn address_from_known_key() {
        let signer = EthSigner::from_hex(DEV_KEY).unwrap();
        assert_eq!(signer.address(), DEV_ADDRESS);
    }

    #[test]
    fn sign_and_recover() {
        let signer = EthSigner::random();
        let signature = signer.sign(b"payload").unwrap();
        assert_eq!(signature.len(), SIGNATURE_LEN);
        assert!(signature[64] == 27 || signature[64] == 28);

        let verifier = EthVerifier;
        assert_eq!(verifier.recover(b"payload", &signature).unwrap(), signer.identity());
        assert!(verifier.verify(b"payload", &signature, &signer.identity().to_uppercase()));
        assert!(!verifier.verify(b"other payload", &signature, &signer.identity()));
    }

    #[test]
    fn malformed_signatures_do_not_verify() {
        let signer = EthSigner::random();
        let mut signature = signer.sign(b"payload").unwrap();
        assert!(!EthVerifier.verify(b"payload", &signature[..64], &signer.identity()));
        signature[64] = 99;
        assert!(!EthVerifier.verify(b"payload", &signature, &signer.identity()));
        assert!(EthSigner::from_hex("0x1234").is_err());
    }
}
