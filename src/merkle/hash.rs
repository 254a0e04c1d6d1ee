// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use multihash_codetable::{Code, MultihashDigest};
use sha3::{Digest as _, Keccak256};

pub type Digest = [u8; 32];

/// Hash function a tree is built and verified with
pub trait MerkleHasher: Send + Sync {
    fn name(&self) -> &'static str;

    fn hash(&self, data: &[u8]) -> Digest;

    fn hash_pair(&self, left: &Digest, right: &Digest) -> Digest {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(left);
        buf[32..].copy_from_slice(right);
        self.hash(&buf)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Keccak256Hasher;

impl MerkleHasher for Keccak256Hasher {
    fn name(&self) -> &'static str {
        "keccak-256"
    }

    fn hash(&self, data: &[u8]) -> Digest {
        keccak256(data)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl MerkleHasher for Sha256Hasher {
    fn name(&self) -> &'static str {
        "sha2-256"
    }

    fn hash(&self, data: &[u8]) -> Digest {
        digest_32(Code::Sha2_256, data)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Blake2b256Hasher;

impl MerkleHasher for Blake2b256Hasher {
    fn name(&self) -> &'static str {
        "blake2b-256"
    }

    fn hash(&self, data: &[u8]) -> Digest {
        digest_32(Code::Blake2b256, data)
    }
}

fn digest_32(code: Code, data: &[u8]) -> Digest {
    let mh = code.digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mh.digest()[..32]);
    out
}

pub fn keccak256(data: &[u8]) -> Digest {
    Keccak256::digest(data).into()
}

/// Keccak-256 over several parts without concatenating them first
pub fn keccak256_concat(parts: &[&[u8]]) -> Digest {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Serde helpers: digests as 0x-prefixed hex
pub mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Digest;

    pub fn serialize<S: Serializer>(digest: &Digest, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(digest)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Digest, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse(s: &str) -> Result<Digest, String> {
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|e| e.to_string())?;
        <Digest>::try_from(bytes.as_slice())
            .map_err(|_| format!("expected 32 byte digest, got {}", bytes.len()))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        use super::super::Digest;

        pub fn serialize<S: Serializer>(
            digest: &Option<Digest>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match digest {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Digest>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    pub mod vec {
        use serde::ser::SerializeSeq;
        use serde::{Deserialize, Deserializer, Serializer};

        use super::super::Digest;

        pub fn serialize<S: Serializer>(
            digests: &[Digest],
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(digests.len()))?;
            for d in digests {
                seq.serialize_element(&format!("0x{}", hex::encode(d)))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<Digest>, D::Error> {
            let raw = Vec::<String>::deserialize(deserializer)?;
            raw.iter()
                .map(|s| super::parse(s).map_err(serde::de::Error::custom))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_of_empty_input() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(keccak256_concat(&[b"ab", b"c"]), keccak256(b"abc"));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            hex::encode(Sha256Hasher.hash(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hashers_disagree() {
        let data = b"leaf";
        assert_ne!(Keccak256Hasher.hash(data), Sha256Hasher.hash(data));
        assert_ne!(Sha256Hasher.hash(data), Blake2b256Hasher.hash(data));
    }

    #[test]
    fn hex_parse_rejects_wrong_length() {
        assert!(hex_digest::parse("0xabcd").is_err());
        let d = keccak256(b"x");
        assert_eq!(hex_digest::parse(&hex::encode(d)).unwrap(), d);
    }
}
