// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use cid::multibase::Base;
use cid::{Cid, Version};
use fvm_ipld_encoding::{DAG_CBOR, IPLD_RAW};
use multihash_codetable::{Code, MultihashDigest};

use crate::error::{VaultError, VaultResult};

/// Multicodec code of dag-pb, the only codec a v0 CID can carry
pub const DAG_PB: u64 = 0x70;

/// Multihash code of sha2-256, required for v0 CIDs
const SHA2_256: u64 = 0x12;

/// Parse a CID string, mapping failures to a validation error
pub fn parse_cid(cid_str: &str) -> VaultResult<Cid> {
    Cid::try_from(cid_str.trim())
        .map_err(|e| VaultError::validation(format!("invalid CID '{cid_str}': {e}")))
}

/// Whether `cid_str` decodes as a CID
pub fn is_valid_cid(cid_str: &str) -> bool {
    parse_cid(cid_str).is_ok()
}

/// Upgrade any CID to version 1, keeping codec and multihash
pub fn to_v1(cid: &Cid) -> VaultResult<Cid> {
    match cid.version() {
        Version::V1 => Ok(*cid),
        Version::V0 => cid
            .into_v1()
            .map_err(|e| VaultError::validation(format!("cannot upgrade {cid}: {e}"))),
    }
}

/// Downgrade to version 0; only sha2-256 dag-pb CIDs can be expressed in v0
pub fn to_v0(cid: &Cid) -> VaultResult<Cid> {
    if cid.version() == Version::V0 {
        return Ok(*cid);
    }
    if cid.codec() != DAG_PB {
        return Err(VaultError::validation(format!(
            "CID {cid} has codec 0x{:x}; only dag-pb can be represented as v0",
            cid.codec()
        )));
    }
    if cid.hash().code() != SHA2_256 {
        return Err(VaultError::validation(format!(
            "CID {cid} is not sha2-256 hashed; v0 requires sha2-256"
        )));
    }
    Cid::new_v0(*cid.hash()).map_err(|e| VaultError::validation(e.to_string()))
}

/// Canonical string form for submission to the network: v1, base32 lower
pub fn format_for_network(cid: &Cid) -> VaultResult<String> {
    let v1 = to_v1(cid)?;
    v1.to_string_of_base(Base::Base32Lower)
        .map_err(|e| VaultError::validation(format!("encode {cid}: {e}")))
}

/// CIDv1 of raw bytes (sha2-256)
pub fn raw_cid(data: &[u8]) -> Cid {
    Cid::new_v1(IPLD_RAW, Code::Sha2_256.digest(data))
}

/// CIDv1 of a DAG-CBOR encoded node (sha2-256)
pub fn dag_cbor_cid(encoded: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(encoded))
}

/// Re-hash `data` with the CID's own multihash function and compare
pub fn verify_block(cid: &Cid, data: &[u8]) -> VaultResult<()> {
    let code = Code::try_from(cid.hash().code()).map_err(|_| {
        VaultError::validation(format!(
            "unsupported multihash 0x{:x} in {cid}",
            cid.hash().code()
        ))
    })?;
    let computed = code.digest(data);
    if computed.digest() != cid.hash().digest() {
        return Err(VaultError::verification(format!(
            "block content does not hash to {cid}"
        )));
    }
    Ok(())
}

/// Serde helpers rendering a CID as its string form
pub mod cid_string {
    use cid::Cid;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(cid: &Cid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&cid.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Cid, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cid::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use cid::Cid;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(cid: &Option<Cid>, serializer: S) -> Result<S::Ok, S::Error> {
            match cid {
                Some(cid) => serializer.serialize_some(&cid.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Cid>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| Cid::try_from(s.as_str()).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V0: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

    #[test]
    fn v0_roundtrips_through_v1() {
        let v0 = parse_cid(V0).unwrap();
        let v1 = to_v1(&v0).unwrap();
        assert_eq!(v1.version(), Version::V1);
        assert_eq!(v1.codec(), DAG_PB);
        assert_eq!(to_v0(&v1).unwrap(), v0);
    }

    #[test]
    fn raw_codec_cannot_downgrade() {
        let cid = raw_cid(b"hello");
        assert!(matches!(to_v0(&cid), Err(VaultError::Validation { .. })));
    }

    #[test]
    fn network_format_is_base32_v1() {
        let v0 = parse_cid(V0).unwrap();
        let formatted = format_for_network(&v0).unwrap();
        assert!(formatted.starts_with("bafy"));
        assert_eq!(parse_cid(&formatted).unwrap(), to_v1(&v0).unwrap());
    }

    #[test]
    fn rejects_garbage() {
        assert!(!is_valid_cid("not-a-cid"));
        assert!(!is_valid_cid(""));
        assert!(is_valid_cid(V0));
    }

    #[test]
    fn verify_block_detects_tampering() {
        let cid = raw_cid(b"payload");
        verify_block(&cid, b"payload").unwrap();
        assert!(matches!(
            verify_block(&cid, b"payloaX"),
            Err(VaultError::Verification { .. })
        ));
    }
}
