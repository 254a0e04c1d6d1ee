// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::str::FromStr;

use fvm_shared::address::{Address, Protocol};

use crate::error::{VaultError, VaultResult};

/// Network prefix of an encoded address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    fn prefix(self) -> char {
        match self {
            Network::Mainnet => 'f',
            Network::Testnet => 't',
        }
    }
}

/// Parse a Filecoin address with either mainnet (f) or testnet (t) prefix
pub fn parse_address(s: &str) -> VaultResult<Address> {
    let s = s.trim();
    // fvm_shared only parses the mainnet prefix
    let normalized = match s.strip_prefix('t') {
        Some(rest) => format!("f{rest}"),
        None => s.to_string(),
    };
    Address::from_str(&normalized)
        .map_err(|e| VaultError::validation(format!("invalid address '{s}': {e}")))
}

/// Network the address string was encoded for
pub fn network_of(s: &str) -> VaultResult<Network> {
    match s.trim().chars().next() {
        Some('f') => Ok(Network::Mainnet),
        Some('t') => Ok(Network::Testnet),
        _ => Err(VaultError::validation(format!("address '{s}' has no network prefix"))),
    }
}

/// Encode an address for the given network
pub fn to_network(address: &Address, network: Network) -> String {
    let encoded = address.to_string();
    let mut chars = encoded.chars();
    chars.next();
    format!("{}{}", network.prefix(), chars.as_str())
}

/// Validate a storage provider ID address (f0…/t0…) and return its actor ID
pub fn parse_miner_id(s: &str) -> VaultResult<u64> {
    let address = parse_address(s)?;
    if address.protocol() != Protocol::ID {
        return Err(VaultError::validation(format!(
            "'{s}' is not an ID address; storage providers are addressed as f0…"
        )));
    }
    address
        .id()
        .map_err(|e| VaultError::validation(format!("'{s}': {e}")))
}

/// Canonical string for a miner ID on a network
pub fn miner_address(id: u64, network: Network) -> String {
    to_network(&Address::new_id(id), network)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_network_prefixes() {
        assert_eq!(parse_miner_id("f01234").unwrap(), 1234);
        assert_eq!(parse_miner_id("t01234").unwrap(), 1234);
        assert_eq!(network_of("t01234").unwrap(), Network::Testnet);
    }

    #[test]
    fn encodes_for_network() {
        let addr = parse_address("t01000").unwrap();
        assert_eq!(to_network(&addr, Network::Testnet), "t01000");
        assert_eq!(to_network(&addr, Network::Mainnet), "f01000");
        assert_eq!(miner_address(7, Network::Testnet), "t07");
    }

    #[test]
    fn rejects_non_id_miner() {
        let actor = Address::new_actor(b"provider").to_string();
        assert!(parse_address(&actor).is_ok());
        assert!(parse_miner_id(&actor).is_err());
        assert!(parse_address("x0123").is_err());
    }
}
