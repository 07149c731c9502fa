// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! CAIP-2 protocol network identifiers (`eip155:<chainId>`) and the human
//! aliases accepted wherever an identifier is expected.

use crate::ConfigError;

/// Networks the protocol is deployed to. Identifiers outside this table are
/// rejected rather than passed through, so a typoed chain id fails at
/// startup.
const NETWORK_ALIASES: &[(&str, u64)] = &[
    ("mainnet", 1),
    ("goerli", 5),
    ("gnosis", 100),
    ("hardhat", 1337),
    ("arbitrum-one", 42161),
    ("arbitrum-goerli", 421613),
    ("arbitrum-sepolia", 421614),
    ("sepolia", 11155111),
];

fn caip2_id(chain_id: u64) -> String {
    format!("eip155:{chain_id}")
}

/// Returns the chain id when `alias` is a known network alias.
pub fn alias_chain_id(alias: &str) -> Option<u64> {
    NETWORK_ALIASES
        .iter()
        .find(|(name, _)| *name == alias)
        .map(|(_, id)| *id)
}

/// Resolves an alias or CAIP-2 identifier to its canonical CAIP-2 form.
///
/// `mainnet` and `eip155:1` both resolve to `eip155:1`; unknown aliases and
/// unknown chain ids are configuration errors.
pub fn resolve_network_identifier(identifier: &str) -> Result<String, ConfigError> {
    if let Some(chain_id) = alias_chain_id(identifier) {
        return Ok(caip2_id(chain_id));
    }
    if let Some(raw_id) = identifier.strip_prefix("eip155:") {
        let chain_id: u64 = raw_id
            .parse()
            .map_err(|_| ConfigError::InvalidNetworkIdentifier(identifier.to_string()))?;
        if NETWORK_ALIASES.iter().any(|(_, id)| *id == chain_id) {
            return Ok(caip2_id(chain_id));
        }
    }
    Err(ConfigError::InvalidNetworkIdentifier(identifier.to_string()))
}

/// The inverse of alias resolution, used where an upstream (the graph node)
/// expects a network name instead of a CAIP-2 identifier.
pub fn resolve_chain_alias(caip2: &str) -> Option<&'static str> {
    let raw_id = caip2.strip_prefix("eip155:")?;
    let chain_id: u64 = raw_id.parse().ok()?;
    NETWORK_ALIASES
        .iter()
        .find(|(_, id)| *id == chain_id)
        .map(|(name, _)| *name)
}

/// The numeric chain id of a canonical CAIP-2 identifier.
pub fn chain_id(caip2: &str) -> Result<u64, ConfigError> {
    caip2
        .strip_prefix("eip155:")
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| ConfigError::InvalidNetworkIdentifier(caip2.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_caip2() {
        assert_eq!(resolve_network_identifier("mainnet").unwrap(), "eip155:1");
        assert_eq!(
            resolve_network_identifier("arbitrum-one").unwrap(),
            "eip155:42161"
        );
        assert_eq!(resolve_network_identifier("eip155:5").unwrap(), "eip155:5");
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        assert!(resolve_network_identifier("eip155:0").is_err());
        assert!(resolve_network_identifier("optimism").is_err());
        assert!(resolve_network_identifier("eip155:nope").is_err());
    }

    #[test]
    fn alias_round_trip() {
        assert_eq!(resolve_chain_alias("eip155:42161"), Some("arbitrum-one"));
        assert_eq!(resolve_chain_alias("eip155:0"), None);
    }
}
