// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Per-network configuration for the indexer agent.
//!
//! The agent runs over an ordered list of [`NetworkSpecification`]s, one per
//! protocol network. In single-network mode the specification is assembled
//! from CLI flags; in multi-network mode each specification is one YAML file
//! in the `--network-specifications-directory`.

pub mod network_identifier;
pub mod tagged;

use std::{fs, path::Path, str::FromStr};

use bigdecimal::BigDecimal;
use reqwest::Url;
use serde::Deserialize;
use thegraph_core::{
    alloy::primitives::{Address, U256},
    DeploymentId,
};
use thiserror::Error;

pub use network_identifier::{chain_id, resolve_chain_alias, resolve_network_identifier};
pub use tagged::{parse_tagged_deployment, parse_tagged_url, validate_tagged_groups, Tagged};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid network identifier `{0}`")]
    InvalidNetworkIdentifier(String),
    #[error("invalid option value `{value}`: {problem}")]
    InvalidOptionValue { value: String, problem: String },
    #[error("option group `{group}` has {actual} entries, expected {expected}")]
    UnbalancedOptionGroups {
        group: String,
        expected: usize,
        actual: usize,
    },
    #[error("mixed network identifiers in option group `{0}`")]
    MixedNetworkIdentifiers(String),
    #[error("duplicate network identifier `{0}`")]
    DuplicateNetworkIdentifier(String),
    #[error("at least one protocol network is required")]
    NoProtocolNetworks,
    #[error("network and operator identifiers do not match: `{network}` vs `{operator}`")]
    MismatchedNetworkPair { network: String, operator: String },
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error(
        "network `{0}` must configure exactly one of network subgraph endpoint and deployment"
    )]
    AmbiguousNetworkSubgraph(String),
    #[error("no network specifications found in `{0}`")]
    EmptySpecificationDirectory(String),
    #[error("failed to read specification file `{file}`: {problem}")]
    UnreadableSpecification { file: String, problem: String },
    #[error("no contract addresses known for network `{0}`")]
    UnknownContractAddresses(String),
    #[error("invalid token amount `{0}`")]
    InvalidTokenAmount(String),
}

/// Everything the agent needs to know about one protocol network.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkSpecification {
    /// CAIP-2 identifier (or a known alias, resolved during validation).
    pub network_identifier: String,
    pub gateway: GatewayConfig,
    pub indexer_options: IndexerOptions,
    #[serde(default)]
    pub transaction_monitoring: TransactionMonitoring,
    pub subgraphs: ProtocolSubgraphs,
    pub network_provider: ProviderConfig,
    /// Overrides for the protocol contract addresses; defaults are looked up
    /// by chain id.
    #[serde(default)]
    pub addresses: Option<ContractAddresses>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
    pub url: Url,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexerOptions {
    pub address: Address,
    pub mnemonic: String,
    pub url: Url,
    #[serde(default = "defaults::geo_coordinates")]
    pub geo_coordinates: [String; 2],
    /// Default allocation amount in GRT, used for the global indexing rule.
    #[serde(default = "defaults::allocation_amount")]
    pub default_allocation_amount: BigDecimal,
    #[serde(default)]
    pub allocation_management: AllocationManagementMode,
    #[serde(default = "defaults::yes")]
    pub restake_rewards: bool,
    /// Minimum query fees (GRT) a single allocation must have collected to be
    /// worth claiming.
    #[serde(default = "defaults::rebate_claim_threshold")]
    pub rebate_claim_threshold: BigDecimal,
    /// Minimum aggregate query fees (GRT) before a claim batch is submitted.
    #[serde(default = "defaults::rebate_claim_batch_threshold")]
    pub rebate_claim_batch_threshold: BigDecimal,
    #[serde(default = "defaults::rebate_claim_max_batch_size")]
    pub rebate_claim_max_batch_size: usize,
    #[serde(default)]
    pub poi_dispute_monitoring: bool,
    #[serde(default = "defaults::poi_disputable_epochs")]
    pub poi_disputable_epochs: u64,
    #[serde(default)]
    pub allocate_on_network_subgraph: bool,
    #[serde(default)]
    pub auto_migration_support: bool,
    #[serde(default)]
    pub offchain_subgraphs: Vec<DeploymentId>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AllocationManagementMode {
    #[default]
    Auto,
    Manual,
    Oversight,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TransactionMonitoring {
    /// Hard ceiling for the gas price, in gwei.
    pub gas_price_max_gwei: u64,
    /// Seconds to wait for confirmation before bumping the gas price.
    pub gas_increase_timeout_secs: u64,
    /// Multiplier applied to the gas price on each bump.
    pub gas_increase_factor: f64,
    /// Attempts before a transaction is abandoned; 0 means unlimited.
    pub max_transaction_attempts: u32,
}

impl Default for TransactionMonitoring {
    fn default() -> Self {
        Self {
            gas_price_max_gwei: 100,
            gas_increase_timeout_secs: 240,
            gas_increase_factor: 1.2,
            max_transaction_attempts: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProtocolSubgraphs {
    pub network_subgraph: SubgraphConfig,
    pub epoch_subgraph: SubgraphConfig,
}

/// A protocol subgraph is reachable through a gateway endpoint, a local
/// deployment on the graph node, or both.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubgraphConfig {
    #[serde(default)]
    pub endpoint: Option<Url>,
    #[serde(default)]
    pub deployment: Option<DeploymentId>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderConfig {
    pub url: Url,
    #[serde(default = "defaults::polling_interval_ms")]
    pub polling_interval_ms: u64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContractAddresses {
    pub staking: Address,
    pub controller: Address,
}

mod defaults {
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    pub fn yes() -> bool {
        true
    }
    pub fn geo_coordinates() -> [String; 2] {
        ["31.780715".to_string(), "-41.179504".to_string()]
    }
    pub fn allocation_amount() -> BigDecimal {
        BigDecimal::from_str("0.01").unwrap()
    }
    pub fn rebate_claim_threshold() -> BigDecimal {
        BigDecimal::from(200)
    }
    pub fn rebate_claim_batch_threshold() -> BigDecimal {
        BigDecimal::from(2000)
    }
    pub fn rebate_claim_max_batch_size() -> usize {
        100
    }
    pub fn poi_disputable_epochs() -> u64 {
        1
    }
    pub fn polling_interval_ms() -> u64 {
        4000
    }
}

impl NetworkSpecification {
    /// Normalizes the network identifier and checks the fields that cannot be
    /// validated by deserialization alone.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.network_identifier = resolve_network_identifier(&self.network_identifier)?;

        bip39::Mnemonic::from_str(&self.indexer_options.mnemonic)
            .map_err(|err| ConfigError::InvalidMnemonic(err.to_string()))?;

        let network_subgraph = &self.subgraphs.network_subgraph;
        if network_subgraph.endpoint.is_some() == network_subgraph.deployment.is_some() {
            return Err(ConfigError::AmbiguousNetworkSubgraph(
                self.network_identifier.clone(),
            ));
        }

        Ok(self)
    }

    /// Contract addresses for this network, either configured or from the
    /// built-in address book.
    pub fn contract_addresses(&self) -> Result<ContractAddresses, ConfigError> {
        if let Some(addresses) = self.addresses {
            return Ok(addresses);
        }
        default_contract_addresses(&self.network_identifier)
            .ok_or_else(|| ConfigError::UnknownContractAddresses(self.network_identifier.clone()))
    }
}

/// Built-in protocol address book, keyed by CAIP-2 identifier.
pub fn default_contract_addresses(network_identifier: &str) -> Option<ContractAddresses> {
    let (staking, controller) = match network_identifier {
        "eip155:1" => (
            "0xF55041E37E12cD407ad00CE2910B8269B01263b9",
            "0x24CCD4D3Ac8529fF08c58F74ff6755036E616117",
        ),
        "eip155:42161" => (
            "0x00669A4CF01450B64E8A2A20E9b1FCB71E61eF03",
            "0x0a8491544221dd212964fbb96487467291b2C97e",
        ),
        "eip155:11155111" => (
            "0x865365C425f3A593Ffe698D9c4E6707D14d51e08",
            "0x4DbE1B10bc15D0F53fF508BE01942198262ddfCa",
        ),
        "eip155:421614" => (
            "0x865365C425f3A593Ffe698D9c4E6707D14d51e08",
            "0x4DbE1B10bc15D0F53fF508BE01942198262ddfCa",
        ),
        _ => return None,
    };
    Some(ContractAddresses {
        staking: Address::from_str(staking).ok()?,
        controller: Address::from_str(controller).ok()?,
    })
}

/// Loads and validates every YAML specification in `dir`, rejecting
/// duplicate network identifiers.
pub fn load_specifications(dir: &Path) -> Result<Vec<NetworkSpecification>, ConfigError> {
    let mut specifications = Vec::new();

    let entries = fs::read_dir(dir).map_err(|err| ConfigError::UnreadableSpecification {
        file: dir.display().to_string(),
        problem: err.to_string(),
    })?;
    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yml") | Some("yaml")
            )
        })
        .collect();
    files.sort();

    for file in files {
        let contents =
            fs::read_to_string(&file).map_err(|err| ConfigError::UnreadableSpecification {
                file: file.display().to_string(),
                problem: err.to_string(),
            })?;
        let specification: NetworkSpecification = serde_yaml::from_str(&contents).map_err(
            |err| ConfigError::UnreadableSpecification {
                file: file.display().to_string(),
                problem: err.to_string(),
            },
        )?;
        specifications.push(specification.validate()?);
    }

    if specifications.is_empty() {
        return Err(ConfigError::EmptySpecificationDirectory(
            dir.display().to_string(),
        ));
    }

    let mut seen = Vec::new();
    for specification in &specifications {
        if seen.contains(&&specification.network_identifier) {
            return Err(ConfigError::DuplicateNetworkIdentifier(
                specification.network_identifier.clone(),
            ));
        }
        seen.push(&specification.network_identifier);
    }

    Ok(specifications)
}

/// Converts a GRT amount (18 decimals) to its wei representation.
pub fn grt_to_wei(amount: &BigDecimal) -> Result<U256, ConfigError> {
    let wei = (amount * BigDecimal::from(10u64.pow(18))).with_scale(0);
    let digits = wei.to_string();
    if digits.starts_with('-') {
        return Err(ConfigError::InvalidTokenAmount(amount.to_string()));
    }
    U256::from_str(&digits).map_err(|_| ConfigError::InvalidTokenAmount(amount.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC_YAML: &str = r#"
networkIdentifier: arbitrum-one
gateway:
  url: https://gateway.example.com/
indexerOptions:
  address: "0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c"
  mnemonic: "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
  url: https://indexer.example.com/
  poiDisputeMonitoring: true
subgraphs:
  networkSubgraph:
    endpoint: https://gateway.example.com/network
  epochSubgraph:
    endpoint: https://gateway.example.com/epoch
networkProvider:
  url: https://arb1.example.com/rpc
"#;

    #[test]
    fn parses_and_validates_yaml_specification() {
        let specification: NetworkSpecification = serde_yaml::from_str(SPEC_YAML).unwrap();
        let specification = specification.validate().unwrap();
        assert_eq!(specification.network_identifier, "eip155:42161");
        assert_eq!(
            specification.indexer_options.default_allocation_amount,
            BigDecimal::from_str("0.01").unwrap()
        );
        assert!(specification.indexer_options.poi_dispute_monitoring);
        assert_eq!(specification.transaction_monitoring.gas_price_max_gwei, 100);
        assert!(specification.contract_addresses().is_ok());
    }

    #[test]
    fn network_subgraph_endpoint_and_deployment_are_exclusive() {
        let mut specification: NetworkSpecification = serde_yaml::from_str(SPEC_YAML).unwrap();
        specification.subgraphs.network_subgraph.deployment = Some(
            DeploymentId::from_str("QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS").unwrap(),
        );
        assert!(matches!(
            specification.validate(),
            Err(ConfigError::AmbiguousNetworkSubgraph(_))
        ));
    }

    #[test]
    fn bad_mnemonic_is_rejected() {
        let mut specification: NetworkSpecification = serde_yaml::from_str(SPEC_YAML).unwrap();
        specification.indexer_options.mnemonic = "definitely not a mnemonic".to_string();
        assert!(matches!(
            specification.validate(),
            Err(ConfigError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn grt_conversion() {
        assert_eq!(
            grt_to_wei(&BigDecimal::from_str("0.01").unwrap()).unwrap(),
            U256::from(10_000_000_000_000_000u64)
        );
        assert_eq!(
            grt_to_wei(&BigDecimal::from(2300)).unwrap(),
            U256::from_str("2300000000000000000000").unwrap()
        );
    }
}
