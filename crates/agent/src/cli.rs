// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Command line surface. `start` runs against a single protocol network
//! assembled from flags; `start-multiple` loads one YAML specification per
//! network from a directory. Every flag has an `INDEXER_AGENT_*`
//! environment variable mirror.

use std::{path::PathBuf, str::FromStr};

use anyhow::Context;
use bigdecimal::BigDecimal;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use ethers::providers::{Http, Middleware, Provider};
use indexer_config::{
    parse_tagged_deployment, parse_tagged_url, resolve_network_identifier, validate_tagged_groups,
    AllocationManagementMode, GatewayConfig, IndexerOptions, NetworkSpecification,
    ProtocolSubgraphs, ProviderConfig, SubgraphConfig, TransactionMonitoring,
};
use reqwest::Url;
use thegraph_core::alloy::primitives::Address;

use crate::agent::DeploymentManagementMode;

/// Environment variable selecting multi-network mode; any value other than
/// a case-insensitive "false" enables it.
pub const MULTINETWORK_MODE_VAR: &str = "INDEXER_AGENT_MULTINETWORK_MODE";

pub fn multinetwork_mode_enabled() -> bool {
    match std::env::var(MULTINETWORK_MODE_VAR) {
        Ok(value) => !value.eq_ignore_ascii_case("false"),
        Err(_) => false,
    }
}

#[derive(Debug, Parser)]
#[command(name = "indexer-agent", about = "Indexer agent for the Graph protocol", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run against a single protocol network configured through flags
    Start(StartArgs),
    /// Run against multiple protocol networks from a specification directory
    StartMultiple(StartMultipleArgs),
}

impl Command {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Command::Start(args) => &args.common,
            Command::StartMultiple(args) => &args.common,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum AllocationMode {
    Auto,
    Manual,
    Oversight,
}

impl From<AllocationMode> for AllocationManagementMode {
    fn from(mode: AllocationMode) -> Self {
        match mode {
            AllocationMode::Auto => AllocationManagementMode::Auto,
            AllocationMode::Manual => AllocationManagementMode::Manual,
            AllocationMode::Oversight => AllocationManagementMode::Oversight,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct CommonArgs {
    #[arg(
        long,
        env = "INDEXER_AGENT_GRAPH_NODE_QUERY_ENDPOINT",
        help = "Graph node GraphQL query endpoint"
    )]
    pub graph_node_query_endpoint: Url,

    #[arg(
        long,
        env = "INDEXER_AGENT_GRAPH_NODE_STATUS_ENDPOINT",
        help = "Graph node indexing status endpoint"
    )]
    pub graph_node_status_endpoint: Url,

    #[arg(
        long,
        env = "INDEXER_AGENT_GRAPH_NODE_ADMIN_ENDPOINT",
        help = "Graph node admin JSON-RPC endpoint"
    )]
    pub graph_node_admin_endpoint: Url,

    #[arg(long, env = "INDEXER_AGENT_POSTGRES_HOST", help = "Postgres host")]
    pub postgres_host: String,

    #[arg(long, env = "INDEXER_AGENT_POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(
        long,
        env = "INDEXER_AGENT_POSTGRES_USERNAME",
        default_value = "postgres"
    )]
    pub postgres_username: String,

    #[arg(long, env = "INDEXER_AGENT_POSTGRES_PASSWORD", default_value = "")]
    pub postgres_password: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_POSTGRES_DATABASE",
        help = "Postgres database name"
    )]
    pub postgres_database: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_INDEX_NODE_IDS",
        value_delimiter = ',',
        required = true,
        help = "Graph node index node ids to assign deployments to"
    )]
    pub index_node_ids: Vec<String>,

    #[arg(
        long,
        env = "INDEXER_AGENT_INDEXER_MANAGEMENT_PORT",
        default_value_t = 8000,
        help = "Port the indexer management API is served on (by the management server)"
    )]
    pub indexer_management_port: u16,

    #[arg(
        long,
        env = "INDEXER_AGENT_METRICS_PORT",
        default_value_t = 7300,
        help = "Port metrics are exposed on (by the metrics server)"
    )]
    pub metrics_port: u16,

    #[arg(
        long,
        env = "INDEXER_AGENT_POLLING_INTERVAL",
        default_value_t = 120_000,
        help = "Reconciliation interval in milliseconds"
    )]
    pub polling_interval: u64,

    #[arg(long, env = "INDEXER_AGENT_LOG_LEVEL", default_value = "debug")]
    pub log_level: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_OFFCHAIN_SUBGRAPHS",
        value_delimiter = ',',
        help = "Deployments to index regardless of rules or allocations"
    )]
    pub offchain_subgraphs: Vec<String>,

    #[arg(
        long,
        env = "INDEXER_AGENT_DEPLOYMENT_MANAGEMENT",
        value_enum,
        default_value_t = DeploymentManagementMode::Auto,
        help = "Whether the agent manages the graph node's deployments"
    )]
    pub deployment_management: DeploymentManagementMode,
}

impl CommonArgs {
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres_username,
            self.postgres_password,
            self.postgres_host,
            self.postgres_port,
            self.postgres_database
        )
    }
}

#[derive(Debug, Args)]
pub struct StartArgs {
    #[arg(
        long,
        env = "INDEXER_AGENT_ETHEREUM",
        help = "Ethereum node or provider URL, optionally tagged `<network>:<url>`"
    )]
    pub ethereum: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_ETHEREUM_POLLING_INTERVAL",
        default_value_t = 4000,
        help = "Provider polling interval in milliseconds"
    )]
    pub ethereum_polling_interval: u64,

    #[arg(long, env = "INDEXER_AGENT_MNEMONIC", help = "Operator wallet mnemonic")]
    pub mnemonic: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_INDEXER_ADDRESS",
        help = "Ethereum address of the indexer"
    )]
    pub indexer_address: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_PUBLIC_INDEXER_URL",
        help = "Public URL of the indexer's query endpoint"
    )]
    pub public_indexer_url: Url,

    #[arg(
        long,
        env = "INDEXER_AGENT_INDEXER_GEO_COORDINATES",
        value_delimiter = ' ',
        num_args = 1..,
        default_value = "31.780715 -41.179504",
        help = "Latitude and longitude of the indexer, space separated"
    )]
    pub indexer_geo_coordinates: Vec<String>,

    #[arg(
        long,
        env = "INDEXER_AGENT_NETWORK_SUBGRAPH_ENDPOINT",
        help = "Network subgraph query endpoint (exclusive with --network-subgraph-deployment)"
    )]
    pub network_subgraph_endpoint: Option<String>,

    #[arg(
        long,
        env = "INDEXER_AGENT_NETWORK_SUBGRAPH_DEPLOYMENT",
        help = "Network subgraph deployment on the graph node (exclusive with --network-subgraph-endpoint)"
    )]
    pub network_subgraph_deployment: Option<String>,

    #[arg(
        long,
        env = "INDEXER_AGENT_EPOCH_SUBGRAPH_ENDPOINT",
        help = "Epoch block oracle subgraph query endpoint"
    )]
    pub epoch_subgraph_endpoint: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_GATEWAY_ENDPOINT",
        help = "Gateway base URL"
    )]
    pub gateway_endpoint: Url,

    #[arg(
        long,
        env = "INDEXER_AGENT_DEFAULT_ALLOCATION_AMOUNT",
        default_value = "0.01",
        help = "Default allocation amount in GRT for the global indexing rule"
    )]
    pub default_allocation_amount: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_ALLOCATION_MANAGEMENT",
        value_enum,
        default_value_t = AllocationMode::Auto
    )]
    pub allocation_management: AllocationMode,

    #[arg(
        long,
        env = "INDEXER_AGENT_RESTAKE_REWARDS",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Restake claimed rewards instead of withdrawing them"
    )]
    pub restake_rewards: bool,

    #[arg(
        long,
        env = "INDEXER_AGENT_INJECT_DAI",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Inject the GRT/DAI conversion rate into cost models (cost models are managed by the management server)"
    )]
    pub inject_dai: bool,

    #[arg(
        long,
        env = "INDEXER_AGENT_REBATE_CLAIM_THRESHOLD",
        default_value = "200",
        help = "Minimum query fees (GRT) on a single allocation to claim"
    )]
    pub rebate_claim_threshold: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_REBATE_CLAIM_BATCH_THRESHOLD",
        default_value = "2000",
        help = "Minimum aggregate query fees (GRT) before a claim batch is sent"
    )]
    pub rebate_claim_batch_threshold: String,

    #[arg(
        long,
        env = "INDEXER_AGENT_REBATE_CLAIM_MAX_BATCH_SIZE",
        default_value_t = 100
    )]
    pub rebate_claim_max_batch_size: usize,

    #[arg(
        long,
        env = "INDEXER_AGENT_POI_DISPUTE_MONITORING",
        default_value_t = false,
        action = ArgAction::Set,
        help = "Record POI disputes for other indexers' closed allocations"
    )]
    pub poi_dispute_monitoring: bool,

    #[arg(
        long,
        env = "INDEXER_AGENT_POI_DISPUTABLE_EPOCHS",
        default_value_t = 1
    )]
    pub poi_disputable_epochs: u64,

    #[arg(
        long,
        env = "INDEXER_AGENT_ALLOCATE_ON_NETWORK_SUBGRAPH",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub allocate_on_network_subgraph: bool,

    #[arg(
        long,
        env = "INDEXER_AGENT_ENABLE_AUTO_MIGRATION_SUPPORT",
        default_value_t = false,
        action = ArgAction::Set,
        help = "Close L1 allocations for subgraphs that started transferring to L2"
    )]
    pub enable_auto_migration_support: bool,

    #[arg(long, env = "INDEXER_AGENT_GAS_PRICE_MAX", default_value_t = 100, help = "Gas price ceiling in gwei")]
    pub gas_price_max: u64,

    #[arg(long, env = "INDEXER_AGENT_GAS_INCREASE_TIMEOUT", default_value_t = 240, help = "Seconds before the gas price is bumped")]
    pub gas_increase_timeout: u64,

    #[arg(long, env = "INDEXER_AGENT_GAS_INCREASE_FACTOR", default_value_t = 1.2)]
    pub gas_increase_factor: f64,

    #[arg(long, env = "INDEXER_AGENT_MAX_TRANSACTION_ATTEMPTS", default_value_t = 0, help = "0 means unlimited attempts")]
    pub max_transaction_attempts: u32,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct StartMultipleArgs {
    #[arg(
        long,
        env = "INDEXER_AGENT_NETWORK_SPECIFICATIONS_DIRECTORY",
        help = "Directory with one network specification YAML file per network"
    )]
    pub network_specifications_directory: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl StartArgs {
    /// Assembles the single-network specification. The protocol network is
    /// taken from the option tags when present, otherwise detected from the
    /// provider's chain id.
    pub async fn build_specification(&self) -> anyhow::Result<NetworkSpecification> {
        let ethereum = parse_tagged_url(&self.ethereum)?;
        let epoch_subgraph_endpoint = parse_tagged_url(&self.epoch_subgraph_endpoint)?;
        let network_subgraph_endpoint = self
            .network_subgraph_endpoint
            .as_deref()
            .map(parse_tagged_url)
            .transpose()?;
        let network_subgraph_deployment = self
            .network_subgraph_deployment
            .as_deref()
            .map(parse_tagged_deployment)
            .transpose()?;

        anyhow::ensure!(
            network_subgraph_endpoint.is_some() != network_subgraph_deployment.is_some(),
            "exactly one of --network-subgraph-endpoint and --network-subgraph-deployment is required"
        );

        // Tagging is all-or-nothing across the network-scoped options.
        let mut groups: Vec<(&str, Vec<Option<String>>)> = vec![
            ("network-provider", vec![ethereum.network_id.clone()]),
            (
                "epoch-subgraph-endpoint",
                vec![epoch_subgraph_endpoint.network_id.clone()],
            ),
        ];
        if let Some(tagged) = &network_subgraph_endpoint {
            groups.push((
                "network-subgraph-endpoint",
                vec![tagged.network_id.clone()],
            ));
        }
        if let Some(tagged) = &network_subgraph_deployment {
            groups.push((
                "network-subgraph-deployment",
                vec![tagged.network_id.clone()],
            ));
        }
        validate_tagged_groups(&groups)?;

        let network_identifier = match &ethereum.network_id {
            Some(id) => id.clone(),
            None => {
                let provider = Provider::<Http>::try_from(ethereum.value.as_str())
                    .context("invalid Ethereum provider URL")?;
                let chain_id = provider
                    .get_chainid()
                    .await
                    .context("failed to detect the provider's chain id")?;
                resolve_network_identifier(&format!("eip155:{chain_id}"))?
            }
        };

        anyhow::ensure!(
            self.indexer_geo_coordinates.len() == 2,
            "--indexer-geo-coordinates takes exactly two values"
        );

        let specification = NetworkSpecification {
            network_identifier,
            gateway: GatewayConfig {
                url: self.gateway_endpoint.clone(),
            },
            indexer_options: IndexerOptions {
                address: Address::from_str(&self.indexer_address)
                    .context("invalid indexer address")?,
                mnemonic: self.mnemonic.clone(),
                url: self.public_indexer_url.clone(),
                geo_coordinates: [
                    self.indexer_geo_coordinates[0].clone(),
                    self.indexer_geo_coordinates[1].clone(),
                ],
                default_allocation_amount: BigDecimal::from_str(&self.default_allocation_amount)
                    .context("invalid default allocation amount")?,
                allocation_management: self.allocation_management.into(),
                restake_rewards: self.restake_rewards,
                rebate_claim_threshold: BigDecimal::from_str(&self.rebate_claim_threshold)
                    .context("invalid rebate claim threshold")?,
                rebate_claim_batch_threshold: BigDecimal::from_str(
                    &self.rebate_claim_batch_threshold,
                )
                .context("invalid rebate claim batch threshold")?,
                rebate_claim_max_batch_size: self.rebate_claim_max_batch_size,
                poi_dispute_monitoring: self.poi_dispute_monitoring,
                poi_disputable_epochs: self.poi_disputable_epochs,
                allocate_on_network_subgraph: self.allocate_on_network_subgraph,
                auto_migration_support: self.enable_auto_migration_support,
                offchain_subgraphs: Vec::new(),
            },
            transaction_monitoring: TransactionMonitoring {
                gas_price_max_gwei: self.gas_price_max,
                gas_increase_timeout_secs: self.gas_increase_timeout,
                gas_increase_factor: self.gas_increase_factor,
                max_transaction_attempts: self.max_transaction_attempts,
            },
            subgraphs: ProtocolSubgraphs {
                network_subgraph: SubgraphConfig {
                    endpoint: network_subgraph_endpoint.map(|tagged| tagged.value),
                    deployment: network_subgraph_deployment.map(|tagged| tagged.value),
                },
                epoch_subgraph: SubgraphConfig {
                    endpoint: Some(epoch_subgraph_endpoint.value),
                    deployment: None,
                },
            },
            network_provider: ProviderConfig {
                url: ethereum.value,
                polling_interval_ms: self.ethereum_polling_interval,
            },
            addresses: None,
        };

        Ok(specification.validate()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_args(extra: &[&str]) -> StartArgs {
        let mut argv = vec![
            "indexer-agent",
            "start",
            "--ethereum",
            "mainnet:https://eth.example.com/rpc",
            "--mnemonic",
            test_assets::INDEXER_OPERATOR_MNEMONIC,
            "--indexer-address",
            "0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c",
            "--public-indexer-url",
            "https://indexer.example.com/",
            "--epoch-subgraph-endpoint",
            "mainnet:https://gateway.example.com/epoch",
            "--gateway-endpoint",
            "https://gateway.example.com/",
            "--network-subgraph-endpoint",
            "mainnet:https://gateway.example.com/network",
            "--graph-node-query-endpoint",
            "http://127.0.0.1:8000/",
            "--graph-node-status-endpoint",
            "http://127.0.0.1:8030/graphql",
            "--graph-node-admin-endpoint",
            "http://127.0.0.1:8020/",
            "--postgres-host",
            "127.0.0.1",
            "--postgres-database",
            "indexer",
            "--index-node-ids",
            "default",
        ];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::Start(args) => args,
            _ => panic!("expected start"),
        }
    }

    #[tokio::test]
    async fn builds_specification_from_tagged_flags() {
        let args = start_args(&[]);
        let specification = args.build_specification().await.unwrap();
        assert_eq!(specification.network_identifier, "eip155:1");
        assert_eq!(
            specification.indexer_options.default_allocation_amount,
            BigDecimal::from_str("0.01").unwrap()
        );
        assert!(specification.subgraphs.network_subgraph.endpoint.is_some());
    }

    #[tokio::test]
    async fn mixed_tagging_is_rejected() {
        let mut args = start_args(&[]);
        args.network_subgraph_endpoint =
            Some("https://gateway.example.com/network".to_string());
        let err = args.build_specification().await.unwrap_err();
        assert!(err.to_string().contains("mixed network identifiers"));
    }

    #[tokio::test]
    async fn network_subgraph_options_are_exclusive() {
        let mut args = start_args(&[]);
        args.network_subgraph_deployment =
            Some("mainnet:QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS".to_string());
        let err = args.build_specification().await.unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn polling_interval_default_matches_documentation() {
        let args = start_args(&[]);
        assert_eq!(args.common.polling_interval, 120_000);
        assert_eq!(args.common.metrics_port, 7300);
        assert_eq!(args.common.indexer_management_port, 8000);
        assert_eq!(
            args.indexer_geo_coordinates,
            vec!["31.780715".to_string(), "-41.179504".to_string()]
        );
    }
}
