// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Per-network read surface: the protocol subgraph clients, the contract
//! read interface, and the watchers the reconciler consumes.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use indexer_allocation::Allocation;
use indexer_config::{chain_id, resolve_chain_alias, NetworkSpecification, SubgraphConfig};
use indexer_monitor::{
    epoch_info, indexer_active_allocations, indexer_recently_closed_allocations, network_pause,
    operator_status, EpochInfo, NetworkDeployment, Subgraph,
};
use indexer_query::{EpochSubgraph, SubgraphClient};
use reqwest::Url;
use thegraph_core::{alloy::primitives::Address, DeploymentId};
use tokio::sync::watch::Receiver;

use crate::contracts::{ContractClient, StakingContract};

const EPOCH_INFO_REFRESH_INTERVAL: Duration = Duration::from_secs(600);
const PAUSE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const OPERATOR_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const ALLOCATIONS_REFRESH_INTERVAL: Duration = Duration::from_secs(120);
const CLOSED_ALLOCATIONS_REFRESH_INTERVAL: Duration = Duration::from_secs(120);
const DEPLOYMENTS_REFRESH_INTERVAL: Duration = Duration::from_secs(240);

pub struct Network {
    pub specification: Arc<NetworkSpecification>,
    pub network_subgraph: &'static SubgraphClient,
    pub epoch_subgraph: EpochSubgraph,
    pub contracts: Arc<dyn StakingContract>,
    /// Address of the operator wallet derived from the mnemonic.
    pub operator_address: Address,
    pub epoch_info: Receiver<EpochInfo>,
    pub paused: Receiver<bool>,
    pub is_operator: Receiver<bool>,
    pub active_allocations: Receiver<Vec<Allocation>>,
    pub recently_closed_allocations: Receiver<Vec<Allocation>>,
    pub network_deployments: Receiver<Vec<NetworkDeployment>>,
}

fn subgraph_url(
    config: &SubgraphConfig,
    graph_node_query_endpoint: &Url,
) -> anyhow::Result<Url> {
    if let Some(endpoint) = &config.endpoint {
        return Ok(endpoint.clone());
    }
    let deployment = config
        .deployment
        .context("subgraph config has neither endpoint nor deployment")?;
    graph_node_query_endpoint
        .join(&format!("subgraphs/id/{deployment}"))
        .context("failed to build local subgraph query URL")
}

impl Network {
    /// Connects the network's clients and seeds all watchers. Fails (and the
    /// process exits) when an initial fetch cannot be satisfied.
    pub async fn create(
        specification: NetworkSpecification,
        graph_node_query_endpoint: &Url,
        http_client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let spec = Arc::new(specification);
        let indexer = spec.indexer_options.address;

        // The network subgraph client is read for the lifetime of the
        // process from many tasks; leaking it buys 'static without Arcs
        // everywhere.
        let network_subgraph: &'static SubgraphClient = Box::leak(Box::new(SubgraphClient::new(
            http_client.clone(),
            subgraph_url(&spec.subgraphs.network_subgraph, graph_node_query_endpoint)?,
        )));
        let epoch_subgraph = EpochSubgraph::new(SubgraphClient::new(
            http_client,
            subgraph_url(&spec.subgraphs.epoch_subgraph, graph_node_query_endpoint)?,
        ));

        let contract_client = ContractClient::connect(
            &spec.network_provider.url,
            chain_id(&spec.network_identifier)?,
            &spec.indexer_options.mnemonic,
            spec.contract_addresses()?,
        )?;
        let operator_address = contract_client.operator_address();
        let contracts: Arc<dyn StakingContract> = Arc::new(contract_client);

        let initially_paused = contracts
            .controller_paused()
            .await
            .context("failed to read the protocol pause state")?;
        let paused = network_pause(network_subgraph, initially_paused, PAUSE_REFRESH_INTERVAL);

        let is_operator = {
            let contracts = contracts.clone();
            operator_status(
                operator_address,
                indexer,
                OPERATOR_REFRESH_INTERVAL,
                move || {
                    let contracts = contracts.clone();
                    async move {
                        contracts
                            .is_operator(operator_address, indexer)
                            .await
                            .map_err(Into::into)
                    }
                },
            )
            .await?
        };

        let epoch_info = epoch_info(network_subgraph, EPOCH_INFO_REFRESH_INTERVAL).await?;
        let active_allocations =
            indexer_active_allocations(network_subgraph, indexer, ALLOCATIONS_REFRESH_INTERVAL)
                .await?;
        let recently_closed_allocations = indexer_recently_closed_allocations(
            network_subgraph,
            indexer,
            epoch_info.clone(),
            CLOSED_ALLOCATIONS_REFRESH_INTERVAL,
        )
        .await?;
        let network_deployments =
            indexer_monitor::network_deployments(network_subgraph, DEPLOYMENTS_REFRESH_INTERVAL)
                .await?;

        Ok(Self {
            specification: spec,
            network_subgraph,
            epoch_subgraph,
            contracts,
            operator_address,
            epoch_info,
            paused,
            is_operator,
            active_allocations,
            recently_closed_allocations,
            network_deployments,
        })
    }

    pub fn id(&self) -> &str {
        &self.specification.network_identifier
    }

    pub fn indexer(&self) -> Address {
        self.specification.indexer_options.address
    }

    /// Chain name the graph node knows this network by.
    pub fn chain_alias(&self) -> Option<&'static str> {
        resolve_chain_alias(self.id())
    }

    pub fn network_subgraph_deployment(&self) -> Option<DeploymentId> {
        self.specification.subgraphs.network_subgraph.deployment
    }

    pub async fn fetch_subgraphs(&self) -> anyhow::Result<Vec<Subgraph>> {
        indexer_monitor::fetch_subgraphs(self.network_subgraph).await
    }
}
