// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use indexer_agent::{
    agent::Agent,
    cli::{multinetwork_mode_enabled, Cli, Command, MULTINETWORK_MODE_VAR},
    database,
    graph_node::GraphNode,
    multi_networks::{MultiNetworks, NetworkAndOperator},
    network::Network,
    operator::Operator,
    query_fees::{LoggingCollector, QueryFeeCollector},
};
use indexer_config::load_specifications;
use indexer_watcher::new_watcher;
use thegraph_core::DeploymentId;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const LOCAL_DEPLOYMENTS_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_new("debug"))
        .expect("default log filter is valid");
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.command.common().log_level);

    if let Err(err) = run(cli).await {
        error!(error = %format!("{err:#}"), "Indexer agent failed to start");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let common = cli.command.common().clone();

    let specifications = match &cli.command {
        Command::Start(args) => {
            anyhow::ensure!(
                !multinetwork_mode_enabled(),
                "`start` requires {MULTINETWORK_MODE_VAR} to be unset or \"false\"; \
                 use `start-multiple` for multi-network mode"
            );
            vec![args.build_specification().await?]
        }
        Command::StartMultiple(args) => {
            anyhow::ensure!(
                multinetwork_mode_enabled(),
                "`start-multiple` requires {MULTINETWORK_MODE_VAR} to be set"
            );
            load_specifications(&args.network_specifications_directory)?
        }
    };

    let pool = database::connect(&common.postgres_url())
        .await
        .context("failed to connect to the database")?;
    database::migrate(&pool).await?;

    let graph_node = Arc::new(GraphNode::new(
        &common.graph_node_admin_endpoint,
        &common.graph_node_status_endpoint,
        common.index_node_ids.clone(),
    )?);
    let collector: Arc<dyn QueryFeeCollector> = Arc::new(LoggingCollector);
    let http_client = reqwest::Client::new();

    let mut pairs = Vec::new();
    for specification in specifications {
        let network_identifier = specification.network_identifier.clone();
        info!(protocol_network = %network_identifier, "Connecting network");
        let network = Network::create(
            specification,
            &common.graph_node_query_endpoint,
            http_client.clone(),
        )
        .await
        .with_context(|| format!("failed to connect network {network_identifier}"))?;
        let operator = Operator::create(pool.clone(), &network, collector.clone())
            .await
            .with_context(|| format!("failed to set up operator for {network_identifier}"))?;
        operator.ensure_global_indexing_rule().await?;
        pairs.push(NetworkAndOperator { network, operator });
    }
    let multi_networks = Arc::new(MultiNetworks::new(pairs)?);

    let local_deployments = {
        let graph_node = graph_node.clone();
        new_watcher(LOCAL_DEPLOYMENTS_REFRESH_INTERVAL, move || {
            let graph_node = graph_node.clone();
            async move { graph_node.active_deployments().await }
        })
        .await
        .context("failed to list deployments on the graph node")?
    };

    let offchain_subgraphs = common
        .offchain_subgraphs
        .iter()
        .map(|raw| DeploymentId::from_str(raw))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid --offchain-subgraphs entry")?;

    let agent = Agent::new(
        multi_networks,
        graph_node,
        pool,
        local_deployments,
        offchain_subgraphs,
        Duration::from_millis(common.polling_interval),
        common.deployment_management,
    );
    agent.run().await;
    Ok(())
}
