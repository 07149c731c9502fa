// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! The reconciliation scheduler.
//!
//! One tick per polling interval, strictly ordered inside the tick: evaluate
//! every network's rules into decisions, claim rebates and run the POI
//! dispute monitor, reconcile the graph node's deployment set, then
//! reconcile allocations per network. Ticks never overlap; a failed tick is
//! logged and retried on the next interval.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use clap::ValueEnum;
use indexer_monitor::claimable_allocations;
use sqlx::PgPool;
use thegraph_core::DeploymentId;
use tokio::{sync::watch::Receiver, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    errors::{indexer_error, IndexerError, IndexerErrorCode},
    graph_node::GraphNode,
    metrics::{RECONCILE_RUNS, TARGET_DEPLOYMENTS},
    multi_networks::{MultiNetworks, NetworkAndOperator},
    poi_monitor::check_poi_disputes,
    reconcile::{
        allocations::{reconcile_allocations, TransferredDeployments},
        deployments::reconcile_deployments,
    },
    rules::{convert_subgraph_rules, evaluate_deployments, offchain_deployments},
};

/// Epochs after closing before a rebate claim settles.
const CHANNEL_DISPUTE_EPOCHS: u64 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DeploymentManagementMode {
    Auto,
    Manual,
}

/// Everything the tick derived for one network.
struct NetworkState {
    decisions: Vec<crate::rules::AllocationDecision>,
    targets: HashSet<DeploymentId>,
    eligible: HashSet<DeploymentId>,
    transfers: TransferredDeployments,
}

pub struct Agent {
    multi_networks: Arc<MultiNetworks>,
    graph_node: Arc<GraphNode>,
    pool: PgPool,
    /// Deployments assigned on the graph node, refreshed every 60 s.
    local_deployments: Receiver<Vec<DeploymentId>>,
    /// Extra offchain deployments from the CLI, synced on every network's
    /// graph node regardless of rules.
    offchain_subgraphs: Vec<DeploymentId>,
    polling_interval: Duration,
    deployment_management: DeploymentManagementMode,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        multi_networks: Arc<MultiNetworks>,
        graph_node: Arc<GraphNode>,
        pool: PgPool,
        local_deployments: Receiver<Vec<DeploymentId>>,
        offchain_subgraphs: Vec<DeploymentId>,
        polling_interval: Duration,
        deployment_management: DeploymentManagementMode,
    ) -> Self {
        Self {
            multi_networks,
            graph_node,
            pool,
            local_deployments,
            offchain_subgraphs,
            polling_interval,
            deployment_management,
        }
    }

    pub async fn run(self) {
        info!(
            networks = self.multi_networks.len(),
            polling_interval_ms = self.polling_interval.as_millis() as u64,
            "Indexer agent started"
        );

        let mut interval = tokio::time::interval(self.polling_interval);
        // Ticks are serialized by this loop; a tick that outlasts the
        // interval skips the missed firings instead of stacking them.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            RECONCILE_RUNS.with_label_values(&["total"]).inc();
            let started = Instant::now();
            match self.reconcile().await {
                Ok(()) => {
                    RECONCILE_RUNS.with_label_values(&["ok"]).inc();
                    debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Reconciliation pass complete"
                    );
                }
                Err(err) => {
                    RECONCILE_RUNS.with_label_values(&["err"]).inc();
                    warn!(
                        err_code = %err.code,
                        error = %err,
                        "Reconciliation failed, retrying next tick"
                    );
                }
            }
        }
    }

    async fn reconcile(&self) -> Result<(), IndexerError> {
        // Evaluate every network. A paused or unauthorized network yields no
        // state and is skipped for the rest of the tick.
        let states: HashMap<String, Option<NetworkState>> = self
            .multi_networks
            .map(|pair| evaluate_network(pair))
            .await;
        let all_evaluated = states.len() == self.multi_networks.len()
            && states.values().all(Option::is_some);

        let mut target: HashSet<DeploymentId> =
            self.offchain_subgraphs.iter().copied().collect();
        let mut eligible: HashSet<DeploymentId> = HashSet::new();
        for state in states.values().flatten() {
            target.extend(state.targets.iter().copied());
            eligible.extend(state.eligible.iter().copied());
        }
        TARGET_DEPLOYMENTS
            .with_label_values(&["target"])
            .set(target.len() as i64);
        TARGET_DEPLOYMENTS
            .with_label_values(&["eligible"])
            .set(eligible.len() as i64);

        let local = self.local_deployments.borrow().clone();
        let local_set: HashSet<DeploymentId> = local.iter().copied().collect();

        // Rebate claims and the POI dispute monitor run before any
        // reconciliation and regardless of pending operator actions.
        {
            let states = &states;
            let local_set = &local_set;
            let graph_node = self.graph_node.as_ref();
            let pool = &self.pool;
            self.multi_networks
                .map(|pair| async move {
                    if !matches!(states.get(pair.network.id()), Some(Some(_))) {
                        return Ok(());
                    }

                    let current_epoch = pair.network.epoch_info.borrow().current_epoch;
                    match claimable_allocations(
                        pair.network.network_subgraph,
                        pair.network.indexer(),
                        current_epoch.saturating_sub(CHANNEL_DISPUTE_EPOCHS),
                    )
                    .await
                    {
                        Ok(claimable) => {
                            if let Err(err) = pair.operator.claim_rebates(&claimable).await {
                                warn!(
                                    protocol_network = %pair.network.id(),
                                    err_code = %err.code,
                                    error = %err,
                                    "Failed to claim rebates"
                                );
                            }
                        }
                        Err(err) => {
                            let err = indexer_error(IndexerErrorCode::IE011, err);
                            warn!(
                                protocol_network = %pair.network.id(),
                                err_code = %err.code,
                                error = %err,
                                "Failed to fetch claimable allocations"
                            );
                        }
                    }

                    if let Err(err) =
                        check_poi_disputes(&pair.network, graph_node, pool, local_set).await
                    {
                        warn!(
                            protocol_network = %pair.network.id(),
                            err_code = %err.code,
                            error = %err,
                            "POI dispute monitoring failed"
                        );
                    }
                    Ok(())
                })
                .await;
        }

        // Deployment reconciliation needs the full cross-network target set;
        // with a network unevaluated the set is incomplete and removals
        // would be unsafe.
        match self.deployment_management {
            DeploymentManagementMode::Manual => {
                debug!("Deployment management is manual, skipping deployment reconciliation");
            }
            DeploymentManagementMode::Auto if !all_evaluated => {
                info!("Not every network could be evaluated, skipping deployment reconciliation");
            }
            DeploymentManagementMode::Auto => {
                if let Err(err) =
                    reconcile_deployments(&self.graph_node, &local, &target, &eligible).await
                {
                    let err = indexer_error(IndexerErrorCode::IE005, err);
                    warn!(
                        err_code = %err.code,
                        error = %err,
                        "Deployment reconciliation failed, skipping allocation reconciliation this tick"
                    );
                    return Ok(());
                }
            }
        }

        // Allocation reconciliation, per network in parallel; transactions
        // within a network stay serialized behind its wallet lock.
        {
            let states = &states;
            let graph_node = self.graph_node.as_ref();
            self.multi_networks
                .map(|pair| async move {
                    let Some(Some(state)) = states.get(pair.network.id()) else {
                        return Ok(());
                    };
                    reconcile_allocations(
                        &pair.network,
                        &pair.operator,
                        graph_node,
                        &state.decisions,
                        &state.transfers,
                    )
                    .await
                    .map_err(anyhow::Error::new)
                })
                .await;
        }

        Ok(())
    }
}

/// Rule evaluation for one network. `None` means the network sits this tick
/// out (paused or operator not authorized).
async fn evaluate_network(
    pair: Arc<NetworkAndOperator>,
) -> anyhow::Result<Option<NetworkState>> {
    let network = &pair.network;
    let operator = &pair.operator;

    if *network.paused.borrow() {
        info!(
            protocol_network = %network.id(),
            "Network is paused, skipping this tick"
        );
        return Ok(None);
    }
    if !*network.is_operator.borrow() {
        error!(
            protocol_network = %network.id(),
            operator = %network.operator_address,
            indexer = %network.indexer(),
            "Operator is not authorized for the indexer, skipping this tick"
        );
        return Ok(None);
    }

    let rules = operator.indexing_rules(true).await?;
    let subgraphs = network
        .fetch_subgraphs()
        .await
        .map_err(|err| indexer_error(IndexerErrorCode::IE003, err))?;
    let epoch_info = *network.epoch_info.borrow();

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let converted = convert_subgraph_rules(
        &rules,
        &subgraphs,
        epoch_info.previous_version_buffer(),
        now_secs,
    );

    let deployments = network.network_deployments.borrow().clone();
    let decisions = evaluate_deployments(&converted, &deployments, network.id());

    let mut targets: HashSet<DeploymentId> = decisions
        .iter()
        .filter(|decision| decision.to_allocate)
        .map(|decision| decision.deployment)
        .collect();
    targets.extend(offchain_deployments(&converted));
    targets.extend(
        network
            .specification
            .indexer_options
            .offchain_subgraphs
            .iter()
            .copied(),
    );
    // The network subgraph itself is always indexed.
    if let Some(network_subgraph) = network.network_subgraph_deployment() {
        targets.insert(network_subgraph);
    }

    let transfers = TransferredDeployments {
        transferring: subgraphs
            .iter()
            .filter(|subgraph| subgraph.started_transfer_to_l2)
            .flat_map(|subgraph| subgraph.versions.iter().map(|version| version.deployment))
            .collect(),
        transferred: deployments
            .iter()
            .filter(|deployment| deployment.transferred_to_l2)
            .map(|deployment| deployment.id)
            .collect(),
    };

    let mut eligible: HashSet<DeploymentId> = network
        .active_allocations
        .borrow()
        .iter()
        .map(|allocation| allocation.subgraph_deployment.id)
        .collect();
    eligible.extend(
        network
            .recently_closed_allocations
            .borrow()
            .iter()
            .map(|allocation| allocation.subgraph_deployment.id),
    );

    Ok(Some(NetworkState {
        decisions,
        targets,
        eligible,
        transfers,
    }))
}
