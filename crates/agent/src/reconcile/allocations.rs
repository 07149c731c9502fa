// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Drives on-chain allocations toward the rule evaluator's decisions.
//!
//! Per deployment this either opens a first set of allocations, refreshes
//! expiring ones (close, then reopen when auto-renewal is on), closes
//! everything for negative decisions, or does nothing. Active allocations
//! are re-fetched right before acting so the cached view cannot race chain
//! truth, and every close is pre-checked against the contract state.

use std::{collections::HashSet, str::FromStr};

use indexer_allocation::Allocation;
use indexer_config::AllocationManagementMode;
use indexer_monitor::{fetch_active_allocations, EpochInfo};
use thegraph_core::{
    alloy::primitives::{Address, B256},
    DeploymentId,
};
use tracing::{debug, info, warn};

use crate::{
    database::actions::ActionStatus,
    errors::{indexer_error, IndexerError, IndexerErrorCode},
    graph_node::GraphNode,
    network::Network,
    operator::Operator,
    rules::{bd_to_u256, AllocationDecision},
};

/// Deployments affected by an L1 -> L2 transfer, as observed on this
/// network's subgraph records.
#[derive(Clone, Debug, Default)]
pub struct TransferredDeployments {
    /// Subgraph started transferring: close L1 allocations, the L2 tick
    /// opens replacements on its own.
    pub transferring: HashSet<DeploymentId>,
    /// Transfer completed: never allocate here again.
    pub transferred: HashSet<DeploymentId>,
}

/// Reconciles one network's allocations against its decisions, sequentially
/// per deployment (the network wallet serializes transactions anyway).
pub async fn reconcile_allocations(
    network: &Network,
    operator: &Operator,
    graph_node: &GraphNode,
    decisions: &[AllocationDecision],
    transfers: &TransferredDeployments,
) -> Result<(), IndexerError> {
    if network.specification.indexer_options.allocation_management
        == AllocationManagementMode::Manual
    {
        debug!(
            protocol_network = %network.id(),
            "Allocation management is manual, skipping reconciliation"
        );
        return Ok(());
    }

    let approved = operator.fetch_actions(ActionStatus::Approved).await?;
    if !approved.is_empty() {
        info!(
            protocol_network = %network.id(),
            approved_actions = approved.len(),
            "Deferring allocation reconciliation to approved operator actions"
        );
        return Ok(());
    }

    let epoch_start = current_epoch_start_block(network, graph_node).await;

    for decision in decisions {
        if let Err(err) = reconcile_deployment_allocations(
            network,
            operator,
            graph_node,
            decision,
            epoch_start.as_ref(),
            transfers,
        )
        .await
        {
            warn!(
                protocol_network = %network.id(),
                deployment = %decision.deployment,
                err_code = %err.code,
                error = %err,
                "Failed to reconcile allocations for deployment"
            );
        }
    }

    Ok(())
}

/// Start block (number, hash) of the current epoch, or `None` when either
/// upstream cannot resolve it; closes then fall back to a zero POI.
async fn current_epoch_start_block(
    network: &Network,
    graph_node: &GraphNode,
) -> Option<(u64, String)> {
    let current_epoch = network.epoch_info.borrow().current_epoch;
    let number = match network.epoch_subgraph.epoch_start_block(current_epoch).await {
        Ok(number) => number,
        Err(err) => {
            let err = indexer_error(IndexerErrorCode::IE004, err);
            warn!(protocol_network = %network.id(), error = %err, "Failed to resolve epoch start block");
            return None;
        }
    };
    let alias = network.chain_alias()?;
    match graph_node.block_hash_from_number(alias, number).await {
        Ok(hash) => Some((number, hash)),
        Err(err) => {
            warn!(
                protocol_network = %network.id(),
                block = number,
                error = %err,
                "Failed to resolve epoch start block hash"
            );
            None
        }
    }
}

/// The POI to close with: the graph node's POI for this indexer at the
/// current epoch's start block, or 32 zero bytes when unavailable.
async fn resolve_poi(
    network: &Network,
    graph_node: &GraphNode,
    deployment: DeploymentId,
    epoch_start: Option<&(u64, String)>,
) -> B256 {
    let Some((number, hash)) = epoch_start else {
        warn!(
            protocol_network = %network.id(),
            deployment = %deployment,
            "Epoch start block unknown, closing with zero POI"
        );
        return B256::ZERO;
    };

    match graph_node
        .proof_of_indexing(&deployment, *number, hash, network.indexer())
        .await
    {
        Ok(Some(poi)) => B256::from_str(&poi).unwrap_or_else(|_| {
            warn!(deployment = %deployment, poi, "Graph node returned a malformed POI, using zero");
            B256::ZERO
        }),
        Ok(None) => {
            warn!(
                protocol_network = %network.id(),
                deployment = %deployment,
                block = number,
                "POI unavailable, closing with zero POI"
            );
            B256::ZERO
        }
        Err(err) => {
            let err = indexer_error(IndexerErrorCode::IE019, err);
            warn!(
                protocol_network = %network.id(),
                deployment = %deployment,
                error = %err,
                "Failed to query POI, closing with zero POI"
            );
            B256::ZERO
        }
    }
}

pub(crate) async fn reconcile_deployment_allocations(
    network: &Network,
    operator: &Operator,
    graph_node: &GraphNode,
    decision: &AllocationDecision,
    epoch_start: Option<&(u64, String)>,
    transfers: &TransferredDeployments,
) -> Result<(), IndexerError> {
    let options = &network.specification.indexer_options;
    let deployment = decision.deployment;
    let epoch_info: EpochInfo = *network.epoch_info.borrow();

    // Close the race window between the cached allocation view and chain
    // truth.
    let active = fetch_active_allocations(network.network_subgraph, network.indexer())
        .await
        .map_err(|err| indexer_error(IndexerErrorCode::IE010, err))?;
    let all_active_ids: Vec<Address> = active.iter().map(|allocation| allocation.id).collect();
    let active_for_deployment: Vec<&Allocation> = active
        .iter()
        .filter(|allocation| allocation.subgraph_deployment.id == deployment)
        .collect();

    let mut to_allocate = decision.to_allocate;
    if Some(deployment) == network.network_subgraph_deployment()
        && !options.allocate_on_network_subgraph
    {
        to_allocate = false;
    }
    if transfers.transferred.contains(&deployment) {
        to_allocate = false;
    }
    if to_allocate && options.auto_migration_support && transfers.transferring.contains(&deployment)
    {
        info!(
            protocol_network = %network.id(),
            deployment = %deployment,
            "Subgraph transfer to L2 started, winding down allocations here"
        );
        to_allocate = false;
    }

    if !to_allocate {
        for allocation in active_for_deployment {
            let poi = resolve_poi(network, graph_node, deployment, epoch_start).await;
            operator.close_allocation(allocation, poi).await?;
        }
        return Ok(());
    }

    let Some(rule) = &decision.rule else {
        return Ok(());
    };
    let Some(amount) = rule.allocation_amount.as_ref().and_then(bd_to_u256) else {
        return Ok(());
    };
    let parallel_allocations = rule.parallel_allocations.unwrap_or(1).max(0) as u32;

    if active_for_deployment.is_empty() {
        if parallel_allocations == 0 {
            debug!(
                protocol_network = %network.id(),
                deployment = %deployment,
                "Rule requests zero parallel allocations, not opening any"
            );
            return Ok(());
        }
        operator
            .create_allocations(
                deployment,
                amount,
                parallel_allocations,
                epoch_info.current_epoch,
                all_active_ids,
            )
            .await?;
        return Ok(());
    }

    // Refresh allocations whose lifetime is up (boundary inclusive).
    let desired_lifetime = rule
        .allocation_lifetime
        .map(|lifetime| lifetime.max(1) as u64)
        .unwrap_or_else(|| epoch_info.max_allocation_epochs.saturating_sub(1).max(1));
    for allocation in active_for_deployment {
        if epoch_info.current_epoch < allocation.created_at_epoch + desired_lifetime {
            continue;
        }

        // Cross-check with the contract; a read failure is treated as
        // still-open so the close gets attempted (the pre-check inside the
        // close will refuse if it is not).
        match network.contracts.get_allocation(allocation.id).await {
            Ok(on_chain) if on_chain.closed_at_epoch != 0 => {
                debug!(
                    allocation = %allocation.id,
                    "Allocation already closed on chain, skipping refresh"
                );
                continue;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    allocation = %allocation.id,
                    error = %err,
                    "Could not cross-check allocation on chain, assuming it needs closing"
                );
            }
        }

        let poi = resolve_poi(network, graph_node, deployment, epoch_start).await;
        let closed = operator.close_allocation(allocation, poi).await?;
        if !closed {
            continue;
        }
        if rule.auto_renewal {
            operator
                .create_allocations(
                    deployment,
                    amount,
                    1,
                    epoch_info.current_epoch,
                    all_active_ids.clone(),
                )
                .await?;
        } else {
            info!(
                protocol_network = %network.id(),
                deployment = %deployment,
                allocation = %allocation.id,
                "Allocation expired and auto-renewal is off, not reopening"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use indexer_config::NetworkSpecification;
    use indexer_query::{EpochSubgraph, SubgraphClient};
    use reqwest::Url;
    use sqlx::postgres::PgPoolOptions;
    use test_assets::{DEPLOYMENT_A, INDEXER_ADDRESS, NETWORK_ID};
    use thegraph_core::alloy::primitives::U256;
    use tokio::sync::watch;
    use wiremock::{
        matchers::{body_string_contains, method},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        contracts::{OnChainAllocation, StakingCall, StakingContract},
        database::rules::{DecisionBasis, IdentifierType, IndexingRule},
        query_fees::LoggingCollector,
        test_utils::MockStakingContract,
        transactions::TransactionManager,
    };

    const ALLOCATION_ID: &str = "0xfa44c72b753a66591f241c7dc04e8178c30e13af";
    const EPOCH_START_HASH: &str =
        "0x675e9411241c431570d07b920321b2ff6aed2359aa8e26109905d34bffd8932a";
    const POI: &str = "0x64c9ee34b6e7ab50be9a22a77fa109f35032dd644419c3dcd8c9c87311a3fc34";

    fn specification() -> NetworkSpecification {
        let yaml = format!(
            r#"
networkIdentifier: mainnet
gateway:
  url: https://gateway.example.com/
indexerOptions:
  address: "{}"
  mnemonic: "{}"
  url: https://indexer.example.com/
subgraphs:
  networkSubgraph:
    endpoint: https://gateway.example.com/network
  epochSubgraph:
    endpoint: https://gateway.example.com/epoch
networkProvider:
  url: https://mainnet.example.com/rpc
"#,
            *INDEXER_ADDRESS,
            test_assets::INDEXER_OPERATOR_MNEMONIC,
        );
        serde_yaml::from_str::<NetworkSpecification>(&yaml)
            .unwrap()
            .validate()
            .unwrap()
    }

    async fn mock_network_subgraph(active_allocations_body: serde_json::Value) -> MockServer {
        let mock_server = MockServer::start().await;
        mock_server
            .register(
                Mock::given(method("POST"))
                    .and(body_string_contains("status: Active"))
                    .respond_with(
                        ResponseTemplate::new(200).set_body_json(active_allocations_body),
                    ),
            )
            .await;
        mock_server
    }

    async fn mock_graph_node_and_epoch() -> (MockServer, MockServer) {
        let status = MockServer::start().await;
        status
            .register(
                Mock::given(method("POST"))
                    .and(body_string_contains("blockHashFromNumber"))
                    .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "data": { "blockHashFromNumber": EPOCH_START_HASH }
                    }))),
            )
            .await;
        status
            .register(
                Mock::given(method("POST"))
                    .and(body_string_contains("proofOfIndexing"))
                    .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "data": { "proofOfIndexing": POI }
                    }))),
            )
            .await;

        let epoch = MockServer::start().await;
        epoch
            .register(
                Mock::given(method("POST"))
                    .and(body_string_contains("startBlockNumber"))
                    .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "data": { "epoch": { "startBlockNumber": "17654321" } }
                    }))),
            )
            .await;

        (status, epoch)
    }

    struct Harness {
        network: Network,
        operator: Operator,
        graph_node: GraphNode,
        contracts: Arc<MockStakingContract>,
        _servers: Vec<MockServer>,
    }

    async fn harness(
        contracts: MockStakingContract,
        active_allocations_body: serde_json::Value,
        current_epoch: u64,
    ) -> Harness {
        let specification = Arc::new(specification());
        let contracts = Arc::new(contracts);

        let network_subgraph_server = mock_network_subgraph(active_allocations_body).await;
        let (status_server, epoch_server) = mock_graph_node_and_epoch().await;

        let network_subgraph: &'static SubgraphClient = Box::leak(Box::new(SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&network_subgraph_server.uri()).unwrap(),
        )));
        let epoch_subgraph = EpochSubgraph::new(SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&epoch_server.uri()).unwrap(),
        ));
        let graph_node = GraphNode::new(
            &Url::parse(&status_server.uri()).unwrap(),
            &Url::parse(&status_server.uri()).unwrap(),
            vec!["default".to_string()],
        )
        .unwrap();

        let epoch_info_rx = {
            let (tx, rx) = watch::channel(indexer_monitor::EpochInfo {
                current_epoch,
                epoch_length: 6646,
                max_allocation_epochs: 28,
            });
            std::mem::forget(tx);
            rx
        };
        let constant = |value: bool| {
            let (tx, rx) = watch::channel(value);
            std::mem::forget(tx);
            rx
        };
        let constant_vec = |value| {
            let (tx, rx) = watch::channel(value);
            std::mem::forget(tx);
            rx
        };

        let network = Network {
            specification: specification.clone(),
            network_subgraph,
            epoch_subgraph,
            contracts: contracts.clone() as Arc<dyn StakingContract>,
            operator_address: *INDEXER_ADDRESS,
            epoch_info: epoch_info_rx,
            paused: constant(false),
            is_operator: constant(true),
            active_allocations: constant_vec(Vec::new()),
            recently_closed_allocations: constant_vec(Vec::new()),
            network_deployments: {
                let (tx, rx) = watch::channel(Vec::new());
                std::mem::forget(tx);
                rx
            },
        };

        let transactions = TransactionManager::new(
            contracts.clone() as Arc<dyn StakingContract>,
            specification.transaction_monitoring.clone(),
            specification.network_identifier.clone(),
            network.paused.clone(),
            network.is_operator.clone(),
        );
        let operator = Operator {
            pool: PgPoolOptions::new()
                .connect_lazy("postgres://indexer@localhost/indexer")
                .unwrap(),
            specification: specification.clone(),
            transactions,
            contracts: contracts.clone() as Arc<dyn StakingContract>,
            collector: Arc::new(LoggingCollector),
            rules: {
                let (tx, rx) = watch::channel(Vec::new());
                std::mem::forget(tx);
                rx
            },
        };

        Harness {
            network,
            operator,
            graph_node,
            contracts,
            _servers: vec![network_subgraph_server, status_server, epoch_server],
        }
    }

    fn allocation_rule(lifetime: Option<i32>, auto_renewal: bool) -> IndexingRule {
        IndexingRule {
            identifier: DEPLOYMENT_A.to_string(),
            identifier_type: IdentifierType::Deployment,
            allocation_amount: Some(bigdecimal::BigDecimal::from(5_000_000_000_000_000_000_000u128)),
            parallel_allocations: Some(1),
            max_allocation_percentage: None,
            min_signal: None,
            max_signal: None,
            min_stake: None,
            min_average_query_fees: None,
            decision_basis: DecisionBasis::Always,
            allocation_lifetime: lifetime,
            auto_renewal,
            require_supported: true,
            protocol_network: NETWORK_ID.to_string(),
        }
    }

    fn decision(rule: IndexingRule, to_allocate: bool) -> AllocationDecision {
        AllocationDecision {
            deployment: *DEPLOYMENT_A,
            to_allocate,
            rule: Some(rule),
            reason: "always".to_string(),
            protocol_network: NETWORK_ID.to_string(),
        }
    }

    fn one_active_allocation_body(created_at_epoch: u64) -> serde_json::Value {
        serde_json::json!({
            "data": {
                "allocations": [{
                    "id": ALLOCATION_ID,
                    "indexer": { "id": format!("{:?}", *INDEXER_ADDRESS) },
                    "allocatedTokens": "5000000000000000000000",
                    "createdAtBlockHash": "0xabc",
                    "createdAtEpoch": created_at_epoch,
                    "closedAtEpoch": null,
                    "subgraphDeployment": {
                        "ipfsHash": DEPLOYMENT_A.to_string(),
                        "deniedAt": 0,
                        "stakedTokens": "1000000",
                        "signalledTokens": "1000000",
                        "queryFeesAmount": "0"
                    }
                }]
            }
        })
    }

    #[test_log::test(tokio::test)]
    async fn expiring_allocation_is_closed_with_poi_then_reopened() {
        let allocation_id = Address::from_str(ALLOCATION_ID).unwrap();
        let contracts = MockStakingContract::default().with_active_allocation(
            allocation_id,
            OnChainAllocation {
                indexer: *INDEXER_ADDRESS,
                tokens: U256::from(5_000u64),
                created_at_epoch: 100,
                closed_at_epoch: 0,
            },
        );

        // createdAtEpoch=100, lifetime=10, currentEpoch=110: expiring,
        // boundary inclusive.
        let harness = harness(contracts, one_active_allocation_body(100), 110).await;
        reconcile_deployment_allocations(
            &harness.network,
            &harness.operator,
            &harness.graph_node,
            &decision(allocation_rule(Some(10), true), true),
            Some(&(17654321u64, EPOCH_START_HASH.to_string())),
            &TransferredDeployments::default(),
        )
        .await
        .unwrap();

        let calls = harness.contracts.recorded_calls();
        assert_eq!(calls.len(), 2, "expected a close followed by an open");
        match &calls[0] {
            StakingCall::CloseAllocation {
                allocation_id: closed,
                poi,
            } => {
                assert_eq!(*closed, allocation_id);
                assert_eq!(*poi, B256::from_str(POI).unwrap());
            }
            other => panic!("expected close, got {other:?}"),
        }
        match &calls[1] {
            StakingCall::Allocate {
                deployment, tokens, ..
            } => {
                assert_eq!(*deployment, *DEPLOYMENT_A);
                assert_eq!(
                    *tokens,
                    U256::from(5_000_000_000_000_000_000_000u128)
                );
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn unexpired_allocation_is_left_alone() {
        let allocation_id = Address::from_str(ALLOCATION_ID).unwrap();
        let contracts = MockStakingContract::default().with_active_allocation(
            allocation_id,
            OnChainAllocation {
                indexer: *INDEXER_ADDRESS,
                tokens: U256::from(5_000u64),
                created_at_epoch: 105,
                closed_at_epoch: 0,
            },
        );

        let harness = harness(contracts, one_active_allocation_body(105), 110).await;
        reconcile_deployment_allocations(
            &harness.network,
            &harness.operator,
            &harness.graph_node,
            &decision(allocation_rule(Some(10), true), true),
            Some(&(17654321u64, EPOCH_START_HASH.to_string())),
            &TransferredDeployments::default(),
        )
        .await
        .unwrap();

        assert!(harness.contracts.recorded_calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn expired_without_auto_renewal_only_closes() {
        let allocation_id = Address::from_str(ALLOCATION_ID).unwrap();
        let contracts = MockStakingContract::default().with_active_allocation(
            allocation_id,
            OnChainAllocation {
                indexer: *INDEXER_ADDRESS,
                tokens: U256::from(5_000u64),
                created_at_epoch: 100,
                closed_at_epoch: 0,
            },
        );

        let harness = harness(contracts, one_active_allocation_body(100), 110).await;
        reconcile_deployment_allocations(
            &harness.network,
            &harness.operator,
            &harness.graph_node,
            &decision(allocation_rule(Some(10), false), true),
            Some(&(17654321u64, EPOCH_START_HASH.to_string())),
            &TransferredDeployments::default(),
        )
        .await
        .unwrap();

        let calls = harness.contracts.recorded_calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], StakingCall::CloseAllocation { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn negative_decision_closes_all_active_allocations() {
        let allocation_id = Address::from_str(ALLOCATION_ID).unwrap();
        let contracts = MockStakingContract::default().with_active_allocation(
            allocation_id,
            OnChainAllocation {
                indexer: *INDEXER_ADDRESS,
                tokens: U256::from(5_000u64),
                created_at_epoch: 108,
                closed_at_epoch: 0,
            },
        );

        let harness = harness(contracts, one_active_allocation_body(108), 110).await;
        reconcile_deployment_allocations(
            &harness.network,
            &harness.operator,
            &harness.graph_node,
            &decision(allocation_rule(None, true), false),
            Some(&(17654321u64, EPOCH_START_HASH.to_string())),
            &TransferredDeployments::default(),
        )
        .await
        .unwrap();

        let calls = harness.contracts.recorded_calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], StakingCall::CloseAllocation { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn first_allocation_opens_parallel_set() {
        let harness = harness(
            MockStakingContract::default(),
            serde_json::json!({ "data": { "allocations": [] } }),
            110,
        )
        .await;

        let mut rule = allocation_rule(None, true);
        rule.parallel_allocations = Some(2);
        reconcile_deployment_allocations(
            &harness.network,
            &harness.operator,
            &harness.graph_node,
            &decision(rule, true),
            Some(&(17654321u64, EPOCH_START_HASH.to_string())),
            &TransferredDeployments::default(),
        )
        .await
        .unwrap();

        let calls = harness.contracts.recorded_calls();
        assert_eq!(calls.len(), 2);
        let ids: Vec<Address> = calls
            .iter()
            .map(|call| match call {
                StakingCall::Allocate { allocation_id, .. } => *allocation_id,
                other => panic!("expected open, got {other:?}"),
            })
            .collect();
        assert_ne!(ids[0], ids[1], "parallel allocations must have unique ids");
    }

    #[test_log::test(tokio::test)]
    async fn zero_parallel_allocations_opens_nothing() {
        let harness = harness(
            MockStakingContract::default(),
            serde_json::json!({ "data": { "allocations": [] } }),
            110,
        )
        .await;

        let mut rule = allocation_rule(None, true);
        rule.parallel_allocations = Some(0);
        reconcile_deployment_allocations(
            &harness.network,
            &harness.operator,
            &harness.graph_node,
            &decision(rule, true),
            Some(&(17654321u64, EPOCH_START_HASH.to_string())),
            &TransferredDeployments::default(),
        )
        .await
        .unwrap();

        assert!(harness.contracts.recorded_calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn transferred_deployments_are_never_allocated() {
        let harness = harness(
            MockStakingContract::default(),
            serde_json::json!({ "data": { "allocations": [] } }),
            110,
        )
        .await;

        let transfers = TransferredDeployments {
            transferring: HashSet::new(),
            transferred: HashSet::from([*DEPLOYMENT_A]),
        };
        reconcile_deployment_allocations(
            &harness.network,
            &harness.operator,
            &harness.graph_node,
            &decision(allocation_rule(None, true), true),
            Some(&(17654321u64, EPOCH_START_HASH.to_string())),
            &transfers,
        )
        .await
        .unwrap();

        assert!(harness.contracts.recorded_calls().is_empty());
    }
}
