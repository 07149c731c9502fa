// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Drives the graph node's active deployment set toward the target set.
//!
//! A deployment is only ever removed when it is neither targeted nor pinned
//! by an eligible (active or recently closed) allocation: those are still
//! serving queries for the gateway and must not be torn down.

use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use thegraph_core::DeploymentId;
use tracing::{info, warn};

use crate::{
    errors::{indexer_error, IndexerErrorCode},
    graph_node::GraphNode,
};

/// Graph-node operations in flight at once.
const MAX_CONCURRENT_OPERATIONS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operation {
    Ensure(DeploymentId),
    Remove(DeploymentId),
}

fn plan(
    active: &[DeploymentId],
    target: &HashSet<DeploymentId>,
    eligible: &HashSet<DeploymentId>,
) -> Vec<Operation> {
    let active_set: HashSet<DeploymentId> = active.iter().copied().collect();

    let mut operations: Vec<Operation> = target
        .iter()
        .filter(|deployment| !active_set.contains(deployment))
        .map(|deployment| Operation::Ensure(*deployment))
        .collect();
    operations.extend(
        active_set
            .iter()
            .filter(|deployment| {
                !target.contains(deployment) && !eligible.contains(deployment)
            })
            .map(|deployment| Operation::Remove(*deployment)),
    );
    operations
}

/// Applies the plan with bounded parallelism. Individual operation failures
/// are logged and retried on the next tick; they do not fail the batch.
pub async fn reconcile_deployments(
    graph_node: &GraphNode,
    active: &[DeploymentId],
    target: &HashSet<DeploymentId>,
    eligible: &HashSet<DeploymentId>,
) -> anyhow::Result<()> {
    let operations = plan(active, target, eligible);

    info!(
        active = active.len(),
        target = target.len(),
        eligible = eligible.len(),
        operations = operations.len(),
        "Reconcile deployments"
    );

    stream::iter(operations)
        .for_each_concurrent(MAX_CONCURRENT_OPERATIONS, |operation| async move {
            match operation {
                Operation::Ensure(deployment) => {
                    if let Err(err) = graph_node.ensure(&deployment).await {
                        let err = indexer_error(IndexerErrorCode::IE020, err);
                        warn!(deployment = %deployment, err_code = %err.code, error = %err, "Failed to deploy, will retry next tick");
                    }
                }
                Operation::Remove(deployment) => {
                    if let Err(err) = graph_node.remove(&deployment).await {
                        let err = indexer_error(IndexerErrorCode::IE021, err);
                        warn!(deployment = %deployment, err_code = %err.code, error = %err, "Failed to remove, will retry next tick");
                    }
                }
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use test_assets::{DEPLOYMENT_A, DEPLOYMENT_B, NETWORK_SUBGRAPH_DEPLOYMENT};

    use super::*;

    #[test]
    fn plans_additions_and_removals() {
        let active = vec![*DEPLOYMENT_A];
        let target = HashSet::from([*DEPLOYMENT_B]);
        let eligible = HashSet::new();

        let operations = plan(&active, &target, &eligible);
        assert!(operations.contains(&Operation::Ensure(*DEPLOYMENT_B)));
        assert!(operations.contains(&Operation::Remove(*DEPLOYMENT_A)));
    }

    #[test]
    fn eligible_allocations_pin_deployments() {
        // DEPLOYMENT_A dropped out of the target set but still has a
        // recently closed allocation; it must stay on the graph node.
        let active = vec![*DEPLOYMENT_A, *NETWORK_SUBGRAPH_DEPLOYMENT];
        let target = HashSet::from([*NETWORK_SUBGRAPH_DEPLOYMENT]);
        let eligible = HashSet::from([*DEPLOYMENT_A]);

        let operations = plan(&active, &target, &eligible);
        assert!(operations.is_empty());
    }

    #[test]
    fn settled_state_is_a_no_op() {
        let active = vec![*DEPLOYMENT_A, *DEPLOYMENT_B];
        let target = HashSet::from([*DEPLOYMENT_A, *DEPLOYMENT_B]);

        let operations = plan(&active, &target, &HashSet::new());
        assert!(operations.is_empty());
    }
}
