// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! POI dispute monitor.
//!
//! Watches recently closed allocations across all indexers for deployments
//! this indexer also indexes, recomputes the reference POI each closing
//! indexer should have produced, and records a dispute row per allocation:
//! `valid` when the submitted POI matches a reference, `potential` when it
//! does not, `reference_unavailable` when no reference could be produced.

use std::collections::{HashMap, HashSet};

use bigdecimal::BigDecimal;
use indexer_allocation::Allocation;
use indexer_monitor::disputable_allocations;
use sqlx::PgPool;
use thegraph_core::DeploymentId;
use tracing::{debug, error, info, warn};

use crate::{
    database::disputes::{
        fetch_disputed_allocation_ids, store_poi_disputes, DisputeStatus, PoiDispute,
    },
    errors::{indexer_error, IndexerError, IndexerErrorCode},
    graph_node::GraphNode,
    metrics::POI_DISPUTES_STORED,
    network::Network,
};

/// The start blocks a rewards pool is judged against.
struct PoolBlocks {
    closed_epoch_start: Option<(u64, String)>,
    previous_epoch_start: Option<(u64, String)>,
}

/// Status derivation for one allocation in a rewards pool.
fn dispute_status(
    poi: &str,
    reference: Option<&str>,
    previous_reference: Option<&str>,
) -> DisputeStatus {
    let matches = |candidate: Option<&str>| {
        candidate.is_some_and(|candidate| candidate.eq_ignore_ascii_case(poi))
    };
    if matches(reference) || matches(previous_reference) {
        DisputeStatus::Valid
    } else if reference.is_none() || previous_reference.is_none() {
        DisputeStatus::ReferenceUnavailable
    } else {
        DisputeStatus::Potential
    }
}

async fn epoch_start_block(
    network: &Network,
    graph_node: &GraphNode,
    epoch: u64,
) -> Option<(u64, String)> {
    let number = match network.epoch_subgraph.epoch_start_block(epoch).await {
        Ok(number) => number,
        Err(err) => {
            warn!(protocol_network = %network.id(), epoch, error = %err, "Failed to resolve epoch start block");
            return None;
        }
    };
    let alias = network.chain_alias()?;
    match graph_node.block_hash_from_number(alias, number).await {
        Ok(hash) => Some((number, hash)),
        Err(err) => {
            warn!(protocol_network = %network.id(), epoch, block = number, error = %err, "Failed to resolve epoch start block hash");
            None
        }
    }
}

async fn reference_poi(
    graph_node: &GraphNode,
    deployment: DeploymentId,
    block: Option<&(u64, String)>,
    allocation: &Allocation,
) -> Option<String> {
    let (number, hash) = block?;
    match graph_node
        .proof_of_indexing(&deployment, *number, hash, allocation.indexer)
        .await
    {
        Ok(poi) => poi,
        Err(err) => {
            debug!(
                deployment = %deployment,
                indexer = %allocation.indexer,
                block = number,
                error = %err,
                "Failed to compute reference POI"
            );
            None
        }
    }
}

/// One monitoring pass: fetch disputable allocations, diff against already
/// recorded disputes, judge the new ones and persist everything in one
/// transaction.
pub async fn check_poi_disputes(
    network: &Network,
    graph_node: &GraphNode,
    pool: &PgPool,
    local_deployments: &HashSet<DeploymentId>,
) -> Result<(), IndexerError> {
    let options = &network.specification.indexer_options;
    if !options.poi_dispute_monitoring {
        return Ok(());
    }

    let epoch_info = *network.epoch_info.borrow();
    let min_closed_epoch = epoch_info
        .current_epoch
        .saturating_sub(options.poi_disputable_epochs);

    let disputable = disputable_allocations(network.network_subgraph, min_closed_epoch)
        .await
        .map_err(|err| indexer_error(IndexerErrorCode::IE016, err))?;

    let recorded = fetch_disputed_allocation_ids(pool, network.id())
        .await
        .map_err(|err| indexer_error(IndexerErrorCode::IE026, err))?;

    // Only allocations against deployments we index can be judged, and only
    // ones we have not judged before.
    let new_disputables: Vec<Allocation> = disputable
        .into_iter()
        .filter(|allocation| local_deployments.contains(&allocation.subgraph_deployment.id))
        .filter(|allocation| !recorded.contains(&format!("{:?}", allocation.id)))
        .collect();
    if new_disputables.is_empty() {
        return Ok(());
    }

    // Group into rewards pools.
    let mut pools: HashMap<(DeploymentId, u64), Vec<Allocation>> = HashMap::new();
    for allocation in new_disputables {
        let Some(closed_at_epoch) = allocation.closed_at_epoch else {
            error!(
                protocol_network = %network.id(),
                allocation = %allocation.id,
                "Disputable allocation carries no closed epoch, skipping"
            );
            continue;
        };
        pools
            .entry((allocation.subgraph_deployment.id, closed_at_epoch))
            .or_default()
            .push(allocation);
    }

    let mut disputes = Vec::new();
    for ((deployment, closed_epoch), allocations) in pools {
        let blocks = PoolBlocks {
            closed_epoch_start: epoch_start_block(network, graph_node, closed_epoch).await,
            previous_epoch_start: epoch_start_block(
                network,
                graph_node,
                closed_epoch.saturating_sub(1),
            )
            .await,
        };

        for allocation in allocations {
            let Some(poi) = allocation.poi.clone() else {
                continue;
            };
            let reference = reference_poi(
                graph_node,
                deployment,
                blocks.closed_epoch_start.as_ref(),
                &allocation,
            )
            .await;
            let previous_reference = reference_poi(
                graph_node,
                deployment,
                blocks.previous_epoch_start.as_ref(),
                &allocation,
            )
            .await;

            let status =
                dispute_status(&poi, reference.as_deref(), previous_reference.as_deref());
            POI_DISPUTES_STORED
                .with_label_values(&[network.id(), &status.to_string()])
                .inc();

            disputes.push(PoiDispute {
                allocation_id: format!("{:?}", allocation.id),
                subgraph_deployment_id: deployment.to_string(),
                allocation_indexer: format!("{:?}", allocation.indexer),
                allocation_amount: allocation
                    .allocated_tokens
                    .to_string()
                    .parse()
                    .unwrap_or_else(|_| BigDecimal::from(0)),
                allocation_proof: poi,
                closed_epoch: closed_epoch as i64,
                closed_epoch_start_block_hash: blocks
                    .closed_epoch_start
                    .as_ref()
                    .map(|(_, hash)| hash.clone()),
                closed_epoch_start_block_number: blocks
                    .closed_epoch_start
                    .as_ref()
                    .map(|(number, _)| *number as i64),
                closed_epoch_reference_proof: reference,
                previous_epoch_start_block_hash: blocks
                    .previous_epoch_start
                    .as_ref()
                    .map(|(_, hash)| hash.clone()),
                previous_epoch_start_block_number: blocks
                    .previous_epoch_start
                    .as_ref()
                    .map(|(number, _)| *number as i64),
                previous_epoch_reference_proof: previous_reference,
                status,
                protocol_network: network.id().to_string(),
            });
        }
    }

    if disputes.is_empty() {
        return Ok(());
    }

    let stored = store_poi_disputes(pool, &disputes)
        .await
        .map_err(|err| indexer_error(IndexerErrorCode::IE025, err))?;
    info!(
        protocol_network = %network.id(),
        disputes = stored.len(),
        "Stored POI disputes"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const POI_A: &str = "0x64c9ee34b6e7ab50be9a22a77fa109f35032dd644419c3dcd8c9c87311a3fc34";
    const POI_B: &str = "0xd04b5601739a1638719696d0735c92439267a89248c6fd21388d9600f5c942f6";

    #[test]
    fn matching_reference_is_valid() {
        assert_eq!(
            dispute_status(POI_A, Some(POI_A), Some(POI_B)),
            DisputeStatus::Valid
        );
        // Matching the previous epoch's reference also counts.
        assert_eq!(
            dispute_status(POI_A, Some(POI_B), Some(POI_A)),
            DisputeStatus::Valid
        );
        // Case-insensitive comparison.
        assert_eq!(
            dispute_status(&POI_A.to_uppercase().replace("0X", "0x"), Some(POI_A), Some(POI_A)),
            DisputeStatus::Valid
        );
    }

    #[test]
    fn missing_reference_is_reference_unavailable() {
        assert_eq!(
            dispute_status(POI_A, None, Some(POI_B)),
            DisputeStatus::ReferenceUnavailable
        );
        assert_eq!(
            dispute_status(POI_A, Some(POI_B), None),
            DisputeStatus::ReferenceUnavailable
        );
    }

    #[test]
    fn mismatching_references_are_potential() {
        assert_eq!(
            dispute_status(POI_A, Some(POI_B), Some(POI_B)),
            DisputeStatus::Potential
        );
    }
}
