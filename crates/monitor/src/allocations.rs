// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use indexer_allocation::Allocation;
use indexer_query::SubgraphClient;
use indexer_watcher::new_watcher;
use serde_json::json;
use thegraph_core::alloy::primitives::Address;
use tokio::sync::watch::Receiver;

use crate::EpochInfo;

const ACTIVE_ALLOCATIONS_QUERY: &str = r#"
    query ($indexer: String!, $first: Int!, $lastId: String!) {
        allocations(
            where: { indexer: $indexer, status: Active, id_gt: $lastId }
            orderBy: id
            orderDirection: asc
            first: $first
        ) {
            id
            indexer {
                id
            }
            allocatedTokens
            createdAtEpoch
            createdAtBlockHash
            closedAtEpoch
            subgraphDeployment {
                ipfsHash
                deniedAt
                stakedTokens
                signalledTokens
                queryFeesAmount
            }
        }
    }
"#;

const CLOSED_ALLOCATIONS_QUERY: &str = r#"
    query ($indexer: String!, $minEpoch: Int!, $first: Int!, $lastId: String!) {
        allocations(
            where: {
                indexer: $indexer
                status: Closed
                closedAtEpoch_gte: $minEpoch
                id_gt: $lastId
            }
            orderBy: id
            orderDirection: asc
            first: $first
        ) {
            id
            indexer {
                id
            }
            allocatedTokens
            createdAtEpoch
            createdAtBlockHash
            closedAtEpoch
            closedAtBlockHash
            poi
            subgraphDeployment {
                ipfsHash
                deniedAt
                stakedTokens
                signalledTokens
                queryFeesAmount
            }
        }
    }
"#;

const CLAIMABLE_ALLOCATIONS_QUERY: &str = r#"
    query ($indexer: String!, $maxEpoch: Int!, $first: Int!, $lastId: String!) {
        allocations(
            where: {
                indexer: $indexer
                status: Closed
                closedAtEpoch_lte: $maxEpoch
                queryFeesCollected_gt: 0
                id_gt: $lastId
            }
            orderBy: id
            orderDirection: asc
            first: $first
        ) {
            id
            indexer {
                id
            }
            allocatedTokens
            createdAtEpoch
            createdAtBlockHash
            closedAtEpoch
            queryFeesCollected
            subgraphDeployment {
                ipfsHash
            }
        }
    }
"#;

const DISPUTABLE_ALLOCATIONS_QUERY: &str = r#"
    query ($minEpoch: Int!, $first: Int!, $lastId: String!) {
        allocations(
            where: { status: Closed, closedAtEpoch_gte: $minEpoch, poi_not: null, id_gt: $lastId }
            orderBy: id
            orderDirection: asc
            first: $first
        ) {
            id
            indexer {
                id
            }
            allocatedTokens
            createdAtEpoch
            createdAtBlockHash
            closedAtEpoch
            closedAtBlockHash
            poi
            subgraphDeployment {
                ipfsHash
            }
        }
    }
"#;

/// One-shot fetch of the indexer's active allocations, used by the
/// reconciler right before it acts to close the window between the cached
/// view and chain truth.
pub async fn fetch_active_allocations(
    network_subgraph: &SubgraphClient,
    indexer: Address,
) -> anyhow::Result<Vec<Allocation>> {
    let allocations = network_subgraph
        .paginated_query(
            ACTIVE_ALLOCATIONS_QUERY,
            json!({ "indexer": format!("{indexer:?}") }),
        )
        .await?;
    Ok(allocations)
}

/// Watches the indexer's active allocations.
pub async fn indexer_active_allocations(
    network_subgraph: &'static SubgraphClient,
    indexer: Address,
    interval: Duration,
) -> anyhow::Result<Receiver<Vec<Allocation>>> {
    new_watcher(interval, move || async move {
        fetch_active_allocations(network_subgraph, indexer).await
    })
    .await
}

/// Watches the indexer's recently closed allocations (closed within the last
/// epoch). These remain query-servable and pin their deployments.
pub async fn indexer_recently_closed_allocations(
    network_subgraph: &'static SubgraphClient,
    indexer: Address,
    epoch_info: Receiver<EpochInfo>,
    interval: Duration,
) -> anyhow::Result<Receiver<Vec<Allocation>>> {
    new_watcher(interval, move || {
        let epoch_info = epoch_info.clone();
        async move {
            let min_epoch = epoch_info.borrow().current_epoch.saturating_sub(1);
            let allocations = network_subgraph
                .paginated_query(
                    CLOSED_ALLOCATIONS_QUERY,
                    json!({ "indexer": format!("{indexer:?}"), "minEpoch": min_epoch }),
                )
                .await?;
            Ok(allocations)
        }
    })
    .await
}

/// Closed allocations old enough for their query-fee rebates to be claimed.
pub async fn claimable_allocations(
    network_subgraph: &SubgraphClient,
    indexer: Address,
    max_closed_epoch: u64,
) -> anyhow::Result<Vec<Allocation>> {
    let allocations = network_subgraph
        .paginated_query(
            CLAIMABLE_ALLOCATIONS_QUERY,
            json!({ "indexer": format!("{indexer:?}"), "maxEpoch": max_closed_epoch }),
        )
        .await?;
    Ok(allocations)
}

/// Closed allocations (across all indexers) with a non-zero POI inside the
/// disputable window.
pub async fn disputable_allocations(
    network_subgraph: &SubgraphClient,
    min_closed_epoch: u64,
) -> anyhow::Result<Vec<Allocation>> {
    let allocations: Vec<Allocation> = network_subgraph
        .paginated_query(
            DISPUTABLE_ALLOCATIONS_QUERY,
            json!({ "minEpoch": min_closed_epoch }),
        )
        .await?;
    Ok(allocations
        .into_iter()
        .filter(|allocation| {
            allocation
                .poi
                .as_deref()
                .is_some_and(|poi| poi.trim_start_matches("0x").chars().any(|c| c != '0'))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use reqwest::Url;
    use wiremock::{
        matchers::{body_string_contains, method},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const ALLOCATIONS_RESPONSE: &str = r#"
        {
            "data": {
                "allocations": [
                    {
                        "id": "0xfa44c72b753a66591f241c7dc04e8178c30e13af",
                        "indexer": { "id": "0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c" },
                        "allocatedTokens": "5081382841000000014901161",
                        "createdAtBlockHash": "0x64c9ee34b6e7ab50be9a22a77fa109f35032dd644419c3dcd8c9c87311a3fc34",
                        "createdAtEpoch": 953,
                        "closedAtEpoch": null,
                        "subgraphDeployment": {
                            "ipfsHash": "QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS",
                            "deniedAt": 0,
                            "stakedTokens": "96183284152000000014901161",
                            "signalledTokens": "182832939554154667498047",
                            "queryFeesAmount": "19861336072168874330350"
                        }
                    }
                ]
            }
        }
    "#;

    #[test_log::test(tokio::test)]
    async fn fetches_active_allocations() {
        let mock_server = MockServer::start().await;
        mock_server
            .register(
                Mock::given(method("POST"))
                    .and(body_string_contains("status: Active"))
                    .respond_with(
                        ResponseTemplate::new(200)
                            .set_body_raw(ALLOCATIONS_RESPONSE, "application/json"),
                    ),
            )
            .await;

        let network_subgraph = SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&mock_server.uri()).unwrap(),
        );
        let indexer = Address::from_str("0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c").unwrap();

        let allocations = fetch_active_allocations(&network_subgraph, indexer)
            .await
            .unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].indexer, indexer);
        assert_eq!(allocations[0].created_at_epoch, 953);
    }

    #[test_log::test(tokio::test)]
    async fn disputable_drops_zero_pois() {
        let mock_server = MockServer::start().await;
        let body = serde_json::json!({
            "data": {
                "allocations": [
                    {
                        "id": "0xfa44c72b753a66591f241c7dc04e8178c30e13af",
                        "indexer": { "id": "0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c" },
                        "allocatedTokens": "1",
                        "createdAtBlockHash": "0xabc",
                        "createdAtEpoch": 953,
                        "closedAtEpoch": 955,
                        "poi": "0x0000000000000000000000000000000000000000000000000000000000000000",
                        "subgraphDeployment": { "ipfsHash": "QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS" }
                    },
                    {
                        "id": "0xa171cd12c3dde7eb8fe7717a0bcd06f3ffa65658",
                        "indexer": { "id": "0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c" },
                        "allocatedTokens": "1",
                        "createdAtBlockHash": "0xabc",
                        "createdAtEpoch": 953,
                        "closedAtEpoch": 955,
                        "poi": "0x64c9ee34b6e7ab50be9a22a77fa109f35032dd644419c3dcd8c9c87311a3fc34",
                        "subgraphDeployment": { "ipfsHash": "QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS" }
                    }
                ]
            }
        });
        mock_server
            .register(
                Mock::given(method("POST"))
                    .respond_with(ResponseTemplate::new(200).set_body_json(body)),
            )
            .await;

        let network_subgraph = SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&mock_server.uri()).unwrap(),
        );
        let disputable = disputable_allocations(&network_subgraph, 954).await.unwrap();
        assert_eq!(disputable.len(), 1);
        assert!(disputable[0].poi.as_deref().unwrap().starts_with("0x64c9"));
    }
}
