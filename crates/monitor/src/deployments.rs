// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use indexer_query::SubgraphClient;
use indexer_watcher::new_watcher;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thegraph_core::DeploymentId;
use tokio::sync::watch::Receiver;

/// A subgraph deployment as published on the network, with the economics the
/// rule evaluator needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkDeployment {
    pub id: DeploymentId,
    pub denied_at: Option<u64>,
    pub staked_tokens: thegraph_core::alloy::primitives::U256,
    pub signalled_tokens: thegraph_core::alloy::primitives::U256,
    pub query_fees_amount: thegraph_core::alloy::primitives::U256,
    /// Number of currently active allocations across all indexers.
    pub allocation_count: usize,
    /// Chain the deployment indexes, from its manifest.
    pub chain: Option<String>,
    pub transferred_to_l2: bool,
}

/// A versioned protocol subgraph record. Identifiers are the raw network
/// subgraph entity ids; they are matched against SUBGRAPH-type rule
/// identifiers as opaque strings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subgraph {
    pub id: String,
    #[serde(default)]
    pub started_transfer_to_l2: bool,
    pub versions: Vec<SubgraphVersion>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubgraphVersion {
    pub version: u32,
    pub created_at: u64,
    pub deployment: DeploymentId,
}

impl Subgraph {
    pub fn latest_version(&self) -> Option<&SubgraphVersion> {
        self.versions.iter().max_by_key(|version| version.version)
    }

    pub fn previous_version(&self) -> Option<&SubgraphVersion> {
        let latest = self.latest_version()?.version;
        self.versions
            .iter()
            .filter(|version| version.version < latest)
            .max_by_key(|version| version.version)
    }
}

impl<'d> Deserialize<'d> for SubgraphVersion {
    fn deserialize<D>(deserializer: D) -> Result<SubgraphVersion, D::Error>
    where
        D: Deserializer<'d>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct InnerDeployment {
            ipfs_hash: DeploymentId,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Outer {
            version: u32,
            created_at: u64,
            subgraph_deployment: InnerDeployment,
        }

        let outer = Outer::deserialize(deserializer)?;
        Ok(SubgraphVersion {
            version: outer.version,
            created_at: outer.created_at,
            deployment: outer.subgraph_deployment.ipfs_hash,
        })
    }
}

impl<'d> Deserialize<'d> for NetworkDeployment {
    fn deserialize<D>(deserializer: D) -> Result<NetworkDeployment, D::Error>
    where
        D: Deserializer<'d>,
    {
        use thegraph_core::alloy::primitives::U256;

        #[derive(Deserialize)]
        struct Manifest {
            network: Option<String>,
        }

        #[derive(Deserialize)]
        struct AllocationId {
            #[allow(dead_code)]
            id: String,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Outer {
            ipfs_hash: DeploymentId,
            #[serde(default)]
            denied_at: Option<u64>,
            #[serde(default)]
            staked_tokens: U256,
            #[serde(default)]
            signalled_tokens: U256,
            #[serde(default)]
            query_fees_amount: U256,
            #[serde(default)]
            indexer_allocations: Vec<AllocationId>,
            #[serde(default)]
            manifest: Option<Manifest>,
            #[serde(default)]
            transferred_to_l2: bool,
        }

        let outer = Outer::deserialize(deserializer)?;
        Ok(NetworkDeployment {
            id: outer.ipfs_hash,
            denied_at: outer.denied_at.filter(|denied_at| *denied_at != 0),
            staked_tokens: outer.staked_tokens,
            signalled_tokens: outer.signalled_tokens,
            query_fees_amount: outer.query_fees_amount,
            allocation_count: outer.indexer_allocations.len(),
            chain: outer.manifest.and_then(|manifest| manifest.network),
            transferred_to_l2: outer.transferred_to_l2,
        })
    }
}

const NETWORK_DEPLOYMENTS_QUERY: &str = r#"
    query ($first: Int!, $lastId: String!) {
        subgraphDeployments(
            where: { id_gt: $lastId }
            orderBy: id
            orderDirection: asc
            first: $first
        ) {
            id
            ipfsHash
            deniedAt
            stakedTokens
            signalledTokens
            queryFeesAmount
            transferredToL2
            indexerAllocations(first: 1000, where: { status: Active }) {
                id
            }
            manifest {
                network
            }
        }
    }
"#;

const SUBGRAPHS_QUERY: &str = r#"
    query ($first: Int!, $lastId: String!) {
        subgraphs(
            where: { id_gt: $lastId, active: true, entityVersion: 2 }
            orderBy: id
            orderDirection: asc
            first: $first
        ) {
            id
            startedTransferToL2
            versions(orderBy: version, orderDirection: asc) {
                version
                createdAt
                subgraphDeployment {
                    ipfsHash
                }
            }
        }
    }
"#;

/// Watches the deployments published to this network.
pub async fn network_deployments(
    network_subgraph: &'static SubgraphClient,
    interval: Duration,
) -> anyhow::Result<Receiver<Vec<NetworkDeployment>>> {
    new_watcher(interval, move || async move {
        let deployments = network_subgraph
            .paginated_query(NETWORK_DEPLOYMENTS_QUERY, Value::Null)
            .await?;
        Ok(deployments)
    })
    .await
}

/// One-shot fetch of the versioned subgraph records, used for the
/// subgraph-to-deployment rule rewrite.
pub async fn fetch_subgraphs(network_subgraph: &SubgraphClient) -> anyhow::Result<Vec<Subgraph>> {
    let subgraphs = network_subgraph
        .paginated_query(SUBGRAPHS_QUERY, Value::Null)
        .await?;
    Ok(subgraphs)
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

    #[test_log::test(tokio::test)]
    async fn parses_network_deployments() {
        let mock_server = MockServer::start().await;
        mock_server
            .register(
                Mock::given(method("POST"))
                    .and(body_string_contains("subgraphDeployments"))
                    .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "data": {
                            "subgraphDeployments": [{
                                "id": "0xc9d18c59e4aaf2c1f86dfef16fbdc0f81eae8ada58d87a23d2666c45704b8823",
                                "ipfsHash": "QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS",
                                "deniedAt": 0,
                                "stakedTokens": "96183284152000000014901161",
                                "signalledTokens": "182832939554154667498047",
                                "queryFeesAmount": "19861336072168874330350",
                                "transferredToL2": false,
                                "indexerAllocations": [{ "id": "0xfa44c72b753a66591f241c7dc04e8178c30e13af" }],
                                "manifest": { "network": "mainnet" }
                            }]
                        }
                    }))),
            )
            .await;

        let network_subgraph = Box::leak(Box::new(SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&mock_server.uri()).unwrap(),
        )));
        let deployments = network_deployments(network_subgraph, Duration::from_secs(240))
            .await
            .unwrap();
        let deployments = deployments.borrow().clone();
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].denied_at, None);
        assert_eq!(deployments[0].allocation_count, 1);
        assert_eq!(deployments[0].chain.as_deref(), Some("mainnet"));
    }

    #[test]
    fn latest_and_previous_versions() {
        let subgraph: Subgraph = serde_json::from_value(serde_json::json!({
            "id": "0x0000000000000000000000000000000000000000-0",
            "startedTransferToL2": false,
            "versions": [
                {
                    "version": 0,
                    "createdAt": 1,
                    "subgraphDeployment": { "ipfsHash": "QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS" }
                },
                {
                    "version": 1,
                    "createdAt": 100,
                    "subgraphDeployment": { "ipfsHash": "QmWaNip2EgixgP4rLrGcvAnnMgDDdHUNJ5KeSYyFvGfjfr" }
                }
            ]
        }))
        .unwrap();

        assert_eq!(
            subgraph.latest_version().unwrap().deployment,
            DeploymentId::from_str("QmWaNip2EgixgP4rLrGcvAnnMgDDdHUNJ5KeSYyFvGfjfr").unwrap()
        );
        assert_eq!(subgraph.previous_version().unwrap().version, 0);
    }
}
