// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Client for the local graph node: admin JSON-RPC for deployment
//! lifecycle, status GraphQL for indexing state, POIs and block lookups.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context};
use jsonrpsee::{
    core::{client::ClientT, params::ObjectParams},
    http_client::{HttpClient, HttpClientBuilder},
};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use thegraph_core::{alloy::primitives::Address, DeploymentId};
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Node id deployments are reassigned to when they should stop indexing.
pub const REMOVAL_NODE: &str = "removed";

/// Upper bound on concurrent admin requests.
const ADMIN_CONCURRENCY: usize = 10;

/// A deployment as the graph node sees it.
#[derive(Clone, Debug)]
pub struct IndexingStatus {
    pub deployment: DeploymentId,
    pub node: Option<String>,
}

#[derive(Clone)]
pub struct GraphNode {
    admin: HttpClient,
    status_url: Url,
    http_client: reqwest::Client,
    index_node_ids: Vec<String>,
    admin_limit: Arc<Semaphore>,
}

impl GraphNode {
    pub fn new(
        admin_endpoint: &Url,
        status_endpoint: &Url,
        index_node_ids: Vec<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !index_node_ids.is_empty(),
            "at least one index node id is required"
        );
        let admin = HttpClientBuilder::default()
            .build(admin_endpoint.as_str())
            .context("failed to create graph node admin client")?;
        Ok(Self {
            admin,
            status_url: status_endpoint.clone(),
            http_client: reqwest::Client::new(),
            index_node_ids,
            admin_limit: Arc::new(Semaphore::new(ADMIN_CONCURRENCY)),
        })
    }

    /// The subgraph name a deployment is indexed under.
    pub fn subgraph_name(deployment: &DeploymentId) -> String {
        let cid = deployment.to_string();
        let tail = &cid[cid.len().saturating_sub(10)..];
        format!("indexer-agent/{tail}")
    }

    async fn status_query<T: for<'de> Deserialize<'de>>(
        &self,
        query: &str,
        variables: Value,
    ) -> anyhow::Result<T> {
        let response = self
            .http_client
            .post(self.status_url.clone())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(anyhow!("indexing status API errors: {errors:?}"));
            }
        }
        let data = body
            .get("data")
            .cloned()
            .ok_or_else(|| anyhow!("indexing status API returned no data"))?;
        Ok(serde_json::from_value(data)?)
    }

    /// Deployments currently known to the graph node, with their assigned
    /// node. Reassignments to [`REMOVAL_NODE`] still show up here.
    pub async fn indexing_statuses(&self) -> anyhow::Result<Vec<IndexingStatus>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "indexingStatuses")]
            indexing_statuses: Vec<RawStatus>,
        }
        #[derive(Deserialize)]
        struct RawStatus {
            subgraph: DeploymentId,
            node: Option<String>,
        }

        let response: Response = self
            .status_query(
                r#"{ indexingStatuses { subgraph node } }"#,
                Value::Null,
            )
            .await?;
        Ok(response
            .indexing_statuses
            .into_iter()
            .map(|status| IndexingStatus {
                deployment: status.subgraph,
                node: status.node,
            })
            .collect())
    }

    /// Deployments actively assigned to an index node.
    pub async fn active_deployments(&self) -> anyhow::Result<Vec<DeploymentId>> {
        Ok(self
            .indexing_statuses()
            .await?
            .into_iter()
            .filter(|status| status.node.as_deref().is_some_and(|node| node != REMOVAL_NODE))
            .map(|status| status.deployment)
            .collect())
    }

    /// The POI `indexer` produced for `deployment` at the given block, if the
    /// node can compute it.
    pub async fn proof_of_indexing(
        &self,
        deployment: &DeploymentId,
        block_number: u64,
        block_hash: &str,
        indexer: Address,
    ) -> anyhow::Result<Option<String>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "proofOfIndexing")]
            proof_of_indexing: Option<String>,
        }

        let response: Response = self
            .status_query(
                r#"
                    query ($subgraph: String!, $blockNumber: Int!, $blockHash: String!, $indexer: String!) {
                        proofOfIndexing(
                            subgraph: $subgraph
                            blockNumber: $blockNumber
                            blockHash: $blockHash
                            indexer: $indexer
                        )
                    }
                "#,
                json!({
                    "subgraph": deployment.to_string(),
                    "blockNumber": block_number,
                    "blockHash": block_hash,
                    "indexer": format!("{indexer:?}"),
                }),
            )
            .await?;
        Ok(response.proof_of_indexing)
    }

    /// Resolves a block number on the given chain to its hash, through the
    /// graph node's chain store.
    pub async fn block_hash_from_number(
        &self,
        network_alias: &str,
        block_number: u64,
    ) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "blockHashFromNumber")]
            block_hash_from_number: Option<String>,
        }

        let response: Response = self
            .status_query(
                r#"
                    query ($network: String!, $blockNumber: Int!) {
                        blockHashFromNumber(network: $network, blockNumber: $blockNumber)
                    }
                "#,
                json!({ "network": network_alias, "blockNumber": block_number }),
            )
            .await?;
        let hash = response.block_hash_from_number.ok_or_else(|| {
            anyhow!("graph node has no hash for block {block_number} on {network_alias}")
        })?;
        // The status API returns the bare hash.
        Ok(if hash.starts_with("0x") {
            hash
        } else {
            format!("0x{hash}")
        })
    }

    async fn admin_call(&self, method: &str, params: ObjectParams) -> anyhow::Result<Value> {
        let _permit = self.admin_limit.acquire().await?;
        self.admin
            .request(method, params)
            .await
            .map_err(|err| anyhow!("graph node admin call {method} failed: {err}"))
    }

    async fn subgraph_create(&self, name: &str) -> anyhow::Result<()> {
        let mut params = ObjectParams::new();
        params.insert("name", name)?;
        match self.admin_call("subgraph_create", params).await {
            Ok(_) => Ok(()),
            // Name creation is idempotent from our point of view.
            Err(err) if err.to_string().contains("already exists") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn subgraph_deploy(
        &self,
        name: &str,
        deployment: &DeploymentId,
        node_id: &str,
    ) -> anyhow::Result<()> {
        let mut params = ObjectParams::new();
        params.insert("name", name)?;
        params.insert("ipfs_hash", deployment.to_string())?;
        params.insert("node_id", node_id)?;
        self.admin_call("subgraph_deploy", params).await?;
        Ok(())
    }

    async fn subgraph_reassign(
        &self,
        deployment: &DeploymentId,
        node_id: &str,
    ) -> anyhow::Result<()> {
        let mut params = ObjectParams::new();
        params.insert("ipfs_hash", deployment.to_string())?;
        params.insert("node_id", node_id)?;
        self.admin_call("subgraph_reassign", params).await?;
        Ok(())
    }

    /// Picks an index node for a new deployment: round-robin over configured
    /// nodes that have nothing assigned yet, otherwise the least loaded one.
    async fn choose_node(&self) -> anyhow::Result<String> {
        let statuses = self.indexing_statuses().await?;
        let mut load: HashMap<&str, usize> = self
            .index_node_ids
            .iter()
            .map(|id| (id.as_str(), 0))
            .collect();
        for status in &statuses {
            if let Some(node) = status.node.as_deref() {
                if let Some(count) = load.get_mut(node) {
                    *count += 1;
                }
            }
        }

        if let Some(unused) = self
            .index_node_ids
            .iter()
            .find(|id| load.get(id.as_str()) == Some(&0))
        {
            return Ok(unused.clone());
        }

        self.index_node_ids
            .iter()
            .min_by_key(|id| load.get(id.as_str()).copied().unwrap_or(0))
            .cloned()
            .ok_or_else(|| anyhow!("no index nodes configured"))
    }

    /// Makes sure `deployment` is created, deployed and assigned to an index
    /// node. Safe to repeat.
    pub async fn ensure(&self, deployment: &DeploymentId) -> anyhow::Result<()> {
        let name = Self::subgraph_name(deployment);
        let node = self.choose_node().await?;
        self.subgraph_create(&name).await?;
        self.subgraph_deploy(&name, deployment, &node).await?;
        self.subgraph_reassign(deployment, &node).await?;
        info!(deployment = %deployment, name, node, "Deployment assigned to graph node");
        Ok(())
    }

    /// Stops indexing `deployment` by reassigning it to the removal node.
    pub async fn remove(&self, deployment: &DeploymentId) -> anyhow::Result<()> {
        debug!(deployment = %deployment, "Reassigning deployment to removal node");
        self.subgraph_reassign(deployment, REMOVAL_NODE).await
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn subgraph_names_use_the_cid_tail() {
        let cid = "QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS";
        let deployment = DeploymentId::from_str(cid).unwrap();
        let name = GraphNode::subgraph_name(&deployment);
        assert_eq!(name, format!("indexer-agent/{}", &cid[cid.len() - 10..]));
        assert_eq!(name.len(), "indexer-agent/".len() + 10);
    }
}
