// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer};
use thegraph_core::{
    alloy::primitives::{Address, U256},
    DeploymentId,
};

/// An on-chain allocation of indexer stake against a subgraph deployment, as
/// reported by the network subgraph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub id: Address,
    pub status: AllocationStatus,
    pub subgraph_deployment: SubgraphDeployment,
    pub indexer: Address,
    pub allocated_tokens: U256,
    pub created_at_epoch: u64,
    pub created_at_block_hash: String,
    pub closed_at_epoch: Option<u64>,
    pub closed_at_block_hash: Option<String>,
    pub poi: Option<String>,
    pub query_fees_collected: Option<U256>,
}

/// Contract-side allocation lifecycle. The agent only ever drives
/// `Null -> Active` (open) and `Active -> Closed` (close); the later states
/// are observed, never written.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocationStatus {
    Null,
    Active,
    Closed,
    Finalized,
    Claimed,
}

/// The slice of a subgraph deployment record the agent evaluates rules
/// against.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphDeployment {
    #[serde(rename = "ipfsHash")]
    pub id: DeploymentId,
    #[serde(default)]
    pub denied_at: Option<u64>,
    #[serde(default)]
    pub staked_tokens: U256,
    #[serde(default)]
    pub signalled_tokens: U256,
    #[serde(default)]
    pub query_fees_amount: U256,
    #[serde(default)]
    pub transferred_to_l2: bool,
}

impl Allocation {
    /// An allocation is eligible to serve queries while active and for a
    /// short window after closing.
    pub fn is_active(&self) -> bool {
        matches!(self.status, AllocationStatus::Active)
    }
}

impl<'d> Deserialize<'d> for Allocation {
    fn deserialize<D>(deserializer: D) -> Result<Allocation, D::Error>
    where
        D: Deserializer<'d>,
    {
        #[derive(Deserialize)]
        struct InnerIndexer {
            id: Address,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Outer {
            id: Address,
            subgraph_deployment: SubgraphDeployment,
            indexer: InnerIndexer,
            allocated_tokens: U256,
            created_at_block_hash: String,
            created_at_epoch: u64,
            #[serde(default)]
            closed_at_epoch: Option<u64>,
            #[serde(default)]
            closed_at_block_hash: Option<String>,
            #[serde(default)]
            poi: Option<String>,
            #[serde(default)]
            query_fees_collected: Option<U256>,
        }

        let outer = Outer::deserialize(deserializer)?;

        let status = if outer.closed_at_epoch.is_some() {
            AllocationStatus::Closed
        } else {
            AllocationStatus::Active
        };

        Ok(Allocation {
            id: outer.id,
            status,
            subgraph_deployment: outer.subgraph_deployment,
            indexer: outer.indexer.id,
            allocated_tokens: outer.allocated_tokens,
            created_at_epoch: outer.created_at_epoch,
            created_at_block_hash: outer.created_at_block_hash,
            closed_at_epoch: outer.closed_at_epoch,
            closed_at_block_hash: outer.closed_at_block_hash,
            poi: outer.poi,
            query_fees_collected: outer.query_fees_collected,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    const RAW: &str = r#"
        {
            "id": "0xfa44c72b753a66591f241c7dc04e8178c30e13af",
            "indexer": { "id": "0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c" },
            "allocatedTokens": "5081382841000000014901161",
            "createdAtBlockHash": "0x64c9ee34b6e7ab50be9a22a77fa109f35032dd644419c3dcd8c9c87311a3fc34",
            "createdAtEpoch": 953,
            "closedAtEpoch": 956,
            "subgraphDeployment": {
                "ipfsHash": "QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS",
                "deniedAt": 0,
                "stakedTokens": "96183284152000000014901161",
                "signalledTokens": "182832939554154667498047",
                "queryFeesAmount": "19861336072168874330350"
            }
        }
    "#;

    #[test]
    fn parses_network_subgraph_shape() {
        let allocation: Allocation = serde_json::from_str(RAW).unwrap();
        assert_eq!(
            allocation.id,
            Address::from_str("0xfa44c72b753a66591f241c7dc04e8178c30e13af").unwrap()
        );
        assert_eq!(allocation.status, AllocationStatus::Closed);
        assert_eq!(allocation.closed_at_epoch, Some(956));
        assert_eq!(
            allocation.subgraph_deployment.id,
            DeploymentId::from_str("QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS").unwrap()
        );
    }

    #[test]
    fn deployment_id_encodings_round_trip() {
        let cid = "QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS";
        let id = DeploymentId::from_str(cid).unwrap();
        let hex = format!("{:#x}", id.0);
        let back = DeploymentId::from_str(&hex).unwrap();
        assert_eq!(id, back);
        assert_eq!(back.to_string(), cid);
    }
}
