// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for tests across the workspace.

use std::str::FromStr;

use indexer_allocation::{Allocation, AllocationStatus, SubgraphDeployment};
use lazy_static::lazy_static;
use thegraph_core::{
    alloy::primitives::{Address, U256},
    DeploymentId,
};

pub const INDEXER_OPERATOR_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub const NETWORK_ID: &str = "eip155:1";

lazy_static! {
    pub static ref INDEXER_ADDRESS: Address =
        Address::from_str("0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c").unwrap();
    pub static ref OPERATOR_ADDRESS: Address =
        Address::from_str("0xfa44c72b753a66591f241c7dc04e8178c30e13af").unwrap();
    pub static ref DEPLOYMENT_A: DeploymentId =
        DeploymentId::from_str("QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS").unwrap();
    pub static ref DEPLOYMENT_B: DeploymentId =
        DeploymentId::from_str("QmWaNip2EgixgP4rLrGcvAnnMgDDdHUNJ5KeSYyFvGfjfr").unwrap();
    pub static ref NETWORK_SUBGRAPH_DEPLOYMENT: DeploymentId =
        DeploymentId::from_str("QmU7zqJyHSyUP3yFii8sBtHT8FaJn2WmUnRvwjAUTjwyCP").unwrap();
}

/// An active allocation for `deployment` with reasonable defaults.
pub fn active_allocation(id: &str, deployment: DeploymentId, created_at_epoch: u64) -> Allocation {
    Allocation {
        id: Address::from_str(id).unwrap(),
        status: AllocationStatus::Active,
        subgraph_deployment: SubgraphDeployment {
            id: deployment,
            denied_at: None,
            staked_tokens: U256::from(100_000u64),
            signalled_tokens: U256::from(50_000u64),
            query_fees_amount: U256::from(1_000u64),
            transferred_to_l2: false,
        },
        indexer: *INDEXER_ADDRESS,
        allocated_tokens: U256::from(10_000_000_000_000_000_000_000u128),
        created_at_epoch,
        created_at_block_hash:
            "0x64c9ee34b6e7ab50be9a22a77fa109f35032dd644419c3dcd8c9c87311a3fc34".to_string(),
        closed_at_epoch: None,
        closed_at_block_hash: None,
        poi: None,
        query_fees_collected: None,
    }
}

/// A closed allocation with the given POI.
pub fn closed_allocation(
    id: &str,
    deployment: DeploymentId,
    closed_at_epoch: u64,
    poi: &str,
) -> Allocation {
    let mut allocation = active_allocation(id, deployment, closed_at_epoch.saturating_sub(5));
    allocation.status = AllocationStatus::Closed;
    allocation.closed_at_epoch = Some(closed_at_epoch);
    allocation.poi = Some(poi.to_string());
    allocation
}
