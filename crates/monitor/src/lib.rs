// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Read-only projections of one protocol network.
//!
//! Each monitor wraps a subgraph query in a watcher with its own refresh
//! interval; readers borrow the latest value without blocking. One-shot
//! fetch functions are provided where the reconciler needs fresh data
//! immediately before acting.

mod allocations;
mod deployments;
mod epoch;
mod operator;
mod pause;

pub use allocations::{
    claimable_allocations, disputable_allocations, fetch_active_allocations,
    indexer_active_allocations, indexer_recently_closed_allocations,
};
pub use deployments::{fetch_subgraphs, network_deployments, NetworkDeployment, Subgraph,
    SubgraphVersion};
pub use epoch::{epoch_info, EpochInfo};
pub use operator::operator_status;
pub use pause::network_pause;
