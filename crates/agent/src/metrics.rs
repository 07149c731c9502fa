// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Agent metrics, registered against the default registry so an embedding
//! process can expose them however it likes.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec,
};

lazy_static! {
    pub static ref INDEXER_ERROR_COUNT: IntCounterVec = register_int_counter_vec!(
        "indexer_agent_errors_total",
        "Errors by stable error code",
        &["code"]
    )
    .unwrap();
    pub static ref RECONCILE_RUNS: IntCounterVec = register_int_counter_vec!(
        "indexer_agent_reconcile_runs_total",
        "Reconciliation ticks by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref TRANSACTIONS: IntCounterVec = register_int_counter_vec!(
        "indexer_agent_transactions_total",
        "On-chain transactions by network and outcome",
        &["network", "outcome"]
    )
    .unwrap();
    pub static ref ALLOCATIONS_OPENED: IntCounterVec = register_int_counter_vec!(
        "indexer_agent_allocations_opened_total",
        "Allocations opened by network",
        &["network"]
    )
    .unwrap();
    pub static ref ALLOCATIONS_CLOSED: IntCounterVec = register_int_counter_vec!(
        "indexer_agent_allocations_closed_total",
        "Allocations closed by network",
        &["network"]
    )
    .unwrap();
    pub static ref POI_DISPUTES_STORED: IntCounterVec = register_int_counter_vec!(
        "indexer_agent_poi_disputes_stored_total",
        "POI disputes persisted by network and status",
        &["network", "status"]
    )
    .unwrap();
    pub static ref TARGET_DEPLOYMENTS: IntGaugeVec = register_int_gauge_vec!(
        "indexer_agent_target_deployments",
        "Number of deployments the graph node should be indexing",
        &["kind"]
    )
    .unwrap();
}
