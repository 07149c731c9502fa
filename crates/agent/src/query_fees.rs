// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the query-fee subsystem. The reconciler tells the collector
//! which allocations opened and closed so receipts can be attributed and
//! vouchers redeemed; everything past that notification lives outside this
//! repository.

use async_trait::async_trait;
use thegraph_core::alloy::primitives::Address;
use tracing::info;

use crate::metrics::{ALLOCATIONS_CLOSED, ALLOCATIONS_OPENED};

#[async_trait]
pub trait QueryFeeCollector: Send + Sync {
    async fn remember_opened_allocations(&self, protocol_network: &str, allocations: &[Address]);
    async fn remember_closed_allocations(&self, protocol_network: &str, allocations: &[Address]);
}

/// Default collector: records the events for operators and metrics. A real
/// voucher pipeline plugs in behind the same trait.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingCollector;

#[async_trait]
impl QueryFeeCollector for LoggingCollector {
    async fn remember_opened_allocations(&self, protocol_network: &str, allocations: &[Address]) {
        for allocation in allocations {
            ALLOCATIONS_OPENED.with_label_values(&[protocol_network]).inc();
            info!(
                protocol_network,
                allocation = %allocation,
                "Tracking query fees for new allocation"
            );
        }
    }

    async fn remember_closed_allocations(&self, protocol_network: &str, allocations: &[Address]) {
        for allocation in allocations {
            ALLOCATIONS_CLOSED.with_label_values(&[protocol_network]).inc();
            info!(
                protocol_network,
                allocation = %allocation,
                "Allocation closed, receipts eligible for voucher exchange"
            );
        }
    }
}
