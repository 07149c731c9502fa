// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{future::Future, time::Duration};

use indexer_watcher::new_watcher;
use thegraph_core::alloy::primitives::Address;
use tokio::sync::watch::{self, Receiver};
use tracing::debug;

/// Watches whether the operator wallet is authorized to act for the indexer.
///
/// When the operator *is* the indexer the answer is constant `true` and no
/// polling happens; otherwise `is_operator` (a staking contract read) is
/// polled on `interval`.
pub async fn operator_status<F, Fut>(
    operator: Address,
    indexer: Address,
    interval: Duration,
    is_operator: F,
) -> anyhow::Result<Receiver<bool>>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    if operator == indexer {
        debug!(%indexer, "Operator wallet is the indexer itself");
        let (tx, rx) = watch::channel(true);
        // Keep the channel open for the lifetime of the process.
        std::mem::forget(tx);
        return Ok(rx);
    }

    new_watcher(interval, is_operator).await
}
