// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use indexer_query::SubgraphClient;
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    sync::watch::{self, Receiver},
    time::{self, sleep},
};
use tracing::warn;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PauseResponse {
    graph_networks: Vec<PauseEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PauseEntry {
    is_paused: bool,
}

/// Watches the protocol pause flag.
///
/// The initial value comes from the controller contract (the caller reads it
/// before the network subgraph is necessarily synced); refreshes come from
/// the network subgraph and retain the previous value on error.
pub fn network_pause(
    network_subgraph: &'static SubgraphClient,
    initial: bool,
    interval: Duration,
) -> Receiver<bool> {
    let (tx, rx) = watch::channel(initial);

    tokio::spawn(async move {
        let mut time_interval = time::interval(interval);
        time_interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            time_interval.tick().await;

            let result = async {
                let response: PauseResponse = network_subgraph
                    .query(
                        r#"{ graphNetworks(first: 1) { isPaused } }"#,
                        Value::Null,
                    )
                    .await?;
                response
                    .graph_networks
                    .into_iter()
                    .next()
                    .map(|entry| entry.is_paused)
                    .ok_or_else(|| anyhow::anyhow!("network subgraph has no graphNetworks entity"))
            }
            .await;

            match result {
                Ok(paused) => {
                    if tx.send(paused).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Failed to query network pause state, keeping previous value");
                    sleep(interval.div_f32(2.0)).await;
                }
            }
        }
    });
    rx
}
