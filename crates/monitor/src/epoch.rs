// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use indexer_query::SubgraphClient;
use indexer_watcher::new_watcher;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch::Receiver;

/// Protocol epoch parameters, refreshed rarely: they only change through
/// governance.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EpochInfo {
    pub current_epoch: u64,
    pub epoch_length: u64,
    pub max_allocation_epochs: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphNetworksResponse {
    graph_networks: Vec<EpochInfo>,
}

impl EpochInfo {
    /// The window within which a subgraph version change keeps rules for the
    /// previous deployment alive, in seconds (about 100 epochs at 15 s per
    /// block).
    pub fn previous_version_buffer(&self) -> Duration {
        Duration::from_secs(self.epoch_length * 15 * 100)
    }
}

/// Watches the current epoch number and allocation lifetime bounds.
pub async fn epoch_info(
    network_subgraph: &'static SubgraphClient,
    interval: Duration,
) -> anyhow::Result<Receiver<EpochInfo>> {
    new_watcher(interval, move || async move {
        let response: GraphNetworksResponse = network_subgraph
            .query(
                r#"
                    {
                        graphNetworks(first: 1) {
                            currentEpoch
                            epochLength
                            maxAllocationEpochs
                        }
                    }
                "#,
                Value::Null,
            )
            .await?;
        response
            .graph_networks
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("network subgraph has no graphNetworks entity"))
    })
    .await
}

#[cfg(test)]
mod tests {
    use reqwest::Url;
    use wiremock::{
        matchers::{body_string_contains, method},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    #[test_log::test(tokio::test)]
    async fn reads_epoch_parameters() {
        let mock_server = MockServer::start().await;
        mock_server
            .register(
                Mock::given(method("POST"))
                    .and(body_string_contains("currentEpoch"))
                    .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "data": {
                            "graphNetworks": [{
                                "currentEpoch": 956,
                                "epochLength": 6646,
                                "maxAllocationEpochs": 28
                            }]
                        }
                    }))),
            )
            .await;

        let network_subgraph = Box::leak(Box::new(SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&mock_server.uri()).unwrap(),
        )));
        let epoch = epoch_info(network_subgraph, Duration::from_secs(600))
            .await
            .unwrap();
        let info = *epoch.borrow();
        assert_eq!(info.current_epoch, 956);
        assert_eq!(info.max_allocation_epochs, 28);
    }
}
