// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use serde_json::json;

use crate::{QueryError, SubgraphClient};

/// Typed access to the epoch block oracle subgraph.
#[derive(Clone)]
pub struct EpochSubgraph {
    client: SubgraphClient,
}

#[derive(Debug, Deserialize)]
struct EpochResponse {
    epoch: Option<Epoch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Epoch {
    start_block_number: String,
}

impl EpochSubgraph {
    pub fn new(client: SubgraphClient) -> Self {
        Self { client }
    }

    /// The first block of `epoch`, or an error when the subgraph has no
    /// record of it.
    pub async fn epoch_start_block(&self, epoch: u64) -> Result<u64, QueryError> {
        let response: EpochResponse = self
            .client
            .query(
                r#"
                    query ($epoch: ID!) {
                        epoch(id: $epoch) {
                            startBlockNumber
                        }
                    }
                "#,
                json!({ "epoch": epoch.to_string() }),
            )
            .await?;

        let epoch_record = response
            .epoch
            .ok_or_else(|| QueryError::BadResponse(format!("epoch {epoch} not found")))?;
        epoch_record
            .start_block_number
            .parse()
            .map_err(|_| QueryError::BadResponse(format!("epoch {epoch} start block is not a number")))
    }
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
    async fn parses_epoch_start_block() {
        let mock_server = MockServer::start().await;
        mock_server
            .register(
                Mock::given(method("POST"))
                    .and(body_string_contains("startBlockNumber"))
                    .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                        "data": { "epoch": { "startBlockNumber": "17654321" } }
                    }))),
            )
            .await;

        let epoch_subgraph = EpochSubgraph::new(SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&mock_server.uri()).unwrap(),
        ));
        assert_eq!(epoch_subgraph.epoch_start_block(956).await.unwrap(), 17654321);
    }
}
