// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! A thin GraphQL-over-HTTP client for the protocol subgraphs.
//!
//! Queries deserialize straight into `serde` structs. List queries paginate
//! with an ascending `id_gt` cursor and a fixed page size, the only paging
//! scheme the subgraphs support consistently.

mod epoch;

pub use epoch::EpochSubgraph;

use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Page size used by every paginated query.
pub const PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("subgraph request failed: {0}")]
    Transport(String),
    #[error("subgraph returned errors: {0}")]
    Graphql(String),
    #[error("malformed subgraph response: {0}")]
    BadResponse(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Clone)]
pub struct SubgraphClient {
    http_client: reqwest::Client,
    url: Url,
}

impl SubgraphClient {
    pub fn new(http_client: reqwest::Client, url: Url) -> Self {
        Self { http_client, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn query_raw(&self, query: &str, variables: Value) -> Result<Value, QueryError> {
        let response = self
            .http_client
            .post(self.url.clone())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|err| QueryError::Transport(err.to_string()))?
            .error_for_status()
            .map_err(|err| QueryError::Transport(err.to_string()))?;

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|err| QueryError::BadResponse(err.to_string()))?;

        if let Some(errors) = envelope.errors.filter(|errors| !errors.is_empty()) {
            let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
            return Err(QueryError::Graphql(messages.join("; ")));
        }

        envelope
            .data
            .ok_or_else(|| QueryError::BadResponse("response carried no data".to_string()))
    }

    /// Runs `query` and deserializes the whole `data` object into `T`.
    pub async fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, QueryError> {
        let data = self.query_raw(query, variables).await?;
        serde_json::from_value(data).map_err(|err| QueryError::BadResponse(err.to_string()))
    }

    /// Runs a list query repeatedly with an `id_gt` cursor until a short page
    /// is returned, collecting every item.
    ///
    /// `query` must select exactly one top-level list field and declare
    /// `$first: Int!` and `$lastId: String!` variables; items must carry an
    /// `id` field for the cursor.
    pub async fn paginated_query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<Vec<T>, QueryError> {
        let mut variables = match variables {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(QueryError::BadResponse(format!(
                    "pagination variables must be an object, got {other}"
                )))
            }
        };

        let mut items = Vec::new();
        let mut last_id = String::new();

        loop {
            variables.insert("first".to_string(), json!(PAGE_SIZE));
            variables.insert("lastId".to_string(), json!(last_id));

            let data = self
                .query_raw(query, Value::Object(variables.clone()))
                .await?;
            let object = data
                .as_object()
                .filter(|object| object.len() == 1)
                .ok_or_else(|| {
                    QueryError::BadResponse(
                        "paginated query must select exactly one field".to_string(),
                    )
                })?;
            let page = object
                .values()
                .next()
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    QueryError::BadResponse("paginated field is not a list".to_string())
                })?;

            let page_len = page.len();
            if let Some(last) = page.last() {
                last_id = last
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        QueryError::BadResponse("paginated items carry no id".to_string())
                    })?
                    .to_string();
            }

            for item in page {
                items.push(
                    serde_json::from_value(item.clone())
                        .map_err(|err| QueryError::BadResponse(err.to_string()))?,
                );
            }

            if page_len < PAGE_SIZE {
                return Ok(items);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_string_contains, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: String,
    }

    fn client(mock_server: &MockServer) -> SubgraphClient {
        SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/subgraphs/id/QmTest", mock_server.uri())).unwrap(),
        )
    }

    #[test_log::test(tokio::test)]
    async fn surfaces_graphql_errors() {
        let mock_server = MockServer::start().await;
        mock_server
            .register(Mock::given(method("POST")).respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "errors": [{ "message": "boom" }] })),
            ))
            .await;

        let result: Result<Value, _> = client(&mock_server).query("{ things { id } }", Value::Null).await;
        assert!(matches!(result, Err(QueryError::Graphql(message)) if message.contains("boom")));
    }

    #[test_log::test(tokio::test)]
    async fn paginates_until_short_page() {
        let mock_server = MockServer::start().await;

        // First page: exactly PAGE_SIZE items ending at id `k999`.
        let full_page: Vec<Value> = (0..PAGE_SIZE)
            .map(|i| serde_json::json!({ "id": format!("k{i:03}") }))
            .collect();
        mock_server
            .register(
                Mock::given(method("POST"))
                    .and(path("/subgraphs/id/QmTest"))
                    .and(body_string_contains("\"lastId\":\"\""))
                    .respond_with(
                        ResponseTemplate::new(200)
                            .set_body_json(serde_json::json!({ "data": { "things": full_page } })),
                    ),
            )
            .await;
        mock_server
            .register(
                Mock::given(method("POST"))
                    .and(path("/subgraphs/id/QmTest"))
                    .and(body_string_contains("\"lastId\":\"k999\""))
                    .respond_with(ResponseTemplate::new(200).set_body_json(
                        serde_json::json!({ "data": { "things": [{ "id": "tail" }] } }),
                    )),
            )
            .await;

        let items: Vec<Item> = client(&mock_server)
            .paginated_query(
                "query ($first: Int!, $lastId: String!) { things(first: $first, where: { id_gt: $lastId }) { id } }",
                Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(items.len(), PAGE_SIZE + 1);
        assert_eq!(items.last(), Some(&Item { id: "tail".to_string() }));
    }
}
