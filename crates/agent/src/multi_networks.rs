// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Registry of `(Network, Operator)` pairs, one per protocol network.

use std::{collections::HashMap, future::Future, sync::Arc};

use futures::future::join_all;
use indexer_config::ConfigError;
use tracing::error;

use crate::{network::Network, operator::Operator};

pub struct NetworkAndOperator {
    pub network: Network,
    pub operator: Operator,
}

pub struct MultiNetworks {
    pairs: HashMap<String, Arc<NetworkAndOperator>>,
}

fn validate_pair_ids(ids: &[(&str, &str)]) -> Result<(), ConfigError> {
    if ids.is_empty() {
        return Err(ConfigError::NoProtocolNetworks);
    }
    let mut seen = Vec::new();
    for (network_id, operator_id) in ids {
        if network_id != operator_id {
            return Err(ConfigError::MismatchedNetworkPair {
                network: network_id.to_string(),
                operator: operator_id.to_string(),
            });
        }
        if seen.contains(network_id) {
            return Err(ConfigError::DuplicateNetworkIdentifier(
                network_id.to_string(),
            ));
        }
        seen.push(network_id);
    }
    Ok(())
}

impl MultiNetworks {
    pub fn new(pairs: Vec<NetworkAndOperator>) -> Result<Self, ConfigError> {
        let ids: Vec<(&str, &str)> = pairs
            .iter()
            .map(|pair| (pair.network.id(), pair.operator.network_id()))
            .collect();
        validate_pair_ids(&ids)?;

        Ok(Self {
            pairs: pairs
                .into_iter()
                .map(|pair| (pair.network.id().to_string(), Arc::new(pair)))
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Applies `f` to every pair concurrently and collects the successful
    /// results keyed by network id. A failing pair is logged and left out;
    /// the other networks are unaffected.
    pub async fn map<T, F, Fut>(&self, f: F) -> HashMap<String, T>
    where
        F: Fn(Arc<NetworkAndOperator>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let tasks = self.pairs.iter().map(|(id, pair)| {
            let task = f(pair.clone());
            async move { (id.clone(), task.await) }
        });

        let mut results = HashMap::new();
        for (id, result) in join_all(tasks).await {
            match result {
                Ok(value) => {
                    results.insert(id, value);
                }
                Err(err) => {
                    error!(protocol_network = %id, error = %err, "Network operation failed");
                }
            }
        }
        results
    }

    /// Inner join of two network-keyed maps.
    pub fn zip<A, B>(
        mut left: HashMap<String, A>,
        mut right: HashMap<String, B>,
    ) -> HashMap<String, (A, B)> {
        let keys: Vec<String> = left
            .keys()
            .filter(|key| right.contains_key(*key))
            .cloned()
            .collect();
        keys.into_iter()
            .map(|key| {
                let a = left.remove(&key).unwrap();
                let b = right.remove(&key).unwrap();
                (key, (a, b))
            })
            .collect()
    }
}
