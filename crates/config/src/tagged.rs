// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Network-tagged option values.
//!
//! In multi-network mode, endpoint-like options accept a
//! `<alias>:<value>` or `<CAIP-2>:<value>` prefix, e.g.
//! `arbitrum-one:https://example.com` or `eip155:1:QmHash`.

use std::str::FromStr;

use reqwest::Url;
use thegraph_core::DeploymentId;

use crate::{
    network_identifier::{alias_chain_id, resolve_network_identifier},
    ConfigError,
};

/// An option value with its optional protocol network tag, already resolved
/// to CAIP-2 form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tagged<T> {
    pub network_id: Option<String>,
    pub value: T,
}

fn parse_tagged<T, E>(
    input: &str,
    parse_value: impl Fn(&str) -> Result<T, E>,
) -> Result<Tagged<T>, ConfigError>
where
    E: std::fmt::Display,
{
    let parse = |network_id: Option<String>, raw: &str| {
        parse_value(raw)
            .map(|value| Tagged { network_id, value })
            .map_err(|err| ConfigError::InvalidOptionValue {
                value: raw.to_string(),
                problem: err.to_string(),
            })
    };

    // A CAIP-2 tag spans two colons: `eip155:1:<value>`.
    if let Some(rest) = input.strip_prefix("eip155:") {
        let (chain_id, raw) = rest
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidNetworkIdentifier(input.to_string()))?;
        let network_id = resolve_network_identifier(&format!("eip155:{chain_id}"))?;
        return parse(Some(network_id), raw);
    }

    if let Some((prefix, raw)) = input.split_once(':') {
        if alias_chain_id(prefix).is_some() {
            let network_id = resolve_network_identifier(prefix)?;
            return parse(Some(network_id), raw);
        }
    }

    parse(None, input)
}

/// Parses a URL option that may carry a network tag.
pub fn parse_tagged_url(input: &str) -> Result<Tagged<Url>, ConfigError> {
    parse_tagged(input, Url::parse)
}

/// Parses an IPFS-hash option that may carry a network tag.
pub fn parse_tagged_deployment(input: &str) -> Result<Tagged<DeploymentId>, ConfigError> {
    parse_tagged(input, DeploymentId::from_str)
}

/// Validates that the tagged option groups cover the same protocol networks:
/// equal lengths, equal network-id sets, no duplicate or partial tagging
/// within a group.
pub fn validate_tagged_groups(
    groups: &[(&str, Vec<Option<String>>)],
) -> Result<(), ConfigError> {
    let Some((_, first)) = groups.first() else {
        return Ok(());
    };

    for (name, ids) in groups {
        if ids.len() != first.len() {
            return Err(ConfigError::UnbalancedOptionGroups {
                group: name.to_string(),
                expected: first.len(),
                actual: ids.len(),
            });
        }
        let tagged = ids.iter().filter(|id| id.is_some()).count();
        if tagged != 0 && tagged != ids.len() {
            return Err(ConfigError::MixedNetworkIdentifiers(name.to_string()));
        }
        let mut seen = Vec::new();
        for id in ids.iter().flatten() {
            if seen.contains(&id) {
                return Err(ConfigError::DuplicateNetworkIdentifier(id.clone()));
            }
            seen.push(id);
        }
    }

    let mut reference: Vec<&Option<String>> = first.iter().collect();
    reference.sort();
    for (name, ids) in groups.iter().skip(1) {
        let mut sorted: Vec<&Option<String>> = ids.iter().collect();
        sorted.sort();
        if sorted != reference {
            return Err(ConfigError::MixedNetworkIdentifiers(name.to_string()));
        }
    }

    Ok(())
}
