// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Pure rule evaluation: no I/O, deterministic, one decision per published
//! deployment.

use std::{str::FromStr, time::Duration};

use bigdecimal::BigDecimal;
use indexer_monitor::{NetworkDeployment, Subgraph};
use thegraph_core::{alloy::primitives::U256, DeploymentId};

use crate::database::rules::{DecisionBasis, IdentifierType, IndexingRule};

/// The evaluator's verdict for one deployment.
#[derive(Clone, Debug)]
pub struct AllocationDecision {
    pub deployment: DeploymentId,
    pub to_allocate: bool,
    /// The merged rule that matched, if any.
    pub rule: Option<IndexingRule>,
    pub reason: String,
    pub protocol_network: String,
}

pub(crate) fn bd_to_u256(value: &BigDecimal) -> Option<U256> {
    U256::from_str(&value.with_scale(0).to_string()).ok()
}

fn rule_matches(rule: &IndexingRule, deployment: DeploymentId) -> bool {
    DeploymentId::from_str(&rule.identifier)
        .map(|id| id == deployment)
        .unwrap_or(false)
}

/// Rewrites SUBGRAPH rules into DEPLOYMENT rules against the subgraph's
/// latest version, leaving rules for unknown subgraphs untouched. A version
/// published less than `previous_version_buffer` ago additionally keeps a
/// duplicate rule for the previous version's deployment, so queries against
/// the rolling-over deployment stay served.
///
/// Returns a new vector; the input is not modified.
pub fn convert_subgraph_rules(
    rules: &[IndexingRule],
    subgraphs: &[Subgraph],
    previous_version_buffer: Duration,
    now_secs: u64,
) -> Vec<IndexingRule> {
    let has_deployment_rule = |deployment: DeploymentId| {
        rules.iter().any(|rule| {
            rule.identifier_type == IdentifierType::Deployment && rule_matches(rule, deployment)
        })
    };

    let mut converted = Vec::with_capacity(rules.len());
    for rule in rules {
        if rule.identifier_type != IdentifierType::Subgraph {
            converted.push(rule.clone());
            continue;
        }
        let Some(subgraph) = subgraphs.iter().find(|s| s.id == rule.identifier) else {
            converted.push(rule.clone());
            continue;
        };
        let Some(latest) = subgraph.latest_version() else {
            converted.push(rule.clone());
            continue;
        };

        if has_deployment_rule(latest.deployment) {
            converted.push(rule.clone());
        } else {
            let mut rewritten = rule.clone();
            rewritten.identifier = latest.deployment.0.to_string();
            rewritten.identifier_type = IdentifierType::Deployment;
            converted.push(rewritten);
        }

        let within_buffer =
            latest.created_at > now_secs.saturating_sub(previous_version_buffer.as_secs());
        if within_buffer {
            if let Some(previous) = subgraph.previous_version() {
                if !has_deployment_rule(previous.deployment) {
                    let mut duplicate = rule.clone();
                    duplicate.identifier = previous.deployment.0.to_string();
                    duplicate.identifier_type = IdentifierType::Deployment;
                    converted.push(duplicate);
                }
            }
        }
    }
    converted
}

/// Deployments named by OFFCHAIN rules; they are synced but never allocated
/// to.
pub fn offchain_deployments(rules: &[IndexingRule]) -> Vec<DeploymentId> {
    rules
        .iter()
        .filter(|rule| rule.decision_basis == DecisionBasis::Offchain)
        .filter_map(|rule| DeploymentId::from_str(&rule.identifier).ok())
        .collect()
}

/// One decision per deployment. `rules` must already be merged with the
/// global rule and rewritten from subgraph to deployment identifiers.
pub fn evaluate_deployments(
    rules: &[IndexingRule],
    deployments: &[NetworkDeployment],
    protocol_network: &str,
) -> Vec<AllocationDecision> {
    deployments
        .iter()
        .map(|deployment| evaluate_deployment(rules, deployment, protocol_network))
        .collect()
}

fn evaluate_deployment(
    rules: &[IndexingRule],
    deployment: &NetworkDeployment,
    protocol_network: &str,
) -> AllocationDecision {
    let decision = |to_allocate: bool, rule: Option<&IndexingRule>, reason: &str| {
        AllocationDecision {
            deployment: deployment.id,
            to_allocate,
            rule: rule.cloned(),
            reason: reason.to_string(),
            protocol_network: protocol_network.to_string(),
        }
    };

    // Deployment-scoped rule wins over the global fallback.
    let rule = rules
        .iter()
        .find(|rule| {
            rule.identifier_type == IdentifierType::Deployment && rule_matches(rule, deployment.id)
        })
        .or_else(|| rules.iter().find(|rule| rule.is_global()));

    let Some(rule) = rule else {
        return decision(false, None, "none");
    };

    if rule.require_supported && deployment.denied_at.is_some() {
        return decision(false, Some(rule), "unsupported");
    }

    match rule.decision_basis {
        DecisionBasis::Always => decision(true, Some(rule), "always"),
        DecisionBasis::Never => decision(false, Some(rule), "never"),
        DecisionBasis::Offchain => decision(false, Some(rule), "offchain"),
        DecisionBasis::Rules => {
            let (to_allocate, reason) = evaluate_thresholds(rule, deployment);
            decision(to_allocate, Some(rule), reason)
        }
    }
}

fn evaluate_thresholds(
    rule: &IndexingRule,
    deployment: &NetworkDeployment,
) -> (bool, &'static str) {
    let amount = rule.allocation_amount.as_ref().and_then(bd_to_u256);
    if amount.unwrap_or(U256::ZERO).is_zero() {
        return (false, "allocation-amount-unset");
    }

    if let Some(min_stake) = rule.min_stake.as_ref().and_then(bd_to_u256) {
        if deployment.staked_tokens >= min_stake {
            return (true, "min-stake");
        }
    }

    let min_signal = rule.min_signal.as_ref().and_then(bd_to_u256);
    let max_signal = rule.max_signal.as_ref().and_then(bd_to_u256);
    if min_signal.is_some() || max_signal.is_some() {
        let above_min = min_signal.is_none_or(|min| deployment.signalled_tokens >= min);
        let below_max = max_signal.is_none_or(|max| deployment.signalled_tokens <= max);
        if above_min && below_max {
            return (true, "signal-range");
        }
    }

    if let Some(min_average_query_fees) =
        rule.min_average_query_fees.as_ref().and_then(bd_to_u256)
    {
        let divisor = U256::from(deployment.allocation_count.max(1) as u64);
        if deployment.query_fees_amount / divisor >= min_average_query_fees {
            return (true, "average-query-fees");
        }
    }

    (false, "thresholds-not-met")
}
