// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Indexing rules: the operator-authored policy the rule evaluator runs
//! against. Rules are created and edited out of band (indexer management
//! API); the agent reads them and seeds the per-network global fallback.

use std::{fmt, str::FromStr};

use bigdecimal::BigDecimal;
use sqlx::PgPool;

/// Identifier of the per-network fallback rule.
pub const GLOBAL_IDENTIFIER: &str = "global";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentifierType {
    Group,
    Subgraph,
    Deployment,
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdentifierType::Group => "group",
            IdentifierType::Subgraph => "subgraph",
            IdentifierType::Deployment => "deployment",
        };
        write!(f, "{s}")
    }
}

impl FromStr for IdentifierType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group" => Ok(IdentifierType::Group),
            "subgraph" => Ok(IdentifierType::Subgraph),
            "deployment" => Ok(IdentifierType::Deployment),
            other => anyhow::bail!("unknown identifier type `{other}`"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionBasis {
    Rules,
    Always,
    Never,
    Offchain,
}

impl fmt::Display for DecisionBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionBasis::Rules => "rules",
            DecisionBasis::Always => "always",
            DecisionBasis::Never => "never",
            DecisionBasis::Offchain => "offchain",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DecisionBasis {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rules" => Ok(DecisionBasis::Rules),
            "always" => Ok(DecisionBasis::Always),
            "never" => Ok(DecisionBasis::Never),
            "offchain" => Ok(DecisionBasis::Offchain),
            other => anyhow::bail!("unknown decision basis `{other}`"),
        }
    }
}

/// One indexing rule row. Token amounts are stored in wei.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexingRule {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub allocation_amount: Option<BigDecimal>,
    pub parallel_allocations: Option<i32>,
    pub max_allocation_percentage: Option<f64>,
    pub min_signal: Option<BigDecimal>,
    pub max_signal: Option<BigDecimal>,
    pub min_stake: Option<BigDecimal>,
    pub min_average_query_fees: Option<BigDecimal>,
    pub decision_basis: DecisionBasis,
    pub allocation_lifetime: Option<i32>,
    pub auto_renewal: bool,
    pub require_supported: bool,
    pub protocol_network: String,
}

impl IndexingRule {
    /// The default global rule seeded at startup.
    pub fn global(protocol_network: &str, allocation_amount: BigDecimal) -> Self {
        Self {
            identifier: GLOBAL_IDENTIFIER.to_string(),
            identifier_type: IdentifierType::Group,
            allocation_amount: Some(allocation_amount),
            parallel_allocations: Some(1),
            max_allocation_percentage: None,
            min_signal: None,
            max_signal: None,
            min_stake: None,
            min_average_query_fees: None,
            decision_basis: DecisionBasis::Rules,
            allocation_lifetime: None,
            auto_renewal: true,
            require_supported: true,
            protocol_network: protocol_network.to_string(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.identifier == GLOBAL_IDENTIFIER && self.identifier_type == IdentifierType::Group
    }

    /// Inherits unset economics from the global rule; everything already set
    /// on the scoped rule wins.
    pub fn merge_global(&self, global: &IndexingRule) -> IndexingRule {
        IndexingRule {
            identifier: self.identifier.clone(),
            identifier_type: self.identifier_type,
            allocation_amount: self
                .allocation_amount
                .clone()
                .or_else(|| global.allocation_amount.clone()),
            parallel_allocations: self
                .parallel_allocations
                .or(global.parallel_allocations),
            max_allocation_percentage: self
                .max_allocation_percentage
                .or(global.max_allocation_percentage),
            min_signal: self.min_signal.clone().or_else(|| global.min_signal.clone()),
            max_signal: self.max_signal.clone().or_else(|| global.max_signal.clone()),
            min_stake: self.min_stake.clone().or_else(|| global.min_stake.clone()),
            min_average_query_fees: self
                .min_average_query_fees
                .clone()
                .or_else(|| global.min_average_query_fees.clone()),
            decision_basis: self.decision_basis,
            allocation_lifetime: self.allocation_lifetime.or(global.allocation_lifetime),
            auto_renewal: self.auto_renewal,
            require_supported: self.require_supported,
            protocol_network: self.protocol_network.clone(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    identifier: String,
    identifier_type: String,
    allocation_amount: Option<BigDecimal>,
    parallel_allocations: Option<i32>,
    max_allocation_percentage: Option<f64>,
    min_signal: Option<BigDecimal>,
    max_signal: Option<BigDecimal>,
    min_stake: Option<BigDecimal>,
    min_average_query_fees: Option<BigDecimal>,
    decision_basis: String,
    allocation_lifetime: Option<i32>,
    auto_renewal: bool,
    require_supported: bool,
    protocol_network: String,
}

impl TryFrom<RuleRow> for IndexingRule {
    type Error = anyhow::Error;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(IndexingRule {
            identifier: row.identifier,
            identifier_type: row.identifier_type.parse()?,
            allocation_amount: row.allocation_amount,
            parallel_allocations: row.parallel_allocations,
            max_allocation_percentage: row.max_allocation_percentage,
            min_signal: row.min_signal,
            max_signal: row.max_signal,
            min_stake: row.min_stake,
            min_average_query_fees: row.min_average_query_fees,
            decision_basis: row.decision_basis.parse()?,
            allocation_lifetime: row.allocation_lifetime,
            auto_renewal: row.auto_renewal,
            require_supported: row.require_supported,
            protocol_network: row.protocol_network,
        })
    }
}

const RULE_COLUMNS: &str = "identifier, identifier_type, allocation_amount, \
     parallel_allocations, max_allocation_percentage, min_signal, max_signal, min_stake, \
     min_average_query_fees, decision_basis, allocation_lifetime, auto_renewal, \
     require_supported, protocol_network";

/// All rules for one network, optionally with scoped rules merged over the
/// global rule.
pub async fn fetch_rules(
    pool: &PgPool,
    protocol_network: &str,
    merged: bool,
) -> anyhow::Result<Vec<IndexingRule>> {
    let rows: Vec<RuleRow> = sqlx::query_as(&format!(
        "SELECT {RULE_COLUMNS} FROM indexing_rules WHERE protocol_network = $1 ORDER BY identifier"
    ))
    .bind(protocol_network)
    .fetch_all(pool)
    .await?;

    let mut rules = rows
        .into_iter()
        .map(IndexingRule::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    if merged {
        if let Some(global) = rules.iter().find(|rule| rule.is_global()).cloned() {
            rules = rules
                .into_iter()
                .map(|rule| {
                    if rule.is_global() {
                        rule
                    } else {
                        rule.merge_global(&global)
                    }
                })
                .collect();
        }
    }

    Ok(rules)
}

/// Seeds the per-network global rule; a no-op when the row already exists.
pub async fn ensure_global_rule(
    pool: &PgPool,
    protocol_network: &str,
    default_allocation_amount: BigDecimal,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO indexing_rules \
             (identifier, identifier_type, allocation_amount, parallel_allocations, \
              decision_basis, auto_renewal, require_supported, protocol_network) \
         VALUES ($1, 'group', $2, 1, 'rules', TRUE, TRUE, $3) \
         ON CONFLICT (identifier, identifier_type, protocol_network) DO NOTHING",
    )
    .bind(GLOBAL_IDENTIFIER)
    .bind(default_allocation_amount)
    .bind(protocol_network)
    .execute(pool)
    .await?;
    Ok(())
}
