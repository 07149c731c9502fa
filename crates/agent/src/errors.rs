// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Stable error codes for everything that can go wrong during
//! reconciliation.
//!
//! Codes are never reused or renumbered; dashboards and alerts aggregate on
//! them. Every caught error increments the per-code Prometheus counter.

use std::fmt;

use crate::metrics::INDEXER_ERROR_COUNT;

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexerErrorCode {
    IE001,
    IE002,
    IE003,
    IE004,
    IE005,
    IE006,
    IE007,
    IE008,
    IE009,
    IE010,
    IE011,
    IE012,
    IE013,
    IE014,
    IE015,
    IE016,
    IE017,
    IE018,
    IE019,
    IE020,
    IE021,
    IE022,
    IE025,
    IE026,
    IE027,
    IE028,
    IE029,
    IE030,
    IE031,
    IE032,
}

impl IndexerErrorCode {
    pub fn message(&self) -> &'static str {
        use IndexerErrorCode::*;
        match self {
            IE001 => "Failed to run database migrations",
            IE002 => "Invalid Ethereum provider URL",
            IE003 => "Failed to query network subgraph",
            IE004 => "Failed to query epoch subgraph",
            IE005 => "Failed to reconcile indexer and network",
            IE006 => "Failed to cross-check allocation state with contracts",
            IE007 => "Failed to check for network pause",
            IE008 => "Failed to check operator status for indexer",
            IE009 => "Failed to query subgraph deployments worth indexing",
            IE010 => "Failed to query indexer allocations",
            IE011 => "Failed to query claimable indexer allocations",
            IE012 => "Failed to claim allocation rebates",
            IE013 => "Failed to allocate: insufficient free stake",
            IE014 => "Failed to allocate: allocation ID collision",
            IE015 => "Failed to close allocation",
            IE016 => "Failed to fetch disputable allocations",
            IE017 => "Failed to ensure default global indexing rule",
            IE018 => "Failed to query indexing status API",
            IE019 => "Failed to query proof of indexing",
            IE020 => "Failed to ensure subgraph deployment is indexing",
            IE021 => "Failed to remove subgraph deployment",
            IE022 => "Failed to reassign subgraph deployment",
            IE025 => "Failed to store POI disputes",
            IE026 => "Failed to fetch POI disputes",
            IE027 => "Failed to evaluate indexing rules",
            IE028 => "Transaction reverted",
            IE029 => "Transaction timed out",
            IE030 => "Failed to fetch operator actions",
            IE031 => "Failed to fetch indexing rules",
            IE032 => "Failed to connect to protocol contracts",
        }
    }
}

impl fmt::Display for IndexerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An error wrapped with its stable code. The cause is stringly typed so the
/// error stays cloneable for retries and logging.
#[derive(Clone, Debug)]
pub struct IndexerError {
    pub code: IndexerErrorCode,
    pub cause: Option<String>,
}

impl std::error::Error for IndexerError {}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {} ({cause})", self.code, self.code.message()),
            None => write!(f, "{}: {}", self.code, self.code.message()),
        }
    }
}

/// Wraps an error with its code and counts it.
pub fn indexer_error(code: IndexerErrorCode, cause: impl fmt::Display) -> IndexerError {
    INDEXER_ERROR_COUNT
        .with_label_values(&[&code.to_string()])
        .inc();
    IndexerError {
        code,
        cause: Some(cause.to_string()),
    }
}
