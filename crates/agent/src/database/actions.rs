// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Read-only view of the operator-management action queue. Actions are
//! created and executed through the management API; the reconciler only
//! checks for approved ones to know when to stand back.

use std::{fmt, str::FromStr};

use bigdecimal::BigDecimal;
use sqlx::PgPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Queued,
    Approved,
    Pending,
    Success,
    Failed,
    Canceled,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::Queued => "queued",
            ActionStatus::Approved => "approved",
            ActionStatus::Pending => "pending",
            ActionStatus::Success => "success",
            ActionStatus::Failed => "failed",
            ActionStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ActionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ActionStatus::Queued),
            "approved" => Ok(ActionStatus::Approved),
            "pending" => Ok(ActionStatus::Pending),
            "success" => Ok(ActionStatus::Success),
            "failed" => Ok(ActionStatus::Failed),
            "canceled" => Ok(ActionStatus::Canceled),
            other => anyhow::bail!("unknown action status `{other}`"),
        }
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Action {
    pub id: i32,
    pub action_type: String,
    pub status: String,
    pub deployment_id: Option<String>,
    pub allocation_id: Option<String>,
    pub amount: Option<BigDecimal>,
    pub poi: Option<String>,
    pub source: String,
    pub reason: String,
    pub priority: i32,
    pub protocol_network: String,
}

pub async fn fetch_actions_with_status(
    pool: &PgPool,
    status: ActionStatus,
    protocol_network: &str,
) -> anyhow::Result<Vec<Action>> {
    let actions: Vec<Action> = sqlx::query_as(
        "SELECT id, action_type, status, deployment_id, allocation_id, amount, poi, source, \
                reason, priority, protocol_network \
         FROM actions WHERE status = $1 AND protocol_network = $2 \
         ORDER BY priority DESC, id ASC",
    )
    .bind(status.to_string())
    .bind(protocol_network)
    .fetch_all(pool)
    .await?;
    Ok(actions)
}
