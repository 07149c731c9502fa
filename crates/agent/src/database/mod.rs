// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

pub mod actions;
pub mod disputes;
pub mod rules;

use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::errors::{indexer_error, IndexerError, IndexerErrorCode};

pub async fn connect(url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(url)
        .await?;
    info!("Connected to database");
    Ok(pool)
}

/// Runs the ordered migrations. Failure here is fatal: the agent must not
/// reconcile against an unknown schema.
pub async fn migrate(pool: &PgPool) -> Result<(), IndexerError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| indexer_error(IndexerErrorCode::IE001, err))
}
