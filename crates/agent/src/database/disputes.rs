// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! POI dispute persistence. Disputes are written once per allocation id;
//! storing the same batch repeatedly yields the same rows.

use std::{collections::HashSet, fmt, str::FromStr};

use anyhow::anyhow;
use bigdecimal::BigDecimal;
use sqlx::PgPool;
use thegraph_core::alloy::primitives::Address;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisputeStatus {
    Potential,
    Valid,
    ReferenceUnavailable,
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisputeStatus::Potential => "potential",
            DisputeStatus::Valid => "valid",
            DisputeStatus::ReferenceUnavailable => "reference_unavailable",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DisputeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "potential" => Ok(DisputeStatus::Potential),
            "valid" => Ok(DisputeStatus::Valid),
            "reference_unavailable" => Ok(DisputeStatus::ReferenceUnavailable),
            other => anyhow::bail!("unknown dispute status `{other}`"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoiDispute {
    /// 42-character `0x` hex allocation address; primary key.
    pub allocation_id: String,
    pub subgraph_deployment_id: String,
    pub allocation_indexer: String,
    pub allocation_amount: BigDecimal,
    pub allocation_proof: String,
    pub closed_epoch: i64,
    pub closed_epoch_start_block_hash: Option<String>,
    pub closed_epoch_start_block_number: Option<i64>,
    pub closed_epoch_reference_proof: Option<String>,
    pub previous_epoch_start_block_hash: Option<String>,
    pub previous_epoch_start_block_number: Option<i64>,
    pub previous_epoch_reference_proof: Option<String>,
    pub status: DisputeStatus,
    pub protocol_network: String,
}

fn validate(dispute: &PoiDispute) -> anyhow::Result<()> {
    Address::from_str(&dispute.allocation_id)
        .map_err(|err| anyhow!("invalid allocation id `{}`: {err}", dispute.allocation_id))?;
    Address::from_str(&dispute.allocation_indexer).map_err(|err| {
        anyhow!(
            "invalid indexer address `{}`: {err}",
            dispute.allocation_indexer
        )
    })?;
    Ok(())
}

/// Stores `disputes` in one transaction, upserting by allocation id, and
/// returns the persisted set. Any invalid record aborts the whole batch.
pub async fn store_poi_disputes(
    pool: &PgPool,
    disputes: &[PoiDispute],
) -> anyhow::Result<Vec<PoiDispute>> {
    for dispute in disputes {
        validate(dispute).map_err(|err| {
            anyhow!("Failed to store pending POI disputes: {err}")
        })?;
    }

    let mut tx = pool.begin().await?;
    for dispute in disputes {
        sqlx::query(
            "INSERT INTO poi_disputes \
                 (allocation_id, subgraph_deployment_id, allocation_indexer, allocation_amount, \
                  allocation_proof, closed_epoch, closed_epoch_start_block_hash, \
                  closed_epoch_start_block_number, closed_epoch_reference_proof, \
                  previous_epoch_start_block_hash, previous_epoch_start_block_number, \
                  previous_epoch_reference_proof, status, protocol_network) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (allocation_id) DO UPDATE \
                 SET status = EXCLUDED.status, updated_at = now()",
        )
        .bind(dispute.allocation_id.to_lowercase())
        .bind(&dispute.subgraph_deployment_id)
        .bind(dispute.allocation_indexer.to_lowercase())
        .bind(&dispute.allocation_amount)
        .bind(&dispute.allocation_proof)
        .bind(dispute.closed_epoch)
        .bind(&dispute.closed_epoch_start_block_hash)
        .bind(dispute.closed_epoch_start_block_number)
        .bind(&dispute.closed_epoch_reference_proof)
        .bind(&dispute.previous_epoch_start_block_hash)
        .bind(dispute.previous_epoch_start_block_number)
        .bind(&dispute.previous_epoch_reference_proof)
        .bind(dispute.status.to_string())
        .bind(&dispute.protocol_network)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    Ok(disputes.to_vec())
}

/// Allocation ids (lowercase) that already have a dispute row.
pub async fn fetch_disputed_allocation_ids(
    pool: &PgPool,
    protocol_network: &str,
) -> anyhow::Result<HashSet<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT allocation_id FROM poi_disputes WHERE protocol_network = $1")
            .bind(protocol_network)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id.to_lowercase()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispute(allocation_id: &str, indexer: &str) -> PoiDispute {
        PoiDispute {
            allocation_id: allocation_id.to_string(),
            subgraph_deployment_id: "QmbvTyvmxqHLahZwS7fZtVWGM85VCpCiKHiagPxQJp5ktS".to_string(),
            allocation_indexer: indexer.to_string(),
            allocation_amount: BigDecimal::from(5000),
            allocation_proof:
                "0xdb5b142ba36abbd98d41ebe627d96e7fffb8d79a3f2f25c70a9724e6cdc39ad4".to_string(),
            closed_epoch: 203,
            closed_epoch_start_block_hash: Some(
                "0x675e9411241c431570d07b920321b2ff6aed2359aa8e26109905d34bffd8932a".to_string(),
            ),
            closed_epoch_start_block_number: Some(848484),
            closed_epoch_reference_proof: Some(
                "0xd04b5601739a1638719696d0735c92439267a89248c6fd21388d9600f5c942f6".to_string(),
            ),
            previous_epoch_start_block_hash: Some(
                "0x3c8b08bf4cdd4f2dc258b3f24cee24af9aeee68e048cc0d0119e379aa1608eb0".to_string(),
            ),
            previous_epoch_start_block_number: Some(848155),
            previous_epoch_reference_proof: Some(
                "0x6cc304e1f1a5c547fc587cd68b2fcb43e04b1a45afab3884984c8c028c7e1530".to_string(),
            ),
            status: DisputeStatus::Potential,
            protocol_network: "eip155:1".to_string(),
        }
    }

    #[test]
    fn invalid_indexer_address_is_rejected() {
        let bad = dispute(
            "0xfa44c72b753a66591f241c7dc04e8178c30e13af",
            "0xCOFFEECOFFEECOFFEE",
        );
        let err = validate(&bad).unwrap_err();
        assert!(err.to_string().contains("invalid indexer address"));
    }

    #[test]
    fn status_round_trips() {
        for status in ["potential", "valid", "reference_unavailable"] {
            assert_eq!(DisputeStatus::from_str(status).unwrap().to_string(), status);
        }
    }

    /// Needs a live Postgres; run with `DATABASE_URL` set.
    #[ignore]
    #[sqlx::test(migrations = "./migrations")]
    async fn storing_disputes_is_idempotent(pool: PgPool) {
        let disputes = vec![
            dispute(
                "0xfa44c72b753a66591f241c7dc04e8178c30e13af",
                "0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c",
            ),
            dispute(
                "0xa171cd12c3dde7eb8fe7717a0bcd06f3ffa65658",
                "0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c",
            ),
        ];

        for _ in 0..3 {
            let stored = store_poi_disputes(&pool, &disputes).await.unwrap();
            assert_eq!(stored.len(), 2);
        }

        let ids = fetch_disputed_allocation_ids(&pool, "eip155:1").await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    /// Needs a live Postgres; run with `DATABASE_URL` set.
    #[ignore]
    #[sqlx::test(migrations = "./migrations")]
    async fn invalid_batch_stores_nothing(pool: PgPool) {
        let disputes = vec![
            dispute(
                "0xfa44c72b753a66591f241c7dc04e8178c30e13af",
                "0xd75c4dbcb215a6cf9097cfbcc70aab2596b96a9c",
            ),
            dispute(
                "0xa171cd12c3dde7eb8fe7717a0bcd06f3ffa65658",
                "0xCOFFEECOFFEECOFFEE",
            ),
        ];

        let err = store_poi_disputes(&pool, &disputes).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("Failed to store pending POI disputes"));

        let ids = fetch_disputed_allocation_ids(&pool, "eip155:1").await.unwrap();
        assert!(ids.is_empty());
    }
}
