// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Per-network mutation surface: indexing rule bookkeeping and the
//! allocation writes the reconciler decides on. All on-chain writes go
//! through the gated transaction manager.

use std::{sync::Arc, time::Duration};

use bigdecimal::BigDecimal;
use indexer_allocation::Allocation;
use indexer_config::{grt_to_wei, NetworkSpecification};
use indexer_watcher::new_watcher;
use sqlx::PgPool;
use thegraph_core::{
    alloy::primitives::{Address, B256, U256},
    DeploymentId,
};
use tokio::sync::watch::Receiver;
use tracing::{debug, info, warn};

use crate::{
    allocation_keys::{allocation_id, allocation_proof, derive_allocation_key},
    contracts::{AllocationState, StakingCall, StakingContract},
    database::{
        actions::{fetch_actions_with_status, Action, ActionStatus},
        rules::{ensure_global_rule, fetch_rules, IndexingRule},
    },
    errors::{indexer_error, IndexerError, IndexerErrorCode},
    network::Network,
    query_fees::QueryFeeCollector,
    transactions::{TransactionManager, TransactionOutcome},
};

const RULES_REFRESH_INTERVAL: Duration = Duration::from_secs(20);

/// Attempts to find an allocation id the contract reports as Null before
/// giving up on an open.
const MAX_ID_ATTEMPTS: usize = 5;

pub struct Operator {
    pub(crate) pool: PgPool,
    pub specification: Arc<NetworkSpecification>,
    pub(crate) transactions: TransactionManager,
    pub(crate) contracts: Arc<dyn StakingContract>,
    pub(crate) collector: Arc<dyn QueryFeeCollector>,
    /// Merged indexing rules, refreshed every 20 s.
    pub rules: Receiver<Vec<IndexingRule>>,
}

impl Operator {
    pub async fn create(
        pool: PgPool,
        network: &Network,
        collector: Arc<dyn QueryFeeCollector>,
    ) -> anyhow::Result<Self> {
        let specification = network.specification.clone();

        let transactions = TransactionManager::new(
            network.contracts.clone(),
            specification.transaction_monitoring.clone(),
            specification.network_identifier.clone(),
            network.paused.clone(),
            network.is_operator.clone(),
        );

        // Seed the global fallback rule before anything reads the rules.
        let default_amount =
            grt_to_wei(&specification.indexer_options.default_allocation_amount)?;
        ensure_global_rule(
            &pool,
            &specification.network_identifier,
            BigDecimal::from(default_amount.to_string().parse::<u128>()?),
        )
        .await?;

        let rules = {
            let pool = pool.clone();
            let network_id = specification.network_identifier.clone();
            new_watcher(RULES_REFRESH_INTERVAL, move || {
                let pool = pool.clone();
                let network_id = network_id.clone();
                async move { fetch_rules(&pool, &network_id, true).await }
            })
            .await?
        };

        Ok(Self {
            pool,
            specification,
            transactions,
            contracts: network.contracts.clone(),
            collector,
            rules,
        })
    }

    pub fn network_id(&self) -> &str {
        &self.specification.network_identifier
    }

    /// Idempotent: inserts the default global rule if the row is missing.
    pub async fn ensure_global_indexing_rule(&self) -> Result<(), IndexerError> {
        let default_amount = grt_to_wei(&self.specification.indexer_options.default_allocation_amount)
            .map_err(|err| indexer_error(IndexerErrorCode::IE017, err))?;
        let amount: BigDecimal = default_amount
            .to_string()
            .parse()
            .map_err(|err| indexer_error(IndexerErrorCode::IE017, err))?;
        ensure_global_rule(&self.pool, self.network_id(), amount)
            .await
            .map_err(|err| indexer_error(IndexerErrorCode::IE017, err))
    }

    /// Fresh rule fetch; `merged` folds the global rule into scoped ones.
    pub async fn indexing_rules(&self, merged: bool) -> Result<Vec<IndexingRule>, IndexerError> {
        fetch_rules(&self.pool, self.network_id(), merged)
            .await
            .map_err(|err| indexer_error(IndexerErrorCode::IE031, err))
    }

    pub async fn fetch_actions(&self, status: ActionStatus) -> Result<Vec<Action>, IndexerError> {
        fetch_actions_with_status(&self.pool, status, self.network_id())
            .await
            .map_err(|err| indexer_error(IndexerErrorCode::IE030, err))
    }

    /// Opens up to `parallel` allocations of `amount` tokens each against
    /// `deployment`, threading every new id into the existing set so derived
    /// ids stay unique. Returns the ids actually opened.
    pub async fn create_allocations(
        &self,
        deployment: DeploymentId,
        amount: U256,
        parallel: u32,
        current_epoch: u64,
        mut existing: Vec<Address>,
    ) -> Result<Vec<Address>, IndexerError> {
        let options = &self.specification.indexer_options;
        let indexer = options.address;
        let mut opened = Vec::new();

        for _ in 0..parallel {
            let capacity = self
                .contracts
                .get_indexer_capacity(indexer)
                .await
                .map_err(|err| indexer_error(IndexerErrorCode::IE006, err))?;
            if capacity < amount {
                let err = indexer_error(
                    IndexerErrorCode::IE013,
                    format!("capacity {capacity} below allocation amount {amount}"),
                );
                warn!(
                    protocol_network = %self.network_id(),
                    deployment = %deployment,
                    err_code = %err.code,
                    error = %err,
                    "Not enough free stake to open allocation, skipping"
                );
                break;
            }

            let mut derived = None;
            for _ in 0..MAX_ID_ATTEMPTS {
                let wallet = derive_allocation_key(
                    &options.mnemonic,
                    current_epoch,
                    &deployment,
                    &existing,
                )
                .map_err(|err| indexer_error(IndexerErrorCode::IE014, err))?;
                let id = allocation_id(&wallet);
                match self.contracts.get_allocation_state(id).await {
                    Ok(AllocationState::Null) => {
                        derived = Some((wallet, id));
                        break;
                    }
                    // The id exists on chain already; extend the input set so
                    // the next derivation lands elsewhere.
                    Ok(_) => existing.push(id),
                    Err(err) => return Err(indexer_error(IndexerErrorCode::IE006, err)),
                }
            }
            let Some((wallet, id)) = derived else {
                return Err(indexer_error(
                    IndexerErrorCode::IE014,
                    format!("no unused allocation id found for {deployment}"),
                ));
            };

            let proof = allocation_proof(&wallet, indexer, id)
                .map_err(|err| indexer_error(IndexerErrorCode::IE014, err))?;
            // The ephemeral key has served its purpose; the address lives on
            // as the allocation id.
            drop(wallet);

            let call = StakingCall::Allocate {
                indexer,
                deployment,
                tokens: amount,
                allocation_id: id,
                metadata: B256::ZERO,
                proof,
            };
            match self.transactions.execute(&call).await? {
                TransactionOutcome::Confirmed => {
                    info!(
                        protocol_network = %self.network_id(),
                        deployment = %deployment,
                        allocation = %id,
                        %amount,
                        epoch = current_epoch,
                        "Allocation opened"
                    );
                    self.collector
                        .remember_opened_allocations(self.network_id(), &[id])
                        .await;
                    existing.push(id);
                    opened.push(id);
                }
                TransactionOutcome::Skipped => return Ok(opened),
            }
        }

        Ok(opened)
    }

    /// Closes one allocation with the given POI. Returns whether a close was
    /// actually submitted: an allocation no longer Active on chain is
    /// skipped.
    pub async fn close_allocation(
        &self,
        allocation: &Allocation,
        poi: B256,
    ) -> Result<bool, IndexerError> {
        match self.contracts.get_allocation_state(allocation.id).await {
            Ok(AllocationState::Active) => {}
            Ok(state) => {
                debug!(
                    protocol_network = %self.network_id(),
                    allocation = %allocation.id,
                    ?state,
                    "Allocation is not active on chain, skipping close"
                );
                return Ok(false);
            }
            Err(err) => return Err(indexer_error(IndexerErrorCode::IE006, err)),
        }

        let call = StakingCall::CloseAllocation {
            allocation_id: allocation.id,
            poi,
        };
        match self
            .transactions
            .execute(&call)
            .await
            .map_err(|err| indexer_error(IndexerErrorCode::IE015, err))?
        {
            TransactionOutcome::Confirmed => {
                info!(
                    protocol_network = %self.network_id(),
                    allocation = %allocation.id,
                    deployment = %allocation.subgraph_deployment.id,
                    poi = %poi,
                    "Allocation closed"
                );
                self.collector
                    .remember_closed_allocations(self.network_id(), &[allocation.id])
                    .await;
                Ok(true)
            }
            TransactionOutcome::Skipped => Ok(false),
        }
    }

    /// Claims query-fee rebates for closed allocations, batched: only
    /// allocations above the per-allocation threshold are considered, and
    /// the batch is only submitted once its total passes the batch
    /// threshold.
    pub async fn claim_rebates(&self, claimable: &[Allocation]) -> Result<(), IndexerError> {
        let options = &self.specification.indexer_options;
        let threshold = grt_to_wei(&options.rebate_claim_threshold)
            .map_err(|err| indexer_error(IndexerErrorCode::IE012, err))?;
        let batch_threshold = grt_to_wei(&options.rebate_claim_batch_threshold)
            .map_err(|err| indexer_error(IndexerErrorCode::IE012, err))?;

        let mut worthwhile: Vec<&Allocation> = claimable
            .iter()
            .filter(|allocation| {
                allocation.query_fees_collected.unwrap_or(U256::ZERO) >= threshold
            })
            .collect();
        if worthwhile.is_empty() {
            return Ok(());
        }
        worthwhile.sort_by(|a, b| {
            b.query_fees_collected
                .unwrap_or(U256::ZERO)
                .cmp(&a.query_fees_collected.unwrap_or(U256::ZERO))
        });
        worthwhile.truncate(options.rebate_claim_max_batch_size);

        let total: U256 = worthwhile
            .iter()
            .map(|allocation| allocation.query_fees_collected.unwrap_or(U256::ZERO))
            .fold(U256::ZERO, |acc, fees| acc + fees);
        if total < batch_threshold {
            debug!(
                protocol_network = %self.network_id(),
                %total,
                %batch_threshold,
                claimable = worthwhile.len(),
                "Aggregate query fees below batch threshold, deferring rebate claim"
            );
            return Ok(());
        }

        let allocation_ids: Vec<Address> =
            worthwhile.iter().map(|allocation| allocation.id).collect();
        let call = StakingCall::ClaimMany {
            allocation_ids: allocation_ids.clone(),
            restake: options.restake_rewards,
        };
        match self.transactions.execute(&call).await? {
            TransactionOutcome::Confirmed => {
                info!(
                    protocol_network = %self.network_id(),
                    allocations = allocation_ids.len(),
                    %total,
                    "Claimed query-fee rebates"
                );
            }
            TransactionOutcome::Skipped => {}
        }
        Ok(())
    }
}
