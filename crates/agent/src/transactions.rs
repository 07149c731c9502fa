// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Submission envelope for staking contract writes.
//!
//! Every write is gated on the network pause flag and operator
//! authorization, serialized per network wallet (single nonce source), and
//! retried with a bumped gas price when confirmation does not arrive in
//! time. The gas price never exceeds the configured ceiling.

use std::{sync::Arc, time::Duration};

use indexer_config::TransactionMonitoring;
use thegraph_core::alloy::primitives::U256;
use tokio::sync::{watch::Receiver, Mutex};
use tracing::{debug, info, warn};

use crate::{
    contracts::{StakingCall, StakingContract, TransactionStatus},
    errors::{indexer_error, IndexerError, IndexerErrorCode},
    metrics::TRANSACTIONS,
};

const GWEI: u64 = 1_000_000_000;

/// Outcome of a gated transaction: either confirmed on chain or skipped
/// because the gate was closed. Skips are silent; the next tick re-evaluates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionOutcome {
    Confirmed,
    Skipped,
}

#[derive(Clone)]
pub struct TransactionManager {
    contracts: Arc<dyn StakingContract>,
    config: TransactionMonitoring,
    network: String,
    paused: Receiver<bool>,
    is_operator: Receiver<bool>,
    wallet_lock: Arc<Mutex<()>>,
}

impl TransactionManager {
    pub fn new(
        contracts: Arc<dyn StakingContract>,
        config: TransactionMonitoring,
        network: String,
        paused: Receiver<bool>,
        is_operator: Receiver<bool>,
    ) -> Self {
        Self {
            contracts,
            config,
            network,
            paused,
            is_operator,
            wallet_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Executes `call`, bumping the gas price by `gas_increase_factor` each
    /// time the confirmation window elapses, up to `max_transaction_attempts`
    /// (0 = unlimited). Gas limit is re-estimated before every attempt.
    pub async fn execute(&self, call: &StakingCall) -> Result<TransactionOutcome, IndexerError> {
        if *self.paused.borrow() {
            debug!(
                protocol_network = %self.network,
                call = %call.description(),
                "Network is paused, skipping transaction"
            );
            return Ok(TransactionOutcome::Skipped);
        }
        if !*self.is_operator.borrow() {
            debug!(
                protocol_network = %self.network,
                call = %call.description(),
                "Operator is not authorized, skipping transaction"
            );
            return Ok(TransactionOutcome::Skipped);
        }

        let _guard = self.wallet_lock.lock().await;

        let gas_price_max = U256::from(self.config.gas_price_max_gwei) * U256::from(GWEI);
        let confirmation_timeout = Duration::from_secs(self.config.gas_increase_timeout_secs);

        let mut gas_price = self
            .contracts
            .gas_price()
            .await
            .map_err(|err| indexer_error(IndexerErrorCode::IE006, err))?
            .min(gas_price_max);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let estimate = self
                .contracts
                .estimate_gas(call)
                .await
                .map_err(|err| indexer_error(IndexerErrorCode::IE028, err))?;
            let gas_limit = estimate * U256::from(3u64) / U256::from(2u64);

            debug!(
                protocol_network = %self.network,
                call = %call.description(),
                %gas_limit,
                %gas_price,
                attempt,
                "Submitting transaction"
            );

            match self
                .contracts
                .send(call, gas_limit, gas_price, confirmation_timeout)
                .await
            {
                Ok(TransactionStatus::Confirmed { tx_hash }) => {
                    TRANSACTIONS
                        .with_label_values(&[&self.network, "confirmed"])
                        .inc();
                    info!(
                        protocol_network = %self.network,
                        call = %call.description(),
                        tx_hash = %tx_hash,
                        "Transaction confirmed"
                    );
                    return Ok(TransactionOutcome::Confirmed);
                }
                Ok(TransactionStatus::Reverted { tx_hash }) => {
                    TRANSACTIONS
                        .with_label_values(&[&self.network, "reverted"])
                        .inc();
                    return Err(indexer_error(
                        IndexerErrorCode::IE028,
                        format!("{} in {tx_hash}", call.description()),
                    ));
                }
                Ok(TransactionStatus::TimedOut) => {
                    if self.config.max_transaction_attempts > 0
                        && attempt >= self.config.max_transaction_attempts
                    {
                        TRANSACTIONS
                            .with_label_values(&[&self.network, "abandoned"])
                            .inc();
                        return Err(indexer_error(
                            IndexerErrorCode::IE029,
                            format!("{} after {attempt} attempts", call.description()),
                        ));
                    }
                    let bumped = bump_gas_price(gas_price, self.config.gas_increase_factor)
                        .min(gas_price_max);
                    warn!(
                        protocol_network = %self.network,
                        call = %call.description(),
                        old_gas_price = %gas_price,
                        new_gas_price = %bumped,
                        attempt,
                        "Transaction not confirmed in time, bumping gas price"
                    );
                    gas_price = bumped;
                }
                Err(err) => {
                    TRANSACTIONS
                        .with_label_values(&[&self.network, "failed"])
                        .inc();
                    return Err(indexer_error(IndexerErrorCode::IE028, err));
                }
            }
        }
    }
}

fn bump_gas_price(gas_price: U256, factor: f64) -> U256 {
    let current: u128 = gas_price.try_into().unwrap_or(u128::MAX);
    let bumped = (current as f64 * factor).ceil();
    if bumped >= u128::MAX as f64 {
        U256::from(u128::MAX)
    } else {
        U256::from(bumped as u128)
    }
}

#[cfg(test)]
mod tests {
    use thegraph_core::alloy::primitives::{Address, B256};
    use tokio::sync::watch;

    use super::*;
    use crate::test_utils::MockStakingContract;

    #[test]
    fn gas_price_bumps_by_factor() {
        let price = U256::from(10 * GWEI);
        assert_eq!(bump_gas_price(price, 1.2), U256::from(12 * GWEI));
    }

    fn manager(
        contracts: Arc<MockStakingContract>,
        paused: bool,
        authorized: bool,
    ) -> TransactionManager {
        let (paused_tx, paused_rx) = watch::channel(paused);
        let (operator_tx, operator_rx) = watch::channel(authorized);
        std::mem::forget(paused_tx);
        std::mem::forget(operator_tx);
        TransactionManager::new(
            contracts,
            TransactionMonitoring::default(),
            "eip155:1".to_string(),
            paused_rx,
            operator_rx,
        )
    }

    fn close_call() -> StakingCall {
        StakingCall::CloseAllocation {
            allocation_id: Address::ZERO,
            poi: B256::ZERO,
        }
    }

    #[tokio::test]
    async fn paused_network_skips_writes() {
        let contracts = Arc::new(MockStakingContract::default());
        let manager = manager(contracts.clone(), true, true);

        let outcome = manager.execute(&close_call()).await.unwrap();
        assert_eq!(outcome, TransactionOutcome::Skipped);
        assert!(contracts.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn unauthorized_operator_skips_writes() {
        let contracts = Arc::new(MockStakingContract::default());
        let manager = manager(contracts.clone(), false, false);

        let outcome = manager.execute(&close_call()).await.unwrap();
        assert_eq!(outcome, TransactionOutcome::Skipped);
        assert!(contracts.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn open_gate_submits_and_confirms() {
        let contracts = Arc::new(MockStakingContract::default());
        let manager = manager(contracts.clone(), false, true);

        let outcome = manager.execute(&close_call()).await.unwrap();
        assert_eq!(outcome, TransactionOutcome::Confirmed);
        assert_eq!(contracts.recorded_calls().len(), 1);
    }
}
