// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles shared by the agent's test modules.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use thegraph_core::alloy::primitives::{Address, B256, U256};

use crate::contracts::{
    AllocationState, ContractError, OnChainAllocation, StakingCall, StakingContract,
    TransactionStatus,
};

/// In-memory staking contract: reads come from the configured maps, writes
/// are recorded and confirm immediately.
pub struct MockStakingContract {
    pub calls: Mutex<Vec<StakingCall>>,
    pub paused: bool,
    pub operator_authorized: bool,
    pub capacity: U256,
    pub allocation_states: Mutex<HashMap<Address, AllocationState>>,
    pub allocations: Mutex<HashMap<Address, OnChainAllocation>>,
}

impl Default for MockStakingContract {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            paused: false,
            operator_authorized: true,
            capacity: U256::from(1_000_000_000_000_000_000_000_000u128),
            allocation_states: Mutex::new(HashMap::new()),
            allocations: Mutex::new(HashMap::new()),
        }
    }
}

impl MockStakingContract {
    pub fn with_active_allocation(self, id: Address, record: OnChainAllocation) -> Self {
        self.allocation_states
            .lock()
            .unwrap()
            .insert(id, AllocationState::Active);
        self.allocations.lock().unwrap().insert(id, record);
        self
    }

    pub fn recorded_calls(&self) -> Vec<StakingCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StakingContract for MockStakingContract {
    async fn controller_paused(&self) -> Result<bool, ContractError> {
        Ok(self.paused)
    }

    async fn is_operator(
        &self,
        _operator: Address,
        _indexer: Address,
    ) -> Result<bool, ContractError> {
        Ok(self.operator_authorized)
    }

    async fn get_allocation_state(
        &self,
        allocation: Address,
    ) -> Result<AllocationState, ContractError> {
        Ok(self
            .allocation_states
            .lock()
            .unwrap()
            .get(&allocation)
            .copied()
            .unwrap_or(AllocationState::Null))
    }

    async fn get_allocation(
        &self,
        allocation: Address,
    ) -> Result<OnChainAllocation, ContractError> {
        self.allocations
            .lock()
            .unwrap()
            .get(&allocation)
            .copied()
            .ok_or_else(|| ContractError::Read(format!("unknown allocation {allocation}")))
    }

    async fn get_indexer_capacity(&self, _indexer: Address) -> Result<U256, ContractError> {
        Ok(self.capacity)
    }

    async fn gas_price(&self) -> Result<U256, ContractError> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn estimate_gas(&self, _call: &StakingCall) -> Result<U256, ContractError> {
        Ok(U256::from(100_000u64))
    }

    async fn send(
        &self,
        call: &StakingCall,
        _gas_limit: U256,
        _gas_price: U256,
        _timeout: Duration,
    ) -> Result<TransactionStatus, ContractError> {
        self.calls.lock().unwrap().push(call.clone());
        // Mirror the state transition the contract would make.
        match call {
            StakingCall::Allocate { allocation_id, .. } => {
                self.allocation_states
                    .lock()
                    .unwrap()
                    .insert(*allocation_id, AllocationState::Active);
            }
            StakingCall::CloseAllocation { allocation_id, .. } => {
                self.allocation_states
                    .lock()
                    .unwrap()
                    .insert(*allocation_id, AllocationState::Closed);
            }
            StakingCall::ClaimMany { allocation_ids, .. } => {
                let mut states = self.allocation_states.lock().unwrap();
                for id in allocation_ids {
                    states.insert(*id, AllocationState::Claimed);
                }
            }
        }
        Ok(TransactionStatus::Confirmed {
            tx_hash: B256::ZERO,
        })
    }
}
