// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Typed surface over the protocol contracts.
//!
//! The reconciler talks to [`StakingContract`]; the ethers-backed
//! [`ContractClient`] is the production implementation, tests substitute
//! their own. Writes are primitive sends; the retry and gas-bump policy
//! lives in [`crate::transactions`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use ethers::{
    abi::Abi,
    contract::Contract,
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer},
    types::{Bytes as EthersBytes, H160, U256 as EthersU256},
};
use indexer_config::ContractAddresses;
use reqwest::Url;
use thegraph_core::{
    alloy::primitives::{Address, B256, U256},
    DeploymentId,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("contract read failed: {0}")]
    Read(String),
    #[error("gas estimation failed: {0}")]
    Estimate(String),
    #[error("transaction submission failed: {0}")]
    Send(String),
}

/// Allocation lifecycle as reported by the staking contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationState {
    Null,
    Active,
    Closed,
    Finalized,
    Claimed,
}

impl TryFrom<u8> for AllocationState {
    type Error = ContractError;

    fn try_from(value: u8) -> Result<Self, ContractError> {
        match value {
            0 => Ok(AllocationState::Null),
            1 => Ok(AllocationState::Active),
            2 => Ok(AllocationState::Closed),
            3 => Ok(AllocationState::Finalized),
            4 => Ok(AllocationState::Claimed),
            other => Err(ContractError::Read(format!(
                "unknown allocation state {other}"
            ))),
        }
    }
}

/// The fields of the on-chain allocation record the reconciler cross-checks.
#[derive(Clone, Copy, Debug)]
pub struct OnChainAllocation {
    pub indexer: Address,
    pub tokens: U256,
    pub created_at_epoch: u64,
    pub closed_at_epoch: u64,
}

/// A write against the staking contract.
#[derive(Clone, Debug)]
pub enum StakingCall {
    Allocate {
        indexer: Address,
        deployment: DeploymentId,
        tokens: U256,
        allocation_id: Address,
        metadata: B256,
        proof: Vec<u8>,
    },
    CloseAllocation {
        allocation_id: Address,
        poi: B256,
    },
    ClaimMany {
        allocation_ids: Vec<Address>,
        restake: bool,
    },
}

impl StakingCall {
    pub fn description(&self) -> String {
        match self {
            StakingCall::Allocate {
                deployment,
                allocation_id,
                ..
            } => format!("allocate({deployment}, {allocation_id})"),
            StakingCall::CloseAllocation { allocation_id, .. } => {
                format!("closeAllocation({allocation_id})")
            }
            StakingCall::ClaimMany { allocation_ids, .. } => {
                format!("claimMany({} allocations)", allocation_ids.len())
            }
        }
    }
}

/// Terminal state of one submission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Confirmed { tx_hash: B256 },
    Reverted { tx_hash: B256 },
    TimedOut,
}

#[async_trait]
pub trait StakingContract: Send + Sync {
    async fn controller_paused(&self) -> Result<bool, ContractError>;
    async fn is_operator(&self, operator: Address, indexer: Address)
        -> Result<bool, ContractError>;
    async fn get_allocation_state(
        &self,
        allocation: Address,
    ) -> Result<AllocationState, ContractError>;
    async fn get_allocation(
        &self,
        allocation: Address,
    ) -> Result<OnChainAllocation, ContractError>;
    async fn get_indexer_capacity(&self, indexer: Address) -> Result<U256, ContractError>;
    async fn gas_price(&self) -> Result<U256, ContractError>;
    async fn estimate_gas(&self, call: &StakingCall) -> Result<U256, ContractError>;
    /// Submits `call` and waits up to `timeout` for a receipt.
    async fn send(
        &self,
        call: &StakingCall,
        gas_limit: U256,
        gas_price: U256,
        timeout: Duration,
    ) -> Result<TransactionStatus, ContractError>;
}

type OperatorMiddleware = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Production implementation backed by an Ethereum JSON-RPC provider and the
/// operator wallet derived from the configured mnemonic.
pub struct ContractClient {
    staking: Contract<OperatorMiddleware>,
    controller: Contract<OperatorMiddleware>,
    client: Arc<OperatorMiddleware>,
}

impl ContractClient {
    pub fn connect(
        provider_url: &Url,
        chain_id: u64,
        mnemonic: &str,
        addresses: ContractAddresses,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(provider_url.as_str())?;
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(mnemonic)
            .build()?
            .with_chain_id(chain_id);
        let client = Arc::new(SignerMiddleware::new(provider, wallet));

        let staking_abi: Abi = ethers::abi::parse_abi(&[
            "function isOperator(address operator, address indexer) view returns (bool)",
            "function getAllocationState(address allocationID) view returns (uint8)",
            "function getAllocation(address allocationID) view returns ((address,bytes32,uint256,uint256,uint256,uint256,uint256,uint256))",
            "function getIndexerCapacity(address indexer) view returns (uint256)",
            "function allocateFrom(address indexer, bytes32 subgraphDeploymentID, uint256 tokens, address allocationID, bytes32 metadata, bytes proof)",
            "function closeAllocation(address allocationID, bytes32 poi)",
            "function claimMany(address[] allocationID, bool restake)",
        ])?;
        let controller_abi: Abi =
            ethers::abi::parse_abi(&["function paused() view returns (bool)"])?;

        Ok(Self {
            staking: Contract::new(
                to_ethers_address(addresses.staking),
                staking_abi,
                client.clone(),
            ),
            controller: Contract::new(
                to_ethers_address(addresses.controller),
                controller_abi,
                client.clone(),
            ),
            client,
        })
    }

    pub fn operator_address(&self) -> Address {
        from_ethers_address(self.client.signer().address())
    }

    fn staking_call(
        &self,
        call: &StakingCall,
    ) -> Result<ethers::contract::FunctionCall<Arc<OperatorMiddleware>, OperatorMiddleware, ()>, ContractError>
    {
        let method = match call {
            StakingCall::Allocate {
                indexer,
                deployment,
                tokens,
                allocation_id,
                metadata,
                proof,
            } => self.staking.method::<_, ()>(
                "allocateFrom",
                (
                    to_ethers_address(*indexer),
                    deployment.0 .0,
                    to_ethers_u256(*tokens),
                    to_ethers_address(*allocation_id),
                    metadata.0,
                    EthersBytes::from(proof.clone()),
                ),
            ),
            StakingCall::CloseAllocation { allocation_id, poi } => self
                .staking
                .method::<_, ()>("closeAllocation", (to_ethers_address(*allocation_id), poi.0)),
            StakingCall::ClaimMany {
                allocation_ids,
                restake,
            } => self.staking.method::<_, ()>(
                "claimMany",
                (
                    allocation_ids
                        .iter()
                        .map(|id| to_ethers_address(*id))
                        .collect::<Vec<_>>(),
                    *restake,
                ),
            ),
        };
        method.map_err(|err| ContractError::Send(err.to_string()))
    }
}

#[async_trait]
impl StakingContract for ContractClient {
    async fn controller_paused(&self) -> Result<bool, ContractError> {
        self.controller
            .method::<_, bool>("paused", ())
            .map_err(|err| ContractError::Read(err.to_string()))?
            .call()
            .await
            .map_err(|err| ContractError::Read(err.to_string()))
    }

    async fn is_operator(
        &self,
        operator: Address,
        indexer: Address,
    ) -> Result<bool, ContractError> {
        self.staking
            .method::<_, bool>(
                "isOperator",
                (to_ethers_address(operator), to_ethers_address(indexer)),
            )
            .map_err(|err| ContractError::Read(err.to_string()))?
            .call()
            .await
            .map_err(|err| ContractError::Read(err.to_string()))
    }

    async fn get_allocation_state(
        &self,
        allocation: Address,
    ) -> Result<AllocationState, ContractError> {
        let state: u8 = self
            .staking
            .method("getAllocationState", to_ethers_address(allocation))
            .map_err(|err| ContractError::Read(err.to_string()))?
            .call()
            .await
            .map_err(|err| ContractError::Read(err.to_string()))?;
        AllocationState::try_from(state)
    }

    async fn get_allocation(
        &self,
        allocation: Address,
    ) -> Result<OnChainAllocation, ContractError> {
        type AllocationTuple = (
            H160,
            [u8; 32],
            EthersU256,
            EthersU256,
            EthersU256,
            EthersU256,
            EthersU256,
            EthersU256,
        );
        let record: AllocationTuple = self
            .staking
            .method("getAllocation", to_ethers_address(allocation))
            .map_err(|err| ContractError::Read(err.to_string()))?
            .call()
            .await
            .map_err(|err| ContractError::Read(err.to_string()))?;
        Ok(OnChainAllocation {
            indexer: from_ethers_address(record.0),
            tokens: from_ethers_u256(record.2),
            created_at_epoch: record.3.as_u64(),
            closed_at_epoch: record.4.as_u64(),
        })
    }

    async fn get_indexer_capacity(&self, indexer: Address) -> Result<U256, ContractError> {
        let capacity: EthersU256 = self
            .staking
            .method("getIndexerCapacity", to_ethers_address(indexer))
            .map_err(|err| ContractError::Read(err.to_string()))?
            .call()
            .await
            .map_err(|err| ContractError::Read(err.to_string()))?;
        Ok(from_ethers_u256(capacity))
    }

    async fn gas_price(&self) -> Result<U256, ContractError> {
        let price = self
            .client
            .get_gas_price()
            .await
            .map_err(|err| ContractError::Read(err.to_string()))?;
        Ok(from_ethers_u256(price))
    }

    async fn estimate_gas(&self, call: &StakingCall) -> Result<U256, ContractError> {
        let estimate = self
            .staking_call(call)?
            .estimate_gas()
            .await
            .map_err(|err| ContractError::Estimate(err.to_string()))?;
        Ok(from_ethers_u256(estimate))
    }

    async fn send(
        &self,
        call: &StakingCall,
        gas_limit: U256,
        gas_price: U256,
        timeout: Duration,
    ) -> Result<TransactionStatus, ContractError> {
        let method = self
            .staking_call(call)?
            .gas(to_ethers_u256(gas_limit))
            .gas_price(to_ethers_u256(gas_price));
        let pending = method
            .send()
            .await
            .map_err(|err| ContractError::Send(err.to_string()))?;

        match tokio::time::timeout(timeout, pending).await {
            // Confirmation did not arrive within the gas bump window.
            Err(_) => Ok(TransactionStatus::TimedOut),
            // Dropped from the mempool.
            Ok(Ok(None)) => Ok(TransactionStatus::TimedOut),
            Ok(Ok(Some(receipt))) => {
                let tx_hash = B256::from(receipt.transaction_hash.0);
                if receipt.status == Some(1u64.into()) {
                    Ok(TransactionStatus::Confirmed { tx_hash })
                } else {
                    Ok(TransactionStatus::Reverted { tx_hash })
                }
            }
            Ok(Err(err)) => Err(ContractError::Send(err.to_string())),
        }
    }
}

pub fn to_ethers_address(address: Address) -> H160 {
    H160::from_slice(address.as_slice())
}

pub fn from_ethers_address(address: H160) -> Address {
    Address::from_slice(address.as_bytes())
}

pub fn to_ethers_u256(value: U256) -> EthersU256 {
    EthersU256(value.into_limbs())
}

pub fn from_ethers_u256(value: EthersU256) -> U256 {
    U256::from_limbs(value.0)
}
