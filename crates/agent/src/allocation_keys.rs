// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Ephemeral allocation keys.
//!
//! Every new allocation is identified by the address of a one-shot key
//! derived from the operator mnemonic. Derivation is deterministic over
//! (epoch, deployment, existing allocation ids), so an abandoned transaction
//! re-derives the same id next tick, while a confirmed one changes the
//! input set and yields a fresh id. Keys are used to sign the ownership
//! proof once and then dropped; nothing is persisted.

use anyhow::anyhow;
use ethers::{
    signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer},
    types::H256,
    utils::keccak256,
};
use thegraph_core::{alloy::primitives::Address, DeploymentId};

use crate::contracts::from_ethers_address;

/// Salts tried before giving up on finding a collision-free address.
const MAX_COLLISION_ATTEMPTS: u64 = 100;

/// Derives the allocation key for (epoch, deployment) that does not collide
/// with any existing active allocation id.
pub fn derive_allocation_key(
    mnemonic: &str,
    epoch: u64,
    deployment: &DeploymentId,
    existing: &[Address],
) -> anyhow::Result<LocalWallet> {
    for salt in 0..MAX_COLLISION_ATTEMPTS {
        let wallet = derive_salted_key(mnemonic, epoch, deployment, existing, salt)?;
        let address = from_ethers_address(wallet.address());
        if !existing.contains(&address) {
            return Ok(wallet);
        }
    }
    Err(anyhow!(
        "failed to derive a collision-free allocation key for {deployment} at epoch {epoch}"
    ))
}

fn derive_salted_key(
    mnemonic: &str,
    epoch: u64,
    deployment: &DeploymentId,
    existing: &[Address],
    salt: u64,
) -> anyhow::Result<LocalWallet> {
    let mut input = Vec::new();
    input.extend_from_slice(&epoch.to_be_bytes());
    input.extend_from_slice(deployment.to_string().as_bytes());
    for id in existing {
        input.extend_from_slice(id.as_slice());
    }
    input.extend_from_slice(&salt.to_be_bytes());
    let digest = keccak256(&input);

    // Map the digest onto a non-hardened BIP-32 path; u16 segments keep every
    // index well under 2^31.
    let segment = |i: usize| u16::from_be_bytes([digest[2 * i], digest[2 * i + 1]]);
    let path = format!(
        "m/{}/{}/{}/{}",
        segment(0),
        segment(1),
        segment(2),
        segment(3)
    );

    MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .derivation_path(&path)?
        .build()
        .map_err(|err| anyhow!("failed to derive allocation key: {err}"))
}

/// The allocation id is the address of its key.
pub fn allocation_id(wallet: &LocalWallet) -> Address {
    from_ethers_address(wallet.address())
}

/// Proof of control of the allocation key:
/// `sign(keccak256(indexer ++ allocationId))` by the allocation key itself.
pub fn allocation_proof(
    wallet: &LocalWallet,
    indexer: Address,
    allocation: Address,
) -> anyhow::Result<Vec<u8>> {
    let mut message = Vec::with_capacity(40);
    message.extend_from_slice(indexer.as_slice());
    message.extend_from_slice(allocation.as_slice());
    let digest = H256::from(keccak256(&message));
    let signature = wallet.sign_hash(digest)?;
    Ok(signature.to_vec())
}

#[cfg(test)]
mod tests {
    use test_assets::{DEPLOYMENT_A, DEPLOYMENT_B, INDEXER_ADDRESS, INDEXER_OPERATOR_MNEMONIC};

    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_allocation_key(INDEXER_OPERATOR_MNEMONIC, 953, &DEPLOYMENT_A, &[]).unwrap();
        let b = derive_allocation_key(INDEXER_OPERATOR_MNEMONIC, 953, &DEPLOYMENT_A, &[]).unwrap();
        assert_eq!(allocation_id(&a), allocation_id(&b));
    }

    #[test]
    fn inputs_change_the_derived_id() {
        let base = derive_allocation_key(INDEXER_OPERATOR_MNEMONIC, 953, &DEPLOYMENT_A, &[]).unwrap();
        let other_epoch =
            derive_allocation_key(INDEXER_OPERATOR_MNEMONIC, 954, &DEPLOYMENT_A, &[]).unwrap();
        let other_deployment =
            derive_allocation_key(INDEXER_OPERATOR_MNEMONIC, 953, &DEPLOYMENT_B, &[]).unwrap();
        assert_ne!(allocation_id(&base), allocation_id(&other_epoch));
        assert_ne!(allocation_id(&base), allocation_id(&other_deployment));
    }

    #[test]
    fn collisions_are_salted_away() {
        let first = derive_allocation_key(INDEXER_OPERATOR_MNEMONIC, 953, &DEPLOYMENT_A, &[]).unwrap();
        let first_id = allocation_id(&first);

        // Pretend the first id is already an active allocation.
        let second =
            derive_allocation_key(INDEXER_OPERATOR_MNEMONIC, 953, &DEPLOYMENT_A, &[first_id])
                .unwrap();
        assert_ne!(allocation_id(&second), first_id);
    }

    #[test]
    fn proof_is_a_65_byte_signature() {
        let wallet = derive_allocation_key(INDEXER_OPERATOR_MNEMONIC, 953, &DEPLOYMENT_A, &[]).unwrap();
        let proof =
            allocation_proof(&wallet, *INDEXER_ADDRESS, allocation_id(&wallet)).unwrap();
        assert_eq!(proof.len(), 65);
    }
}
