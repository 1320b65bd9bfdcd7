//! Static block and transaction validation.

use alloy_primitives::U256;
use thiserror::Error;

use crate::evm::is_delegated;
use crate::primitives::{BlockHeader, Transaction, TxType};
use crate::revision::Revision;
use crate::state::{State, StateError};
use crate::EMPTY_CODE_HASH;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("wrong nonce: expected {expected}, got {got}")]
    WrongNonce { expected: u64, got: u64 },
    #[error("sender is not an eoa")]
    SenderNotEoa,
    #[error("insufficient balance to cover gas and value")]
    InsufficientBalance,
    #[error("gas limit below intrinsic gas")]
    IntrinsicGasGreaterThanLimit,
    #[error("transaction gas limit above block gas limit")]
    GasLimitAboveBlock,
    #[error("max fee per gas below base fee")]
    MaxFeeLessThanBase,
    #[error("priority fee above max fee")]
    PriorityFeeGreaterThanMax,
    #[error("wrong chain id")]
    WrongChainId,
    #[error("sender recovery failed")]
    MissingSender,
    #[error("transaction type not activated")]
    TypeNotSupported,
    #[error("blob transaction missing blobs or recipient")]
    MalformedBlobTransaction,
    #[error("set-code transaction missing authorizations or recipient")]
    MalformedSetCodeTransaction,
    #[error("init code above size cap")]
    InitCodeTooLarge,
    #[error("wrong block number: expected {expected}, got {got}")]
    WrongBlockNumber { expected: u64, got: u64 },
    #[error("timestamp not after parent")]
    TimestampNotIncreasing,
    #[error("gas limit out of bounds")]
    GasLimitOutOfBounds,
    #[error("gas used above gas limit")]
    GasUsedAboveLimit,
    #[error("wrong base fee: expected {expected}, got {got}")]
    WrongBaseFee { expected: U256, got: U256 },
    #[error("block decode error: {0}")]
    Decode(String),
}

const TX_BASE_GAS: u64 = 21_000;
const TX_CREATE_GAS: u64 = 32_000;
const TX_DATA_ZERO_GAS: u64 = 4;
const TX_DATA_NONZERO_GAS_FRONTIER: u64 = 68;
const TX_DATA_NONZERO_GAS_ISTANBUL: u64 = 16;
const ACCESS_LIST_ADDRESS_GAS: u64 = 2_400;
const ACCESS_LIST_KEY_GAS: u64 = 1_900;
const INITCODE_WORD_GAS: u64 = 2;
const AUTHORIZATION_GAS: u64 = 25_000;
const MAX_INITCODE_SIZE: usize = 2 * 24_576;

/// YP g0: gas charged before any execution happens.
pub fn intrinsic_gas(revision: Revision, tx: &Transaction) -> u64 {
    let mut gas = TX_BASE_GAS;
    if tx.is_create() && revision.evm_at_least(crate::revision::EvmRevision::Homestead) {
        gas += TX_CREATE_GAS;
    }
    let nonzero_gas = if revision.evm_at_least(crate::revision::EvmRevision::Istanbul) {
        TX_DATA_NONZERO_GAS_ISTANBUL
    } else {
        TX_DATA_NONZERO_GAS_FRONTIER
    };
    for byte in tx.input.iter() {
        gas += if *byte == 0 {
            TX_DATA_ZERO_GAS
        } else {
            nonzero_gas
        };
    }
    if revision.berlin() {
        for item in &tx.access_list {
            gas += ACCESS_LIST_ADDRESS_GAS;
            gas += ACCESS_LIST_KEY_GAS * item.storage_keys.len() as u64;
        }
    }
    if tx.is_create() && revision.shanghai() {
        gas += INITCODE_WORD_GAS * (tx.input.len() as u64).div_ceil(32);
    }
    if revision.prague() {
        gas += AUTHORIZATION_GAS * tx.authorization_list.len() as u64;
    }
    gas
}

/// Static checks against the sender's current state. The upfront balance
/// check happens implicitly when the gas is bought.
pub fn validate_transaction(
    revision: Revision,
    chain_id: u64,
    header: &BlockHeader,
    tx: &Transaction,
    state: &mut State,
    sender: &alloy_primitives::Address,
) -> Result<(), TransactionValidationError> {
    match tx.tx_type {
        TxType::Legacy => {}
        TxType::Eip2930 if revision.berlin() => {}
        TxType::Eip1559 if revision.london() => {}
        TxType::Eip4844 if revision.cancun() => {}
        TxType::Eip7702 if revision.prague() => {}
        _ => return Err(ValidationError::TypeNotSupported.into()),
    }

    if let Some(tx_chain_id) = tx.chain_id {
        if tx_chain_id != chain_id {
            return Err(ValidationError::WrongChainId.into());
        }
    }

    if tx.gas_limit > header.gas_limit {
        return Err(ValidationError::GasLimitAboveBlock.into());
    }
    if tx.gas_limit < intrinsic_gas(revision, tx) {
        return Err(ValidationError::IntrinsicGasGreaterThanLimit.into());
    }
    if tx.is_create() && revision.shanghai() && tx.input.len() > MAX_INITCODE_SIZE {
        return Err(ValidationError::InitCodeTooLarge.into());
    }

    let base_fee = header.base_fee_per_gas.unwrap_or_default();
    if tx.max_fee() < base_fee {
        return Err(ValidationError::MaxFeeLessThanBase.into());
    }
    if tx.tx_type.is_dynamic_fee()
        && tx.max_priority_fee_per_gas.unwrap_or_default() > tx.max_fee_per_gas.unwrap_or_default()
    {
        return Err(ValidationError::PriorityFeeGreaterThanMax.into());
    }

    match tx.tx_type {
        TxType::Eip4844 if tx.to.is_none() || tx.blob_versioned_hashes.is_empty() => {
            return Err(ValidationError::MalformedBlobTransaction.into());
        }
        TxType::Eip7702 if tx.to.is_none() || tx.authorization_list.is_empty() => {
            return Err(ValidationError::MalformedSetCodeTransaction.into());
        }
        _ => {}
    }

    let nonce = state.get_nonce(sender)?;
    if nonce != tx.nonce {
        return Err(ValidationError::WrongNonce {
            expected: nonce,
            got: tx.nonce,
        }
        .into());
    }

    // EIP-3607: reject transactions from accounts with deployed code,
    // except EIP-7702 delegated accounts.
    let code_hash = state.get_code_hash(sender)?;
    if !code_hash.is_zero() && code_hash != EMPTY_CODE_HASH {
        let code = state.code_by_hash(&code_hash)?;
        if !is_delegated(&code) {
            return Err(ValidationError::SenderNotEoa.into());
        }
    }

    Ok(())
}

/// Validation failures carry either a typed verdict on the transaction or
/// a fatal state error from the reads the checks performed.
#[derive(Debug, Error)]
pub enum TransactionValidationError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    State(#[from] StateError),
}

const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;
const MIN_GAS_LIMIT: u64 = 5_000;
const BASE_FEE_CHANGE_DENOMINATOR: u64 = 8;
const ELASTICITY_MULTIPLIER: u64 = 2;

/// EIP-1559 expected base fee from the parent header.
pub fn expected_base_fee(parent: &BlockHeader) -> U256 {
    let Some(parent_base_fee) = parent.base_fee_per_gas else {
        // First London block.
        return U256::from(1_000_000_000u64);
    };
    let parent_gas_target = parent.gas_limit / ELASTICITY_MULTIPLIER;
    if parent.gas_used == parent_gas_target {
        return parent_base_fee;
    }
    if parent.gas_used > parent_gas_target {
        let gas_used_delta = parent.gas_used - parent_gas_target;
        let delta = parent_base_fee * U256::from(gas_used_delta)
            / U256::from(parent_gas_target)
            / U256::from(BASE_FEE_CHANGE_DENOMINATOR);
        parent_base_fee + delta.max(U256::from(1))
    } else {
        let gas_used_delta = parent_gas_target - parent.gas_used;
        let delta = parent_base_fee * U256::from(gas_used_delta)
            / U256::from(parent_gas_target)
            / U256::from(BASE_FEE_CHANGE_DENOMINATOR);
        parent_base_fee.saturating_sub(delta)
    }
}

pub fn validate_block_header(
    revision: Revision,
    header: &BlockHeader,
    parent: &BlockHeader,
) -> Result<(), ValidationError> {
    if header.number != parent.number + 1 {
        return Err(ValidationError::WrongBlockNumber {
            expected: parent.number + 1,
            got: header.number,
        });
    }
    if header.timestamp <= parent.timestamp {
        return Err(ValidationError::TimestampNotIncreasing);
    }
    if header.gas_used > header.gas_limit {
        return Err(ValidationError::GasUsedAboveLimit);
    }

    let bound = parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR;
    if header.gas_limit >= parent.gas_limit + bound
        || header.gas_limit + bound <= parent.gas_limit
        || header.gas_limit < MIN_GAS_LIMIT
    {
        return Err(ValidationError::GasLimitOutOfBounds);
    }

    if revision.london() {
        let expected = if parent.base_fee_per_gas.is_some() || parent.number == 0 {
            expected_base_fee(parent)
        } else {
            U256::from(1_000_000_000u64)
        };
        let got = header.base_fee_per_gas.unwrap_or_default();
        if got != expected {
            return Err(ValidationError::WrongBaseFee { expected, got });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{EvmRevision, MonadRevision};

    fn revision() -> Revision {
        Revision::new(EvmRevision::Cancun, Some(MonadRevision::Four))
    }

    #[test]
    fn intrinsic_gas_counts_calldata() {
        let tx = Transaction {
            input: alloy_primitives::Bytes::from(vec![0u8, 1, 2, 0]),
            to: Some(alloy_primitives::Address::ZERO),
            ..Transaction::default()
        };
        assert_eq!(intrinsic_gas(revision(), &tx), 21_000 + 2 * 4 + 2 * 16);
    }

    #[test]
    fn base_fee_steady_at_target() {
        let parent = BlockHeader {
            gas_limit: 30_000_000,
            gas_used: 15_000_000,
            base_fee_per_gas: Some(U256::from(1_000u64)),
            ..BlockHeader::default()
        };
        assert_eq!(expected_base_fee(&parent), U256::from(1_000u64));
    }

    #[test]
    fn base_fee_rises_when_full() {
        let parent = BlockHeader {
            gas_limit: 30_000_000,
            gas_used: 30_000_000,
            base_fee_per_gas: Some(U256::from(1_000u64)),
            ..BlockHeader::default()
        };
        // Full block raises the base fee by 1/8.
        assert_eq!(expected_base_fee(&parent), U256::from(1_125u64));
    }

    #[test]
    fn header_gas_limit_bounds() {
        let parent = BlockHeader {
            number: 1,
            timestamp: 10,
            gas_limit: 30_000_000,
            ..BlockHeader::default()
        };
        let mut header = BlockHeader {
            number: 2,
            timestamp: 11,
            gas_limit: 30_000_000,
            base_fee_per_gas: Some(expected_base_fee(&parent)),
            ..BlockHeader::default()
        };
        assert!(validate_block_header(revision(), &header, &parent).is_ok());
        header.gas_limit = 40_000_000;
        assert!(matches!(
            validate_block_header(revision(), &header, &parent),
            Err(ValidationError::GasLimitOutOfBounds)
        ));
    }
}
