//! Single-transaction execution: validation, gas purchase, EIP-7702
//! authorization processing, the EVM message, refunds, fee payment and
//! the reserve-balance gate.

use alloy_primitives::{Address, Bytes, B256, U256};

use crate::block_hash_buffer::BlockHashBuffer;
use crate::call_tracer::CallTracer;
use crate::chain::ChainContext;
use crate::evm::{delegation_designation, is_delegated, CallKind, Interpreter, Message, TxContext};
use crate::host::ExecHost;
use crate::primitives::{logs_bloom, BlockHeader, Receipt, Transaction, TxType};
use crate::reserve_balance::{can_sender_dip_into_reserve, revert_transaction};
use crate::reserve_balance_contract::{
    is_reconfiguring_transaction, ReserveBalanceContract,
};
use crate::revision::Revision;
use crate::state::State;
use crate::validate::{intrinsic_gas, validate_transaction, TransactionValidationError, ValidationError};
use crate::reserve_balance::DEFAULT_RESERVE_BALANCE_WEI;

const GAS_PER_BLOB: u64 = 131_072;
const MIN_BLOB_GAS_PRICE: u64 = 1;
const BLOB_GAS_PRICE_UPDATE_FRACTION: u64 = 3_338_477;
const PER_AUTH_EXISTING_ACCOUNT_REFUND: u64 = 12_500;

pub struct ExecuteTransaction<'a> {
    pub revision: Revision,
    pub chain_id: u64,
    pub index: u64,
    pub tx: &'a Transaction,
    pub sender: Address,
    /// Recovered authority per authorization tuple, index-aligned.
    pub authorities: &'a [Option<Address>],
    pub header: &'a BlockHeader,
    pub block_hash_buffer: &'a BlockHashBuffer,
    pub chain_context: &'a ChainContext,
    pub interpreter: &'a dyn Interpreter,
    pub log_native_transfers: bool,
}

impl std::fmt::Debug for ExecuteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteTransaction")
            .field("index", &self.index)
            .field("sender", &self.sender)
            .finish()
    }
}

/// EIP-4844 excess-gas price curve: floor * e^(excess / fraction).
fn blob_gas_price(excess_blob_gas: u64) -> U256 {
    let factor = U256::from(MIN_BLOB_GAS_PRICE);
    let numerator = U256::from(excess_blob_gas);
    let denominator = U256::from(BLOB_GAS_PRICE_UPDATE_FRACTION);
    // fake_exponential from the EIP.
    let mut i = U256::from(1u64);
    let mut output = U256::ZERO;
    let mut accum = factor * denominator;
    while !accum.is_zero() {
        output += accum;
        accum = accum * numerator / (denominator * i);
        i += U256::from(1u64);
    }
    output / denominator
}

impl ExecuteTransaction<'_> {
    pub fn run(
        &self,
        state: &mut State,
        tracer: &mut dyn CallTracer,
    ) -> Result<Receipt, TransactionValidationError> {
        let revision = self.revision;
        let tx = self.tx;
        let base_fee = self.header.base_fee_per_gas.unwrap_or_default();

        if revision.monad.is_some() {
            let use_recent = revision.reserve_uses_recent_code_hash();
            let sender_code_hash = state.code_hash_for_reserve(&self.sender, use_recent)?;
            let delegated = state.is_delegated_code_hash(&sender_code_hash)?;
            let can_dip = can_sender_dip_into_reserve(
                &self.sender,
                self.index,
                delegated,
                self.chain_context,
            );
            state
                .reserve_mut()
                .init_from_tx(self.sender, tx, base_fee, can_dip, revision);
        }

        validate_transaction(revision, self.chain_id, self.header, tx, state, &self.sender)?;

        let effective_gas_price = tx.effective_gas_price(base_fee);
        let mut upfront = U256::from(tx.gas_limit) * effective_gas_price;
        if tx.tx_type == TxType::Eip4844 {
            let blob_gas = GAS_PER_BLOB * tx.blob_versioned_hashes.len() as u64;
            upfront += U256::from(blob_gas)
                * blob_gas_price(self.header.excess_blob_gas.unwrap_or_default());
        }
        if !state.balance_at_least(&self.sender, upfront + tx.value)? {
            return Err(ValidationError::InsufficientBalance.into());
        }
        state.subtract_from_balance(&self.sender, upfront)?;

        let nonce = state.get_nonce(&self.sender)?;
        state.set_nonce(&self.sender, nonce + 1)?;

        // EIP-2929 pre-warming.
        state.access_account(&self.sender);
        if let Some(to) = &tx.to {
            state.access_account(to);
        }
        if revision.shanghai() {
            state.access_account(&self.header.beneficiary);
        }
        if revision.berlin() {
            for item in &tx.access_list {
                state.access_account(&item.address);
                for key in &item.storage_keys {
                    state.access_storage(&item.address, key);
                }
            }
        }

        let auth_refund = self.process_authorizations(state)?;

        let tx_context = TxContext {
            gas_price: effective_gas_price,
            origin: self.sender,
            beneficiary: self.header.beneficiary,
            block_number: self.header.number,
            timestamp: self.header.timestamp,
            block_gas_limit: self.header.gas_limit,
            prev_randao: self.header.prev_randao,
            chain_id: self.chain_id,
            base_fee,
            blob_base_fee: blob_gas_price(self.header.excess_blob_gas.unwrap_or_default()),
            blob_hashes: tx.blob_versioned_hashes.clone(),
        };

        let gas = tx.gas_limit - intrinsic_gas(revision, tx);
        let msg = Message {
            kind: if tx.is_create() {
                CallKind::Create
            } else {
                CallKind::Call
            },
            is_static: false,
            depth: 0,
            gas,
            recipient: tx.to.unwrap_or_default(),
            code_address: tx.to.unwrap_or_default(),
            sender: self.sender,
            value: tx.value,
            input: tx.input.clone(),
            salt: B256::ZERO,
        };

        // Envelope frame so a reserve-balance revert can discard every
        // EVM effect while keeping the gas purchase and nonce bump below.
        state.push();
        let result = {
            let mut host = ExecHost::new(
                state,
                tracer,
                self.interpreter,
                self.block_hash_buffer,
                tx_context,
                revision,
                self.log_native_transfers,
            );
            host.execute_message(&msg)
        }?;

        let reverted_by_reserve = result.status.is_success()
            && revision.monad.is_some()
            && revert_transaction(revision, state);
        if reverted_by_reserve {
            state.pop_reject();
        } else {
            state.pop_accept();
        }

        // YP g* gas refund.
        let gas_used_pre_refund = tx.gas_limit - result.gas_left;
        let refund = if result.status.is_success() {
            let quotient = if revision.london() { 5 } else { 2 };
            let counter = result.gas_refund.max(0) as u64 + auth_refund;
            counter.min(gas_used_pre_refund / quotient)
        } else {
            0
        };
        let gas_left = result.gas_left + refund;
        let gas_used = tx.gas_limit - gas_left;

        // A reverted reconfiguring transaction keeps its contract storage
        // update; the event stays dropped with the failed receipt.
        if reverted_by_reserve && is_reconfiguring_transaction(tx) {
            let mut new_value = U256::from_be_slice(&tx.input[4..36]);
            if new_value.is_zero() {
                new_value = DEFAULT_RESERVE_BALANCE_WEI;
            }
            let _ = ReserveBalanceContract::update(state, &self.sender, new_value)?;
        }

        state.add_to_balance(&self.sender, U256::from(gas_left) * effective_gas_price)?;
        let priority_fee = if revision.london() {
            effective_gas_price - base_fee
        } else {
            effective_gas_price
        };
        state.add_to_balance(
            &self.header.beneficiary,
            U256::from(gas_used) * priority_fee,
        )?;

        state.destruct_suicides();
        if revision.spurious_dragon() {
            state.destruct_touched_dead();
        }

        let logs = state.take_logs();
        let bloom = logs_bloom(&logs);
        Ok(Receipt {
            success: result.status.is_success() && !reverted_by_reserve,
            cumulative_gas_used: gas_used,
            logs,
            bloom,
        })
    }

    /// EIP-7702: apply valid authorization tuples, returning the refund
    /// earned from already-existing authority accounts.
    fn process_authorizations(
        &self,
        state: &mut State,
    ) -> Result<u64, TransactionValidationError> {
        if !self.revision.prague() || self.tx.authorization_list.is_empty() {
            return Ok(0);
        }
        let mut refund = 0u64;
        for (auth, authority) in self.tx.authorization_list.iter().zip(self.authorities) {
            let Some(authority) = authority else {
                continue;
            };
            if auth.chain_id != 0 && auth.chain_id != self.chain_id {
                continue;
            }
            if auth.nonce == u64::MAX {
                continue;
            }
            let code = state.get_code(authority)?;
            if !code.is_empty() && !is_delegated(&code) {
                continue;
            }
            if state.get_nonce(authority)? != auth.nonce {
                continue;
            }
            if !state.account_is_dead(authority)? {
                refund += PER_AUTH_EXISTING_ACCOUNT_REFUND;
            }
            state.access_account(authority);
            if auth.address == Address::ZERO {
                state.set_code(authority, Bytes::new())?;
            } else {
                state.set_code(authority, delegation_designation(&auth.address))?;
            }
            state.set_nonce(authority, auth.nonce + 1)?;
        }
        Ok(refund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_gas_price_at_zero_excess_is_min() {
        assert_eq!(blob_gas_price(0), U256::from(MIN_BLOB_GAS_PRICE));
    }

    #[test]
    fn blob_gas_price_grows_with_excess() {
        assert!(blob_gas_price(10_000_000) > blob_gas_price(0));
    }
}
