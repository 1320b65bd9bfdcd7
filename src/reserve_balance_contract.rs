//! The reserve-balance system contract.
//!
//! Lets an account reconfigure its reserve with a two-block settlement
//! delay. State lives in three storage slots per subject address, keyed
//! by the address packed into the first twenty bytes of the slot key with
//! byte 20 selecting the field.

use alloy_primitives::{address, b256, Address, Bytes, B256, U256};
use thiserror::Error;

use crate::call_tracer::CallTracer;
use crate::primitives::{Log, Transaction};
use crate::reserve_balance::DEFAULT_RESERVE_BALANCE_WEI;
use crate::state::{State, StateError};

/// Fixed system address of the contract.
pub const RESERVE_BALANCE_ADDRESS: Address =
    address!("0000000000000000000000000000000000001000");

/// Selector of `update(uint256)`.
pub const UPDATE_SELECTOR: u32 = 0x82ab890a;

/// Topic hash of `ReserveBalanceChanged(address,uint256,uint256)`.
pub const RESERVE_BALANCE_CHANGED_TOPIC: B256 =
    b256!("ecbead9d902aef6900edfcf4e3ec205b52f4f59866d086bbf0d6388fc9b30d97");

/// Blocks between an update and its settlement.
pub const DELAY_BLOCKS: u64 = 2;

// The contract's gas is determined by its sloads, sstores and events.
const COLD_SLOAD_COST: u64 = 8100;
const WARM_SSTORE_NONZERO_COST: u64 = 2900;
const EVENT_COST: u64 = 4275;
pub(crate) const UPDATE_OP_COST: u64 = COLD_SLOAD_COST + WARM_SSTORE_NONZERO_COST + EVENT_COST;
pub(crate) const FALLBACK_COST: u64 = 40_000;

const PENDING_MASK: u64 = 0x01;
const INITIALIZED_MASK: u64 = 0x02;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ReserveBalanceError {
    #[error("function is not payable")]
    ValueNonZero,
    #[error("malformed calldata")]
    InvalidInput,
    #[error("an update is already pending")]
    PendingUpdate,
    #[error("method not supported")]
    MethodNotSupported,
}

/// True for transactions that target the contract's `update` selector;
/// these get special validation and keep their contract storage effects
/// even when the reserve rule reverts them.
pub fn is_reconfiguring_transaction(tx: &Transaction) -> bool {
    tx.to == Some(RESERVE_BALANCE_ADDRESS)
        && tx.value.is_zero()
        && tx.input.len() >= 4
        && selector(&tx.input) == UPDATE_SELECTOR
}

fn selector(input: &[u8]) -> u32 {
    u32::from_be_bytes([input[0], input[1], input[2], input[3]])
}

fn slot_key(address: &Address, field: u8) -> B256 {
    let mut key = B256::ZERO;
    key.0[..20].copy_from_slice(address.as_slice());
    key.0[20] = field;
    key
}

fn abi_encode_address(address: &Address) -> B256 {
    let mut out = B256::ZERO;
    out.0[12..].copy_from_slice(address.as_slice());
    out
}

fn abi_encode_uint(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<32>())
}

/// Per-address contract state, packed across the three slots.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ReserveBalanceRecord {
    pending_value: Option<U256>,
    settled_value: U256,
    pending_block: u64,
    settled_block: u64,
}

impl Default for ReserveBalanceRecord {
    fn default() -> Self {
        Self {
            pending_value: None,
            settled_value: DEFAULT_RESERVE_BALANCE_WEI,
            pending_block: 0,
            settled_block: 0,
        }
    }
}

impl ReserveBalanceRecord {
    fn load(state: &mut State, address: &Address) -> Result<Self, StateError> {
        let packed = state.get_storage(&RESERVE_BALANCE_ADDRESS, &slot_key(address, 0x00))?;
        // First touch for this address.
        if packed.is_zero() {
            return Ok(Self::default());
        }
        let bytes = packed.0;
        let flags = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
        let pending_block = u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes"));
        let settled_block = u64::from_le_bytes(bytes[16..24].try_into().expect("8 bytes"));

        let settled_raw =
            state.get_storage(&RESERVE_BALANCE_ADDRESS, &slot_key(address, 0x01))?;
        let settled_value = U256::from_le_bytes(settled_raw.0);

        let pending_value = if flags & PENDING_MASK != 0 {
            let raw = state.get_storage(&RESERVE_BALANCE_ADDRESS, &slot_key(address, 0x02))?;
            Some(U256::from_le_bytes(raw.0))
        } else {
            None
        };

        Ok(Self {
            pending_value,
            settled_value,
            pending_block,
            settled_block,
        })
    }

    fn store(&self, state: &mut State, address: &Address) -> Result<(), StateError> {
        let flags = INITIALIZED_MASK
            | if self.pending_value.is_some() {
                PENDING_MASK
            } else {
                0
            };
        let mut packed = [0u8; 32];
        packed[0..8].copy_from_slice(&flags.to_le_bytes());
        packed[8..16].copy_from_slice(&self.pending_block.to_le_bytes());
        packed[16..24].copy_from_slice(&self.settled_block.to_le_bytes());
        state.set_storage(
            &RESERVE_BALANCE_ADDRESS,
            &slot_key(address, 0x00),
            B256::from(packed),
        )?;

        state.set_storage(
            &RESERVE_BALANCE_ADDRESS,
            &slot_key(address, 0x01),
            B256::from(self.settled_value.to_le_bytes::<32>()),
        )?;

        let pending = self.pending_value.unwrap_or_default();
        state.set_storage(
            &RESERVE_BALANCE_ADDRESS,
            &slot_key(address, 0x02),
            B256::from(pending.to_le_bytes::<32>()),
        )?;
        Ok(())
    }
}

/// Outcome of a contract invocation: the fixed gas charge plus the result.
#[derive(Debug)]
pub struct ContractOutcome {
    pub gas_cost: u64,
    pub result: Result<Bytes, ReserveBalanceError>,
}

#[derive(Debug)]
pub struct ReserveBalanceContract;

impl ReserveBalanceContract {
    /// Entry point from the call path. The account is touched so it
    /// participates in the block delta even on failure.
    pub fn run(
        state: &mut State,
        tracer: &mut dyn CallTracer,
        sender: &Address,
        msg_value: &U256,
        input: &[u8],
    ) -> Result<ContractOutcome, StateError> {
        state.add_to_balance(&RESERVE_BALANCE_ADDRESS, U256::ZERO)?;

        if input.len() < 4 {
            return Ok(ContractOutcome {
                gas_cost: FALLBACK_COST,
                result: Err(ReserveBalanceError::MethodNotSupported),
            });
        }
        match selector(input) {
            UPDATE_SELECTOR => {
                let result = Self::update_entry(state, tracer, sender, msg_value, &input[4..])?;
                Ok(ContractOutcome {
                    gas_cost: UPDATE_OP_COST,
                    result,
                })
            }
            _ => Ok(ContractOutcome {
                gas_cost: FALLBACK_COST,
                result: Err(ReserveBalanceError::MethodNotSupported),
            }),
        }
    }

    fn update_entry(
        state: &mut State,
        tracer: &mut dyn CallTracer,
        sender: &Address,
        msg_value: &U256,
        input: &[u8],
    ) -> Result<Result<Bytes, ReserveBalanceError>, StateError> {
        if !msg_value.is_zero() {
            return Ok(Err(ReserveBalanceError::ValueNonZero));
        }
        if input.len() != 32 {
            return Ok(Err(ReserveBalanceError::InvalidInput));
        }
        let mut new_value = U256::from_be_slice(input);
        if new_value.is_zero() {
            new_value = DEFAULT_RESERVE_BALANCE_WEI;
        }

        let old_value = match Self::update(state, sender, new_value)? {
            Ok(old) => old,
            Err(err) => return Ok(Err(err)),
        };

        let log = Log {
            address: RESERVE_BALANCE_ADDRESS,
            topics: vec![RESERVE_BALANCE_CHANGED_TOPIC, abi_encode_address(sender)],
            data: Bytes::from(
                [
                    abi_encode_uint(old_value).as_slice(),
                    abi_encode_uint(new_value).as_slice(),
                ]
                .concat(),
            ),
        };
        state.store_log(log.clone());
        tracer.on_log(&log);

        Ok(Ok(Bytes::from(abi_encode_uint(U256::from(1)).to_vec())))
    }

    /// Register `new_value` as the pending reserve, lazily promoting an
    /// old pending value whose delay has elapsed. Returns the previous
    /// settled value.
    pub fn update(
        state: &mut State,
        sender: &Address,
        new_value: U256,
    ) -> Result<Result<U256, ReserveBalanceError>, StateError> {
        let mut record = ReserveBalanceRecord::load(state, sender)?;

        let old_settled_value = record.settled_value;
        let block_number = state.incarnation().block;
        if let Some(pending) = record.pending_value {
            if record.pending_block + DELAY_BLOCKS <= block_number {
                record.settled_value = pending;
                record.pending_value = None;
                record.settled_block = record.pending_block;
                record.pending_block = 0;
            }
        }

        if record.pending_value.is_some() {
            return Ok(Err(ReserveBalanceError::PendingUpdate));
        }
        record.pending_value = Some(new_value);
        record.pending_block = block_number;
        record.store(state, sender)?;
        Ok(Ok(old_settled_value))
    }
}

#[derive(Debug)]
pub struct ReserveBalanceView;

impl ReserveBalanceView {
    /// The reserve in force for `address`: the pending value once its
    /// delay has elapsed, else the settled value.
    pub fn get_delayed(state: &mut State, address: &Address) -> Result<U256, StateError> {
        let record = ReserveBalanceRecord::load(state, address)?;
        if let Some(pending) = record.pending_value {
            if record.pending_block + DELAY_BLOCKS <= state.incarnation().block {
                return Ok(pending);
            }
        }
        Ok(record.settled_value)
    }
}
