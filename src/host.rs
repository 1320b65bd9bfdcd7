//! The host adapter: implements the callback surface the opaque
//! interpreter expects and owns the call/create orchestration around it.
//!
//! State errors raised inside a host callback are captured and replaced
//! by a sentinel so they can unwind through interpreter frames that know
//! nothing about them; the adapter rethrows the real error once the
//! interpreter returns.

use alloy_primitives::{address, b256, Address, Bytes, B256, U256};

use crate::account_state::StorageStatus;
use crate::block_hash_buffer::BlockHashBuffer;
use crate::call_tracer::CallTracer;
use crate::evm::{
    create2_address, create_address, delegation_target, AccessStatus, CallKind, EvmResult,
    Interpreter, Message, StatusCode, TxContext,
};
use crate::precompiles;
use crate::reserve_balance_contract::{ReserveBalanceContract, RESERVE_BALANCE_ADDRESS};
use crate::revision::Revision;
use crate::state::{State, StateError};
use crate::EMPTY_CODE_HASH;

/// Emitter address of the synthetic native-transfer event.
pub const NATIVE_TRANSFER_EMITTER: Address =
    address!("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee");

/// Topic hash of `Transfer(address,address,uint256)`.
pub const TRANSFER_EVENT_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

const MAX_CALL_DEPTH: u32 = 1024;
const CODE_DEPOSIT_GAS_PER_BYTE: u64 = 200;
const MAX_CODE_SIZE: usize = 24_576;

/// Callback surface expected by the interpreter.
pub trait Host {
    fn account_exists(&mut self, address: &Address) -> Result<bool, StateError>;
    fn get_storage(&mut self, address: &Address, key: &B256) -> Result<B256, StateError>;
    fn set_storage(
        &mut self,
        address: &Address,
        key: &B256,
        value: B256,
    ) -> Result<StorageStatus, StateError>;
    fn get_balance(&mut self, address: &Address) -> Result<U256, StateError>;
    fn get_code_size(&mut self, address: &Address) -> Result<usize, StateError>;
    fn get_code_hash(&mut self, address: &Address) -> Result<B256, StateError>;
    fn copy_code(
        &mut self,
        address: &Address,
        offset: usize,
        buffer: &mut [u8],
    ) -> Result<usize, StateError>;
    fn selfdestruct(
        &mut self,
        address: &Address,
        beneficiary: &Address,
    ) -> Result<bool, StateError>;
    fn call(&mut self, msg: &Message) -> Result<EvmResult, StateError>;
    fn get_tx_context(&self) -> &TxContext;
    fn get_block_hash(&self, number: u64) -> B256;
    fn emit_log(
        &mut self,
        address: &Address,
        data: &[u8],
        topics: &[B256],
    ) -> Result<(), StateError>;
    fn access_account(&mut self, address: &Address) -> AccessStatus;
    fn access_storage(&mut self, address: &Address, key: &B256) -> AccessStatus;
    fn get_transient_storage(&mut self, address: &Address, key: &B256)
        -> Result<B256, StateError>;
    fn set_transient_storage(
        &mut self,
        address: &Address,
        key: &B256,
        value: B256,
    ) -> Result<(), StateError>;
}

pub struct ExecHost<'a> {
    state: &'a mut State,
    tracer: &'a mut dyn CallTracer,
    interpreter: &'a dyn Interpreter,
    block_hash_buffer: &'a BlockHashBuffer,
    tx_context: TxContext,
    revision: Revision,
    log_native_transfers: bool,
    captured_error: Option<StateError>,
}

impl std::fmt::Debug for ExecHost<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecHost")
            .field("revision", &self.revision)
            .finish()
    }
}

impl<'a> ExecHost<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: &'a mut State,
        tracer: &'a mut dyn CallTracer,
        interpreter: &'a dyn Interpreter,
        block_hash_buffer: &'a BlockHashBuffer,
        tx_context: TxContext,
        revision: Revision,
        log_native_transfers: bool,
    ) -> Self {
        Self {
            state,
            tracer,
            interpreter,
            block_hash_buffer,
            tx_context,
            revision,
            log_native_transfers,
            captured_error: None,
        }
    }

    /// Top-level message entry; returns real errors, not the unwind
    /// sentinel.
    pub fn execute_message(&mut self, msg: &Message) -> Result<EvmResult, StateError> {
        if msg.kind.is_create() {
            self.execute_create(msg)
        } else {
            self.execute_call(msg)
        }
    }

    fn guard<T>(&mut self, result: Result<T, StateError>) -> Result<T, StateError> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                self.captured_error.get_or_insert(error);
                Err(StateError::StackUnwind)
            }
        }
    }

    fn run_interpreter(&mut self, msg: &Message, code: &[u8]) -> Result<EvmResult, StateError> {
        let interpreter = self.interpreter;
        let revision = self.revision;
        let result = interpreter.execute(self, revision, msg, code);
        if let Some(error) = self.captured_error.take() {
            return Err(error);
        }
        Ok(result)
    }

    fn execute_call(&mut self, msg: &Message) -> Result<EvmResult, StateError> {
        self.tracer.on_enter(
            msg.kind,
            msg.sender,
            Some(msg.code_address),
            msg.value,
            msg.gas,
            &msg.input,
            msg.depth,
        );
        let result = self.call_inner(msg);
        match &result {
            Ok(res) => self
                .tracer
                .on_exit(res.status, msg.gas.saturating_sub(res.gas_left), &res.output),
            Err(_) => self.tracer.on_exit(StatusCode::Failure, msg.gas, &Bytes::new()),
        }
        result
    }

    fn call_inner(&mut self, msg: &Message) -> Result<EvmResult, StateError> {
        if msg.depth >= MAX_CALL_DEPTH {
            return Ok(EvmResult::failure(StatusCode::CallDepthExceeded, msg.gas));
        }
        self.state.push();
        let result = self.call_frame(msg);
        match &result {
            Ok(res) if res.status.is_success() => self.state.pop_accept(),
            _ => self.state.pop_reject(),
        }
        result
    }

    fn call_frame(&mut self, msg: &Message) -> Result<EvmResult, StateError> {
        if msg.kind == CallKind::Call && !msg.is_static && !msg.value.is_zero() {
            if !self.state.balance_at_least(&msg.sender, msg.value)? {
                return Ok(EvmResult::failure(StatusCode::Failure, msg.gas));
            }
            self.transfer_balances(&msg.sender, &msg.recipient, msg.value)?;
        }

        if msg.recipient == RESERVE_BALANCE_ADDRESS
            && msg.kind == CallKind::Call
            && self.revision.monad.is_some()
        {
            let outcome = ReserveBalanceContract::run(
                self.state,
                self.tracer,
                &msg.sender,
                &msg.value,
                &msg.input,
            )?;
            if msg.gas < outcome.gas_cost {
                return Ok(EvmResult::failure(StatusCode::OutOfGas, 0));
            }
            return Ok(match outcome.result {
                Ok(output) => EvmResult {
                    status: StatusCode::Success,
                    gas_left: msg.gas - outcome.gas_cost,
                    gas_refund: 0,
                    output,
                    create_address: None,
                },
                Err(_) => EvmResult::failure(StatusCode::PrecompileFailure, 0),
            });
        }

        if precompiles::is_precompile(self.revision, &msg.code_address) {
            return Ok(
                match precompiles::execute(self.revision, &msg.code_address, &msg.input) {
                    Some(out) if msg.gas >= out.gas_cost => EvmResult {
                        status: StatusCode::Success,
                        gas_left: msg.gas - out.gas_cost,
                        gas_refund: 0,
                        output: out.output,
                        create_address: None,
                    },
                    Some(_) => EvmResult::failure(StatusCode::OutOfGas, 0),
                    None => EvmResult::failure(StatusCode::PrecompileFailure, 0),
                },
            );
        }

        let code = self.state.get_code(&msg.code_address)?;
        let code = match delegation_target(&code) {
            Some(target) if self.revision.prague() => {
                self.state.access_account(&target);
                self.state.get_code(&target)?
            }
            _ => code,
        };
        if code.is_empty() {
            return Ok(EvmResult::success(msg.gas));
        }
        self.run_interpreter(msg, &code)
    }

    fn execute_create(&mut self, msg: &Message) -> Result<EvmResult, StateError> {
        self.tracer.on_enter(
            msg.kind,
            msg.sender,
            None,
            msg.value,
            msg.gas,
            &msg.input,
            msg.depth,
        );
        let result = self.create_inner(msg);
        match &result {
            Ok(res) => self
                .tracer
                .on_exit(res.status, msg.gas.saturating_sub(res.gas_left), &res.output),
            Err(_) => self.tracer.on_exit(StatusCode::Failure, msg.gas, &Bytes::new()),
        }
        result
    }

    fn create_inner(&mut self, msg: &Message) -> Result<EvmResult, StateError> {
        if msg.depth >= MAX_CALL_DEPTH {
            return Ok(EvmResult::failure(StatusCode::CallDepthExceeded, msg.gas));
        }

        let nonce = self.state.get_nonce(&msg.sender)?;
        let address = match msg.kind {
            CallKind::Create => {
                // A top-level create arrives with the sender nonce already
                // bumped by the transaction prologue.
                let create_nonce = if msg.depth == 0 { nonce - 1 } else { nonce };
                create_address(&msg.sender, create_nonce)
            }
            CallKind::Create2 => create2_address(&msg.sender, &msg.salt, &msg.input),
            _ => unreachable!("create_inner only sees create kinds"),
        };

        if msg.depth > 0 {
            if !self.state.balance_at_least(&msg.sender, msg.value)? {
                return Ok(EvmResult::failure(StatusCode::Failure, msg.gas));
            }
            if nonce == u64::MAX {
                return Ok(EvmResult::failure(StatusCode::Failure, msg.gas));
            }
            self.state.set_nonce(&msg.sender, nonce + 1)?;
        }

        self.state.access_account(&address);

        let existing_nonce = self.state.get_nonce(&address)?;
        let existing_code_hash = self.state.get_code_hash(&address)?;
        let has_code =
            existing_code_hash != B256::ZERO && existing_code_hash != EMPTY_CODE_HASH;
        if existing_nonce != 0 || has_code {
            return Ok(EvmResult::failure(StatusCode::Failure, 0));
        }

        self.state.push();
        let result = self.create_frame(msg, address);
        match &result {
            Ok(res) if res.status.is_success() => self.state.pop_accept(),
            _ => self.state.pop_reject(),
        }
        result
    }

    fn create_frame(&mut self, msg: &Message, address: Address) -> Result<EvmResult, StateError> {
        self.state.create_contract(&address)?;
        if self.revision.spurious_dragon() {
            self.state.set_nonce(&address, 1)?;
        }
        if !msg.value.is_zero() {
            self.transfer_balances(&msg.sender, &address, msg.value)?;
        }

        let frame_msg = Message {
            kind: msg.kind,
            is_static: false,
            depth: msg.depth,
            gas: msg.gas,
            recipient: address,
            code_address: address,
            sender: msg.sender,
            value: msg.value,
            input: Bytes::new(),
            salt: msg.salt,
        };
        let mut result = self.run_interpreter(&frame_msg, &msg.input)?;

        if result.status.is_success() {
            let code = std::mem::take(&mut result.output);
            // EIP-3541: new code may not start with 0xef (the delegation
            // designation is written through set_code, not deployed).
            if self.revision.london() && code.first() == Some(&0xef) {
                return Ok(EvmResult::failure(StatusCode::Failure, 0));
            }
            if self.revision.spurious_dragon() && code.len() > MAX_CODE_SIZE {
                return Ok(EvmResult::failure(StatusCode::Failure, 0));
            }
            let deposit = CODE_DEPOSIT_GAS_PER_BYTE * code.len() as u64;
            if result.gas_left < deposit {
                return Ok(EvmResult::failure(StatusCode::OutOfGas, 0));
            }
            result.gas_left -= deposit;
            self.state.set_code(&address, code)?;
            result.create_address = Some(address);
        } else if result.status != StatusCode::Revert {
            // EIP-211: only revert keeps its return data.
            result.output = Bytes::new();
            result.create_address = None;
        }
        Ok(result)
    }

    fn transfer_balances(
        &mut self,
        from: &Address,
        to: &Address,
        value: U256,
    ) -> Result<(), StateError> {
        self.state.subtract_from_balance(from, value)?;
        self.state.add_to_balance(to, value)?;
        if from != to {
            self.emit_native_transfer(from, to, value)?;
        }
        Ok(())
    }

    fn emit_native_transfer(
        &mut self,
        from: &Address,
        to: &Address,
        value: U256,
    ) -> Result<(), StateError> {
        if !self.log_native_transfers || value.is_zero() {
            return Ok(());
        }
        let mut from_topic = B256::ZERO;
        from_topic.0[12..].copy_from_slice(from.as_slice());
        let mut to_topic = B256::ZERO;
        to_topic.0[12..].copy_from_slice(to.as_slice());
        let log = crate::primitives::Log {
            address: NATIVE_TRANSFER_EMITTER,
            topics: vec![TRANSFER_EVENT_TOPIC, from_topic, to_topic],
            data: Bytes::from(value.to_be_bytes::<32>().to_vec()),
        };
        self.state.store_log(log.clone());
        self.tracer.on_log(&log);
        Ok(())
    }
}

impl Host for ExecHost<'_> {
    fn account_exists(&mut self, address: &Address) -> Result<bool, StateError> {
        let result = if self.revision.spurious_dragon() {
            self.state.account_is_dead(address).map(|dead| !dead)
        } else {
            self.state.account_exists(address)
        };
        self.guard(result)
    }

    fn get_storage(&mut self, address: &Address, key: &B256) -> Result<B256, StateError> {
        let result = self.state.get_storage(address, key);
        self.guard(result)
    }

    fn set_storage(
        &mut self,
        address: &Address,
        key: &B256,
        value: B256,
    ) -> Result<StorageStatus, StateError> {
        let result = self.state.set_storage(address, key, value);
        self.guard(result)
    }

    fn get_balance(&mut self, address: &Address) -> Result<U256, StateError> {
        let result = self.state.get_balance(address);
        self.guard(result)
    }

    fn get_code_size(&mut self, address: &Address) -> Result<usize, StateError> {
        let result = self.state.get_code(address).map(|code| code.len());
        self.guard(result)
    }

    fn get_code_hash(&mut self, address: &Address) -> Result<B256, StateError> {
        let result = self.state.get_code_hash(address);
        self.guard(result)
    }

    fn copy_code(
        &mut self,
        address: &Address,
        offset: usize,
        buffer: &mut [u8],
    ) -> Result<usize, StateError> {
        let code = {
            let result = self.state.get_code(address);
            self.guard(result)?
        };
        if offset >= code.len() {
            return Ok(0);
        }
        let n = buffer.len().min(code.len() - offset);
        buffer[..n].copy_from_slice(&code[offset..offset + n]);
        Ok(n)
    }

    fn selfdestruct(
        &mut self,
        address: &Address,
        beneficiary: &Address,
    ) -> Result<bool, StateError> {
        let revision = self.revision;
        let result = self.state.selfdestruct(address, beneficiary, revision);
        let (applied, transferred) = self.guard(result)?;
        self.tracer
            .on_self_destruct(*address, *beneficiary, transferred);
        if applied && address != beneficiary {
            let result = self.emit_native_transfer(address, beneficiary, transferred);
            self.guard(result)?;
        }
        Ok(applied)
    }

    fn call(&mut self, msg: &Message) -> Result<EvmResult, StateError> {
        let result = self.execute_message(msg);
        self.guard(result)
    }

    fn get_tx_context(&self) -> &TxContext {
        &self.tx_context
    }

    fn get_block_hash(&self, number: u64) -> B256 {
        self.block_hash_buffer.get(number)
    }

    fn emit_log(
        &mut self,
        address: &Address,
        data: &[u8],
        topics: &[B256],
    ) -> Result<(), StateError> {
        let log = crate::primitives::Log {
            address: *address,
            topics: topics.to_vec(),
            data: Bytes::copy_from_slice(data),
        };
        self.state.store_log(log.clone());
        self.tracer.on_log(&log);
        Ok(())
    }

    fn access_account(&mut self, address: &Address) -> AccessStatus {
        if precompiles::precompile_warm(self.revision, address) {
            return AccessStatus::Warm;
        }
        self.state.access_account(address)
    }

    fn access_storage(&mut self, address: &Address, key: &B256) -> AccessStatus {
        self.state.access_storage(address, key)
    }

    fn get_transient_storage(
        &mut self,
        address: &Address,
        key: &B256,
    ) -> Result<B256, StateError> {
        let result = self.state.get_transient_storage(address, key);
        self.guard(result)
    }

    fn set_transient_storage(
        &mut self,
        address: &Address,
        key: &B256,
        value: B256,
    ) -> Result<(), StateError> {
        let result = self.state.set_transient_storage(address, key, value);
        self.guard(result)
    }
}
