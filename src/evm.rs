//! Types at the boundary to the opaque EVM interpreter.
//!
//! The interpreter itself (bytecode dispatch, gas metering inside a
//! frame) is an external collaborator behind the [`Interpreter`] trait;
//! everything the interpreter needs from the chain goes through the
//! [`crate::Host`] callback surface.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::Encodable;

use crate::revision::Revision;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallKind {
    #[default]
    Call,
    DelegateCall,
    CallCode,
    StaticCall,
    Create,
    Create2,
    /// Synthetic kind used only by call tracers.
    SelfDestruct,
}

impl CallKind {
    pub const fn is_create(self) -> bool {
        matches!(self, Self::Create | Self::Create2)
    }
}

/// Frame outcome classification. Failures other than revert consume all
/// remaining gas; both are ordinary receipts, never errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusCode {
    #[default]
    Success,
    Revert,
    OutOfGas,
    InvalidInstruction,
    StaticModeViolation,
    PrecompileFailure,
    CallDepthExceeded,
    Failure,
}

impl StatusCode {
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessStatus {
    Cold,
    Warm,
}

#[derive(Clone, Debug, Default)]
pub struct Message {
    pub kind: CallKind,
    pub is_static: bool,
    pub depth: u32,
    pub gas: u64,
    /// Account whose storage and balance the frame operates on.
    pub recipient: Address,
    /// Account whose code executes; differs from `recipient` for
    /// DELEGATECALL and CALLCODE.
    pub code_address: Address,
    pub sender: Address,
    pub value: U256,
    pub input: Bytes,
    pub salt: B256,
}

#[derive(Clone, Debug)]
pub struct EvmResult {
    pub status: StatusCode,
    pub gas_left: u64,
    pub gas_refund: i64,
    pub output: Bytes,
    pub create_address: Option<Address>,
}

impl EvmResult {
    pub fn success(gas_left: u64) -> Self {
        Self {
            status: StatusCode::Success,
            gas_left,
            gas_refund: 0,
            output: Bytes::new(),
            create_address: None,
        }
    }

    pub fn failure(status: StatusCode, gas_left: u64) -> Self {
        debug_assert!(!status.is_success());
        Self {
            status,
            gas_left,
            gas_refund: 0,
            output: Bytes::new(),
            create_address: None,
        }
    }
}

/// Per-transaction context served to the interpreter.
#[derive(Clone, Debug, Default)]
pub struct TxContext {
    pub gas_price: U256,
    pub origin: Address,
    pub beneficiary: Address,
    pub block_number: u64,
    pub timestamp: u64,
    pub block_gas_limit: u64,
    pub prev_randao: B256,
    pub chain_id: u64,
    pub base_fee: U256,
    pub blob_base_fee: U256,
    pub blob_hashes: Vec<B256>,
}

/// The opaque EVM. Implementations run `code` in the context of `msg`,
/// calling back into the host for every state interaction.
pub trait Interpreter: Send + Sync {
    fn execute(
        &self,
        host: &mut dyn crate::host::Host,
        revision: Revision,
        msg: &Message,
        code: &[u8],
    ) -> EvmResult;
}

/// Interpreter that treats all bytecode as a no-op. Value transfers,
/// precompiles and system contracts still work since those run host-side;
/// useful for transfer-only workloads and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopInterpreter;

impl Interpreter for NoopInterpreter {
    fn execute(
        &self,
        _host: &mut dyn crate::host::Host,
        _revision: Revision,
        msg: &Message,
        _code: &[u8],
    ) -> EvmResult {
        EvmResult::success(msg.gas)
    }
}

/// EIP-7702 delegation designation prefix.
pub const DELEGATION_PREFIX: [u8; 3] = [0xef, 0x01, 0x00];

pub fn is_delegated(code: &[u8]) -> bool {
    code.len() == 23 && code.starts_with(&DELEGATION_PREFIX)
}

pub fn delegation_target(code: &[u8]) -> Option<Address> {
    if is_delegated(code) {
        Some(Address::from_slice(&code[3..23]))
    } else {
        None
    }
}

pub fn delegation_designation(address: &Address) -> Bytes {
    let mut code = Vec::with_capacity(23);
    code.extend_from_slice(&DELEGATION_PREFIX);
    code.extend_from_slice(address.as_slice());
    Bytes::from(code)
}

/// CREATE address: keccak256(rlp([sender, nonce]))[12..].
pub fn create_address(sender: &Address, nonce: u64) -> Address {
    let mut payload = Vec::with_capacity(30);
    sender.encode(&mut payload);
    nonce.encode(&mut payload);
    let mut buf = Vec::with_capacity(payload.len() + 1);
    alloy_rlp::Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut buf);
    buf.extend_from_slice(&payload);
    Address::from_slice(&keccak256(&buf)[12..])
}

/// CREATE2 address: keccak256(0xff ++ sender ++ salt ++ keccak256(init))[12..].
pub fn create2_address(sender: &Address, salt: &B256, init_code: &[u8]) -> Address {
    let init_hash = keccak256(init_code);
    let mut buf = Vec::with_capacity(85);
    buf.push(0xff);
    buf.extend_from_slice(sender.as_slice());
    buf.extend_from_slice(salt.as_slice());
    buf.extend_from_slice(init_hash.as_slice());
    Address::from_slice(&keccak256(&buf)[12..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn known_create_address() {
        // cow address vector from the yellow paper examples.
        let sender = address!("0f572e5295c57f15886f9b263e2f6d2d6c7b5ec6");
        let created = create_address(&sender, 0);
        assert_eq!(created, address!("343c43a37d37dff08ae8c4a11544c718abb4fcf8"));
    }

    #[test]
    fn delegation_roundtrip() {
        let target = address!("00000000000000000000000000000000000000aa");
        let code = delegation_designation(&target);
        assert!(is_delegated(&code));
        assert_eq!(delegation_target(&code), Some(target));
        assert_eq!(delegation_target(&[0u8; 23]), None);
    }
}
