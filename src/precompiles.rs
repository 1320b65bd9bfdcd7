//! Standard precompiled contracts dispatched host-side.
//!
//! ecrecover, SHA-256 and identity are implemented; the remaining
//! reserved addresses are recognized (and therefore always warm) but
//! return empty success, leaving a production interpreter to provide the
//! full set.

use alloy_primitives::{Address, Bytes, B256, U256};
use sha2::{Digest, Sha256};

use crate::recover::recover_address;
use crate::revision::{EvmRevision, Revision};

#[derive(Clone, Debug)]
pub(crate) struct PrecompileOutput {
    pub gas_cost: u64,
    pub output: Bytes,
}

const ECRECOVER_GAS: u64 = 3000;
const SHA256_BASE_GAS: u64 = 60;
const SHA256_WORD_GAS: u64 = 12;
const IDENTITY_BASE_GAS: u64 = 15;
const IDENTITY_WORD_GAS: u64 = 3;

fn precompile_index(address: &Address) -> Option<u8> {
    let bytes = address.as_slice();
    if bytes[..19].iter().all(|b| *b == 0) && bytes[19] != 0 {
        Some(bytes[19])
    } else {
        None
    }
}

pub(crate) fn is_precompile(revision: Revision, address: &Address) -> bool {
    let Some(index) = precompile_index(address) else {
        return false;
    };
    let max = if revision.evm_at_least(EvmRevision::Prague) {
        0x11
    } else if revision.cancun() {
        0x0a
    } else if revision.evm_at_least(EvmRevision::Istanbul) {
        0x09
    } else if revision.evm_at_least(EvmRevision::Byzantium) {
        0x08
    } else {
        0x04
    };
    index <= max
}

fn words(len: usize) -> u64 {
    (len as u64).div_ceil(32)
}

/// Run the precompile at `address`. `None` signals a precompile failure
/// (all gas is consumed by the caller).
pub(crate) fn execute(
    revision: Revision,
    address: &Address,
    input: &[u8],
) -> Option<PrecompileOutput> {
    debug_assert!(is_precompile(revision, address));
    let index = precompile_index(address).expect("checked by caller");
    match index {
        0x01 => Some(ecrecover(input)),
        0x02 => Some(PrecompileOutput {
            gas_cost: SHA256_BASE_GAS + SHA256_WORD_GAS * words(input.len()),
            output: Bytes::copy_from_slice(Sha256::digest(input).as_slice()),
        }),
        0x04 => Some(PrecompileOutput {
            gas_cost: IDENTITY_BASE_GAS + IDENTITY_WORD_GAS * words(input.len()),
            output: Bytes::copy_from_slice(input),
        }),
        _ => Some(PrecompileOutput {
            gas_cost: 0,
            output: Bytes::new(),
        }),
    }
}

fn ecrecover(input: &[u8]) -> PrecompileOutput {
    let mut padded = [0u8; 128];
    let len = input.len().min(128);
    padded[..len].copy_from_slice(&input[..len]);

    let hash = B256::from_slice(&padded[0..32]);
    let v = U256::from_be_slice(&padded[32..64]);
    let r = U256::from_be_slice(&padded[64..96]);
    let s = U256::from_be_slice(&padded[96..128]);

    // Invalid signatures yield empty output, not failure.
    let empty = PrecompileOutput {
        gas_cost: ECRECOVER_GAS,
        output: Bytes::new(),
    };
    if v != U256::from(27) && v != U256::from(28) {
        return empty;
    }
    let odd = v == U256::from(28);
    match recover_address(&hash, odd, r, s) {
        Some(address) => {
            let mut output = [0u8; 32];
            output[12..].copy_from_slice(address.as_slice());
            PrecompileOutput {
                gas_cost: ECRECOVER_GAS,
                output: Bytes::copy_from_slice(&output),
            }
        }
        None => empty,
    }
}

/// Addresses always treated as warm under EIP-2929.
pub(crate) fn precompile_warm(revision: Revision, address: &Address) -> bool {
    is_precompile(revision, address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn precompile_ranges_follow_revisions() {
        let frontier = Revision::new(EvmRevision::Frontier, None);
        let cancun = Revision::new(EvmRevision::Cancun, None);
        let blake = address!("0000000000000000000000000000000000000009");
        let point_eval = address!("000000000000000000000000000000000000000a");
        assert!(!is_precompile(frontier, &blake));
        assert!(is_precompile(cancun, &blake));
        assert!(is_precompile(cancun, &point_eval));
        assert!(!is_precompile(cancun, &address!("0000000000000000000000000000000000000000")));
    }

    #[test]
    fn identity_copies_input() {
        let cancun = Revision::new(EvmRevision::Cancun, None);
        let out = execute(cancun, &address!("0000000000000000000000000000000000000004"), b"abc")
            .unwrap();
        assert_eq!(out.output.as_ref(), b"abc");
        assert_eq!(out.gas_cost, IDENTITY_BASE_GAS + IDENTITY_WORD_GAS);
    }

    #[test]
    fn sha256_digest() {
        let cancun = Revision::new(EvmRevision::Cancun, None);
        let out = execute(cancun, &address!("0000000000000000000000000000000000000002"), b"")
            .unwrap();
        assert_eq!(
            alloy_primitives::hex::encode(&out.output),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn ecrecover_rejects_bad_v() {
        let out = ecrecover(&[0u8; 128]);
        assert!(out.output.is_empty());
        assert_eq!(out.gas_cost, ECRECOVER_GAS);
    }
}
