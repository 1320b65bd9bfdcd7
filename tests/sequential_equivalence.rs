//! Parallel execution must be observationally identical to sequential
//! execution in transaction index order.

mod common;

use alloy_primitives::{Address, U256};
use common::{address_of, signer, transfer_tx, TestChain};

const MON: u64 = 1_000_000_000_000_000_000;

#[test]
fn chained_transfers_through_empty_account() {
    // T1: A -> B (10 wei) where B starts empty, T2: B -> C (10 wei).
    // T2 can only succeed with T1's credit, so the parallel run must
    // retry it against the merged state.
    let a = signer(1);
    let b = signer(2);
    let c_address = Address::repeat_byte(0xcc);

    let alloc = [(address_of(&a), U256::from(100u64))];
    let txns = || {
        vec![
            transfer_tx(&a, 0, address_of(&b), U256::from(10u64)),
            transfer_tx(&b, 0, c_address, U256::from(10u64)),
        ]
    };

    let mut parallel = TestChain::new(&alloc);
    let (parallel_output, parallel_root) = parallel.execute_block(txns(), None).unwrap();

    let mut sequential = TestChain::sequential(&alloc);
    let (sequential_output, sequential_root) = sequential.execute_block(txns(), None).unwrap();

    assert_eq!(parallel_root, sequential_root);
    assert_eq!(parallel_output.receipts, sequential_output.receipts);
    assert!(parallel_output.receipts.iter().all(|r| r.success));

    assert_eq!(parallel.balance(&address_of(&a)), U256::from(90u64));
    assert_eq!(parallel.balance(&address_of(&b)), U256::ZERO);
    assert_eq!(parallel.balance(&c_address), U256::from(10u64));
    // B was left empty (zero balance, zero nonce would be dead, but the
    // nonce advanced) so the account survives.
    assert_eq!(parallel.nonce(&address_of(&b)), 1);
}

#[test]
fn randomized_transfer_batch_matches_sequential() {
    let keys: Vec<_> = (0..12u8).map(signer).collect();
    let alloc: Vec<(Address, U256)> = keys
        .iter()
        .map(|key| (address_of(key), U256::from(20u64) * U256::from(MON)))
        .collect();

    // Heavily conflicting batch: everyone pays the next signer twice.
    let build = || {
        let mut txns = Vec::new();
        for round in 0..2u64 {
            for (i, key) in keys.iter().enumerate() {
                let to = address_of(&keys[(i + 1) % keys.len()]);
                txns.push(transfer_tx(key, round, to, U256::from(1_000u64 + i as u64)));
            }
        }
        txns
    };

    let mut parallel = TestChain::new(&alloc);
    let (parallel_output, parallel_root) = parallel.execute_block(build(), None).unwrap();

    let mut sequential = TestChain::sequential(&alloc);
    let (sequential_output, sequential_root) = sequential.execute_block(build(), None).unwrap();

    assert_eq!(parallel_root, sequential_root);
    assert_eq!(parallel_output.receipts, sequential_output.receipts);
    assert_eq!(parallel_output.gas_used, sequential_output.gas_used);
}

#[test]
fn receipts_accumulate_gas_in_order() {
    let keys: Vec<_> = (20..24u8).map(signer).collect();
    let alloc: Vec<(Address, U256)> = keys
        .iter()
        .map(|key| (address_of(key), U256::from(MON)))
        .collect();
    let mut chain = TestChain::new(&alloc);
    let txns = keys
        .iter()
        .map(|key| transfer_tx(key, 0, Address::repeat_byte(0x99), U256::from(1u64)))
        .collect();
    let (output, _) = chain.execute_block(txns, None).unwrap();

    let mut expected = 0u64;
    for receipt in &output.receipts {
        expected += 21_000;
        assert_eq!(receipt.cumulative_gas_used, expected);
    }
}
