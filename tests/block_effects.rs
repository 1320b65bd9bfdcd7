//! Block-level effects: withdrawals, the BLOCKHASH window, transient
//! storage isolation, create semantics and native-transfer logs.

mod common;

use alloy_primitives::{Address, Bytes, B256, U256};
use common::{address_of, sign_tx, signer, transfer_tx, ScriptInterpreter, TestChain};
use monad_exec::{
    create_address, Db, EvmResult, Host, Message, Revision, StatusCode, Transaction, TxType,
    Withdrawal, CHAIN_ID_DEVNET, EMPTY_CODE_HASH, NATIVE_TRANSFER_EMITTER,
    TRANSFER_EVENT_TOPIC,
};
use std::sync::Arc;

const MON: u64 = 1_000_000_000_000_000_000;
const CONTRACT: Address = Address::repeat_byte(0xca);

fn word(byte: u8) -> B256 {
    let mut out = B256::ZERO;
    out.0[31] = byte;
    out
}

const SLOT_SAME_TXN: B256 = B256::ZERO;
fn slot(byte: u8) -> B256 {
    word(byte)
}

fn call_contract_tx(key: &k256::ecdsa::SigningKey, nonce: u64, input: Vec<u8>) -> Transaction {
    sign_tx(
        Transaction {
            tx_type: TxType::Legacy,
            chain_id: Some(CHAIN_ID_DEVNET),
            nonce,
            gas_price: U256::ZERO,
            gas_limit: 200_000,
            to: Some(CONTRACT),
            input: Bytes::from(input),
            ..Transaction::default()
        },
        key,
    )
}

#[test]
fn withdrawals_credit_recipients_at_block_end() {
    let recipient = Address::repeat_byte(0xdd);
    let other = Address::repeat_byte(0xde);
    let mut chain = TestChain::new(&[]);
    let withdrawals = vec![
        Withdrawal {
            index: 0,
            validator_index: 7,
            address: recipient,
            amount: 3,
        },
        Withdrawal {
            index: 1,
            validator_index: 8,
            address: other,
            amount: 5,
        },
        Withdrawal {
            index: 2,
            validator_index: 7,
            address: recipient,
            amount: 2,
        },
    ];
    chain.execute_block(Vec::new(), Some(withdrawals)).unwrap();

    // Amounts are denominated in gwei.
    assert_eq!(chain.balance(&recipient), U256::from(5_000_000_000u64));
    assert_eq!(chain.balance(&other), U256::from(5_000_000_000u64));
}

fn blockhash_script(
    host: &mut dyn Host,
    _revision: Revision,
    msg: &Message,
    _code: &[u8],
) -> EvmResult {
    let number = host.get_tx_context().block_number;
    let parent = host.get_block_hash(number - 1);
    let current = host.get_block_hash(number);
    host.set_storage(&msg.recipient, &slot(1), parent).unwrap();
    host.set_storage(&msg.recipient, &slot(2), current).unwrap();
    EvmResult::success(msg.gas)
}

#[test]
fn blockhash_returns_parent_and_zero_for_current() {
    let sender = signer(1);
    let mut chain = TestChain::with_options(
        &[(address_of(&sender), U256::from(MON))],
        &[(CONTRACT, Bytes::from(vec![0x60, 0x00]))],
        2,
        4,
    );
    chain.interpreter = Arc::new(ScriptInterpreter(blockhash_script));
    let genesis_hash = chain.parent.hash();

    chain
        .execute_block(vec![call_contract_tx(&sender, 0, vec![1])], None)
        .unwrap();

    assert_eq!(chain.storage(&CONTRACT, &slot(1)), genesis_hash);
    assert_eq!(chain.storage(&CONTRACT, &slot(2)), B256::ZERO);
}

fn transient_script(
    host: &mut dyn Host,
    _revision: Revision,
    msg: &Message,
    _code: &[u8],
) -> EvmResult {
    let key = slot(9);
    match msg.input.first().copied() {
        Some(1) => {
            host.set_transient_storage(&msg.recipient, &key, word(7)).unwrap();
            let seen = host.get_transient_storage(&msg.recipient, &key).unwrap();
            host.set_storage(&msg.recipient, &SLOT_SAME_TXN, seen).unwrap();
        }
        _ => {
            let seen = host.get_transient_storage(&msg.recipient, &key).unwrap();
            let marker = if seen.is_zero() { word(0xff) } else { seen };
            host.set_storage(&msg.recipient, &slot(3), marker).unwrap();
        }
    }
    EvmResult::success(msg.gas)
}

#[test]
fn transient_storage_is_cleared_between_transactions() {
    let t1 = signer(1);
    let t2 = signer(2);
    let mut chain = TestChain::with_options(
        &[
            (address_of(&t1), U256::from(MON)),
            (address_of(&t2), U256::from(MON)),
        ],
        &[(CONTRACT, Bytes::from(vec![0x60, 0x00]))],
        2,
        4,
    );
    chain.interpreter = Arc::new(ScriptInterpreter(transient_script));

    chain
        .execute_block(
            vec![
                call_contract_tx(&t1, 0, vec![1]),
                call_contract_tx(&t2, 0, vec![2]),
            ],
            None,
        )
        .unwrap();

    // Visible within the writing transaction...
    assert_eq!(chain.storage(&CONTRACT, &SLOT_SAME_TXN), word(7));
    // ...but cleared before the next one.
    assert_eq!(chain.storage(&CONTRACT, &slot(3)), word(0xff));
}

fn create_revert_script(
    _host: &mut dyn Host,
    _revision: Revision,
    msg: &Message,
    _code: &[u8],
) -> EvmResult {
    EvmResult {
        status: StatusCode::Revert,
        gas_left: msg.gas,
        gas_refund: 0,
        output: Bytes::from_static(b"why it failed"),
        create_address: None,
    }
}

fn create_deploy_script(
    _host: &mut dyn Host,
    _revision: Revision,
    msg: &Message,
    _code: &[u8],
) -> EvmResult {
    EvmResult {
        status: StatusCode::Success,
        gas_left: msg.gas,
        gas_refund: 0,
        output: Bytes::from(vec![0xaa; 10]),
        create_address: None,
    }
}

fn create_tx(key: &k256::ecdsa::SigningKey, nonce: u64) -> Transaction {
    sign_tx(
        Transaction {
            tx_type: TxType::Legacy,
            chain_id: Some(CHAIN_ID_DEVNET),
            nonce,
            gas_price: U256::ZERO,
            gas_limit: 200_000,
            to: None,
            input: Bytes::from(vec![0x01]),
            ..Transaction::default()
        },
        key,
    )
}

#[test]
fn create_revert_preserves_return_data() {
    let sender = signer(1);
    let mut chain = TestChain::new(&[(address_of(&sender), U256::from(MON))]);
    chain.interpreter = Arc::new(ScriptInterpreter(create_revert_script));

    let (output, _) = chain
        .execute_block(vec![create_tx(&sender, 0)], None)
        .unwrap();

    assert!(!output.receipts[0].success);
    let frame = &output.call_frames[0][0];
    assert_eq!(frame.status, StatusCode::Revert);
    assert_eq!(frame.output.as_ref(), b"why it failed");

    // The would-be contract does not exist.
    let created = create_address(&address_of(&sender), 0);
    assert_eq!(chain.balance(&created), U256::ZERO);
    assert_eq!(chain.nonce(&created), 0);
}

#[test]
fn create_deploys_returned_code() {
    let sender = signer(1);
    let mut chain = TestChain::new(&[(address_of(&sender), U256::from(MON))]);
    chain.interpreter = Arc::new(ScriptInterpreter(create_deploy_script));

    let (output, _) = chain
        .execute_block(vec![create_tx(&sender, 0)], None)
        .unwrap();
    assert!(output.receipts[0].success);

    let created = create_address(&address_of(&sender), 0);
    let account = chain
        .db
        .read_account(&created)
        .unwrap()
        .expect("deployed");
    assert_ne!(account.code_hash, EMPTY_CODE_HASH);
    assert_eq!(account.nonce, 1);
}

#[test]
fn native_transfer_logs_skip_self_and_zero() {
    let a = signer(1);
    let b = signer(2);
    let c = signer(3);
    let mut chain = TestChain::new(&[
        (address_of(&a), U256::from(MON)),
        (address_of(&b), U256::from(MON)),
        (address_of(&c), U256::from(MON)),
    ]);
    chain.log_native_transfers = true;

    let (output, _) = chain
        .execute_block(
            vec![
                transfer_tx(&a, 0, Address::repeat_byte(0x11), U256::from(5u64)),
                transfer_tx(&b, 0, address_of(&b), U256::from(5u64)),
                transfer_tx(&c, 0, Address::repeat_byte(0x11), U256::ZERO),
            ],
            None,
        )
        .unwrap();

    // Ordinary transfer emits the synthetic event.
    let logs = &output.receipts[0].logs;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].address, NATIVE_TRANSFER_EMITTER);
    assert_eq!(logs[0].topics[0], TRANSFER_EVENT_TOPIC);
    assert_eq!(logs[0].data.as_ref(), &U256::from(5u64).to_be_bytes::<32>());

    // Self-transfer and zero-value transfer stay silent.
    assert!(output.receipts[1].logs.is_empty());
    assert!(output.receipts[2].logs.is_empty());
}
