//! Core data model: accounts, transactions, headers, receipts and their
//! RLP encodings (signing hashes, trie leaf values, envelopes).

use alloy_primitives::{keccak256, Address, Bloom, BloomInput, Bytes, B256, B64, U256};
use alloy_rlp::{Encodable, Header, RlpEncodable, EMPTY_STRING_CODE};
use serde::{Deserialize, Serialize};

use crate::{EMPTY_CODE_HASH, EMPTY_OMMERS_HASH, EMPTY_ROOT_HASH};

/// Version tag `(block, txn)` attached to an account. Bumped when a
/// contract is created so storage reads through a stale lifetime resolve
/// to zero without consulting the database.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Incarnation {
    pub block: u64,
    pub txn: u64,
}

impl Incarnation {
    /// Sentinel transaction index for end-of-block effects (withdrawals,
    /// rewards, touched-dead cleanup).
    pub const LAST_TXN: u64 = u64::MAX;

    pub const fn new(block: u64, txn: u64) -> Self {
        Self { block, txn }
    }

    pub const fn last(block: u64) -> Self {
        Self::new(block, Self::LAST_TXN)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: U256,
    pub nonce: u64,
    pub code_hash: B256,
    pub incarnation: Incarnation,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            balance: U256::ZERO,
            nonce: 0,
            code_hash: EMPTY_CODE_HASH,
            incarnation: Incarnation::default(),
        }
    }
}

impl Account {
    pub fn has_code(&self) -> bool {
        self.code_hash != EMPTY_CODE_HASH
    }

    /// EIP-161 dead-account predicate, given that the account exists.
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() && self.nonce == 0 && !self.has_code()
    }

    /// Ethereum account RLP `[nonce, balance, storage_root, code_hash]`
    /// used for Merkle leaves.
    pub fn rlp_encoded(&self, storage_root: B256) -> Vec<u8> {
        let mut payload = Vec::with_capacity(110);
        self.nonce.encode(&mut payload);
        self.balance.encode(&mut payload);
        storage_root.encode(&mut payload);
        self.code_hash.encode(&mut payload);
        wrap_list(payload)
    }
}

/// Secp256k1 signature with the recovery parity bit. Legacy `v` values
/// are reconstructed from the parity and the transaction's chain id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub odd_y_parity: bool,
    pub r: U256,
    pub s: U256,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, Serialize, Deserialize)]
pub struct AccessListItem {
    pub address: Address,
    pub storage_keys: Vec<B256>,
}

/// EIP-7702 authorization tuple as carried in a type-4 transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAuthorization {
    pub chain_id: u64,
    pub address: Address,
    pub nonce: u64,
    pub signature: Signature,
}

/// Magic prefix of the EIP-7702 authorization signing payload.
pub const AUTHORIZATION_MAGIC: u8 = 0x05;

impl SignedAuthorization {
    /// keccak256(0x05 || rlp([chain_id, address, nonce]))
    pub fn signing_hash(&self) -> B256 {
        let mut payload = Vec::with_capacity(64);
        self.chain_id.encode(&mut payload);
        self.address.encode(&mut payload);
        self.nonce.encode(&mut payload);
        let mut buf = vec![AUTHORIZATION_MAGIC];
        buf.extend_from_slice(&wrap_list(payload));
        keccak256(&buf)
    }
}

impl Encodable for SignedAuthorization {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let mut payload = Vec::with_capacity(96);
        self.chain_id.encode(&mut payload);
        self.address.encode(&mut payload);
        self.nonce.encode(&mut payload);
        self.signature.odd_y_parity.encode(&mut payload);
        self.signature.r.encode(&mut payload);
        self.signature.s.encode(&mut payload);
        Header {
            list: true,
            payload_length: payload.len(),
        }
        .encode(out);
        out.put_slice(&payload);
    }

    fn length(&self) -> usize {
        let mut payload = Vec::with_capacity(96);
        self.encode(&mut payload);
        payload.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TxType {
    #[default]
    Legacy = 0,
    Eip2930 = 1,
    Eip1559 = 2,
    Eip4844 = 3,
    Eip7702 = 4,
}

impl TxType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn is_dynamic_fee(self) -> bool {
        matches!(self, Self::Eip1559 | Self::Eip4844 | Self::Eip7702)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_type: TxType,
    pub chain_id: Option<u64>,
    pub nonce: u64,
    /// Gas price for legacy and access-list transactions.
    pub gas_price: U256,
    pub max_priority_fee_per_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub access_list: Vec<AccessListItem>,
    pub max_fee_per_blob_gas: Option<U256>,
    pub blob_versioned_hashes: Vec<B256>,
    pub authorization_list: Vec<SignedAuthorization>,
    pub signature: Signature,
}

impl Transaction {
    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    /// The most the sender can be charged per unit of gas.
    pub fn max_fee(&self) -> U256 {
        if self.tx_type.is_dynamic_fee() {
            self.max_fee_per_gas.unwrap_or_default()
        } else {
            self.gas_price
        }
    }

    /// YP `p`: the per-gas price actually paid given the block base fee.
    pub fn effective_gas_price(&self, base_fee_per_gas: U256) -> U256 {
        if self.tx_type.is_dynamic_fee() {
            let max_fee = self.max_fee_per_gas.unwrap_or_default();
            let priority = self.max_priority_fee_per_gas.unwrap_or_default();
            max_fee.min(base_fee_per_gas.saturating_add(priority))
        } else {
            self.gas_price
        }
    }

    /// Hash of the transaction envelope, the canonical transaction id.
    pub fn hash(&self) -> B256 {
        keccak256(self.encoded())
    }

    /// The payload whose keccak256 the sender signed.
    pub fn signing_hash(&self) -> B256 {
        let mut payload = Vec::with_capacity(256);
        match self.tx_type {
            TxType::Legacy => {
                self.encode_legacy_fields(&mut payload);
                if let Some(chain_id) = self.chain_id {
                    chain_id.encode(&mut payload);
                    0u64.encode(&mut payload);
                    0u64.encode(&mut payload);
                }
                keccak256(wrap_list(payload))
            }
            _ => {
                self.encode_typed_fields(&mut payload);
                let mut buf = vec![self.tx_type.as_u8()];
                buf.extend_from_slice(&wrap_list(payload));
                keccak256(&buf)
            }
        }
    }

    /// Typed envelope (EIP-2718): the value stored under the transactions
    /// trie and hashed for the transaction id.
    pub fn encoded(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(256);
        match self.tx_type {
            TxType::Legacy => {
                self.encode_legacy_fields(&mut payload);
                self.legacy_v().encode(&mut payload);
                self.signature.r.encode(&mut payload);
                self.signature.s.encode(&mut payload);
                wrap_list(payload)
            }
            _ => {
                self.encode_typed_fields(&mut payload);
                self.signature.odd_y_parity.encode(&mut payload);
                self.signature.r.encode(&mut payload);
                self.signature.s.encode(&mut payload);
                let mut buf = vec![self.tx_type.as_u8()];
                buf.extend_from_slice(&wrap_list(payload));
                buf
            }
        }
    }

    pub fn legacy_v(&self) -> u64 {
        let parity = u64::from(self.signature.odd_y_parity);
        match self.chain_id {
            Some(chain_id) => 35 + chain_id * 2 + parity,
            None => 27 + parity,
        }
    }

    fn encode_legacy_fields(&self, out: &mut Vec<u8>) {
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas_limit.encode(out);
        encode_optional_address(out, &self.to);
        self.value.encode(out);
        self.input.encode(out);
    }

    fn encode_typed_fields(&self, out: &mut Vec<u8>) {
        self.chain_id.unwrap_or_default().encode(out);
        self.nonce.encode(out);
        match self.tx_type {
            TxType::Eip2930 => {
                self.gas_price.encode(out);
            }
            _ => {
                self.max_priority_fee_per_gas.unwrap_or_default().encode(out);
                self.max_fee_per_gas.unwrap_or_default().encode(out);
            }
        }
        self.gas_limit.encode(out);
        encode_optional_address(out, &self.to);
        self.value.encode(out);
        self.input.encode(out);
        self.access_list.encode(out);
        match self.tx_type {
            TxType::Eip4844 => {
                self.max_fee_per_blob_gas.unwrap_or_default().encode(out);
                self.blob_versioned_hashes.encode(out);
            }
            TxType::Eip7702 => {
                self.authorization_list.encode(out);
            }
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent_hash: B256,
    pub ommers_hash: B256,
    pub beneficiary: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub prev_randao: B256,
    pub nonce: B64,
    pub base_fee_per_gas: Option<U256>,
    pub withdrawals_root: Option<B256>,
    pub blob_gas_used: Option<u64>,
    pub excess_blob_gas: Option<u64>,
    pub parent_beacon_block_root: Option<B256>,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            parent_hash: B256::ZERO,
            ommers_hash: EMPTY_OMMERS_HASH,
            beneficiary: Address::ZERO,
            state_root: EMPTY_ROOT_HASH,
            transactions_root: EMPTY_ROOT_HASH,
            receipts_root: EMPTY_ROOT_HASH,
            logs_bloom: Bloom::ZERO,
            difficulty: U256::ZERO,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Bytes::new(),
            prev_randao: B256::ZERO,
            nonce: B64::ZERO,
            base_fee_per_gas: None,
            withdrawals_root: None,
            blob_gas_used: None,
            excess_blob_gas: None,
            parent_beacon_block_root: None,
        }
    }
}

impl BlockHeader {
    pub fn rlp_encoded(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(640);
        self.parent_hash.encode(&mut payload);
        self.ommers_hash.encode(&mut payload);
        self.beneficiary.encode(&mut payload);
        self.state_root.encode(&mut payload);
        self.transactions_root.encode(&mut payload);
        self.receipts_root.encode(&mut payload);
        self.logs_bloom.encode(&mut payload);
        self.difficulty.encode(&mut payload);
        self.number.encode(&mut payload);
        self.gas_limit.encode(&mut payload);
        self.gas_used.encode(&mut payload);
        self.timestamp.encode(&mut payload);
        self.extra_data.encode(&mut payload);
        self.prev_randao.encode(&mut payload);
        self.nonce.encode(&mut payload);
        // Optional trailing fields appear only once activated; the encoder
        // relies on later revisions never clearing an earlier field.
        if let Some(base_fee) = self.base_fee_per_gas {
            base_fee.encode(&mut payload);
        }
        if let Some(root) = self.withdrawals_root {
            root.encode(&mut payload);
        }
        if let Some(blob_gas_used) = self.blob_gas_used {
            blob_gas_used.encode(&mut payload);
        }
        if let Some(excess) = self.excess_blob_gas {
            excess.encode(&mut payload);
        }
        if let Some(root) = self.parent_beacon_block_root {
            root.encode(&mut payload);
        }
        wrap_list(payload)
    }

    pub fn hash(&self) -> B256 {
        keccak256(self.rlp_encoded())
    }
}

/// EIP-4895 withdrawal; `amount` is denominated in gwei.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, RlpEncodable, Serialize, Deserialize)]
pub struct Withdrawal {
    pub index: u64,
    pub validator_index: u64,
    pub address: Address,
    pub amount: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Receipt {
    pub success: bool,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
    pub bloom: Bloom,
}

impl Receipt {
    /// Typed receipt envelope stored under the receipts trie.
    pub fn encoded(&self, tx_type: TxType) -> Vec<u8> {
        let mut payload = Vec::with_capacity(512);
        self.success.encode(&mut payload);
        self.cumulative_gas_used.encode(&mut payload);
        self.bloom.encode(&mut payload);
        self.logs.encode(&mut payload);
        let wrapped = wrap_list(payload);
        match tx_type {
            TxType::Legacy => wrapped,
            _ => {
                let mut buf = vec![tx_type.as_u8()];
                buf.extend_from_slice(&wrapped);
                buf
            }
        }
    }
}

pub fn logs_bloom<'a>(logs: impl IntoIterator<Item = &'a Log>) -> Bloom {
    let mut bloom = Bloom::ZERO;
    for log in logs {
        bloom.accrue(BloomInput::Raw(log.address.as_slice()));
        for topic in &log.topics {
            bloom.accrue(BloomInput::Raw(topic.as_slice()));
        }
    }
    bloom
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub ommers: Vec<BlockHeader>,
    pub withdrawals: Option<Vec<Withdrawal>>,
}

fn encode_optional_address(out: &mut Vec<u8>, to: &Option<Address>) {
    match to {
        Some(address) => address.encode(out),
        None => out.push(EMPTY_STRING_CODE),
    }
}

fn wrap_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}
