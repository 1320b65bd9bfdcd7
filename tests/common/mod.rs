//! Shared harness: an in-memory chain with funded signers, block
//! building over the parallel executor, and scripted interpreters.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashSet;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use k256::ecdsa::SigningKey;

use monad_exec::{
    execute_block, Block, BlockError, BlockHashBuffer, BlockHeader, BlockMetrics, BlockOutput,
    BlockState, Db, EvmResult, ExecutorPool, Genesis, GenesisAccount, InMemoryDb, Interpreter,
    Message, NoopInterpreter, MonadChain, Revision, Signature, Transaction, TxType,
    CHAIN_ID_DEVNET,
};

pub const BENEFICIARY: Address = Address::repeat_byte(0xcb);

pub fn signer(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed.wrapping_add(1); 32]).expect("non-zero scalar")
}

pub fn address_of(key: &SigningKey) -> Address {
    let encoded = key.verifying_key().to_encoded_point(false);
    Address::from_slice(&keccak256(&encoded.as_bytes()[1..])[12..])
}

pub fn sign_tx(mut tx: Transaction, key: &SigningKey) -> Transaction {
    let prehash = tx.signing_hash();
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(prehash.as_slice())
        .expect("signing succeeds");
    let normalized = signature.normalize_s();
    let odd = recovery_id.is_y_odd() ^ normalized.is_some();
    let signature = normalized.unwrap_or(signature);
    tx.signature = Signature {
        odd_y_parity: odd,
        r: U256::from_be_slice(&signature.to_bytes()[..32]),
        s: U256::from_be_slice(&signature.to_bytes()[32..]),
    };
    tx
}

/// Zero-fee value transfer.
pub fn transfer_tx(key: &SigningKey, nonce: u64, to: Address, value: U256) -> Transaction {
    sign_tx(
        Transaction {
            tx_type: TxType::Legacy,
            chain_id: Some(CHAIN_ID_DEVNET),
            nonce,
            gas_price: U256::ZERO,
            gas_limit: 50_000,
            to: Some(to),
            value,
            ..Transaction::default()
        },
        key,
    )
}

/// Interpreter driven by a plain function; lets a test script host
/// interactions without bytecode.
pub struct ScriptInterpreter(
    pub fn(&mut dyn monad_exec::Host, Revision, &Message, &[u8]) -> EvmResult,
);

impl Interpreter for ScriptInterpreter {
    fn execute(
        &self,
        host: &mut dyn monad_exec::Host,
        revision: Revision,
        msg: &Message,
        code: &[u8],
    ) -> EvmResult {
        (self.0)(host, revision, msg, code)
    }
}

pub struct TestChain {
    pub db: Arc<InMemoryDb>,
    pub chain: MonadChain,
    pub pool: ExecutorPool,
    pub interpreter: Arc<dyn Interpreter>,
    pub parent: BlockHeader,
    pub buffer: BlockHashBuffer,
    pub parent_set: AHashSet<Address>,
    pub grandparent_set: AHashSet<Address>,
    pub log_native_transfers: bool,
}

impl TestChain {
    pub fn new(alloc: &[(Address, U256)]) -> Self {
        Self::with_options(alloc, &[], 4, 16)
    }

    pub fn sequential(alloc: &[(Address, U256)]) -> Self {
        Self::with_options(alloc, &[], 1, 1)
    }

    /// `contracts` seeds accounts carrying code for scripted calls.
    pub fn with_options(
        alloc: &[(Address, U256)],
        contracts: &[(Address, Bytes)],
        nthreads: u32,
        nfibers: u32,
    ) -> Self {
        let mut genesis_alloc = BTreeMap::new();
        for (address, balance) in alloc {
            genesis_alloc.insert(
                *address,
                GenesisAccount {
                    balance: *balance,
                    ..GenesisAccount::default()
                },
            );
        }
        for (address, code) in contracts {
            genesis_alloc.insert(
                *address,
                GenesisAccount {
                    nonce: 1,
                    code: Some(code.clone()),
                    ..GenesisAccount::default()
                },
            );
        }
        let genesis = Genesis {
            chain_id: Some(CHAIN_ID_DEVNET),
            timestamp: 1_700_000_000,
            gas_limit: 30_000_000,
            extra_data: Bytes::new(),
            alloc: genesis_alloc,
        };
        let db = Arc::new(InMemoryDb::new());
        let dyn_db: Arc<dyn Db> = db.clone();
        let parent = genesis.commit(&dyn_db).expect("genesis commits");
        let mut buffer = BlockHashBuffer::new();
        buffer.push(0, parent.hash());

        Self {
            db,
            chain: MonadChain::devnet(),
            pool: ExecutorPool::new(nthreads, nfibers).expect("pool builds"),
            interpreter: Arc::new(NoopInterpreter),
            parent,
            buffer,
            parent_set: AHashSet::new(),
            grandparent_set: AHashSet::new(),
            log_native_transfers: false,
        }
    }

    pub fn next_header(&self) -> BlockHeader {
        BlockHeader {
            number: self.parent.number + 1,
            timestamp: self.parent.timestamp + 1,
            gas_limit: self.parent.gas_limit,
            parent_hash: self.parent.hash(),
            beneficiary: BENEFICIARY,
            base_fee_per_gas: Some(U256::ZERO),
            state_root: B256::ZERO,
            ..BlockHeader::default()
        }
    }

    /// Execute and commit one block; returns the output and the new
    /// state root.
    pub fn execute_block(
        &mut self,
        transactions: Vec<Transaction>,
        withdrawals: Option<Vec<monad_exec::Withdrawal>>,
    ) -> Result<(BlockOutput, B256), BlockError> {
        let header = self.next_header();
        let block = Block {
            header: header.clone(),
            transactions,
            ommers: Vec::new(),
            withdrawals,
        };
        let dyn_db: Arc<dyn Db> = self.db.clone();
        dyn_db
            .set_block_and_prefix(self.parent.number, self.parent.hash())
            .expect("parent is committed");
        let block_state = Arc::new(BlockState::new(dyn_db.clone()));
        let metrics = Arc::new(BlockMetrics::default());

        let output = execute_block(
            &self.chain,
            &block,
            block_state.clone(),
            &self.buffer,
            self.parent_set.clone(),
            self.grandparent_set.clone(),
            &self.pool,
            self.interpreter.clone(),
            metrics,
            self.log_native_transfers,
        )?;

        block_state
            .commit(
                &header,
                &output.receipts,
                &output.call_frames,
                &output.senders,
                &block.transactions,
                &block.ommers,
                block.withdrawals.as_deref(),
            )
            .expect("commit succeeds");
        let root = dyn_db.state_root().expect("state root");

        self.buffer.push(header.number, header.hash());
        self.grandparent_set = std::mem::take(&mut self.parent_set);
        self.parent_set = output.senders_and_authorities.clone();
        self.parent = header;
        Ok((output, root))
    }

    pub fn balance(&self, address: &Address) -> U256 {
        let dyn_db: Arc<dyn Db> = self.db.clone();
        dyn_db
            .read_account(address)
            .expect("read account")
            .map(|account| account.balance)
            .unwrap_or_default()
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        let dyn_db: Arc<dyn Db> = self.db.clone();
        dyn_db
            .read_account(address)
            .expect("read account")
            .map(|account| account.nonce)
            .unwrap_or_default()
    }

    pub fn storage(&self, address: &Address, key: &B256) -> B256 {
        let dyn_db: Arc<dyn Db> = self.db.clone();
        let Some(account) = dyn_db.read_account(address).expect("read account") else {
            return B256::ZERO;
        };
        dyn_db
            .read_storage(address, account.incarnation, key)
            .expect("read storage")
    }
}
