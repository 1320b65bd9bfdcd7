//! Parallel Ethereum-compatible execution core for the Monad chain family.
//!
//! Transactions in a block are executed speculatively on a pool of
//! cooperative tasks. Each transaction runs against a private versioned
//! view ([`State`]) layered over the shared block view ([`BlockState`]),
//! records the original values it observed, and commits in transaction
//! order: a merge either validates those originals against the block view
//! and folds the writes in, or the transaction is re-executed against the
//! newer view. Committed blocks flush into an append-only Merkle-Patricia
//! trie store ([`triedb::TrieDb`]) with asynchronous chunked I/O.

use alloy_primitives::{b256, B256};

/// keccak256 of the empty byte string; code hash of accounts without code.
pub const EMPTY_CODE_HASH: B256 =
    b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470");

/// Root hash of an empty Merkle-Patricia trie, keccak256(rlp("")).
pub const EMPTY_ROOT_HASH: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// keccak256 of the RLP encoding of an empty ommer list.
pub const EMPTY_OMMERS_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

mod account_state;
mod block_hash_buffer;
mod block_state;
mod call_tracer;
mod chain;
mod db;
mod evm;
mod execute_block;
mod execute_transaction;
mod genesis;
mod host;
mod metrics;
mod pool;
mod precompiles;
mod primitives;
mod recover;
mod reserve_balance;
mod reserve_balance_contract;
mod revision;
mod snapshot;
mod state;
mod validate;
mod version_stack;

pub mod block_db;
pub mod runloop;
pub mod triedb;

pub use account_state::{
    AccountHistory, AccountState, CurrentAccountState, OriginalAccountState, StorageMap,
    StorageStatus,
};
pub use block_hash_buffer::BlockHashBuffer;
pub use block_state::{BlockState, StateDelta, StateDeltas};
pub use call_tracer::{CallFrame, CallTracer, NoopCallTracer, RecordingCallTracer};
pub use chain::{ChainContext, MonadChain, CHAIN_ID_DEVNET, CHAIN_ID_MAINNET, CHAIN_ID_TESTNET};
pub use db::{CommitPayload, Db, DbError, InMemoryDb};
pub use evm::{
    create2_address, create_address, delegation_designation, delegation_target, is_delegated,
    AccessStatus, CallKind, EvmResult, Interpreter, Message, NoopInterpreter, StatusCode,
    TxContext,
};
pub use execute_block::{execute_block, BlockError, BlockOutput};
pub use execute_transaction::ExecuteTransaction;
pub use genesis::{Genesis, GenesisAccount, GenesisError};
pub use host::{ExecHost, Host, NATIVE_TRANSFER_EMITTER, TRANSFER_EVENT_TOPIC};
pub use metrics::BlockMetrics;
pub use pool::ExecutorPool;
pub use primitives::{
    logs_bloom, Account, AccessListItem, Block, BlockHeader, Incarnation, Log, Receipt, Signature,
    SignedAuthorization, Transaction, TxType, Withdrawal,
};
pub use recover::{recover_authority, recover_sender};
pub use reserve_balance::{
    can_sender_dip_into_reserve, max_reserve, revert_transaction, ReserveBalance,
    DEFAULT_RESERVE_BALANCE_WEI,
};
pub use reserve_balance_contract::{
    is_reconfiguring_transaction, ContractOutcome, ReserveBalanceContract, ReserveBalanceError,
    ReserveBalanceView, DELAY_BLOCKS, RESERVE_BALANCE_ADDRESS, RESERVE_BALANCE_CHANGED_TOPIC,
    UPDATE_SELECTOR,
};
pub use revision::{EvmRevision, MonadRevision, Revision};
pub use state::{State, StateError};
pub use validate::{
    expected_base_fee, intrinsic_gas, validate_block_header, validate_transaction,
    TransactionValidationError, ValidationError,
};
pub use snapshot::{dump_snapshot, load_snapshot, SnapshotError};
