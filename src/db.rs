//! Database boundary between the execution layer and the state-backing
//! trie store.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256};
use thiserror::Error;

use crate::block_state::StateDeltas;
use crate::call_tracer::CallFrame;
use crate::primitives::{Account, BlockHeader, Incarnation, Receipt, Transaction, Withdrawal};
use crate::triedb::{MemStore, TrieDb};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt node at offset {offset:#x}: {reason}")]
    CorruptNode { offset: u64, reason: &'static str },
    #[error("no root for block {0}")]
    UnknownBlock(u64),
    #[error("missing code for hash {0}")]
    MissingCode(B256),
    #[error("metadata error: {0}")]
    Metadata(String),
    #[error("i/o ring shut down")]
    RingClosed,
}

/// Everything a block commit hands to the store.
#[derive(Debug)]
pub struct CommitPayload<'a> {
    pub state_deltas: &'a StateDeltas,
    pub code: Vec<(B256, Arc<Bytes>)>,
    pub block_id: B256,
    pub header: &'a BlockHeader,
    pub receipts: &'a [Receipt],
    pub call_frames: &'a [Vec<CallFrame>],
    pub senders: &'a [Address],
    pub transactions: &'a [Transaction],
    pub ommers: &'a [BlockHeader],
    pub withdrawals: Option<&'a [Withdrawal]>,
}

/// Versioned state database. Reads are served against the version selected
/// by the latest `set_block_and_prefix` call; `commit` appends a new
/// version and leaves it selected.
pub trait Db: Send + Sync {
    fn read_account(&self, address: &Address) -> Result<Option<Account>, DbError>;

    /// Storage read for the account lifetime identified by `incarnation`;
    /// keys belonging to a newer lifetime than the stored one read as
    /// zero.
    fn read_storage(
        &self,
        address: &Address,
        incarnation: Incarnation,
        key: &B256,
    ) -> Result<B256, DbError>;

    fn read_code(&self, code_hash: &B256) -> Result<Arc<Bytes>, DbError>;

    fn set_block_and_prefix(&self, block_number: u64, block_id: B256) -> Result<(), DbError>;

    fn commit(&self, payload: CommitPayload<'_>) -> Result<(), DbError>;

    fn finalize(&self, block_number: u64, block_id: B256) -> Result<(), DbError>;

    fn update_verified_block(&self, block_number: u64) -> Result<(), DbError>;

    fn update_voted_metadata(&self, block_number: u64, block_id: B256) -> Result<(), DbError>;

    fn update_proposed_metadata(&self, block_number: u64, block_id: B256) -> Result<(), DbError>;

    fn state_root(&self) -> Result<B256, DbError>;

    fn receipts_root(&self) -> Result<B256, DbError>;

    fn transactions_root(&self) -> Result<B256, DbError>;

    fn withdrawals_root(&self) -> Result<Option<B256>, DbError>;

    /// Highest committed block number, `None` on a fresh database.
    fn latest_block_number(&self) -> Result<Option<u64>, DbError>;

    /// Header recorded for a block still inside the history window.
    fn block_header(&self, block_number: u64) -> Result<Option<BlockHeader>, DbError>;
}

/// The trie database over in-memory chunk storage; used by tests and when
/// the runloop is started without `--db`.
pub type InMemoryDb = TrieDb<MemStore>;
