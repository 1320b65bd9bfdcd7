//! The block runloop: validates each incoming block against its parent,
//! drives parallel execution, commits to the trie store, and maintains
//! the rolling context (block hashes, pending sender/authority sets) the
//! next blocks need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use alloy_primitives::Address;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block_db::{BlockDb, BlockDbError};
use crate::block_hash_buffer::BlockHashBuffer;
use crate::block_state::BlockState;
use crate::chain::MonadChain;
use crate::db::{Db, DbError};
use crate::evm::Interpreter;
use crate::execute_block::{execute_block, BlockError};
use crate::metrics::BlockMetrics;
use crate::pool::ExecutorPool;
use crate::state::StateError;
use crate::validate::{validate_block_header, ValidationError};

/// Blocks between execution and finalization, mirroring the two-block
/// settlement the reserve contract assumes.
const FINALITY_LAG: u64 = 2;

const COMMIT_WARN_THRESHOLD: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RunloopError {
    #[error("block {number}: {source}")]
    Block {
        number: u64,
        #[source]
        source: BlockError,
    },
    #[error("block {number} header invalid: {source}")]
    Header {
        number: u64,
        #[source]
        source: ValidationError,
    },
    #[error("block {number}: parent hash does not match committed chain")]
    ParentMismatch { number: u64 },
    #[error("block {number}: computed {what} differs from header")]
    OutputMismatch { number: u64, what: &'static str },
    #[error("database is empty; a genesis file is required")]
    MissingGenesis,
    #[error(transparent)]
    BlockDb(#[from] BlockDbError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    State(#[from] StateError),
}

pub struct RunLoop {
    pub chain: MonadChain,
    pub db: Arc<dyn Db>,
    pub block_db: BlockDb,
    pub pool: ExecutorPool,
    pub interpreter: Arc<dyn Interpreter>,
    pub stop: Arc<AtomicBool>,
    pub nblocks: Option<u64>,
    pub log_native_transfers: bool,
}

impl std::fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoop")
            .field("chain", &self.chain)
            .field("nblocks", &self.nblocks)
            .finish()
    }
}

impl RunLoop {
    /// Process blocks until the stop flag is raised, the block source is
    /// exhausted, or `nblocks` have been executed. Returns the number of
    /// blocks executed.
    pub fn run(&mut self) -> Result<u64, RunloopError> {
        let latest = self
            .db
            .latest_block_number()?
            .ok_or(RunloopError::MissingGenesis)?;
        let mut parent_header = self
            .db
            .block_header(latest)?
            .ok_or(RunloopError::MissingGenesis)?;

        // Seed the BLOCKHASH window from recorded history.
        let mut block_hash_buffer = BlockHashBuffer::new();
        for number in latest.saturating_sub(255)..=latest {
            if let Some(header) = self.db.block_header(number)? {
                block_hash_buffer.push(number, header.hash());
            }
        }

        let mut parent_set: AHashSet<Address> = AHashSet::new();
        let mut grandparent_set: AHashSet<Address> = AHashSet::new();
        let mut executed = 0u64;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested; exiting runloop");
                break;
            }
            if self.nblocks.is_some_and(|limit| executed >= limit) {
                break;
            }

            let number = parent_header.number + 1;
            let Some(block) = self.block_db.read_block(number)? else {
                debug!(number, "no more blocks");
                break;
            };

            let revision = self
                .chain
                .revision(block.header.number, block.header.timestamp);
            if block.header.parent_hash != parent_header.hash() {
                return Err(RunloopError::ParentMismatch { number });
            }
            validate_block_header(revision, &block.header, &parent_header)
                .map_err(|source| RunloopError::Header { number, source })?;

            self.db
                .set_block_and_prefix(number - 1, block.header.parent_hash)?;
            let block_state = Arc::new(BlockState::new(self.db.clone()));
            let metrics = Arc::new(BlockMetrics::default());

            let started = Instant::now();
            let output = execute_block(
                &self.chain,
                &block,
                block_state.clone(),
                &block_hash_buffer,
                parent_set.clone(),
                grandparent_set.clone(),
                &self.pool,
                self.interpreter.clone(),
                metrics.clone(),
                self.log_native_transfers,
            )
            .map_err(|source| RunloopError::Block { number, source })?;

            if output.gas_used != block.header.gas_used {
                return Err(RunloopError::OutputMismatch {
                    number,
                    what: "gas used",
                });
            }

            block_state.commit(
                &block.header,
                &output.receipts,
                &output.call_frames,
                &output.senders,
                &block.transactions,
                &block.ommers,
                block.withdrawals.as_deref(),
            )?;

            // Headers from a producing validator carry the roots; replay
            // inputs without them skip the comparison.
            let state_root = self.db.state_root()?;
            if !block.header.state_root.is_zero() && block.header.state_root != state_root {
                return Err(RunloopError::OutputMismatch {
                    number,
                    what: "state root",
                });
            }
            let receipts_root = self.db.receipts_root()?;
            if !block.header.receipts_root.is_zero()
                && block.header.receipts_root != crate::EMPTY_ROOT_HASH
                && block.header.receipts_root != receipts_root
            {
                return Err(RunloopError::OutputMismatch {
                    number,
                    what: "receipts root",
                });
            }

            let elapsed = started.elapsed();
            metrics.set_exec_time(elapsed);
            if elapsed > COMMIT_WARN_THRESHOLD {
                warn!(
                    number,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow block commit"
                );
            }
            info!(
                number,
                txns = block.transactions.len(),
                gas_used = output.gas_used,
                retries = metrics.retries(),
                elapsed_us = elapsed.as_micros() as u64,
                "block committed"
            );

            if number >= FINALITY_LAG {
                let final_number = number - FINALITY_LAG;
                if let Some(header) = self.db.block_header(final_number)? {
                    self.db.finalize(final_number, header.hash())?;
                }
            }

            block_hash_buffer.push(number, block.header.hash());
            grandparent_set = std::mem::take(&mut parent_set);
            parent_set = output.senders_and_authorities;
            parent_header = block.header;
            executed += 1;
        }
        Ok(executed)
    }
}
