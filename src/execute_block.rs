//! Block-level parallel execution.
//!
//! Transactions execute speculatively on the pool; a promise chain of
//! oneshot channels serializes the commit stage in transaction order.
//! When a merge fails validation the transaction re-executes against the
//! newer block state; each successful merge only widens the committed
//! value set, so re-execution after the predecessor barrier converges.

use std::sync::Arc;

use ahash::AHashSet;
use alloy_primitives::{address, Address, B256, U256};
use crate::call_tracer::CallTracer;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};

use crate::block_hash_buffer::BlockHashBuffer;
use crate::block_state::BlockState;
use crate::call_tracer::{CallFrame, RecordingCallTracer};
use crate::chain::{ChainContext, MonadChain};
use crate::evm::Interpreter;
use crate::execute_transaction::ExecuteTransaction;
use crate::metrics::BlockMetrics;
use crate::pool::ExecutorPool;
use crate::primitives::{Block, BlockHeader, Incarnation, Receipt, Transaction};
use crate::recover::{recover_authority, recover_sender};
use crate::revision::{EvmRevision, Revision};
use crate::state::{State, StateError};
use crate::validate::ValidationError;

/// Merge retries allowed per block, as a multiple of the transaction
/// count. A block that keeps failing validation beyond this is aborted.
const RETRY_FACTOR: u64 = 10;

const BEACON_ROOTS_ADDRESS: Address = address!("000f3df6d732807ef1319fb7b8bb8522d0beac02");
const HISTORY_BUFFER_LENGTH: u64 = 8191;
const GWEI: u64 = 1_000_000_000;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("transaction {index} validation failed: {source}")]
    Validation {
        index: u64,
        #[source]
        source: ValidationError,
    },
    #[error("invariant violation in transaction {index}: {source}")]
    State {
        index: u64,
        #[source]
        source: StateError,
    },
    #[error("sender recovery failed for transaction {index}")]
    SenderRecovery { index: u64 },
    #[error("merge retry limit exceeded at transaction {index}")]
    RetryLimit { index: u64 },
    #[error("block aborted before transaction {index}")]
    Aborted { index: u64 },
    #[error("system call failed to merge")]
    SystemMerge,
    #[error("execution task failed: {0}")]
    Task(String),
    #[error("system state error: {0}")]
    System(#[from] StateError),
}

#[derive(Debug)]
pub struct BlockOutput {
    pub receipts: Vec<Receipt>,
    pub call_frames: Vec<Vec<CallFrame>>,
    pub senders: Vec<Address>,
    /// Union of senders and recovered authorities, fed into the next
    /// blocks' reserve-balance contexts.
    pub senders_and_authorities: AHashSet<Address>,
    pub gas_used: u64,
}

struct BlockEnv {
    revision: Revision,
    chain_id: u64,
    header: BlockHeader,
    transactions: Arc<Vec<Transaction>>,
    senders: Vec<Address>,
    authorities: Vec<Vec<Option<Address>>>,
    chain_context: ChainContext,
    block_state: Arc<BlockState>,
    block_hash_buffer: BlockHashBuffer,
    interpreter: Arc<dyn Interpreter>,
    metrics: Arc<BlockMetrics>,
    fibers: Arc<Semaphore>,
    log_native_transfers: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn execute_block(
    chain: &MonadChain,
    block: &Block,
    block_state: Arc<BlockState>,
    block_hash_buffer: &BlockHashBuffer,
    parent_senders_and_authorities: AHashSet<Address>,
    grandparent_senders_and_authorities: AHashSet<Address>,
    pool: &ExecutorPool,
    interpreter: Arc<dyn Interpreter>,
    metrics: Arc<BlockMetrics>,
    log_native_transfers: bool,
) -> Result<BlockOutput, BlockError> {
    let revision = chain.revision(block.header.number, block.header.timestamp);
    let transactions = Arc::new(block.transactions.clone());

    // Sender and authority recovery fan-out.
    let (senders, authorities) = recover_all(pool, &transactions)?;

    let chain_context = ChainContext::new(
        senders.clone(),
        authorities
            .iter()
            .map(|list| list.iter().flatten().copied().collect())
            .collect(),
        parent_senders_and_authorities,
        grandparent_senders_and_authorities,
    );

    if revision.cancun() {
        set_beacon_root(&block_state, &block.header)?;
    }

    let env = Arc::new(BlockEnv {
        revision,
        chain_id: chain.id,
        header: block.header.clone(),
        transactions: transactions.clone(),
        senders: senders.clone(),
        authorities,
        chain_context,
        block_state: block_state.clone(),
        block_hash_buffer: block_hash_buffer.clone(),
        interpreter,
        metrics,
        fibers: pool.fiber_permits(),
        log_native_transfers,
    });

    // Promise chain: transaction i merges only after i-1 has merged.
    let count = transactions.len();
    let mut handles = Vec::with_capacity(count);
    let mut prev_rx = {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        rx
    };
    for index in 0..count {
        let (next_tx, next_rx) = oneshot::channel();
        let env = env.clone();
        handles.push(pool.spawn_raw(run_transaction(env, index, prev_rx, next_tx)));
        prev_rx = next_rx;
    }

    let mut receipts = Vec::with_capacity(count);
    let mut call_frames = Vec::with_capacity(count);
    for handle in handles {
        let joined = pool
            .block_on(handle)
            .map_err(|err| BlockError::Task(err.to_string()))?;
        let (receipt, frames) = joined?;
        receipts.push(receipt);
        call_frames.push(frames);
    }

    // YP eq. 22: receipts carry cumulative gas.
    let mut cumulative_gas_used = 0u64;
    for receipt in &mut receipts {
        cumulative_gas_used += receipt.cumulative_gas_used;
        receipt.cumulative_gas_used = cumulative_gas_used;
    }

    finish_block(revision, block, &block_state)?;

    Ok(BlockOutput {
        receipts,
        call_frames,
        senders,
        senders_and_authorities: env.chain_context.senders_and_authorities.clone(),
        gas_used: cumulative_gas_used,
    })
}

type Recovered = (Vec<Address>, Vec<Vec<Option<Address>>>);

fn recover_all(
    pool: &ExecutorPool,
    transactions: &Arc<Vec<Transaction>>,
) -> Result<Recovered, BlockError> {
    let mut handles = Vec::with_capacity(transactions.len());
    for index in 0..transactions.len() {
        let transactions = transactions.clone();
        handles.push(pool.spawn(async move {
            let tx = &transactions[index];
            let sender = recover_sender(tx);
            let authorities: Vec<Option<Address>> = tx
                .authorization_list
                .iter()
                .map(recover_authority)
                .collect();
            (sender, authorities)
        }));
    }
    let mut senders = Vec::with_capacity(transactions.len());
    let mut authorities = Vec::with_capacity(transactions.len());
    for (index, handle) in handles.into_iter().enumerate() {
        let (sender, auths) = pool
            .block_on(handle)
            .map_err(|err| BlockError::Task(err.to_string()))?;
        let sender = sender.ok_or(BlockError::SenderRecovery {
            index: index as u64,
        })?;
        senders.push(sender);
        authorities.push(auths);
    }
    Ok((senders, authorities))
}

/// EIP-4788 pre-block system call.
fn set_beacon_root(
    block_state: &Arc<BlockState>,
    header: &BlockHeader,
) -> Result<(), BlockError> {
    let Some(parent_beacon_block_root) = header.parent_beacon_block_root else {
        return Ok(());
    };
    let mut state = State::new(block_state.clone(), Incarnation::new(header.number, 0));
    if !state.account_exists(&BEACON_ROOTS_ADDRESS).map_err(BlockError::System)? {
        return Ok(());
    }
    let timestamp = U256::from(header.timestamp);
    let slot = U256::from(header.timestamp % HISTORY_BUFFER_LENGTH);
    let k1 = B256::from(slot.to_be_bytes::<32>());
    let k2 = B256::from((slot + U256::from(HISTORY_BUFFER_LENGTH)).to_be_bytes::<32>());
    state
        .set_storage(&BEACON_ROOTS_ADDRESS, &k1, B256::from(timestamp.to_be_bytes::<32>()))
        .map_err(BlockError::System)?;
    state
        .set_storage(&BEACON_ROOTS_ADDRESS, &k2, parent_beacon_block_root)
        .map_err(BlockError::System)?;
    if !block_state.try_merge(&mut state).map_err(BlockError::System)? {
        return Err(BlockError::SystemMerge);
    }
    Ok(())
}

async fn run_transaction(
    env: Arc<BlockEnv>,
    index: usize,
    prev: oneshot::Receiver<()>,
    next: oneshot::Sender<()>,
) -> Result<(Receipt, Vec<CallFrame>), BlockError> {
    let retry_limit = RETRY_FACTOR * env.transactions.len() as u64;
    let mut attempts: u64 = 1;

    // Speculative execution; a fiber permit is held only while actually
    // executing, never across the predecessor barrier.
    let mut outcome = {
        let _permit = env.fibers.acquire().await.expect("semaphore never closes");
        execute_once(&env, index)
    };

    if prev.await.is_err() {
        return Err(BlockError::Aborted {
            index: index as u64,
        });
    }

    let mut post_barrier = false;
    loop {
        match outcome {
            Ok((mut state, receipt, frames)) => {
                match env.block_state.try_merge(&mut state) {
                    Ok(true) => {
                        let _ = next.send(());
                        return Ok((receipt, frames));
                    }
                    Ok(false) => env.metrics.inc_merge_failures(),
                    Err(source) => {
                        return Err(BlockError::State {
                            index: index as u64,
                            source,
                        })
                    }
                }
            }
            Err(error) => {
                // A failure observed against the settled predecessor
                // state is authoritative; a speculative one gets retried.
                if post_barrier {
                    return Err(error);
                }
            }
        }

        attempts += 1;
        if attempts > retry_limit.max(2) {
            return Err(BlockError::RetryLimit {
                index: index as u64,
            });
        }
        env.metrics.inc_retries();
        post_barrier = true;
        outcome = {
            let _permit = env.fibers.acquire().await.expect("semaphore never closes");
            execute_once(&env, index)
        };
    }
}

type ExecutionAttempt = Result<(State, Receipt, Vec<CallFrame>), BlockError>;

fn execute_once(env: &BlockEnv, index: usize) -> ExecutionAttempt {
    let tx = &env.transactions[index];
    let mut state = State::new(
        env.block_state.clone(),
        Incarnation::new(env.header.number, index as u64),
    );
    let mut tracer = RecordingCallTracer::default();
    let executor = ExecuteTransaction {
        revision: env.revision,
        chain_id: env.chain_id,
        index: index as u64,
        tx,
        sender: env.senders[index],
        authorities: &env.authorities[index],
        header: &env.header,
        block_hash_buffer: &env.block_hash_buffer,
        chain_context: &env.chain_context,
        interpreter: env.interpreter.as_ref(),
        log_native_transfers: env.log_native_transfers,
    };
    match executor.run(&mut state, &mut tracer) {
        Ok(receipt) => Ok((state, receipt, tracer.take_frames())),
        Err(crate::validate::TransactionValidationError::Invalid(source)) => {
            Err(BlockError::Validation {
                index: index as u64,
                source,
            })
        }
        Err(crate::validate::TransactionValidationError::State(source)) => {
            Err(BlockError::State {
                index: index as u64,
                source,
            })
        }
    }
}

/// End-of-block effects in the distinguished LAST_TXN version:
/// withdrawals, legacy block rewards, touched-dead cleanup.
fn finish_block(
    revision: Revision,
    block: &Block,
    block_state: &Arc<BlockState>,
) -> Result<(), BlockError> {
    let mut state = State::new(
        block_state.clone(),
        Incarnation::last(block.header.number),
    );

    if revision.shanghai() {
        if let Some(withdrawals) = &block.withdrawals {
            for withdrawal in withdrawals {
                state
                    .add_to_balance(
                        &withdrawal.address,
                        U256::from(withdrawal.amount) * U256::from(GWEI),
                    )
                    .map_err(BlockError::System)?;
            }
        }
    }

    if let Some(reward) = block_reward(revision) {
        let ommer_count = U256::from(block.ommers.len() as u64);
        state
            .add_to_balance(
                &block.header.beneficiary,
                reward + reward * ommer_count / U256::from(32u64),
            )
            .map_err(BlockError::System)?;
        for ommer in &block.ommers {
            let distance = block.header.number.saturating_sub(ommer.number);
            if distance > 8 {
                continue;
            }
            let ommer_reward = reward * U256::from(8 - distance) / U256::from(8u64);
            state
                .add_to_balance(&ommer.beneficiary, ommer_reward)
                .map_err(BlockError::System)?;
        }
    }

    if revision.spurious_dragon() {
        state.destruct_touched_dead();
    }

    if !block_state.try_merge(&mut state).map_err(BlockError::System)? {
        return Err(BlockError::SystemMerge);
    }
    Ok(())
}

/// Static block reward; gone since the merge.
fn block_reward(revision: Revision) -> Option<U256> {
    if revision.evm_at_least(EvmRevision::Paris) {
        return None;
    }
    let eth = U256::from(1_000_000_000_000_000_000u64);
    Some(if revision.evm_at_least(EvmRevision::Constantinople) {
        U256::from(2u64) * eth
    } else if revision.evm_at_least(EvmRevision::Byzantium) {
        U256::from(3u64) * eth
    } else {
        U256::from(5u64) * eth
    })
}
