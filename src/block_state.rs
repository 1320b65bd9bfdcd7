//! Single-block cache and commit buffer over the trie store.
//!
//! Readers run concurrently against the delta maps; merges are serialized
//! by the block-scoped mutex and only copy deltas that speculative
//! execution already computed, so the lock window stays short.

use std::sync::{Arc, Mutex, MutexGuard};

use alloy_primitives::{Address, Bytes, B256};
use dashmap::DashMap;

use crate::call_tracer::CallFrame;
use crate::db::{CommitPayload, Db};
use crate::primitives::{Account, BlockHeader, Incarnation, Receipt, Transaction, Withdrawal};
use crate::state::{State, StateError};
use crate::EMPTY_CODE_HASH;

/// `(original, current)` pair for an account and each of its storage keys.
/// The original half is what the database held at block start and never
/// changes; the current half advances as transactions merge.
#[derive(Debug)]
pub struct StateDelta {
    pub account: (Option<Account>, Option<Account>),
    pub storage: DashMap<B256, (B256, B256), ahash::RandomState>,
}

pub type StateDeltas = DashMap<Address, StateDelta, ahash::RandomState>;

pub struct BlockState {
    db: Arc<dyn Db>,
    state: StateDeltas,
    code: DashMap<B256, Arc<Bytes>, ahash::RandomState>,
    dirty_code: DashMap<B256, Arc<Bytes>, ahash::RandomState>,
    merge_mutex: Mutex<()>,
}

impl std::fmt::Debug for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockState")
            .field("accounts", &self.state.len())
            .field("code", &self.code.len())
            .finish()
    }
}

impl BlockState {
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self {
            db,
            state: StateDeltas::default(),
            code: DashMap::default(),
            dirty_code: DashMap::default(),
            merge_mutex: Mutex::new(()),
        }
    }

    pub fn db(&self) -> &Arc<dyn Db> {
        &self.db
    }

    pub fn deltas(&self) -> &StateDeltas {
        &self.state
    }

    /// Committed account view, memoizing the database read.
    pub fn read_account(&self, address: &Address) -> Result<Option<Account>, StateError> {
        if let Some(entry) = self.state.get(address) {
            return Ok(entry.account.1);
        }
        let result = self.db.read_account(address)?;
        let entry = self.state.entry(*address).or_insert_with(|| StateDelta {
            account: (result, result),
            storage: DashMap::default(),
        });
        Ok(entry.account.1)
    }

    /// Committed storage view for the lifetime named by `incarnation`.
    /// Keys of a lifetime newer than the database's resolve to zero
    /// without touching the store.
    pub fn read_storage(
        &self,
        address: &Address,
        incarnation: Incarnation,
        key: &B256,
    ) -> Result<B256, StateError> {
        let entry = self
            .state
            .get(address)
            .ok_or(StateError::MissingBlockStateEntry(*address))?;
        if let Some(slot) = entry.storage.get(key) {
            return Ok(slot.1);
        }
        let db_lifetime = entry.account.0.map(|a| a.incarnation) == Some(incarnation);
        let value = if db_lifetime {
            self.db.read_storage(address, incarnation, key)?
        } else {
            B256::ZERO
        };
        let slot = entry.storage.entry(*key).or_insert((value, value));
        Ok(slot.1)
    }

    /// Code for `code_hash`; never empty for a non-null hash.
    pub fn read_code(&self, code_hash: &B256) -> Result<Arc<Bytes>, StateError> {
        if *code_hash == EMPTY_CODE_HASH {
            return Ok(Arc::new(Bytes::new()));
        }
        if let Some(code) = self.code.get(code_hash) {
            return Ok(code.clone());
        }
        let code = self.db.read_code(code_hash)?;
        if code.is_empty() {
            return Err(StateError::MissingCode(*code_hash));
        }
        self.code.entry(*code_hash).or_insert_with(|| code.clone());
        Ok(code)
    }

    /// True iff every original value observed by `state` still matches the
    /// committed value here, under the relaxed balance rule.
    pub fn can_merge(&self, state: &State) -> Result<bool, StateError> {
        let _guard = self.lock();
        self.can_merge_locked(state)
    }

    /// Fold `state`'s writes into the committed view. Must only be called
    /// while the result of `can_merge` still holds; `try_merge` couples
    /// the two under the block mutex.
    pub fn merge(&self, state: &mut State) -> Result<(), StateError> {
        let _guard = self.lock();
        self.merge_locked(state)
    }

    /// Validate and merge atomically. Returns false (leaving the block
    /// state untouched) when the transaction must be re-executed.
    pub fn try_merge(&self, state: &mut State) -> Result<bool, StateError> {
        let _guard = self.lock();
        if !self.can_merge_locked(state)? {
            return Ok(false);
        }
        self.merge_locked(state)?;
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.merge_mutex
            .lock()
            .expect("block state mutex poisoned")
    }

    fn can_merge_locked(&self, state: &State) -> Result<bool, StateError> {
        for (address, history) in state.histories() {
            let entry = self
                .state
                .get(address)
                .ok_or(StateError::MissingBlockStateEntry(*address))?;
            let original = history.original_state();
            let committed = &entry.account.1;
            let exact = original.validate_exact_balance()
                || original.state.account.is_none()
                || committed.is_none();
            if exact {
                if *committed != original.state.account {
                    return Ok(false);
                }
            } else {
                let observed = original.state.account.expect("checked above");
                let current = committed.expect("checked above");
                if observed.nonce != current.nonce
                    || observed.code_hash != current.code_hash
                    || observed.incarnation != current.incarnation
                {
                    return Ok(false);
                }
                if current.balance < original.min_balance() {
                    return Ok(false);
                }
            }
            for (key, observed) in original.state.storage.iter() {
                let slot = entry
                    .storage
                    .get(key)
                    .ok_or(StateError::MissingBlockStateEntry(*address))?;
                if slot.1 != *observed {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn merge_locked(&self, state: &mut State) -> Result<(), StateError> {
        for (code_hash, code) in state.drain_code() {
            self.code.entry(code_hash).or_insert_with(|| code.clone());
            self.dirty_code.entry(code_hash).or_insert(code);
        }

        for (address, history) in state.drain_histories() {
            if !history.has_current_state() {
                continue;
            }
            debug_assert_eq!(history.stack_shape(), Some((1, 0)));
            let mut entry = self
                .state
                .get_mut(&address)
                .ok_or(StateError::MissingBlockStateEntry(address))?;
            let original = history.original_state();
            let recent = history
                .recent_current_state()
                .expect("has_current_state checked");

            let mut merged = recent.state.account;
            if let (Some(observed), Some(account)) =
                (&original.state.account, merged.as_mut())
            {
                // Relaxed merge: shift by the balance drift committed
                // since this transaction sampled its original.
                if !original.validate_exact_balance() {
                    if let Some(committed) = &entry.account.1 {
                        if committed.balance >= observed.balance {
                            account.balance = account
                                .balance
                                .checked_add(committed.balance - observed.balance)
                                .ok_or(StateError::BalanceOverflow(address))?;
                        } else {
                            account.balance = account
                                .balance
                                .checked_sub(observed.balance - committed.balance)
                                .ok_or(StateError::BalanceUnderflow(address))?;
                        }
                    }
                }
            }

            let account_survives = merged.is_some();
            entry.account.1 = merged;
            if account_survives {
                for (key, value) in recent.state.storage.iter() {
                    match entry.storage.get_mut(key) {
                        Some(mut slot) => slot.1 = *value,
                        None => {
                            entry.storage.insert(*key, (B256::ZERO, *value));
                        }
                    }
                }
            } else {
                entry.storage.clear();
            }
        }
        Ok(())
    }

    /// Flush the block to the trie store; the new state root becomes
    /// readable through the database handle.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &self,
        header: &BlockHeader,
        receipts: &[Receipt],
        call_frames: &[Vec<CallFrame>],
        senders: &[Address],
        transactions: &[Transaction],
        ommers: &[BlockHeader],
        withdrawals: Option<&[Withdrawal]>,
    ) -> Result<(), StateError> {
        let code = self
            .dirty_code
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        self.db.commit(CommitPayload {
            state_deltas: &self.state,
            code,
            block_id: header.hash(),
            header,
            receipts,
            call_frames,
            senders,
            transactions,
            ommers,
            withdrawals,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDb;
    use alloy_primitives::{address, U256};

    fn block_state() -> BlockState {
        BlockState::new(Arc::new(InMemoryDb::new()))
    }

    #[test]
    fn read_account_memoizes_absence() {
        let bs = block_state();
        let addr = address!("00000000000000000000000000000000000000aa");
        assert_eq!(bs.read_account(&addr).unwrap(), None);
        assert!(bs.deltas().contains_key(&addr));
    }

    #[test]
    fn conflicting_original_fails_merge() {
        let bs = Arc::new(block_state());
        let addr = address!("00000000000000000000000000000000000000aa");

        // A speculative state samples nonce 0 and bumps it.
        let mut stale = State::new(bs.clone(), Incarnation::new(1, 1));
        assert_eq!(stale.get_nonce(&addr).unwrap(), 0);
        stale.set_nonce(&addr, 1).unwrap();

        // A lower transaction merges a conflicting nonce bump first.
        let mut t0 = State::new(bs.clone(), Incarnation::new(1, 0));
        t0.get_nonce(&addr).unwrap();
        t0.set_nonce(&addr, 1).unwrap();
        assert!(bs.try_merge(&mut t0).unwrap());

        // The stale state no longer validates and must be re-executed.
        assert!(!bs.try_merge(&mut stale).unwrap());

        let mut retry = State::new(bs.clone(), Incarnation::new(1, 1));
        assert_eq!(retry.get_nonce(&addr).unwrap(), 1);
        retry.set_nonce(&addr, 2).unwrap();
        assert!(bs.try_merge(&mut retry).unwrap());
    }

    #[test]
    fn relaxed_merge_shifts_balance_drift() {
        let bs = Arc::new(block_state());
        let a = address!("00000000000000000000000000000000000000aa");
        let b = address!("00000000000000000000000000000000000000bb");

        let mut seed = State::new(bs.clone(), Incarnation::new(1, 0));
        seed.add_to_balance(&a, U256::from(100)).unwrap();
        assert!(bs.try_merge(&mut seed).unwrap());

        // Two debits prepared against the same original balance; both
        // only rely on a balance floor, so both merge, and the second
        // merge shifts by the first one's drift.
        let mut t1 = State::new(bs.clone(), Incarnation::new(1, 1));
        t1.subtract_from_balance(&a, U256::from(30)).unwrap();
        let mut t2 = State::new(bs.clone(), Incarnation::new(1, 2));
        t2.subtract_from_balance(&a, U256::from(30)).unwrap();

        assert!(bs.try_merge(&mut t1).unwrap());
        assert!(bs.try_merge(&mut t2).unwrap());

        let mut check = State::new(bs.clone(), Incarnation::new(1, 3));
        assert_eq!(check.get_balance(&a).unwrap(), U256::from(40));
        let _ = b;
    }
}
