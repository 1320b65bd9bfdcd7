//! Per-transaction versioned state.
//!
//! A `State` layers account histories over the shared [`BlockState`]. The
//! first read of an address seeds an original snapshot; writes create
//! current snapshots on a per-call-frame version stack. Warm/cold access
//! sets and emitted logs are journaled per frame so a reverted frame
//! rolls its additions back. Every balance mutation passes through the
//! reserve-balance hooks.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use thiserror::Error;

use crate::account_state::{AccountHistory, CurrentAccountState, StorageStatus};
use crate::block_state::BlockState;
use crate::db::DbError;
use crate::evm::{is_delegated, AccessStatus};
use crate::primitives::{Account, Incarnation, Log};
use crate::reserve_balance::{max_reserve, ReserveBalance};
use crate::revision::Revision;
use crate::EMPTY_CODE_HASH;

/// Fatal invariant violations; these abort the whole block.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("balance overflow for {0}")]
    BalanceOverflow(Address),
    #[error("balance underflow for {0}")]
    BalanceUnderflow(Address),
    #[error("no block state entry for {0}")]
    MissingBlockStateEntry(Address),
    #[error("code missing for hash {0}")]
    MissingCode(B256),
    #[error("gas fee greater than reserve for non-dipping transaction from {0}")]
    GasFeesExceedReserve(Address),
    #[error(transparent)]
    Db(#[from] DbError),
    /// Sentinel returned by host callbacks while the real error unwinds
    /// through interpreter frames; never observed at the top level.
    #[error("unwinding through the interpreter")]
    StackUnwind,
}

#[derive(Debug, Default)]
struct Frame {
    version: u32,
    logs_len: usize,
    touched: AHashSet<Address>,
    accessed_addresses: Vec<Address>,
    accessed_storage: Vec<(Address, B256)>,
}

pub struct State {
    block_state: Arc<BlockState>,
    incarnation: Incarnation,
    version: u32,
    histories: AHashMap<Address, AccountHistory>,
    code: AHashMap<B256, Arc<Bytes>>,
    logs: Vec<Log>,
    frames: Vec<Frame>,
    accessed_addresses: AHashSet<Address>,
    accessed_storage: AHashSet<(Address, B256)>,
    reserve: ReserveBalance,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("incarnation", &self.incarnation)
            .field("version", &self.version)
            .field("accounts", &self.histories.len())
            .finish()
    }
}

impl State {
    pub fn new(block_state: Arc<BlockState>, incarnation: Incarnation) -> Self {
        // System and end-of-block states run with tracking disabled; the
        // executor arms the tracker per transaction.
        let reserve = ReserveBalance::disabled(Revision::new(
            crate::revision::EvmRevision::Frontier,
            None,
        ));
        Self {
            block_state,
            incarnation,
            version: 0,
            histories: AHashMap::new(),
            code: AHashMap::new(),
            logs: Vec::new(),
            frames: vec![Frame::default()],
            accessed_addresses: AHashSet::new(),
            accessed_storage: AHashSet::new(),
            reserve,
        }
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn block_state(&self) -> &Arc<BlockState> {
        &self.block_state
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn reserve(&self) -> &ReserveBalance {
        &self.reserve
    }

    pub fn reserve_mut(&mut self) -> &mut ReserveBalance {
        &mut self.reserve
    }

    fn ensure_history(&mut self, address: &Address) -> Result<(), StateError> {
        if !self.histories.contains_key(address) {
            let account = self.block_state.read_account(address)?;
            self.histories
                .insert(*address, AccountHistory::new(account));
        }
        Ok(())
    }

    fn history_mut(&mut self, address: &Address) -> Result<&mut AccountHistory, StateError> {
        self.ensure_history(address)?;
        Ok(self.histories.get_mut(address).expect("just ensured"))
    }

    pub fn original_account_state(
        &mut self,
        address: &Address,
    ) -> Result<&mut crate::account_state::OriginalAccountState, StateError> {
        Ok(self.history_mut(address)?.original_state_mut())
    }

    /// Mutable current snapshot, journaling the address in the live frame
    /// if a new snapshot had to be pushed.
    fn current_mut(
        &mut self,
        address: &Address,
    ) -> Result<&mut CurrentAccountState, StateError> {
        self.ensure_history(address)?;
        let version = self.version;
        {
            let history = self.histories.get_mut(address).expect("just ensured");
            let (_, pushed) = history.current_state(version);
            if pushed {
                self.frames
                    .last_mut()
                    .expect("base frame always present")
                    .touched
                    .insert(*address);
            }
        }
        let history = self.histories.get_mut(address).expect("just ensured");
        Ok(history.current_state(version).0)
    }

    // --- host-facing reads ---

    pub fn account_exists(&mut self, address: &Address) -> Result<bool, StateError> {
        Ok(self.history_mut(address)?.recent_state().has_account())
    }

    /// EIP-161: an account is dead when absent or empty.
    pub fn account_is_dead(&mut self, address: &Address) -> Result<bool, StateError> {
        let state = self.history_mut(address)?.recent_state();
        Ok(match &state.account {
            None => true,
            Some(account) => account.is_empty(),
        })
    }

    /// Balance as the EVM observes it; demands exact merge validation.
    pub fn get_balance(&mut self, address: &Address) -> Result<U256, StateError> {
        Ok(self.history_mut(address)?.balance_with_exact_validation())
    }

    /// Whether the balance covers `amount`, recording only the balance
    /// floor as a merge dependency rather than the exact value.
    pub fn balance_at_least(
        &mut self,
        address: &Address,
        amount: U256,
    ) -> Result<bool, StateError> {
        Ok(self
            .history_mut(address)?
            .record_min_balance_for_debit(amount))
    }

    pub fn get_nonce(&mut self, address: &Address) -> Result<u64, StateError> {
        Ok(self.history_mut(address)?.recent_state().get_nonce())
    }

    /// EVM-visible code hash: zero for dead accounts.
    pub fn get_code_hash(&mut self, address: &Address) -> Result<B256, StateError> {
        if self.account_is_dead(address)? {
            return Ok(B256::ZERO);
        }
        Ok(self.history_mut(address)?.recent_state().get_code_hash())
    }

    pub fn get_code(&mut self, address: &Address) -> Result<Arc<Bytes>, StateError> {
        let hash = self.history_mut(address)?.recent_state().get_code_hash();
        self.code_by_hash(&hash)
    }

    pub fn code_by_hash(&mut self, hash: &B256) -> Result<Arc<Bytes>, StateError> {
        if *hash == EMPTY_CODE_HASH || hash.is_zero() {
            return Ok(Arc::new(Bytes::new()));
        }
        if let Some(code) = self.code.get(hash) {
            return Ok(code.clone());
        }
        self.block_state.read_code(hash)
    }

    /// Code hash used by the reserve subject test; `recent` selects the
    /// freshly written hash (post-EIP-7702 revisions) over the original.
    pub fn code_hash_for_reserve(
        &mut self,
        address: &Address,
        recent: bool,
    ) -> Result<B256, StateError> {
        let history = self.history_mut(address)?;
        Ok(if recent {
            history.recent_state().get_code_hash()
        } else {
            history.original_state().state.get_code_hash()
        })
    }

    pub fn is_delegated_code_hash(&mut self, hash: &B256) -> Result<bool, StateError> {
        let code = self.code_by_hash(hash)?;
        Ok(is_delegated(&code))
    }

    /// Value of `key` for the account's original (transaction-start)
    /// lifetime, memoized for merge validation. Accounts created in this
    /// transaction or block read zero without touching the store.
    fn original_storage_value(
        &mut self,
        address: &Address,
        key: &B256,
    ) -> Result<B256, StateError> {
        self.ensure_history(address)?;
        let (cached, original_account, recent_incarnation) = {
            let history = self.histories.get(address).expect("just ensured");
            (
                history.original_state().state.storage.get(key).copied(),
                history.original_state().state.account,
                history.recent_state().get_incarnation(),
            )
        };
        let Some(original) = original_account else {
            return Ok(B256::ZERO);
        };
        if recent_incarnation != Some(original.incarnation) {
            // Recreated in this transaction; old storage is invisible and
            // not a merge dependency.
            return Ok(B256::ZERO);
        }
        if let Some(value) = cached {
            return Ok(value);
        }
        let value = self
            .block_state
            .read_storage(address, original.incarnation, key)?;
        self.histories
            .get_mut(address)
            .expect("just ensured")
            .original_state_mut()
            .state
            .storage
            .insert(*key, value);
        Ok(value)
    }

    pub fn get_storage(&mut self, address: &Address, key: &B256) -> Result<B256, StateError> {
        self.ensure_history(address)?;
        if let Some(current) = self
            .histories
            .get(address)
            .expect("just ensured")
            .recent_current_state()
        {
            if let Some(value) = current.state.storage.get(key) {
                return Ok(*value);
            }
        }
        self.original_storage_value(address, key)
    }

    pub fn set_storage(
        &mut self,
        address: &Address,
        key: &B256,
        value: B256,
    ) -> Result<StorageStatus, StateError> {
        let original = self.original_storage_value(address, key)?;
        let current = self.current_mut(address)?;
        Ok(current.state.set_storage(*key, value, original))
    }

    pub fn get_transient_storage(
        &mut self,
        address: &Address,
        key: &B256,
    ) -> Result<B256, StateError> {
        self.ensure_history(address)?;
        Ok(self
            .histories
            .get(address)
            .expect("just ensured")
            .recent_current_state()
            .map(|current| current.get_transient_storage(key))
            .unwrap_or_default())
    }

    pub fn set_transient_storage(
        &mut self,
        address: &Address,
        key: &B256,
        value: B256,
    ) -> Result<(), StateError> {
        self.current_mut(address)?.set_transient_storage(*key, value);
        Ok(())
    }

    // --- access sets (EIP-2929) ---

    pub fn access_account(&mut self, address: &Address) -> AccessStatus {
        if self.accessed_addresses.insert(*address) {
            self.frames
                .last_mut()
                .expect("base frame always present")
                .accessed_addresses
                .push(*address);
            AccessStatus::Cold
        } else {
            AccessStatus::Warm
        }
    }

    pub fn access_storage(&mut self, address: &Address, key: &B256) -> AccessStatus {
        if self.accessed_storage.insert((*address, *key)) {
            self.frames
                .last_mut()
                .expect("base frame always present")
                .accessed_storage
                .push((*address, *key));
            AccessStatus::Cold
        } else {
            AccessStatus::Warm
        }
    }

    // --- writes ---

    pub fn add_to_balance(&mut self, address: &Address, delta: U256) -> Result<(), StateError> {
        self.ensure_history(address)?;
        let version = self.version;
        let incarnation = self.incarnation;
        let pushed = self
            .histories
            .get_mut(address)
            .expect("just ensured")
            .add_to_balance(address, version, incarnation, delta)?;
        if pushed {
            self.frames
                .last_mut()
                .expect("base frame always present")
                .touched
                .insert(*address);
        }
        self.rb_on_credit(address)
    }

    pub fn subtract_from_balance(
        &mut self,
        address: &Address,
        delta: U256,
    ) -> Result<(), StateError> {
        self.ensure_history(address)?;
        let version = self.version;
        let incarnation = self.incarnation;
        let pushed = self
            .histories
            .get_mut(address)
            .expect("just ensured")
            .subtract_from_balance(address, version, incarnation, delta)?;
        if pushed {
            self.frames
                .last_mut()
                .expect("base frame always present")
                .touched
                .insert(*address);
        }
        self.rb_on_debit(address)
    }

    pub fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<(), StateError> {
        let incarnation = self.incarnation;
        let current = self.current_mut(address)?;
        let account = current.state.account.get_or_insert_with(|| Account {
            incarnation,
            ..Account::default()
        });
        account.nonce = nonce;
        current.touch();
        Ok(())
    }

    pub fn set_code(&mut self, address: &Address, code: Bytes) -> Result<(), StateError> {
        let hash = if code.is_empty() {
            EMPTY_CODE_HASH
        } else {
            keccak256(&code)
        };
        if hash != EMPTY_CODE_HASH {
            self.code.entry(hash).or_insert_with(|| Arc::new(code.clone()));
        }
        let incarnation = self.incarnation;
        let current = self.current_mut(address)?;
        let account = current.state.account.get_or_insert_with(|| Account {
            incarnation,
            ..Account::default()
        });
        account.code_hash = hash;
        current.touch();
        self.rb_on_set_code(address, &code)
    }

    /// Begin a fresh contract lifetime at this transaction's incarnation.
    /// The balance survives; the storage map starts empty and stale keys
    /// read zero through the incarnation check.
    pub fn create_contract(&mut self, address: &Address) -> Result<(), StateError> {
        let incarnation = self.incarnation;
        let current = self.current_mut(address)?;
        let balance = current.state.get_balance();
        let nonce = current.state.get_nonce();
        current.state.account = Some(Account {
            balance,
            nonce,
            code_hash: EMPTY_CODE_HASH,
            incarnation,
        });
        current.state.storage = Default::default();
        current.touch();
        Ok(())
    }

    /// Returns `(registered, transferred_balance)`; `registered` is true
    /// the first time the account is scheduled for destruction.
    pub fn selfdestruct(
        &mut self,
        address: &Address,
        beneficiary: &Address,
        revision: Revision,
    ) -> Result<(bool, U256), StateError> {
        let balance = self.get_balance(address)?;
        let incarnation = self.incarnation;
        let created_this_txn = {
            let history = self.history_mut(address)?;
            history.recent_state().get_incarnation() == Some(incarnation)
        };
        self.subtract_from_balance(address, balance)?;
        self.add_to_balance(beneficiary, balance)?;
        // EIP-6780: only accounts created in the same transaction are
        // actually destroyed post-Cancun.
        if revision.cancun() && !created_this_txn {
            self.current_mut(address)?.touch();
            return Ok((false, balance));
        }
        let current = self.current_mut(address)?;
        let registered = !current.destructed;
        current.destructed = true;
        current.touch();
        Ok((registered, balance))
    }

    /// Remove accounts scheduled for destruction. Runs at transaction end
    /// with all call frames resolved.
    pub fn destruct_suicides(&mut self) {
        debug_assert_eq!(self.version, 0);
        for history in self.histories.values_mut() {
            let destructed = history
                .recent_current_state()
                .is_some_and(|current| current.destructed);
            if destructed {
                let (current, _) = history.current_state(0);
                current.state.account = None;
                current.state.storage = Default::default();
                current.destructed = false;
            }
        }
    }

    /// EIP-161 cleanup: drop touched accounts that ended the transaction
    /// dead.
    pub fn destruct_touched_dead(&mut self) {
        debug_assert_eq!(self.version, 0);
        for history in self.histories.values_mut() {
            let dead_touched = history.recent_current_state().is_some_and(|current| {
                current.touched
                    && current
                        .state
                        .account
                        .as_ref()
                        .is_some_and(|account| account.is_empty())
            });
            if dead_touched {
                let (current, _) = history.current_state(0);
                current.state.account = None;
                current.state.storage = Default::default();
            }
        }
    }

    // --- logs ---

    pub fn store_log(&mut self, log: Log) {
        self.logs.push(log);
    }

    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    pub fn take_logs(&mut self) -> Vec<Log> {
        std::mem::take(&mut self.logs)
    }

    // --- call-frame snapshots ---

    pub fn push(&mut self) {
        self.version += 1;
        self.frames.push(Frame {
            version: self.version,
            logs_len: self.logs.len(),
            ..Frame::default()
        });
    }

    pub fn pop_accept(&mut self) {
        let frame = self.frames.pop().expect("pop_accept without push");
        debug_assert_eq!(frame.version, self.version);
        debug_assert!(self.version > 0);
        for address in &frame.touched {
            self.histories
                .get_mut(address)
                .expect("touched account has a history")
                .pop_accept(frame.version);
        }
        let parent = self.frames.last_mut().expect("base frame remains");
        parent.touched.extend(frame.touched);
        parent
            .accessed_addresses
            .extend(frame.accessed_addresses);
        parent.accessed_storage.extend(frame.accessed_storage);
        self.version -= 1;
    }

    pub fn pop_reject(&mut self) {
        let frame = self.frames.pop().expect("pop_reject without push");
        debug_assert_eq!(frame.version, self.version);
        debug_assert!(self.version > 0);
        for address in &frame.touched {
            self.histories
                .get_mut(address)
                .expect("touched account has a history")
                .pop_reject(frame.version);
        }
        self.logs.truncate(frame.logs_len);
        for address in frame.accessed_addresses {
            self.accessed_addresses.remove(&address);
        }
        for key in frame.accessed_storage {
            self.accessed_storage.remove(&key);
        }
        self.version -= 1;
        self.rb_on_pop_reject(&frame.touched);
    }

    // --- reserve-balance hooks ---

    fn rb_on_credit(&mut self, address: &Address) -> Result<(), StateError> {
        if !self.reserve.tracking_enabled() {
            return Ok(());
        }
        if self.reserve.failed_contains(address) {
            self.rb_update_violation_status(address)?;
        }
        Ok(())
    }

    fn rb_on_debit(&mut self, address: &Address) -> Result<(), StateError> {
        if !self.reserve.tracking_enabled() {
            return Ok(());
        }
        self.rb_update_violation_status(address)
    }

    fn rb_on_set_code(&mut self, address: &Address, code: &Bytes) -> Result<(), StateError> {
        if !self.reserve.tracking_enabled() || !self.reserve.use_recent_code_hash() {
            return Ok(());
        }
        if !is_delegated(code) {
            let current = self.current_mut(address)?;
            current.rb_violation_threshold = Some(U256::ZERO);
            current.rb_failed = false;
            self.reserve.clear_failed(address);
            return Ok(());
        }
        self.current_mut(address)?.rb_violation_threshold = None;
        self.rb_update_violation_status(address)
    }

    fn rb_subject_account(&mut self, address: &Address) -> Result<bool, StateError> {
        let recent = self.reserve.use_recent_code_hash();
        let effective_code_hash = self.code_hash_for_reserve(address, recent)?;
        if effective_code_hash == EMPTY_CODE_HASH {
            return Ok(true);
        }
        self.is_delegated_code_hash(&effective_code_hash)
    }

    fn rb_pretx_reserve(&mut self, address: &Address) -> Result<U256, StateError> {
        let reserve = max_reserve(self.reserve.revision(), address);
        let original = self.history_mut(address)?.original_balance_pessimistic();
        Ok(reserve.min(original))
    }

    pub(crate) fn rb_update_violation_status(
        &mut self,
        address: &Address,
    ) -> Result<(), StateError> {
        if !self.reserve.tracking_enabled() {
            return Ok(());
        }
        let cached = self.current_mut(address)?.rb_violation_threshold;
        let threshold = match cached {
            Some(threshold) => threshold,
            None => {
                let threshold = if !self.rb_subject_account(address)? {
                    U256::ZERO
                } else {
                    let reserve = self.rb_pretx_reserve(address)?;
                    if *address == self.reserve.sender() {
                        if self.reserve.sender_can_dip() {
                            U256::ZERO
                        } else {
                            let fees = self.reserve.sender_gas_fees();
                            if fees > reserve {
                                return Err(StateError::GasFeesExceedReserve(*address));
                            }
                            reserve - fees
                        }
                    } else {
                        reserve
                    }
                };
                self.current_mut(address)?.rb_violation_threshold = Some(threshold);
                threshold
            }
        };

        if threshold.is_zero() {
            self.reserve.clear_failed(address);
            self.current_mut(address)?.rb_failed = false;
            return Ok(());
        }

        if self.get_balance(address)? < threshold {
            self.reserve.mark_failed(*address);
            self.current_mut(address)?.rb_failed = true;
        } else {
            self.reserve.clear_failed(address);
            self.current_mut(address)?.rb_failed = false;
        }
        Ok(())
    }

    fn rb_on_pop_reject(&mut self, touched: &AHashSet<Address>) {
        if !self.reserve.tracking_enabled() {
            return;
        }
        for address in touched {
            let failed = self
                .histories
                .get(address)
                .and_then(|history| history.recent_current_state())
                .map(|current| current.rb_failed)
                .unwrap_or(false);
            if failed {
                self.reserve.mark_failed(*address);
            } else {
                self.reserve.clear_failed(address);
            }
        }
    }

    // --- merge surface ---

    pub(crate) fn histories(&self) -> &AHashMap<Address, AccountHistory> {
        &self.histories
    }

    pub(crate) fn drain_histories(
        &mut self,
    ) -> impl Iterator<Item = (Address, AccountHistory)> + '_ {
        self.histories.drain()
    }

    pub(crate) fn drain_code(&mut self) -> impl Iterator<Item = (B256, Arc<Bytes>)> + '_ {
        self.code.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDb;
    use crate::revision::{EvmRevision, MonadRevision};
    use alloy_primitives::{address, b256};

    fn state() -> State {
        let bs = Arc::new(BlockState::new(Arc::new(InMemoryDb::new())));
        State::new(bs, Incarnation::new(1, 0))
    }

    const ADDR: Address = address!("00000000000000000000000000000000000000aa");
    const KEY: B256 = b256!("0000000000000000000000000000000000000000000000000000000000000001");

    fn word(byte: u8) -> B256 {
        let mut out = B256::ZERO;
        out.0[31] = byte;
        out
    }

    #[test]
    fn frame_reject_rolls_back_storage_logs_and_access() {
        let mut state = state();
        state.add_to_balance(&ADDR, U256::from(1)).unwrap();
        assert_eq!(state.access_account(&ADDR), AccessStatus::Cold);

        state.push();
        state.set_storage(&ADDR, &KEY, word(7)).unwrap();
        state.store_log(Log {
            address: ADDR,
            ..Log::default()
        });
        let other = address!("00000000000000000000000000000000000000bb");
        assert_eq!(state.access_account(&other), AccessStatus::Cold);
        state.pop_reject();

        assert_eq!(state.get_storage(&ADDR, &KEY).unwrap(), B256::ZERO);
        assert!(state.logs().is_empty());
        // Rolled back to cold, while the outer access stays warm.
        assert_eq!(state.access_account(&other), AccessStatus::Cold);
        assert_eq!(state.access_account(&ADDR), AccessStatus::Warm);
        assert_eq!(state.get_balance(&ADDR).unwrap(), U256::from(1));
    }

    #[test]
    fn frame_accept_keeps_changes() {
        let mut state = state();
        state.push();
        state.set_storage(&ADDR, &KEY, word(7)).unwrap();
        state.pop_accept();
        assert_eq!(state.get_storage(&ADDR, &KEY).unwrap(), word(7));
    }

    #[test]
    fn transient_storage_reverts_with_frame() {
        let mut state = state();
        state.set_transient_storage(&ADDR, &KEY, word(1)).unwrap();
        state.push();
        state.set_transient_storage(&ADDR, &KEY, word(2)).unwrap();
        state.pop_reject();
        assert_eq!(state.get_transient_storage(&ADDR, &KEY).unwrap(), word(1));
    }

    #[test]
    fn selfdestruct_created_account_post_cancun() {
        let rev = Revision::new(EvmRevision::Cancun, Some(MonadRevision::Four));
        let mut state = state();
        let beneficiary = address!("00000000000000000000000000000000000000bb");
        state.create_contract(&ADDR).unwrap();
        state.add_to_balance(&ADDR, U256::from(5)).unwrap();
        let (registered, transferred) =
            state.selfdestruct(&ADDR, &beneficiary, rev).unwrap();
        assert!(registered);
        assert_eq!(transferred, U256::from(5));
        state.destruct_suicides();
        assert!(!state.account_exists(&ADDR).unwrap());
        assert_eq!(state.get_balance(&beneficiary).unwrap(), U256::from(5));
    }

    #[test]
    fn selfdestruct_pre_existing_account_post_cancun_only_transfers() {
        let rev = Revision::new(EvmRevision::Cancun, Some(MonadRevision::Four));
        let bs = Arc::new(BlockState::new(Arc::new(InMemoryDb::new())));

        // Commit the account in an earlier transaction.
        let mut seed = State::new(bs.clone(), Incarnation::new(1, 0));
        seed.add_to_balance(&ADDR, U256::from(5)).unwrap();
        seed.set_nonce(&ADDR, 1).unwrap();
        assert!(bs.try_merge(&mut seed).unwrap());

        let mut state = State::new(bs, Incarnation::new(1, 1));
        let beneficiary = address!("00000000000000000000000000000000000000bb");
        let (registered, _) = state.selfdestruct(&ADDR, &beneficiary, rev).unwrap();
        assert!(!registered);
        state.destruct_suicides();
        assert!(state.account_exists(&ADDR).unwrap());
        assert_eq!(state.get_balance(&ADDR).unwrap(), U256::ZERO);
        assert_eq!(state.get_balance(&beneficiary).unwrap(), U256::from(5));
    }

    #[test]
    fn touched_dead_accounts_are_removed() {
        let mut state = state();
        state.add_to_balance(&ADDR, U256::ZERO).unwrap();
        assert!(state.account_exists(&ADDR).unwrap());
        state.destruct_touched_dead();
        assert!(!state.account_exists(&ADDR).unwrap());
    }

    #[test]
    fn storage_of_recreated_contract_reads_zero() {
        let bs = Arc::new(BlockState::new(Arc::new(InMemoryDb::new())));
        let mut seed = State::new(bs.clone(), Incarnation::new(1, 0));
        seed.create_contract(&ADDR).unwrap();
        seed.set_nonce(&ADDR, 1).unwrap();
        seed.set_storage(&ADDR, &KEY, word(9)).unwrap();
        assert!(bs.try_merge(&mut seed).unwrap());

        // Same block, later transaction recreates the account.
        let mut state = State::new(bs, Incarnation::new(1, 4));
        assert_eq!(state.get_storage(&ADDR, &KEY).unwrap(), word(9));
        state.create_contract(&ADDR).unwrap();
        assert_eq!(state.get_storage(&ADDR, &KEY).unwrap(), B256::ZERO);
    }
}
