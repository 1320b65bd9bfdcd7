//! Per-account snapshots: the original view observed at transaction start
//! (with the relaxed-merge bookkeeping) and the stack of current views,
//! one per active call frame.

use std::ops::{Deref, DerefMut};

use alloy_primitives::{Address, B256, U256};

use crate::primitives::{Account, Incarnation};
use crate::state::StateError;
use crate::version_stack::VersionStack;
use crate::EMPTY_CODE_HASH;

/// Persistent key/value map with O(1) clone; every call-frame snapshot of
/// an account shares structure with its parent.
pub type StorageMap = im::HashMap<B256, B256>;

/// Discrete outcome of a storage write, as the interpreter prices it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageStatus {
    Assigned,
    Added,
    Deleted,
    Modified,
    DeletedAdded,
    ModifiedDeleted,
    DeletedRestored,
    AddedDeleted,
    ModifiedRestored,
}

#[derive(Clone, Debug, Default)]
pub struct AccountState {
    pub account: Option<Account>,
    pub storage: StorageMap,
}

impl AccountState {
    pub fn new(account: Option<Account>) -> Self {
        Self {
            account,
            storage: StorageMap::new(),
        }
    }

    pub fn has_account(&self) -> bool {
        self.account.is_some()
    }

    pub fn get_code_hash(&self) -> B256 {
        match &self.account {
            Some(account) => account.code_hash,
            None => EMPTY_CODE_HASH,
        }
    }

    pub fn get_nonce(&self) -> u64 {
        self.account.as_ref().map_or(0, |a| a.nonce)
    }

    pub fn get_balance(&self) -> U256 {
        self.account.as_ref().map_or(U256::ZERO, |a| a.balance)
    }

    pub fn get_incarnation(&self) -> Option<Incarnation> {
        self.account.as_ref().map(|a| a.incarnation)
    }

    /// Write `value` under `key` and classify the transition against the
    /// `original` (transaction-start) and current values.
    pub fn set_storage(&mut self, key: B256, value: B256, original: B256) -> StorageStatus {
        let current = self.storage.get(&key).copied().unwrap_or(original);
        self.storage.insert(key, value);
        storage_status(original, current, value)
    }
}

fn storage_status(original: B256, current: B256, value: B256) -> StorageStatus {
    use StorageStatus::*;
    if current == value {
        return Assigned;
    }
    if original == current {
        if original.is_zero() {
            Added
        } else if value.is_zero() {
            Deleted
        } else {
            Modified
        }
    } else if original.is_zero() {
        if value.is_zero() {
            AddedDeleted
        } else {
            Assigned
        }
    } else if current.is_zero() {
        if value == original {
            DeletedRestored
        } else {
            DeletedAdded
        }
    } else if value.is_zero() {
        ModifiedDeleted
    } else if value == original {
        ModifiedRestored
    } else {
        Assigned
    }
}

/// Call-frame snapshot: account view plus the transaction substate that
/// must revert with the frame.
#[derive(Clone, Debug, Default)]
pub struct CurrentAccountState {
    pub state: AccountState,
    pub transient_storage: StorageMap,
    pub touched: bool,
    pub destructed: bool,
    /// Cached reserve-balance violation threshold; `None` until computed.
    pub rb_violation_threshold: Option<U256>,
    pub rb_failed: bool,
}

impl CurrentAccountState {
    fn from_original(original: &OriginalAccountState) -> Self {
        Self {
            state: original.state.clone(),
            transient_storage: StorageMap::new(),
            touched: false,
            destructed: false,
            rb_violation_threshold: None,
            rb_failed: false,
        }
    }

    pub fn touch(&mut self) {
        self.touched = true;
    }

    pub fn get_transient_storage(&self, key: &B256) -> B256 {
        self.transient_storage.get(key).copied().unwrap_or_default()
    }

    pub fn set_transient_storage(&mut self, key: B256, value: B256) {
        self.transient_storage.insert(key, value);
    }
}

impl Deref for CurrentAccountState {
    type Target = AccountState;

    fn deref(&self) -> &AccountState {
        &self.state
    }
}

impl DerefMut for CurrentAccountState {
    fn deref_mut(&mut self) -> &mut AccountState {
        &mut self.state
    }
}

/// The snapshot seen from the committed block state at transaction start.
///
/// Tracks how precisely the merge must validate the balance: an explicit
/// balance read demands the exact original value, while a successful debit
/// only records the minimum original balance it relied on, letting
/// unrelated credits and debits commit underneath without a re-execution.
#[derive(Clone, Debug)]
pub struct OriginalAccountState {
    pub state: AccountState,
    validate_exact_balance: bool,
    min_balance: U256,
}

impl OriginalAccountState {
    pub fn new(account: Option<Account>) -> Self {
        Self {
            state: AccountState::new(account),
            validate_exact_balance: false,
            min_balance: U256::ZERO,
        }
    }

    pub fn validate_exact_balance(&self) -> bool {
        self.validate_exact_balance
    }

    pub fn min_balance(&self) -> U256 {
        self.min_balance
    }

    pub fn set_validate_exact_balance(&mut self) {
        self.validate_exact_balance = true;
    }

    pub fn get_balance_pessimistic(&mut self) -> U256 {
        self.set_validate_exact_balance();
        self.state.get_balance()
    }

    pub fn get_balance_or_zero(&self) -> U256 {
        self.state.get_balance()
    }

    fn set_min_balance(&mut self, value: U256) {
        debug_assert!(self.state.get_balance() >= value);
        if value > self.min_balance {
            self.min_balance = value;
        }
    }
}

impl Deref for OriginalAccountState {
    type Target = AccountState;

    fn deref(&self) -> &AccountState {
        &self.state
    }
}

impl DerefMut for OriginalAccountState {
    fn deref_mut(&mut self) -> &mut AccountState {
        &mut self.state
    }
}

/// The central versioned object: original snapshot plus the optional
/// stack of current snapshots for the frames that touched the account.
#[derive(Clone, Debug)]
pub struct AccountHistory {
    original: OriginalAccountState,
    current: Option<VersionStack<CurrentAccountState>>,
}

impl AccountHistory {
    pub fn new(account: Option<Account>) -> Self {
        Self {
            original: OriginalAccountState::new(account),
            current: None,
        }
    }

    pub fn original_state(&self) -> &OriginalAccountState {
        &self.original
    }

    pub fn original_state_mut(&mut self) -> &mut OriginalAccountState {
        &mut self.original
    }

    pub fn has_current_state(&self) -> bool {
        self.current.is_some()
    }

    pub fn recent_current_state(&self) -> Option<&CurrentAccountState> {
        self.current.as_ref().map(|stack| stack.recent())
    }

    /// Most recent view: top of the current stack, else the original.
    pub fn recent_state(&self) -> &AccountState {
        match &self.current {
            Some(stack) => &stack.recent().state,
            None => &self.original.state,
        }
    }

    /// Number of live current snapshots and the version of the top one;
    /// the block-state merge asserts `(1, 0)`.
    pub(crate) fn stack_shape(&self) -> Option<(usize, u32)> {
        self.current.as_ref().map(|s| (s.len(), s.version()))
    }

    /// Mutable current snapshot for `version`, created from the original
    /// (or cloned from the enclosing frame) on demand. The bool reports
    /// whether a new snapshot was pushed.
    pub(crate) fn current_state(&mut self, version: u32) -> (&mut CurrentAccountState, bool) {
        let original = &self.original;
        let stack = self.current.get_or_insert_with(|| {
            VersionStack::new(CurrentAccountState::from_original(original), version)
        });
        stack.current(version)
    }

    pub(crate) fn add_to_balance(
        &mut self,
        address: &Address,
        version: u32,
        incarnation: Incarnation,
        delta: U256,
    ) -> Result<bool, StateError> {
        let (current, pushed) = self.current_state(version);
        let account = current
            .state
            .account
            .get_or_insert_with(|| Account {
                incarnation,
                ..Account::default()
            });
        account.balance = account
            .balance
            .checked_add(delta)
            .ok_or(StateError::BalanceOverflow(*address))?;
        current.touch();
        Ok(pushed)
    }

    pub(crate) fn subtract_from_balance(
        &mut self,
        address: &Address,
        version: u32,
        incarnation: Incarnation,
        delta: U256,
    ) -> Result<bool, StateError> {
        if !self.record_min_balance_for_debit(delta) {
            return Err(StateError::BalanceUnderflow(*address));
        }
        let (current, pushed) = self.current_state(version);
        let account = current
            .state
            .account
            .get_or_insert_with(|| Account {
                incarnation,
                ..Account::default()
            });
        account.balance = account
            .balance
            .checked_sub(delta)
            .ok_or(StateError::BalanceUnderflow(*address))?;
        current.touch();
        Ok(pushed)
    }

    pub(crate) fn pop_accept(&mut self, version: u32) {
        if let Some(stack) = &mut self.current {
            stack.pop_accept(version);
        }
    }

    pub(crate) fn pop_reject(&mut self, version: u32) {
        if let Some(stack) = &mut self.current {
            if stack.pop_reject(version) {
                self.current = None;
            }
        }
    }

    /// Balance as the EVM observes it; forces exact merge validation.
    pub fn balance_with_exact_validation(&mut self) -> U256 {
        self.original.set_validate_exact_balance();
        self.recent_state().get_balance()
    }

    pub fn original_balance_pessimistic(&mut self) -> U256 {
        self.original.get_balance_pessimistic()
    }

    /// Record the weakest original-balance assumption that keeps `debit`
    /// payable. Returns false when the recent balance cannot cover it, in
    /// which case exact validation is demanded instead.
    pub(crate) fn record_min_balance_for_debit(&mut self, debit: U256) -> bool {
        let balance = self.recent_state().get_balance();
        if balance >= debit {
            let diff = balance - debit;
            let original_balance = self.original.get_balance_or_zero();
            if original_balance > diff {
                self.original.set_min_balance(original_balance - diff);
            }
            true
        } else {
            self.original.set_validate_exact_balance();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    const KEY: B256 = b256!("00000000000000000000000000000000000000000000000000000000000000aa");

    fn word(byte: u8) -> B256 {
        let mut out = B256::ZERO;
        out.0[31] = byte;
        out
    }

    fn state_with_storage(original: B256) -> AccountState {
        let mut state = AccountState::new(Some(Account::default()));
        if !original.is_zero() {
            state.storage.insert(KEY, original);
        }
        state
    }

    #[test]
    fn storage_status_matrix() {
        use StorageStatus::*;
        let x = word(1);
        let y = word(2);
        let z = word(3);
        let o = B256::ZERO;

        // (original, current, value) -> status
        let cases = [
            (o, o, o, Assigned),
            (o, o, z, Added),
            (x, x, o, Deleted),
            (x, x, z, Modified),
            (x, x, x, Assigned),
            (o, y, o, AddedDeleted),
            (o, y, z, Assigned),
            (x, o, z, DeletedAdded),
            (x, o, x, DeletedRestored),
            (x, y, o, ModifiedDeleted),
            (x, y, x, ModifiedRestored),
            (x, y, z, Assigned),
            (x, y, y, Assigned),
        ];
        for (original, current, value, expected) in cases {
            assert_eq!(
                storage_status(original, current, value),
                expected,
                "({original}, {current}, {value})"
            );
        }
    }

    #[test]
    fn set_storage_added_then_deleted() {
        let mut state = state_with_storage(B256::ZERO);
        assert_eq!(state.set_storage(KEY, word(9), B256::ZERO), StorageStatus::Added);
        assert_eq!(
            state.set_storage(KEY, B256::ZERO, B256::ZERO),
            StorageStatus::AddedDeleted
        );
    }

    #[test]
    fn balance_underflow_is_reported() {
        let addr = address!("00000000000000000000000000000000000000aa");
        let mut history = AccountHistory::new(Some(Account {
            balance: U256::from(5),
            ..Account::default()
        }));
        let err = history
            .subtract_from_balance(&addr, 0, Incarnation::default(), U256::from(6))
            .unwrap_err();
        assert!(matches!(err, StateError::BalanceUnderflow(a) if a == addr));
        // Failure demands exact validation at merge time.
        assert!(history.original_state().validate_exact_balance());
    }

    #[test]
    fn debit_records_min_balance() {
        let addr = address!("00000000000000000000000000000000000000aa");
        let mut history = AccountHistory::new(Some(Account {
            balance: U256::from(10),
            ..Account::default()
        }));
        history
            .subtract_from_balance(&addr, 0, Incarnation::default(), U256::from(3))
            .unwrap();
        assert_eq!(history.original_state().min_balance(), U256::from(3));
        assert!(!history.original_state().validate_exact_balance());
        history
            .add_to_balance(&addr, 0, Incarnation::default(), U256::from(1))
            .unwrap();
        history
            .subtract_from_balance(&addr, 0, Incarnation::default(), U256::from(6))
            .unwrap();
        // Lowest point was 10 - 3 + 1 - 6 = 2, so 8 of the original 10
        // were relied upon.
        assert_eq!(history.original_state().min_balance(), U256::from(8));
    }

    #[test]
    fn reject_reverts_to_original() {
        let addr = address!("00000000000000000000000000000000000000aa");
        let mut history = AccountHistory::new(None);
        history
            .add_to_balance(&addr, 1, Incarnation::new(3, 1), U256::from(7))
            .unwrap();
        assert!(history.has_current_state());
        history.pop_reject(1);
        assert!(!history.has_current_state());
        assert!(history.recent_state().account.is_none());
    }
}
