//! Reserve-balance tracking context.
//!
//! Some accounts must keep a minimum balance across a sliding window of
//! the current, parent and grandparent blocks. The tracker carries the
//! per-transaction context (sender, prepaid gas fees, dip permission) and
//! the set of addresses currently in violation; the balance hooks that
//! drive it live on [`crate::State`].

use ahash::AHashSet;
use alloy_primitives::{Address, U256};

use crate::chain::ChainContext;
use crate::primitives::Transaction;
use crate::revision::Revision;
use crate::state::State;

/// 10 MON, the default maximum reserve.
pub const DEFAULT_RESERVE_BALANCE_WEI: U256 =
    U256::from_limbs([10_000_000_000_000_000_000, 0, 0, 0]);

/// Per-revision maximum reserve for an address. Backed by a precompile in
/// a future revision; a constant for now.
pub fn max_reserve(_revision: Revision, _address: &Address) -> U256 {
    DEFAULT_RESERVE_BALANCE_WEI
}

#[derive(Clone, Debug)]
pub struct ReserveBalance {
    tracking_enabled: bool,
    use_recent_code_hash: bool,
    revision: Revision,
    sender: Address,
    sender_gas_fees: U256,
    sender_can_dip: bool,
    failed: AHashSet<Address>,
}

impl ReserveBalance {
    pub(crate) fn disabled(revision: Revision) -> Self {
        Self {
            tracking_enabled: false,
            use_recent_code_hash: false,
            revision,
            sender: Address::ZERO,
            sender_gas_fees: U256::ZERO,
            sender_can_dip: false,
            failed: AHashSet::new(),
        }
    }

    /// Arm the tracker for one transaction.
    pub fn init_from_tx(
        &mut self,
        sender: Address,
        tx: &Transaction,
        base_fee_per_gas: U256,
        sender_can_dip: bool,
        revision: Revision,
    ) {
        self.tracking_enabled = true;
        self.use_recent_code_hash = revision.reserve_uses_recent_code_hash();
        self.revision = revision;
        self.sender = sender;
        self.sender_gas_fees =
            U256::from(tx.gas_limit) * tx.effective_gas_price(base_fee_per_gas);
        self.sender_can_dip = sender_can_dip;
        self.failed.clear();
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    pub fn use_recent_code_hash(&self) -> bool {
        self.use_recent_code_hash
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn sender_gas_fees(&self) -> U256 {
        self.sender_gas_fees
    }

    pub fn sender_can_dip(&self) -> bool {
        self.sender_can_dip
    }

    pub fn has_violation(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn failed_contains(&self, address: &Address) -> bool {
        self.failed.contains(address)
    }

    pub(crate) fn mark_failed(&mut self, address: Address) {
        self.failed.insert(address);
    }

    pub(crate) fn clear_failed(&mut self, address: &Address) {
        self.failed.remove(address);
    }
}

/// Whether the transaction must be reverted after a successful EVM run.
/// Reverted transactions still consume gas and bump the sender nonce.
pub fn revert_transaction(revision: Revision, state: &State) -> bool {
    debug_assert!(state.reserve().tracking_enabled());
    if revision.reserve_balance_reverts() {
        state.reserve().has_violation()
    } else {
        false
    }
}

/// A sender may spend below its reserve only when it is not delegated and
/// does not overlap with the grandparent, parent or earlier-in-block
/// transactions as sender or authority.
pub fn can_sender_dip_into_reserve(
    sender: &Address,
    i: u64,
    sender_is_delegated: bool,
    ctx: &ChainContext,
) -> bool {
    if sender_is_delegated {
        return false;
    }

    if ctx.grandparent_senders_and_authorities.contains(sender)
        || ctx.parent_senders_and_authorities.contains(sender)
    {
        return false;
    }

    if ctx.senders_and_authorities.contains(sender) {
        let i = i as usize;
        debug_assert!(i < ctx.senders.len());
        for j in 0..=i {
            if j < i && ctx.senders[j] == *sender {
                return false;
            }
            if ctx.authorities[j].contains(sender) {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    fn ctx(senders: Vec<Address>, authorities: Vec<Vec<Address>>) -> ChainContext {
        ChainContext::new(senders, authorities, AHashSet::new(), AHashSet::new())
    }

    #[test]
    fn delegated_sender_cannot_dip() {
        let s = address!("00000000000000000000000000000000000000aa");
        assert!(!can_sender_dip_into_reserve(&s, 0, true, &ctx(vec![s], vec![vec![]])));
    }

    #[test]
    fn repeat_sender_cannot_dip() {
        let s = address!("00000000000000000000000000000000000000aa");
        let other = address!("00000000000000000000000000000000000000bb");
        let ctx = ctx(vec![s, other, s], vec![vec![], vec![], vec![]]);
        // First appearance may dip, the repeat may not.
        assert!(can_sender_dip_into_reserve(&s, 0, false, &ctx));
        assert!(!can_sender_dip_into_reserve(&s, 2, false, &ctx));
    }

    #[test]
    fn pending_block_overlap_blocks_dipping() {
        let s = address!("00000000000000000000000000000000000000aa");
        let mut parent = AHashSet::new();
        parent.insert(s);
        let ctx = ChainContext::new(vec![s], vec![vec![]], parent, AHashSet::new());
        assert!(!can_sender_dip_into_reserve(&s, 0, false, &ctx));
    }

    #[test]
    fn authority_in_earlier_transaction_blocks_dipping() {
        let s = address!("00000000000000000000000000000000000000aa");
        let other = address!("00000000000000000000000000000000000000bb");
        let ctx = ctx(vec![other, s], vec![vec![s], vec![]]);
        assert!(!can_sender_dip_into_reserve(&s, 1, false, &ctx));
    }
}
