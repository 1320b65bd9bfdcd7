//! Protocol revisions. Behavior that varies by revision is resolved once
//! per transaction by passing a [`Revision`] value down the execution
//! path, never per opcode.

use serde::{Deserialize, Serialize};

/// Ethereum hard forks in activation order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EvmRevision {
    Frontier,
    Homestead,
    TangerineWhistle,
    SpuriousDragon,
    Byzantium,
    Constantinople,
    Petersburg,
    Istanbul,
    Berlin,
    London,
    Paris,
    Shanghai,
    Cancun,
    Prague,
}

/// Monad protocol revisions, orthogonal to the EVM fork schedule.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MonadRevision {
    Zero,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Next,
}

/// The pair of schedules a transaction executes under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub evm: EvmRevision,
    /// `None` when replaying plain Ethereum history.
    pub monad: Option<MonadRevision>,
}

impl Revision {
    pub const fn new(evm: EvmRevision, monad: Option<MonadRevision>) -> Self {
        Self { evm, monad }
    }

    pub fn evm_at_least(&self, rev: EvmRevision) -> bool {
        self.evm >= rev
    }

    pub fn monad_at_least(&self, rev: MonadRevision) -> bool {
        self.monad.is_some_and(|m| m >= rev)
    }

    /// EIP-161: touched empty accounts are removed at transaction end.
    pub fn spurious_dragon(&self) -> bool {
        self.evm_at_least(EvmRevision::SpuriousDragon)
    }

    /// EIP-2929 warm/cold access accounting.
    pub fn berlin(&self) -> bool {
        self.evm_at_least(EvmRevision::Berlin)
    }

    /// EIP-1559 base fee and the max-refund-quotient change (EIP-3529).
    pub fn london(&self) -> bool {
        self.evm_at_least(EvmRevision::London)
    }

    /// EIP-4895 withdrawals.
    pub fn shanghai(&self) -> bool {
        self.evm_at_least(EvmRevision::Shanghai)
    }

    /// EIP-1153 transient storage, EIP-6780 selfdestruct, beacon roots.
    pub fn cancun(&self) -> bool {
        self.evm_at_least(EvmRevision::Cancun)
    }

    /// EIP-7702 set-code transactions.
    pub fn prague(&self) -> bool {
        self.evm_at_least(EvmRevision::Prague)
    }

    /// Reserve-balance violations revert the transaction post-execution.
    pub fn reserve_balance_reverts(&self) -> bool {
        self.monad_at_least(MonadRevision::Four)
    }

    /// The reserve subject test reads the freshly written code hash
    /// instead of the block-start one.
    pub fn reserve_uses_recent_code_hash(&self) -> bool {
        self.monad_at_least(MonadRevision::Eight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_tracks_activation() {
        let rev = Revision::new(EvmRevision::Cancun, Some(MonadRevision::Four));
        assert!(rev.berlin());
        assert!(rev.cancun());
        assert!(!rev.prague());
        assert!(rev.reserve_balance_reverts());
        assert!(!rev.reserve_uses_recent_code_hash());
    }

    #[test]
    fn ethereum_replay_has_no_monad_rules() {
        let rev = Revision::new(EvmRevision::London, None);
        assert!(!rev.reserve_balance_reverts());
        assert!(!rev.reserve_uses_recent_code_hash());
    }
}
