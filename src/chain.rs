//! Chain identity, revision schedule and the per-block context consumed
//! by the reserve-balance rules.

use ahash::AHashSet;
use alloy_primitives::Address;

use crate::revision::{EvmRevision, MonadRevision, Revision};

pub const CHAIN_ID_MAINNET: u64 = 143;
pub const CHAIN_ID_DEVNET: u64 = 20143;
pub const CHAIN_ID_TESTNET: u64 = 10143;

/// A Monad chain instance: id plus its revision schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonadChain {
    pub id: u64,
}

impl MonadChain {
    pub const fn mainnet() -> Self {
        Self {
            id: CHAIN_ID_MAINNET,
        }
    }

    pub const fn devnet() -> Self {
        Self {
            id: CHAIN_ID_DEVNET,
        }
    }

    pub const fn testnet() -> Self {
        Self {
            id: CHAIN_ID_TESTNET,
        }
    }

    pub fn from_id(id: u64) -> Option<Self> {
        match id {
            CHAIN_ID_MAINNET | CHAIN_ID_DEVNET | CHAIN_ID_TESTNET => Some(Self { id }),
            _ => None,
        }
    }

    /// Revision in force for a block. All Monad networks activated from
    /// genesis; the devnet runs ahead of mainnet on Monad-specific rules.
    pub fn revision(&self, _block_number: u64, _timestamp: u64) -> Revision {
        match self.id {
            CHAIN_ID_MAINNET => Revision::new(EvmRevision::Cancun, Some(MonadRevision::Four)),
            CHAIN_ID_TESTNET => Revision::new(EvmRevision::Prague, Some(MonadRevision::Eight)),
            _ => Revision::new(EvmRevision::Prague, Some(MonadRevision::Next)),
        }
    }
}

/// Sender/authority sets for the current block and the two pending
/// ancestors, consulted by the reserve-balance dip predicate.
#[derive(Clone, Debug, Default)]
pub struct ChainContext {
    /// Recovered sender of every transaction in the current block.
    pub senders: Vec<Address>,
    /// Recovered EIP-7702 authorities of every transaction, index-aligned
    /// with `senders`. Tuples that fail recovery are simply absent.
    pub authorities: Vec<Vec<Address>>,
    pub senders_and_authorities: AHashSet<Address>,
    pub parent_senders_and_authorities: AHashSet<Address>,
    pub grandparent_senders_and_authorities: AHashSet<Address>,
}

impl ChainContext {
    pub fn new(
        senders: Vec<Address>,
        authorities: Vec<Vec<Address>>,
        parent_senders_and_authorities: AHashSet<Address>,
        grandparent_senders_and_authorities: AHashSet<Address>,
    ) -> Self {
        debug_assert_eq!(senders.len(), authorities.len());
        let mut senders_and_authorities =
            AHashSet::with_capacity(senders.len() + authorities.len());
        senders_and_authorities.extend(senders.iter().copied());
        for list in &authorities {
            senders_and_authorities.extend(list.iter().copied());
        }
        Self {
            senders,
            authorities,
            senders_and_authorities,
            parent_senders_and_authorities,
            grandparent_senders_and_authorities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn chain_ids_resolve() {
        assert_eq!(MonadChain::from_id(143), Some(MonadChain::mainnet()));
        assert_eq!(MonadChain::from_id(10143), Some(MonadChain::testnet()));
        assert_eq!(MonadChain::from_id(20143), Some(MonadChain::devnet()));
        assert_eq!(MonadChain::from_id(1), None);
    }

    #[test]
    fn context_unions_senders_and_authorities() {
        let a = address!("1000000000000000000000000000000000000001");
        let b = address!("1000000000000000000000000000000000000002");
        let ctx = ChainContext::new(
            vec![a],
            vec![vec![b]],
            AHashSet::new(),
            AHashSet::new(),
        );
        assert!(ctx.senders_and_authorities.contains(&a));
        assert!(ctx.senders_and_authorities.contains(&b));
    }
}
