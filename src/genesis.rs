//! Genesis state loading. Required only on a fresh database.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use serde::Deserialize;
use thiserror::Error;

use crate::block_state::{StateDelta, StateDeltas};
use crate::db::{CommitPayload, Db, DbError};
use crate::primitives::{Account, BlockHeader, Incarnation};

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("cannot read genesis file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse genesis file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Default, Deserialize)]
pub struct GenesisAccount {
    #[serde(default)]
    pub balance: U256,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub code: Option<Bytes>,
    #[serde(default)]
    pub storage: BTreeMap<B256, B256>,
}

#[derive(Debug, Deserialize)]
pub struct Genesis {
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default)]
    pub extra_data: Bytes,
    #[serde(default)]
    pub alloc: BTreeMap<Address, GenesisAccount>,
}

fn default_gas_limit() -> u64 {
    30_000_000
}

impl Genesis {
    pub fn load(path: &Path) -> Result<Self, GenesisError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn header(&self, state_root: B256) -> BlockHeader {
        BlockHeader {
            number: 0,
            timestamp: self.timestamp,
            gas_limit: self.gas_limit,
            extra_data: self.extra_data.clone(),
            base_fee_per_gas: Some(U256::from(1_000_000_000u64)),
            state_root,
            ..BlockHeader::default()
        }
    }

    /// Commit the allocation as block zero; returns the genesis header
    /// with the computed state root.
    pub fn commit(&self, db: &Arc<dyn Db>) -> Result<BlockHeader, GenesisError> {
        let deltas = StateDeltas::default();
        let mut code = Vec::new();
        for (address, alloc) in &self.alloc {
            let code_hash = match &alloc.code {
                Some(bytes) if !bytes.is_empty() => {
                    let hash = keccak256(bytes);
                    code.push((hash, Arc::new(bytes.clone())));
                    hash
                }
                _ => crate::EMPTY_CODE_HASH,
            };
            let account = Account {
                balance: alloc.balance,
                nonce: alloc.nonce,
                code_hash,
                incarnation: Incarnation::default(),
            };
            let storage = dashmap::DashMap::default();
            for (key, value) in &alloc.storage {
                storage.insert(*key, (B256::ZERO, *value));
            }
            deltas.insert(
                *address,
                StateDelta {
                    account: (None, Some(account)),
                    storage,
                },
            );
        }

        // First pass computes the root, the second records the header
        // carrying it (an empty delta set leaves the root unchanged).
        let provisional = self.header(crate::EMPTY_ROOT_HASH);
        db.commit(CommitPayload {
            state_deltas: &deltas,
            code,
            block_id: provisional.hash(),
            header: &provisional,
            receipts: &[],
            call_frames: &[],
            senders: &[],
            transactions: &[],
            ommers: &[],
            withdrawals: None,
        })?;
        let state_root = db.state_root()?;
        let header = self.header(state_root);
        db.commit(CommitPayload {
            state_deltas: &StateDeltas::default(),
            code: Vec::new(),
            block_id: header.hash(),
            header: &header,
            receipts: &[],
            call_frames: &[],
            senders: &[],
            transactions: &[],
            ommers: &[],
            withdrawals: None,
        })?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDb;

    #[test]
    fn alloc_commits_and_reads_back() {
        let json = r#"{
            "chain_id": 20143,
            "timestamp": 1700000000,
            "alloc": {
                "0x00000000000000000000000000000000000000aa": {
                    "balance": "0x64",
                    "nonce": 1
                }
            }
        }"#;
        let genesis: Genesis = serde_json::from_str(json).unwrap();
        let db: Arc<dyn Db> = Arc::new(InMemoryDb::new());
        let header = genesis.commit(&db).unwrap();
        assert_eq!(header.number, 0);
        assert_ne!(header.state_root, crate::EMPTY_ROOT_HASH);

        let account = db
            .read_account(&alloy_primitives::address!(
                "00000000000000000000000000000000000000aa"
            ))
            .unwrap()
            .expect("allocated account exists");
        assert_eq!(account.balance, U256::from(100));
        assert_eq!(account.nonce, 1);
        assert_eq!(db.latest_block_number().unwrap(), Some(0));
    }
}
