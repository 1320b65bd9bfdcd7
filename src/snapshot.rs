//! State snapshots: JSON-lines dumps of every account (keyed by hashed
//! address, as stored in the trie) plus the code blobs, loadable into a
//! fresh database as a single commit.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use alloy_primitives::{Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;
use crate::primitives::{Account, BlockHeader, Incarnation};
use crate::triedb::{for_each_account, NodeStore, TrieDb};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot record error: {0}")]
    Record(#[from] serde_json::Error),
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountRecord {
    address_hash: B256,
    balance: U256,
    nonce: u64,
    code_hash: B256,
    incarnation: Incarnation,
    storage: Vec<(B256, B256)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CodeRecord {
    hash: B256,
    code: Bytes,
}

const ACCOUNTS_FILE: &str = "accounts.jsonl";
const CODE_FILE: &str = "code.jsonl";

pub fn dump_snapshot<S: NodeStore>(db: &TrieDb<S>, dir: &Path) -> Result<(), SnapshotError> {
    std::fs::create_dir_all(dir)?;

    let mut accounts = std::fs::File::create(dir.join(ACCOUNTS_FILE))?;
    let mut walk_error = None;
    for_each_account(db, |address_hash, account, storage| {
        let record = AccountRecord {
            address_hash,
            balance: account.balance,
            nonce: account.nonce,
            code_hash: account.code_hash,
            incarnation: account.incarnation,
            storage,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                walk_error = Some(SnapshotError::Record(err));
                return Err(DbError::Metadata("snapshot encode failed".into()));
            }
        };
        if let Err(err) = writeln!(accounts, "{line}") {
            walk_error = Some(SnapshotError::Io(err));
            return Err(DbError::Metadata("snapshot write failed".into()));
        }
        Ok(())
    })
    .map_err(|err| walk_error.take().unwrap_or(SnapshotError::Db(err)))?;
    accounts.sync_all()?;

    let mut code = std::fs::File::create(dir.join(CODE_FILE))?;
    for (hash, bytes) in db.export_code()? {
        let record = CodeRecord { hash, code: bytes };
        writeln!(code, "{}", serde_json::to_string(&record)?)?;
    }
    code.sync_all()?;
    Ok(())
}

/// Load a snapshot into a fresh database, committed under `header`.
pub fn load_snapshot<S: NodeStore>(
    db: &TrieDb<S>,
    dir: &Path,
    header: &BlockHeader,
) -> Result<(), SnapshotError> {
    let mut accounts = Vec::new();
    let reader = BufReader::new(std::fs::File::open(dir.join(ACCOUNTS_FILE))?);
    for line in reader.lines() {
        let record: AccountRecord = serde_json::from_str(&line?)?;
        accounts.push((
            record.address_hash,
            Account {
                balance: record.balance,
                nonce: record.nonce,
                code_hash: record.code_hash,
                incarnation: record.incarnation,
            },
            record.storage,
        ));
    }

    let mut code = Vec::new();
    match std::fs::File::open(dir.join(CODE_FILE)) {
        Ok(file) => {
            for line in BufReader::new(file).lines() {
                let record: CodeRecord = serde_json::from_str(&line?)?;
                code.push((record.hash, Arc::new(record.code)));
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(SnapshotError::Io(err)),
    }

    db.import_snapshot(accounts, code, header)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_state::{StateDelta, StateDeltas};
    use crate::db::{CommitPayload, Db};
    use alloy_primitives::{keccak256, Address};

    #[test]
    fn dump_and_load_roundtrip_preserves_root() {
        let db = TrieDb::new();
        let deltas = StateDeltas::default();
        for byte in 1u8..20 {
            let account = Account {
                balance: U256::from(byte),
                nonce: u64::from(byte),
                ..Account::default()
            };
            let storage = dashmap::DashMap::default();
            storage.insert(
                keccak256([byte]).into(),
                (B256::ZERO, B256::repeat_byte(byte)),
            );
            deltas.insert(
                Address::repeat_byte(byte),
                StateDelta {
                    account: (None, Some(account)),
                    storage,
                },
            );
        }
        let header = BlockHeader::default();
        db.commit(CommitPayload {
            state_deltas: &deltas,
            code: Vec::new(),
            block_id: header.hash(),
            header: &header,
            receipts: &[],
            call_frames: &[],
            senders: &[],
            transactions: &[],
            ommers: &[],
            withdrawals: None,
        })
        .unwrap();
        let root = db.state_root().unwrap();

        let dir = tempfile::tempdir().unwrap();
        dump_snapshot(&db, dir.path()).unwrap();

        let restored = TrieDb::new();
        load_snapshot(&restored, dir.path(), &header).unwrap();
        assert_eq!(restored.state_root().unwrap(), root);
    }
}
