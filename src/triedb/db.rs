//! The versioned state database: block-indexed Merkle roots over chunked
//! storage, with an append-only write path and an atomically published
//! metadata head.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy_primitives::{keccak256, Address, Bytes, B256};
use serde::{Deserialize, Serialize};

use super::chunk::{ChunkOffset, DISK_PAGE_SIZE};
use super::node::{nibbles_from_bytes, NodeRef, RlpRef};
use super::store::{DiskStore, MemStore, NodeStore};
use super::trie::{
    decode_account_value, encode_account_value, ordered_root, SubtreeOp, Trie, TrieKind,
};
use super::write_buffer::WriteBuffer;
use crate::db::{CommitPayload, Db, DbError};
use crate::primitives::{Account, BlockHeader, Incarnation};
use crate::EMPTY_ROOT_HASH;

/// Blocks of history kept once finalization starts pruning.
const DEFAULT_HISTORY_LEN: u64 = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockEntry {
    number: u64,
    block_id: B256,
    state_root_offset: Option<u64>,
    state_root: B256,
    receipts_root: B256,
    transactions_root: B256,
    withdrawals_root: Option<B256>,
    header: BlockHeader,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Meta {
    directory: Vec<BlockEntry>,
    head_chunk: u32,
    head_offset: u64,
    finalized: Option<(u64, B256)>,
    verified: Option<u64>,
    voted: Option<(u64, B256)>,
    proposed: Option<(u64, B256)>,
    code_index: Vec<(B256, u64, u32)>,
}

#[derive(Debug)]
struct Inner {
    directory: BTreeMap<u64, BlockEntry>,
    current: Option<u64>,
    head_chunk: u32,
    head_offset: u64,
    finalized: Option<(u64, B256)>,
    verified: Option<u64>,
    voted: Option<(u64, B256)>,
    proposed: Option<(u64, B256)>,
    code_index: HashMap<B256, (u64, u32)>,
}

impl Inner {
    fn to_meta(&self) -> Meta {
        Meta {
            directory: self.directory.values().cloned().collect(),
            head_chunk: self.head_chunk,
            head_offset: self.head_offset,
            finalized: self.finalized,
            verified: self.verified,
            voted: self.voted,
            proposed: self.proposed,
            code_index: self
                .code_index
                .iter()
                .map(|(hash, (offset, len))| (*hash, *offset, *len))
                .collect(),
        }
    }

    fn from_meta(meta: Meta) -> Self {
        let current = meta.directory.iter().map(|e| e.number).max();
        Self {
            directory: meta
                .directory
                .into_iter()
                .map(|entry| (entry.number, entry))
                .collect(),
            current,
            head_chunk: meta.head_chunk,
            head_offset: meta.head_offset,
            finalized: meta.finalized,
            verified: meta.verified,
            voted: meta.voted,
            proposed: meta.proposed,
            code_index: meta
                .code_index
                .into_iter()
                .map(|(hash, offset, len)| (hash, (offset, len)))
                .collect(),
        }
    }
}

pub struct TrieDb<S: NodeStore> {
    store: S,
    inner: RwLock<Inner>,
    prune_history: bool,
    history_len: u64,
}

impl<S: NodeStore> std::fmt::Debug for TrieDb<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrieDb").finish()
    }
}

impl TrieDb<MemStore> {
    pub fn new() -> Self {
        Self::with_store(MemStore::new(), true).expect("in-memory store has no metadata errors")
    }
}

impl Default for TrieDb<MemStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl TrieDb<DiskStore> {
    /// Open (or create) the on-disk database from the `--db` file list.
    pub fn open(
        paths: &[PathBuf],
        sq_thread_cpu: Option<u32>,
        compaction: bool,
    ) -> Result<Self, DbError> {
        let store = DiskStore::open(paths, sq_thread_cpu).map_err(DbError::Io)?;
        Self::with_store(store, compaction)
    }
}

impl<S: NodeStore> TrieDb<S> {
    pub fn with_store(store: S, prune_history: bool) -> Result<Self, DbError> {
        let inner = match store.read_meta()? {
            Some(bytes) => {
                let meta: Meta = serde_json::from_slice(&bytes)
                    .map_err(|err| DbError::Metadata(err.to_string()))?;
                Inner::from_meta(meta)
            }
            None => Inner {
                directory: BTreeMap::new(),
                current: None,
                head_chunk: 0,
                head_offset: 0,
                finalized: None,
                verified: None,
                voted: None,
                proposed: None,
                code_index: HashMap::new(),
            },
        };
        Ok(Self {
            store,
            inner: RwLock::new(inner),
            prune_history,
            history_len: DEFAULT_HISTORY_LEN,
        })
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("triedb lock poisoned")
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("triedb lock poisoned")
    }

    fn current_entry<'a>(&self, inner: &'a Inner) -> Option<&'a BlockEntry> {
        inner.current.and_then(|number| inner.directory.get(&number))
    }

    fn state_root_ref(entry: &BlockEntry) -> Option<NodeRef> {
        entry.state_root_offset.map(|raw| NodeRef::Disk {
            offset: ChunkOffset::from_raw(raw),
            merkle: RlpRef::Hash(entry.state_root),
        })
    }

    fn account_leaf(
        &self,
        address: &Address,
    ) -> Result<Option<(Account, Option<NodeRef>)>, DbError> {
        let inner = self.read_inner();
        let Some(entry) = self.current_entry(&inner) else {
            return Ok(None);
        };
        let trie = Trie::from_root(TrieKind::State, Self::state_root_ref(entry));
        drop(inner);
        let key = nibbles_from_bytes(keccak256(address).as_slice());
        let Some((value, subtree)) = trie.get_leaf(&self.store, &key)? else {
            return Ok(None);
        };
        let account = decode_account_value(&value).map_err(|reason| DbError::CorruptNode {
            offset: 0,
            reason,
        })?;
        Ok(Some((account, subtree)))
    }

    fn publish(&self, inner: &Inner) -> Result<(), DbError> {
        let bytes = serde_json::to_vec(&inner.to_meta())
            .map_err(|err| DbError::Metadata(err.to_string()))?;
        self.store.publish_meta(&bytes)
    }

    /// Rebuild state from snapshot records keyed by hashed address and
    /// hashed storage key, committing it under `header`'s block number.
    pub fn import_snapshot(
        &self,
        accounts: Vec<(B256, Account, Vec<(B256, B256)>)>,
        code: Vec<(B256, Arc<Bytes>)>,
        header: &BlockHeader,
    ) -> Result<(), DbError> {
        let mut inner = self.write_inner();
        let mut trie = Trie::new(TrieKind::State);
        let mut writer = WriteBuffer::new(&self.store, inner.head_chunk, inner.head_offset);

        for (hashed_address, account, storage) in accounts {
            let mut storage_trie = Trie::new(TrieKind::Storage);
            for (hashed_key, value) in storage {
                storage_trie.upsert(
                    &self.store,
                    &nibbles_from_bytes(hashed_key.as_slice()),
                    value.to_vec(),
                )?;
            }
            trie.upsert_with(
                &self.store,
                &nibbles_from_bytes(hashed_address.as_slice()),
                encode_account_value(&account),
                SubtreeOp::Set(storage_trie.root.take()),
            )?;
        }

        let mut code_index_delta = Vec::with_capacity(code.len());
        for (hash, bytes) in &code {
            if inner.code_index.contains_key(hash) {
                continue;
            }
            let offset = writer.append(bytes)?;
            code_index_delta.push((*hash, (offset.raw(), bytes.len() as u32)));
        }

        let (state_root_offset, state_root) = trie.commit(&self.store, &mut writer)?;
        let (head_chunk, head_offset) = writer.finish()?;
        self.store.sync()?;

        let number = header.number;
        inner.head_chunk = head_chunk;
        inner.head_offset = head_offset;
        inner.code_index.extend(code_index_delta);
        inner.directory.insert(
            number,
            BlockEntry {
                number,
                block_id: header.hash(),
                state_root_offset,
                state_root,
                receipts_root: EMPTY_ROOT_HASH,
                transactions_root: EMPTY_ROOT_HASH,
                withdrawals_root: None,
                header: header.clone(),
            },
        );
        inner.current = Some(number);
        self.publish(&inner)
    }

    /// Every code blob currently indexed; used by snapshot dumps.
    pub fn export_code(&self) -> Result<Vec<(B256, Bytes)>, DbError> {
        let index: Vec<(B256, (u64, u32))> = {
            let inner = self.read_inner();
            inner
                .code_index
                .iter()
                .map(|(hash, loc)| (*hash, *loc))
                .collect()
        };
        let mut out = Vec::with_capacity(index.len());
        for (hash, (raw, len)) in index {
            let offset = ChunkOffset::from_raw(raw);
            let buf = self.store.read_pages(
                offset.chunk_id(),
                offset.page_aligned_offset(),
                (offset.pages() * DISK_PAGE_SIZE) as usize,
            )?;
            let start = offset.buffer_offset();
            out.push((hash, Bytes::copy_from_slice(&buf[start..start + len as usize])));
        }
        Ok(out)
    }
}

impl<S: NodeStore> Db for TrieDb<S> {
    fn read_account(&self, address: &Address) -> Result<Option<Account>, DbError> {
        Ok(self.account_leaf(address)?.map(|(account, _)| account))
    }

    fn read_storage(
        &self,
        address: &Address,
        incarnation: Incarnation,
        key: &B256,
    ) -> Result<B256, DbError> {
        let Some((account, subtree)) = self.account_leaf(address)? else {
            return Ok(B256::ZERO);
        };
        // Keys of a newer lifetime than the stored account read as zero.
        if account.incarnation != incarnation {
            return Ok(B256::ZERO);
        }
        let trie = Trie::from_root(TrieKind::Storage, subtree);
        let nibbles = nibbles_from_bytes(keccak256(key).as_slice());
        match trie.get_leaf(&self.store, &nibbles)? {
            Some((value, _)) if value.len() == 32 => Ok(B256::from_slice(&value)),
            Some(_) => Err(DbError::CorruptNode {
                offset: 0,
                reason: "storage leaf is not 32 bytes",
            }),
            None => Ok(B256::ZERO),
        }
    }

    fn read_code(&self, code_hash: &B256) -> Result<Arc<Bytes>, DbError> {
        let located = {
            let inner = self.read_inner();
            inner.code_index.get(code_hash).copied()
        };
        let Some((raw, len)) = located else {
            return Err(DbError::MissingCode(*code_hash));
        };
        let offset = ChunkOffset::from_raw(raw);
        let buf = self.store.read_pages(
            offset.chunk_id(),
            offset.page_aligned_offset(),
            (offset.pages() * DISK_PAGE_SIZE) as usize,
        )?;
        let start = offset.buffer_offset();
        Ok(Arc::new(Bytes::copy_from_slice(
            &buf[start..start + len as usize],
        )))
    }

    fn set_block_and_prefix(&self, block_number: u64, block_id: B256) -> Result<(), DbError> {
        let mut inner = self.write_inner();
        let Some(entry) = inner.directory.get(&block_number) else {
            return Err(DbError::UnknownBlock(block_number));
        };
        if block_id != B256::ZERO && entry.block_id != block_id {
            return Err(DbError::UnknownBlock(block_number));
        }
        inner.current = Some(block_number);
        Ok(())
    }

    fn commit(&self, payload: CommitPayload<'_>) -> Result<(), DbError> {
        let mut inner = self.write_inner();
        let parent_root = self
            .current_entry(&inner)
            .and_then(Self::state_root_ref);
        let mut trie = Trie::from_root(TrieKind::State, parent_root);
        let mut writer = WriteBuffer::new(&self.store, inner.head_chunk, inner.head_offset);

        // Deterministic application order for a reproducible disk layout.
        let mut addresses: Vec<Address> = payload
            .state_deltas
            .iter()
            .map(|entry| *entry.key())
            .collect();
        addresses.sort();

        for address in addresses {
            let Some(delta) = payload.state_deltas.get(&address) else {
                continue;
            };
            let account_key = nibbles_from_bytes(keccak256(address).as_slice());
            let (original, current) = delta.account;
            match current {
                None => {
                    if original.is_some() {
                        trie.erase(&self.store, &account_key)?;
                    }
                }
                Some(account) => {
                    let storage_changes: Vec<(B256, B256)> = delta
                        .storage
                        .iter()
                        .filter(|slot| slot.value().0 != slot.value().1)
                        .map(|slot| (*slot.key(), slot.value().1))
                        .collect();
                    if original == Some(account) && storage_changes.is_empty() {
                        continue;
                    }

                    let existing = trie.get_leaf(&self.store, &account_key)?;
                    let subtree = match &existing {
                        Some((value, subtree)) => {
                            let stored =
                                decode_account_value(value).map_err(|reason| {
                                    DbError::CorruptNode { offset: 0, reason }
                                })?;
                            // A bumped incarnation starts a fresh lifetime;
                            // the old storage subtree is dropped wholesale.
                            if stored.incarnation == account.incarnation {
                                subtree.clone()
                            } else {
                                None
                            }
                        }
                        None => None,
                    };

                    let mut storage_trie = Trie::from_root(TrieKind::Storage, subtree);
                    for (key, value) in storage_changes {
                        let nibbles = nibbles_from_bytes(keccak256(key).as_slice());
                        if value.is_zero() {
                            storage_trie.erase(&self.store, &nibbles)?;
                        } else {
                            storage_trie.upsert(&self.store, &nibbles, value.to_vec())?;
                        }
                    }
                    trie.upsert_with(
                        &self.store,
                        &account_key,
                        encode_account_value(&account),
                        SubtreeOp::Set(storage_trie.root.take()),
                    )?;
                }
            }
        }

        let mut code_index_delta = Vec::with_capacity(payload.code.len());
        for (hash, code) in &payload.code {
            if inner.code_index.contains_key(hash) {
                continue;
            }
            let offset = writer.append(code)?;
            code_index_delta.push((*hash, (offset.raw(), code.len() as u32)));
        }

        let (state_root_offset, state_root) = trie.commit(&self.store, &mut writer)?;
        let (head_chunk, head_offset) = writer.finish()?;
        self.store.sync()?;

        let receipts_root = ordered_root(
            payload
                .receipts
                .iter()
                .zip(payload.transactions)
                .map(|(receipt, tx)| receipt.encoded(tx.tx_type)),
        );
        let transactions_root = ordered_root(
            payload.transactions.iter().map(|tx| tx.encoded()),
        );
        let withdrawals_root = payload
            .withdrawals
            .map(|withdrawals| ordered_root(withdrawals.iter().map(alloy_rlp::encode)));

        let number = payload.header.number;
        inner.head_chunk = head_chunk;
        inner.head_offset = head_offset;
        inner.code_index.extend(code_index_delta);
        inner.directory.insert(
            number,
            BlockEntry {
                number,
                block_id: payload.block_id,
                state_root_offset,
                state_root,
                receipts_root,
                transactions_root,
                withdrawals_root,
                header: payload.header.clone(),
            },
        );
        inner.current = Some(number);

        // One atomic metadata update publishes the new roots; chunks
        // written before a crash are garbage for compaction.
        self.publish(&inner)
    }

    fn finalize(&self, block_number: u64, block_id: B256) -> Result<(), DbError> {
        let mut inner = self.write_inner();
        match inner.directory.get(&block_number) {
            Some(entry) if block_id == B256::ZERO || entry.block_id == block_id => {}
            _ => return Err(DbError::UnknownBlock(block_number)),
        }
        inner.finalized = Some((block_number, block_id));
        if self.prune_history {
            let keep_from = block_number.saturating_sub(self.history_len);
            inner.directory.retain(|number, _| *number >= keep_from);
        }
        self.publish(&inner)
    }

    fn update_verified_block(&self, block_number: u64) -> Result<(), DbError> {
        let mut inner = self.write_inner();
        inner.verified = Some(block_number);
        self.publish(&inner)
    }

    fn update_voted_metadata(&self, block_number: u64, block_id: B256) -> Result<(), DbError> {
        let mut inner = self.write_inner();
        inner.voted = Some((block_number, block_id));
        self.publish(&inner)
    }

    fn update_proposed_metadata(&self, block_number: u64, block_id: B256) -> Result<(), DbError> {
        let mut inner = self.write_inner();
        inner.proposed = Some((block_number, block_id));
        self.publish(&inner)
    }

    fn state_root(&self) -> Result<B256, DbError> {
        let inner = self.read_inner();
        Ok(self
            .current_entry(&inner)
            .map(|entry| entry.state_root)
            .unwrap_or(EMPTY_ROOT_HASH))
    }

    fn receipts_root(&self) -> Result<B256, DbError> {
        let inner = self.read_inner();
        Ok(self
            .current_entry(&inner)
            .map(|entry| entry.receipts_root)
            .unwrap_or(EMPTY_ROOT_HASH))
    }

    fn transactions_root(&self) -> Result<B256, DbError> {
        let inner = self.read_inner();
        Ok(self
            .current_entry(&inner)
            .map(|entry| entry.transactions_root)
            .unwrap_or(EMPTY_ROOT_HASH))
    }

    fn withdrawals_root(&self) -> Result<Option<B256>, DbError> {
        let inner = self.read_inner();
        Ok(self
            .current_entry(&inner)
            .and_then(|entry| entry.withdrawals_root))
    }

    fn latest_block_number(&self) -> Result<Option<u64>, DbError> {
        let inner = self.read_inner();
        Ok(inner.directory.keys().next_back().copied())
    }

    fn block_header(&self, block_number: u64) -> Result<Option<BlockHeader>, DbError> {
        let inner = self.read_inner();
        Ok(inner
            .directory
            .get(&block_number)
            .map(|entry| entry.header.clone()))
    }
}

/// Walk every account and its storage under the current root; used by
/// snapshot dumps.
pub fn for_each_account<S, F>(db: &TrieDb<S>, mut f: F) -> Result<(), DbError>
where
    S: NodeStore,
    F: FnMut(B256, Account, Vec<(B256, B256)>) -> Result<(), DbError>,
{
    let root = {
        let inner = db.read_inner();
        db.current_entry(&inner).and_then(TrieDb::<S>::state_root_ref)
    };
    let Some(root) = root else {
        return Ok(());
    };
    walk_accounts(db, &root, Vec::new(), &mut f)
}

fn walk_accounts<S, F>(
    db: &TrieDb<S>,
    r: &NodeRef,
    prefix: Vec<u8>,
    f: &mut F,
) -> Result<(), DbError>
where
    S: NodeStore,
    F: FnMut(B256, Account, Vec<(B256, B256)>) -> Result<(), DbError>,
{
    use super::node::Node;
    use super::store::read_node;

    let owned;
    let node = match r {
        NodeRef::Mem(node) => node.as_ref(),
        NodeRef::Disk { offset, .. } => {
            owned = read_node(&db.store, *offset)?;
            &owned
        }
    };
    match node {
        Node::Leaf {
            path,
            value,
            subtree,
        } => {
            let mut nibbles = prefix;
            nibbles.extend_from_slice(path);
            let account = decode_account_value(value)
                .map_err(|reason| DbError::CorruptNode { offset: 0, reason })?;
            let mut storage = Vec::new();
            if let Some(subtree) = subtree {
                walk_storage(db, subtree, Vec::new(), &mut storage)?;
            }
            f(nibbles_to_b256(&nibbles), account, storage)
        }
        Node::Extension { path, child } => {
            let mut nibbles = prefix;
            nibbles.extend_from_slice(path);
            walk_accounts(db, child, nibbles, f)
        }
        Node::Branch { children, .. } => {
            for (i, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    let mut nibbles = prefix.clone();
                    nibbles.push(i as u8);
                    walk_accounts(db, child, nibbles, f)?;
                }
            }
            Ok(())
        }
    }
}

fn walk_storage<S: NodeStore>(
    db: &TrieDb<S>,
    r: &NodeRef,
    prefix: Vec<u8>,
    out: &mut Vec<(B256, B256)>,
) -> Result<(), DbError> {
    use super::node::Node;
    use super::store::read_node;

    let owned;
    let node = match r {
        NodeRef::Mem(node) => node.as_ref(),
        NodeRef::Disk { offset, .. } => {
            owned = read_node(&db.store, *offset)?;
            &owned
        }
    };
    match node {
        Node::Leaf { path, value, .. } => {
            let mut nibbles = prefix;
            nibbles.extend_from_slice(path);
            if value.len() == 32 {
                out.push((nibbles_to_b256(&nibbles), B256::from_slice(value)));
            }
            Ok(())
        }
        Node::Extension { path, child } => {
            let mut nibbles = prefix;
            nibbles.extend_from_slice(path);
            walk_storage(db, child, nibbles, out)
        }
        Node::Branch { children, .. } => {
            for (i, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    let mut nibbles = prefix.clone();
                    nibbles.push(i as u8);
                    walk_storage(db, child, nibbles, out)?;
                }
            }
            Ok(())
        }
    }
}

fn nibbles_to_b256(nibbles: &[u8]) -> B256 {
    debug_assert_eq!(nibbles.len(), 64);
    let mut out = B256::ZERO;
    for (i, pair) in nibbles.chunks(2).enumerate() {
        out.0[i] = (pair[0] << 4) | pair[1];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_state::{StateDelta, StateDeltas};
    use dashmap::DashMap;

    fn delta(
        deltas: &StateDeltas,
        address: Address,
        original: Option<Account>,
        current: Option<Account>,
        storage: &[(B256, B256, B256)],
    ) {
        let map = DashMap::default();
        for (key, orig, cur) in storage {
            map.insert(*key, (*orig, *cur));
        }
        deltas.insert(
            address,
            StateDelta {
                account: (original, current),
                storage: map,
            },
        );
    }

    fn commit_block<S: NodeStore>(db: &TrieDb<S>, number: u64, deltas: &StateDeltas) -> B256 {
        let header = BlockHeader {
            number,
            timestamp: number,
            ..BlockHeader::default()
        };
        db.commit(CommitPayload {
            state_deltas: deltas,
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
        db.state_root().unwrap()
    }

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn word(n: u64) -> B256 {
        B256::from(alloy_primitives::U256::from(n).to_be_bytes::<32>())
    }

    #[test]
    fn empty_commit_keeps_root() {
        let db = TrieDb::new();
        let deltas = StateDeltas::default();
        let root0 = commit_block(&db, 0, &deltas);
        assert_eq!(root0, EMPTY_ROOT_HASH);

        let account = Account {
            balance: alloy_primitives::U256::from(5),
            ..Account::default()
        };
        let deltas = StateDeltas::default();
        delta(&deltas, addr(1), None, Some(account), &[]);
        let root1 = commit_block(&db, 1, &deltas);
        assert_ne!(root1, root0);

        let deltas = StateDeltas::default();
        let root2 = commit_block(&db, 2, &deltas);
        assert_eq!(root2, root1);
    }

    #[test]
    fn committed_values_read_back() {
        let db = TrieDb::new();
        let account = Account {
            balance: alloy_primitives::U256::from(5),
            nonce: 3,
            ..Account::default()
        };
        let deltas = StateDeltas::default();
        delta(
            &deltas,
            addr(1),
            None,
            Some(account),
            &[(word(1), B256::ZERO, word(42))],
        );
        commit_block(&db, 0, &deltas);

        assert_eq!(db.read_account(&addr(1)).unwrap(), Some(account));
        assert_eq!(
            db.read_storage(&addr(1), account.incarnation, &word(1)).unwrap(),
            word(42)
        );
        // A newer lifetime reads zero.
        assert_eq!(
            db.read_storage(&addr(1), Incarnation::new(9, 0), &word(1)).unwrap(),
            B256::ZERO
        );
        assert_eq!(db.read_account(&addr(2)).unwrap(), None);
    }

    #[test]
    fn historical_reads_select_old_roots() {
        let db = TrieDb::new();
        let mut account = Account {
            balance: alloy_primitives::U256::from(5),
            ..Account::default()
        };
        let deltas = StateDeltas::default();
        delta(&deltas, addr(1), None, Some(account), &[]);
        commit_block(&db, 0, &deltas);

        let old = account;
        account.balance = alloy_primitives::U256::from(50);
        let deltas = StateDeltas::default();
        delta(&deltas, addr(1), Some(old), Some(account), &[]);
        commit_block(&db, 1, &deltas);

        assert_eq!(db.read_account(&addr(1)).unwrap(), Some(account));
        db.set_block_and_prefix(0, B256::ZERO).unwrap();
        assert_eq!(db.read_account(&addr(1)).unwrap(), Some(old));
    }

    #[test]
    fn incarnation_bump_drops_storage_subtree() {
        let db = TrieDb::new();
        let account = Account {
            nonce: 1,
            incarnation: Incarnation::new(0, 0),
            ..Account::default()
        };
        let deltas = StateDeltas::default();
        delta(
            &deltas,
            addr(1),
            None,
            Some(account),
            &[(word(1), B256::ZERO, word(42))],
        );
        commit_block(&db, 0, &deltas);

        let recreated = Account {
            nonce: 1,
            incarnation: Incarnation::new(1, 2),
            ..Account::default()
        };
        let deltas = StateDeltas::default();
        delta(&deltas, addr(1), Some(account), Some(recreated), &[]);
        commit_block(&db, 1, &deltas);

        assert_eq!(
            db.read_storage(&addr(1), recreated.incarnation, &word(1)).unwrap(),
            B256::ZERO
        );
    }

    #[test]
    fn disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().join("chunks.0"), dir.path().join("chunks.1")];

        let account = Account {
            balance: alloy_primitives::U256::from(77),
            nonce: 2,
            ..Account::default()
        };
        let root = {
            let db = TrieDb::open(&paths, None, true).unwrap();
            let deltas = StateDeltas::default();
            delta(
                &deltas,
                addr(9),
                None,
                Some(account),
                &[(word(3), B256::ZERO, word(99))],
            );
            commit_block(&db, 0, &deltas)
        };

        // A fresh handle resumes from the published metadata head.
        let db = TrieDb::open(&paths, None, true).unwrap();
        assert_eq!(db.latest_block_number().unwrap(), Some(0));
        assert_eq!(db.state_root().unwrap(), root);
        assert_eq!(db.read_account(&addr(9)).unwrap(), Some(account));
        assert_eq!(
            db.read_storage(&addr(9), account.incarnation, &word(3)).unwrap(),
            word(99)
        );
    }

    #[test]
    fn finalize_prunes_history() {
        let db = TrieDb::new();
        for number in 0..3 {
            let deltas = StateDeltas::default();
            let account = Account {
                balance: alloy_primitives::U256::from(number + 1),
                ..Account::default()
            };
            delta(&deltas, addr(1), None, Some(account), &[]);
            commit_block(&db, number, &deltas);
        }
        db.finalize(2, B256::ZERO).unwrap();
        assert_eq!(db.latest_block_number().unwrap(), Some(2));
        // History window keeps everything here; a tight window prunes.
        let mut db = db;
        db.history_len = 0;
        db.finalize(2, B256::ZERO).unwrap();
        assert!(db.set_block_and_prefix(1, B256::ZERO).is_err());
        assert!(db.set_block_and_prefix(2, B256::ZERO).is_ok());
    }
}
