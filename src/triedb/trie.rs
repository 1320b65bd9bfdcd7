//! Merkle-Patricia trie over a chunk store.
//!
//! Updates load only the touched path into memory; clean subtrees stay as
//! disk references carrying their Merkle form, so root recomputation at
//! commit time touches exactly the dirty subset. Account leaves own a
//! nested storage subtree whose root is spliced into the account RLP when
//! hashing.

use alloy_primitives::{B256, U256};
use alloy_rlp::{Decodable, Encodable, Header};

use super::node::{node_rlp, Nibbles, Node, NodeRef, RlpRef};
use super::store::{read_node, NodeStore};
use super::write_buffer::WriteBuffer;
use crate::db::DbError;
use crate::primitives::{Account, Incarnation};
use crate::EMPTY_ROOT_HASH;

/// What a leaf's Merkle value is derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TrieKind {
    /// Account trie: leaves store the account record, hash as the
    /// ethereum account RLP with the storage root embedded.
    State,
    /// Per-account storage: leaves store the raw 32-byte word, hash as
    /// the RLP of its zeroless form.
    Storage,
    /// Ephemeral index-keyed tries (receipts, transactions, withdrawals):
    /// leaves store the final RLP value directly.
    Ordered,
}

/// Disk encoding of an account leaf: RLP of
/// `[nonce, balance, code_hash, incarnation_block, incarnation_txn]`.
pub(crate) fn encode_account_value(account: &Account) -> Vec<u8> {
    let mut payload = Vec::with_capacity(96);
    account.nonce.encode(&mut payload);
    account.balance.encode(&mut payload);
    account.code_hash.encode(&mut payload);
    account.incarnation.block.encode(&mut payload);
    account.incarnation.txn.encode(&mut payload);
    let mut out = Vec::with_capacity(payload.len() + 4);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

pub(crate) fn decode_account_value(mut bytes: &[u8]) -> Result<Account, &'static str> {
    let buf = &mut bytes;
    let header = Header::decode(buf).map_err(|_| "bad account header")?;
    if !header.list {
        return Err("account value is not a list");
    }
    let nonce = u64::decode(buf).map_err(|_| "bad nonce")?;
    let balance = U256::decode(buf).map_err(|_| "bad balance")?;
    let code_hash = B256::decode(buf).map_err(|_| "bad code hash")?;
    let block = u64::decode(buf).map_err(|_| "bad incarnation block")?;
    let txn = u64::decode(buf).map_err(|_| "bad incarnation txn")?;
    Ok(Account {
        nonce,
        balance,
        code_hash,
        incarnation: Incarnation::new(block, txn),
    })
}

fn zeroless_rlp(value: &[u8]) -> Vec<u8> {
    let start = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let mut out = Vec::with_capacity(33);
    value[start..].encode(&mut out);
    out
}

pub(crate) enum SubtreeOp {
    Keep,
    Set(Option<NodeRef>),
}

impl SubtreeOp {
    fn into_new(self) -> Option<NodeRef> {
        match self {
            SubtreeOp::Keep => None,
            SubtreeOp::Set(subtree) => subtree,
        }
    }
}

fn mem(node: Node) -> NodeRef {
    NodeRef::Mem(Box::new(node))
}

fn resolve_owned<S: NodeStore>(store: &S, r: NodeRef) -> Result<Node, DbError> {
    match r {
        NodeRef::Mem(node) => Ok(*node),
        NodeRef::Disk { offset, .. } => read_node(store, offset),
    }
}

fn lcp(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[derive(Debug)]
pub(crate) struct Trie {
    kind: TrieKind,
    pub(crate) root: Option<NodeRef>,
}

impl Trie {
    pub(crate) fn new(kind: TrieKind) -> Self {
        Self { kind, root: None }
    }

    pub(crate) fn from_root(kind: TrieKind, root: Option<NodeRef>) -> Self {
        Self { kind, root }
    }

    /// Leaf value (and subtree reference) under `key`.
    pub(crate) fn get_leaf<S: NodeStore>(
        &self,
        store: &S,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Option<NodeRef>)>, DbError> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        get_ref(store, root, key)
    }

    pub(crate) fn upsert<S: NodeStore>(
        &mut self,
        store: &S,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<(), DbError> {
        self.upsert_with(store, key, value, SubtreeOp::Keep)
    }

    pub(crate) fn upsert_with<S: NodeStore>(
        &mut self,
        store: &S,
        key: &[u8],
        value: Vec<u8>,
        subtree: SubtreeOp,
    ) -> Result<(), DbError> {
        let root = self.root.take();
        self.root = Some(insert_ref(store, root, key, value, subtree)?);
        Ok(())
    }

    pub(crate) fn erase<S: NodeStore>(&mut self, store: &S, key: &[u8]) -> Result<bool, DbError> {
        let Some(root) = self.root.take() else {
            return Ok(false);
        };
        let (root, removed) = remove_ref(store, root, key)?;
        self.root = root;
        Ok(removed)
    }

    /// Merkle root without persisting anything.
    pub(crate) fn root_hash<S: NodeStore>(&self, store: &S) -> Result<B256, DbError> {
        match &self.root {
            None => Ok(EMPTY_ROOT_HASH),
            Some(root) => Ok(merkle_ref(store, root, self.kind)?.hash()),
        }
    }

    /// Write every dirty node through `writer` bottom-up, leaving the
    /// trie clean. Returns the root location and hash.
    pub(crate) fn commit<S: NodeStore>(
        &mut self,
        store: &S,
        writer: &mut WriteBuffer<'_, S>,
    ) -> Result<(Option<u64>, B256), DbError> {
        match self.root.take() {
            None => Ok((None, EMPTY_ROOT_HASH)),
            Some(root) => {
                let (offset, merkle) = commit_ref(store, writer, root, self.kind)?;
                let hash = merkle.hash();
                self.root = Some(NodeRef::Disk { offset, merkle });
                Ok((Some(offset.raw()), hash))
            }
        }
    }
}

fn get_ref<S: NodeStore>(
    store: &S,
    r: &NodeRef,
    key: &[u8],
) -> Result<Option<(Vec<u8>, Option<NodeRef>)>, DbError> {
    let owned;
    let node = match r {
        NodeRef::Mem(node) => node.as_ref(),
        NodeRef::Disk { offset, .. } => {
            owned = read_node(store, *offset)?;
            &owned
        }
    };
    match node {
        Node::Leaf {
            path,
            value,
            subtree,
        } => {
            if path.as_slice() == key {
                Ok(Some((value.clone(), subtree.clone())))
            } else {
                Ok(None)
            }
        }
        Node::Extension { path, child } => {
            if key.len() >= path.len() && key[..path.len()] == path[..] {
                get_ref(store, child, &key[path.len()..])
            } else {
                Ok(None)
            }
        }
        Node::Branch { children, value } => {
            if key.is_empty() {
                Ok(value.clone().map(|v| (v, None)))
            } else {
                match &children[key[0] as usize] {
                    Some(child) => get_ref(store, child, &key[1..]),
                    None => Ok(None),
                }
            }
        }
    }
}

fn insert_ref<S: NodeStore>(
    store: &S,
    r: Option<NodeRef>,
    key: &[u8],
    value: Vec<u8>,
    subtree_op: SubtreeOp,
) -> Result<NodeRef, DbError> {
    let Some(r) = r else {
        return Ok(mem(Node::Leaf {
            path: key.to_vec(),
            value,
            subtree: subtree_op.into_new(),
        }));
    };
    let node = resolve_owned(store, r)?;
    Ok(match node {
        Node::Leaf {
            path,
            value: old_value,
            subtree,
        } => {
            if path.as_slice() == key {
                let subtree = match subtree_op {
                    SubtreeOp::Keep => subtree,
                    SubtreeOp::Set(new) => new,
                };
                mem(Node::Leaf {
                    path,
                    value,
                    subtree,
                })
            } else {
                let common = lcp(&path, key);
                let mut children: [Option<NodeRef>; 16] = Default::default();
                let mut branch_value = None;
                if path.len() == common {
                    debug_assert!(subtree.is_none(), "account keys have a fixed length");
                    branch_value = Some(old_value);
                } else {
                    children[path[common] as usize] = Some(mem(Node::Leaf {
                        path: path[common + 1..].to_vec(),
                        value: old_value,
                        subtree,
                    }));
                }
                if key.len() == common {
                    branch_value = Some(value);
                } else {
                    children[key[common] as usize] = Some(mem(Node::Leaf {
                        path: key[common + 1..].to_vec(),
                        value,
                        subtree: subtree_op.into_new(),
                    }));
                }
                let branch = mem(Node::Branch {
                    children,
                    value: branch_value,
                });
                if common > 0 {
                    mem(Node::Extension {
                        path: key[..common].to_vec(),
                        child: branch,
                    })
                } else {
                    branch
                }
            }
        }
        Node::Extension { path, child } => {
            let common = lcp(&path, key);
            if common == path.len() {
                let child = insert_ref(store, Some(child), &key[common..], value, subtree_op)?;
                mem(Node::Extension { path, child })
            } else {
                let mut children: [Option<NodeRef>; 16] = Default::default();
                let mut branch_value = None;
                let ext_rest = path[common + 1..].to_vec();
                children[path[common] as usize] = Some(if ext_rest.is_empty() {
                    child
                } else {
                    mem(Node::Extension {
                        path: ext_rest,
                        child,
                    })
                });
                if key.len() == common {
                    branch_value = Some(value);
                } else {
                    children[key[common] as usize] = Some(mem(Node::Leaf {
                        path: key[common + 1..].to_vec(),
                        value,
                        subtree: subtree_op.into_new(),
                    }));
                }
                let branch = mem(Node::Branch {
                    children,
                    value: branch_value,
                });
                if common > 0 {
                    mem(Node::Extension {
                        path: path[..common].to_vec(),
                        child: branch,
                    })
                } else {
                    branch
                }
            }
        }
        Node::Branch {
            mut children,
            value: branch_value,
        } => {
            if key.is_empty() {
                mem(Node::Branch {
                    children,
                    value: Some(value),
                })
            } else {
                let idx = key[0] as usize;
                let child = insert_ref(store, children[idx].take(), &key[1..], value, subtree_op)?;
                children[idx] = Some(child);
                mem(Node::Branch {
                    children,
                    value: branch_value,
                })
            }
        }
    })
}

fn remove_ref<S: NodeStore>(
    store: &S,
    r: NodeRef,
    key: &[u8],
) -> Result<(Option<NodeRef>, bool), DbError> {
    let node = resolve_owned(store, r)?;
    match node {
        Node::Leaf {
            path,
            value,
            subtree,
        } => {
            if path.as_slice() == key {
                Ok((None, true))
            } else {
                Ok((
                    Some(mem(Node::Leaf {
                        path,
                        value,
                        subtree,
                    })),
                    false,
                ))
            }
        }
        Node::Extension { path, child } => {
            if key.len() >= path.len() && key[..path.len()] == path[..] {
                let (new_child, removed) = remove_ref(store, child, &key[path.len()..])?;
                match new_child {
                    None => Ok((None, removed)),
                    Some(child) if removed => {
                        Ok((Some(join_extension(store, path, child)?), true))
                    }
                    Some(child) => Ok((Some(mem(Node::Extension { path, child })), false)),
                }
            } else {
                Ok((Some(mem(Node::Extension { path, child })), false))
            }
        }
        Node::Branch {
            mut children,
            mut value,
        } => {
            let removed = if key.is_empty() {
                value.take().is_some()
            } else {
                let idx = key[0] as usize;
                match children[idx].take() {
                    None => false,
                    Some(child) => {
                        let (new_child, removed) = remove_ref(store, child, &key[1..])?;
                        children[idx] = new_child;
                        removed
                    }
                }
            };
            if !removed {
                return Ok((Some(mem(Node::Branch { children, value })), false));
            }

            let child_count = children.iter().flatten().count();
            if child_count == 0 {
                return Ok((
                    value.map(|value| {
                        mem(Node::Leaf {
                            path: Vec::new(),
                            value,
                            subtree: None,
                        })
                    }),
                    true,
                ));
            }
            if child_count == 1 && value.is_none() {
                let idx = children
                    .iter()
                    .position(|c| c.is_some())
                    .expect("one child present");
                let child = children[idx].take().expect("one child present");
                return Ok((Some(join_extension(store, vec![idx as u8], child)?), true));
            }
            Ok((Some(mem(Node::Branch { children, value })), true))
        }
    }
}

/// Re-attach `child` below a path prefix after a deletion collapsed its
/// parent, merging paths where the child is a leaf or extension.
fn join_extension<S: NodeStore>(
    store: &S,
    mut path: Nibbles,
    child: NodeRef,
) -> Result<NodeRef, DbError> {
    let node = resolve_owned(store, child)?;
    Ok(match node {
        Node::Leaf {
            path: leaf_path,
            value,
            subtree,
        } => {
            path.extend_from_slice(&leaf_path);
            mem(Node::Leaf {
                path,
                value,
                subtree,
            })
        }
        Node::Extension {
            path: ext_path,
            child,
        } => {
            path.extend_from_slice(&ext_path);
            mem(Node::Extension { path, child })
        }
        branch @ Node::Branch { .. } => mem(Node::Extension {
            path,
            child: mem(branch),
        }),
    })
}

fn merkle_ref<S: NodeStore>(store: &S, r: &NodeRef, kind: TrieKind) -> Result<RlpRef, DbError> {
    match r {
        NodeRef::Disk { merkle, .. } => Ok(merkle.clone()),
        NodeRef::Mem(node) => merkle_node(store, node, kind),
    }
}

fn merkle_leaf_value<S: NodeStore>(
    store: &S,
    value: &[u8],
    subtree: &Option<NodeRef>,
    kind: TrieKind,
) -> Result<Vec<u8>, DbError> {
    Ok(match kind {
        TrieKind::State => {
            let account = decode_account_value(value).map_err(|reason| DbError::CorruptNode {
                offset: 0,
                reason,
            })?;
            let storage_root = match subtree {
                Some(subtree) => merkle_ref(store, subtree, TrieKind::Storage)?.hash(),
                None => EMPTY_ROOT_HASH,
            };
            account.rlp_encoded(storage_root)
        }
        TrieKind::Storage => zeroless_rlp(value),
        TrieKind::Ordered => value.to_vec(),
    })
}

fn merkle_node<S: NodeStore>(store: &S, node: &Node, kind: TrieKind) -> Result<RlpRef, DbError> {
    let empty: [Option<RlpRef>; 16] = Default::default();
    let rlp = match node {
        Node::Leaf { value, subtree, .. } => {
            let leaf_value = merkle_leaf_value(store, value, subtree, kind)?;
            node_rlp(node, &empty, Some(&leaf_value), None)
        }
        Node::Extension { child, .. } => {
            let child_ref = merkle_ref(store, child, kind)?;
            node_rlp(node, &empty, None, Some(&child_ref))
        }
        Node::Branch { children, .. } => {
            let mut refs: [Option<RlpRef>; 16] = Default::default();
            for (i, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    refs[i] = Some(merkle_ref(store, child, kind)?);
                }
            }
            node_rlp(node, &refs, None, None)
        }
    };
    Ok(RlpRef::from_rlp(rlp))
}

fn commit_ref<S: NodeStore>(
    store: &S,
    writer: &mut WriteBuffer<'_, S>,
    r: NodeRef,
    kind: TrieKind,
) -> Result<(super::chunk::ChunkOffset, RlpRef), DbError> {
    let boxed = match r {
        NodeRef::Disk { offset, merkle } => return Ok((offset, merkle)),
        NodeRef::Mem(node) => node,
    };
    let empty: [Option<RlpRef>; 16] = Default::default();
    let (node, rlp) = match *boxed {
        Node::Leaf {
            path,
            value,
            subtree,
        } => {
            let subtree = match subtree {
                Some(subtree) => {
                    let (offset, merkle) = commit_ref(store, writer, subtree, TrieKind::Storage)?;
                    Some(NodeRef::Disk { offset, merkle })
                }
                None => None,
            };
            let leaf_value = merkle_leaf_value(store, &value, &subtree, kind)?;
            let node = Node::Leaf {
                path,
                value,
                subtree,
            };
            let rlp = node_rlp(&node, &empty, Some(&leaf_value), None);
            (node, rlp)
        }
        Node::Extension { path, child } => {
            let (offset, merkle) = commit_ref(store, writer, child, kind)?;
            let node = Node::Extension {
                path,
                child: NodeRef::Disk {
                    offset,
                    merkle: merkle.clone(),
                },
            };
            let rlp = node_rlp(&node, &empty, None, Some(&merkle));
            (node, rlp)
        }
        Node::Branch { children, value } => {
            let mut new_children: [Option<NodeRef>; 16] = Default::default();
            let mut refs: [Option<RlpRef>; 16] = Default::default();
            for (i, child) in children.into_iter().enumerate() {
                if let Some(child) = child {
                    let (offset, merkle) = commit_ref(store, writer, child, kind)?;
                    refs[i] = Some(merkle.clone());
                    new_children[i] = Some(NodeRef::Disk { offset, merkle });
                }
            }
            let node = Node::Branch {
                children: new_children,
                value,
            };
            let rlp = node_rlp(&node, &refs, None, None);
            (node, rlp)
        }
    };
    let merkle = RlpRef::from_rlp(rlp);
    let offset = writer.append(&node.serialize())?;
    Ok((offset, merkle))
}

/// Root of an ephemeral trie keyed by RLP-encoded indices, used for
/// receipts, transactions and withdrawals roots.
pub(crate) fn ordered_root(items: impl IntoIterator<Item = Vec<u8>>) -> B256 {
    use super::node::nibbles_from_bytes;
    use super::store::MemStore;

    let store = MemStore::new();
    let mut trie = Trie::new(TrieKind::Ordered);
    for (index, item) in items.into_iter().enumerate() {
        let key = alloy_rlp::encode(index as u64);
        trie.upsert(&store, &nibbles_from_bytes(&key), item)
            .expect("in-memory upsert cannot fail");
    }
    trie.root_hash(&store).expect("in-memory hash cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triedb::node::nibbles_from_bytes;
    use crate::triedb::store::MemStore;
    use crate::triedb::write_buffer::WriteBuffer;
    use alloy_primitives::keccak256;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn word(n: u64) -> B256 {
        B256::from(U256::from(n).to_be_bytes::<32>())
    }

    fn reference_storage_root(entries: &[(B256, B256)]) -> B256 {
        let mut sorted: Vec<_> = entries.to_vec();
        sorted.sort_by_key(|(key, _)| *key);
        let mut builder = alloy_trie::HashBuilder::default();
        for (key, value) in sorted {
            builder.add_leaf(
                alloy_trie::Nibbles::unpack(key.as_slice()),
                &zeroless_rlp(value.as_slice()),
            );
        }
        builder.root()
    }

    #[test]
    fn empty_trie_root() {
        let store = MemStore::new();
        let trie = Trie::new(TrieKind::Storage);
        assert_eq!(trie.root_hash(&store).unwrap(), EMPTY_ROOT_HASH);
    }

    #[test]
    fn storage_root_matches_reference_builder() {
        let mut rng = StdRng::seed_from_u64(42);
        let store = MemStore::new();
        let mut trie = Trie::new(TrieKind::Storage);
        let mut entries = Vec::new();
        for _ in 0..200 {
            let key = B256::from(rng.gen::<[u8; 32]>());
            let value = word(rng.gen_range(1..u64::MAX));
            trie.upsert(&store, &nibbles_from_bytes(key.as_slice()), value.to_vec())
                .unwrap();
            entries.push((key, value));
        }
        assert_eq!(
            trie.root_hash(&store).unwrap(),
            reference_storage_root(&entries)
        );
    }

    #[test]
    fn erase_matches_reference_builder() {
        let mut rng = StdRng::seed_from_u64(7);
        let store = MemStore::new();
        let mut trie = Trie::new(TrieKind::Storage);
        let mut entries = Vec::new();
        for i in 0..64u64 {
            let key = keccak256(i.to_be_bytes());
            let value = word(i + 1);
            trie.upsert(&store, &nibbles_from_bytes(key.as_slice()), value.to_vec())
                .unwrap();
            entries.push((key, value));
        }
        // Remove half the keys at random.
        for _ in 0..32 {
            let idx = rng.gen_range(0..entries.len());
            let (key, _) = entries.swap_remove(idx);
            assert!(trie
                .erase(&store, &nibbles_from_bytes(key.as_slice()))
                .unwrap());
        }
        assert_eq!(
            trie.root_hash(&store).unwrap(),
            reference_storage_root(&entries)
        );
    }

    #[test]
    fn commit_preserves_root_and_reads() {
        let store = MemStore::new();
        let mut trie = Trie::new(TrieKind::Storage);
        let mut entries = Vec::new();
        for i in 0..50u64 {
            let key = keccak256(i.to_be_bytes());
            let value = word(i + 1);
            trie.upsert(&store, &nibbles_from_bytes(key.as_slice()), value.to_vec())
                .unwrap();
            entries.push((key, value));
        }
        let memory_root = trie.root_hash(&store).unwrap();

        let mut writer = WriteBuffer::new(&store, 0, 0);
        let (offset, committed_root) = trie.commit(&store, &mut writer).unwrap();
        writer.finish().unwrap();
        assert!(offset.is_some());
        assert_eq!(committed_root, memory_root);

        // Reads now go through the store.
        for (key, value) in &entries {
            let (found, _) = trie
                .get_leaf(&store, &nibbles_from_bytes(key.as_slice()))
                .unwrap()
                .expect("key present after commit");
            assert_eq!(found, value.to_vec());
        }

        // Updating one key through the clean trie only dirties its path.
        let (key, _) = entries[0];
        trie.upsert(&store, &nibbles_from_bytes(key.as_slice()), word(999).to_vec())
            .unwrap();
        let mut reference: Vec<_> = entries.clone();
        reference[0].1 = word(999);
        assert_eq!(
            trie.root_hash(&store).unwrap(),
            reference_storage_root(&reference)
        );
    }

    #[test]
    fn account_leaf_embeds_storage_root() {
        let store = MemStore::new();
        let mut storage = Trie::new(TrieKind::Storage);
        let slot = keccak256(b"slot");
        storage
            .upsert(&store, &nibbles_from_bytes(slot.as_slice()), word(7).to_vec())
            .unwrap();
        let storage_root = storage.root_hash(&store).unwrap();

        let account = Account {
            balance: U256::from(100),
            nonce: 1,
            ..Account::default()
        };
        let key = keccak256(b"account");
        let mut state = Trie::new(TrieKind::State);
        state
            .upsert_with(
                &store,
                &nibbles_from_bytes(key.as_slice()),
                encode_account_value(&account),
                SubtreeOp::Set(storage.root.clone()),
            )
            .unwrap();

        let mut builder = alloy_trie::HashBuilder::default();
        builder.add_leaf(
            alloy_trie::Nibbles::unpack(key.as_slice()),
            &account.rlp_encoded(storage_root),
        );
        assert_eq!(state.root_hash(&store).unwrap(), builder.root());
    }

    #[test]
    fn ordered_root_of_empty_is_null() {
        assert_eq!(ordered_root(Vec::<Vec<u8>>::new()), EMPTY_ROOT_HASH);
    }

    #[test]
    fn ordered_root_matches_reference() {
        let items: Vec<Vec<u8>> = (0..10u64)
            .map(|i| alloy_rlp::encode(keccak256(i.to_be_bytes()).as_slice()))
            .collect();
        let mut keyed: Vec<(Vec<u8>, Vec<u8>)> = items
            .iter()
            .enumerate()
            .map(|(i, item)| (alloy_rlp::encode(i as u64), item.clone()))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| {
            alloy_trie::Nibbles::unpack(a).cmp(&alloy_trie::Nibbles::unpack(b))
        });
        let mut builder = alloy_trie::HashBuilder::default();
        for (key, value) in &keyed {
            builder.add_leaf(alloy_trie::Nibbles::unpack(key), value);
        }
        assert_eq!(ordered_root(items), builder.root());
    }
}
