//! Trie nodes: in-memory representation, the custom on-disk wire format
//! and the RLP forms used for Merkle hashing.

use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Encodable, Header, EMPTY_STRING_CODE};

use super::chunk::ChunkOffset;

/// Unpacked nibble path, one nibble per byte.
pub(crate) type Nibbles = Vec<u8>;

pub(crate) fn nibbles_from_bytes(bytes: &[u8]) -> Nibbles {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(byte >> 4);
        out.push(byte & 0x0f);
    }
    out
}

fn pack_nibbles(nibbles: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nibbles.len().div_ceil(2));
    for pair in nibbles.chunks(2) {
        let high = pair[0] << 4;
        let low = pair.get(1).copied().unwrap_or(0);
        out.push(high | low);
    }
    out
}

fn unpack_nibbles(packed: &[u8], count: usize) -> Nibbles {
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let byte = packed[i / 2];
        out.push(if i % 2 == 0 { byte >> 4 } else { byte & 0x0f });
    }
    out
}

/// Hex-prefix encoding of a path for the Merkle RLP forms.
pub(crate) fn compact_encode(path: &[u8], is_leaf: bool) -> Vec<u8> {
    let odd = path.len() % 2 == 1;
    let mut out = Vec::with_capacity(path.len() / 2 + 1);
    let mut first = if is_leaf { 0x20u8 } else { 0x00 };
    let rest = if odd {
        first |= 0x10 | path[0];
        &path[1..]
    } else {
        path
    };
    out.push(first);
    for pair in rest.chunks(2) {
        out.push((pair[0] << 4) | pair[1]);
    }
    out
}

/// Reference to a node as seen by its parent's Merkle form: the keccak of
/// its RLP, or the raw RLP when shorter than 32 bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RlpRef {
    Hash(B256),
    Inline(Vec<u8>),
}

impl RlpRef {
    pub(crate) fn from_rlp(rlp: Vec<u8>) -> Self {
        if rlp.len() < 32 {
            Self::Inline(rlp)
        } else {
            Self::Hash(keccak256(&rlp))
        }
    }

    pub(crate) fn hash(&self) -> B256 {
        match self {
            Self::Hash(hash) => *hash,
            Self::Inline(rlp) => keccak256(rlp),
        }
    }

    /// Append this reference into a parent's RLP payload.
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Hash(hash) => hash.encode(out),
            Self::Inline(rlp) => out.extend_from_slice(rlp),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum NodeRef {
    /// Clean node persisted at `offset` with its Merkle form known.
    Disk { offset: ChunkOffset, merkle: RlpRef },
    /// Dirty in-memory node awaiting commit.
    Mem(Box<Node>),
}

#[derive(Clone, Debug)]
pub(crate) enum Node {
    Leaf {
        path: Nibbles,
        value: Vec<u8>,
        /// Nested storage trie hanging off an account leaf.
        subtree: Option<NodeRef>,
    },
    Extension {
        path: Nibbles,
        child: NodeRef,
    },
    Branch {
        children: [Option<NodeRef>; 16],
        value: Option<Vec<u8>>,
    },
}

const TAG_LEAF: u8 = 0;
const TAG_EXTENSION: u8 = 1;
const TAG_BRANCH: u8 = 2;

const REF_HASH: u8 = 0;
const REF_INLINE: u8 = 1;

fn serialize_ref(out: &mut Vec<u8>, offset: ChunkOffset, merkle: &RlpRef) {
    out.extend_from_slice(&offset.raw().to_le_bytes());
    match merkle {
        RlpRef::Hash(hash) => {
            out.push(REF_HASH);
            out.extend_from_slice(hash.as_slice());
        }
        RlpRef::Inline(rlp) => {
            out.push(REF_INLINE);
            out.push(rlp.len() as u8);
            out.extend_from_slice(rlp);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], &'static str> {
        if self.pos + n > self.buf.len() {
            return Err("truncated node");
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, &'static str> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, &'static str> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32, &'static str> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, &'static str> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn node_ref(&mut self) -> Result<NodeRef, &'static str> {
        let offset = ChunkOffset::from_raw(self.u64()?);
        let merkle = match self.u8()? {
            REF_HASH => RlpRef::Hash(B256::from_slice(self.take(32)?)),
            REF_INLINE => {
                let len = self.u8()? as usize;
                RlpRef::Inline(self.take(len)?.to_vec())
            }
            _ => return Err("bad ref tag"),
        };
        Ok(NodeRef::Disk { offset, merkle })
    }

    fn path(&mut self) -> Result<Nibbles, &'static str> {
        let count = self.u16()? as usize;
        let packed = self.take(count.div_ceil(2))?;
        Ok(unpack_nibbles(packed, count))
    }
}

impl Node {
    /// Wire format. Child references must already be on disk.
    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        match self {
            Node::Leaf {
                path,
                value,
                subtree,
            } => {
                out.push(TAG_LEAF);
                out.push(subtree.is_some() as u8);
                out.extend_from_slice(&(path.len() as u16).to_le_bytes());
                out.extend_from_slice(&pack_nibbles(path));
                out.extend_from_slice(&(value.len() as u32).to_le_bytes());
                out.extend_from_slice(value);
                if let Some(NodeRef::Disk { offset, merkle }) = subtree {
                    serialize_ref(&mut out, *offset, merkle);
                } else {
                    debug_assert!(subtree.is_none(), "dirty subtree at serialize time");
                }
            }
            Node::Extension { path, child } => {
                out.push(TAG_EXTENSION);
                out.extend_from_slice(&(path.len() as u16).to_le_bytes());
                out.extend_from_slice(&pack_nibbles(path));
                match child {
                    NodeRef::Disk { offset, merkle } => serialize_ref(&mut out, *offset, merkle),
                    NodeRef::Mem(_) => unreachable!("dirty child at serialize time"),
                }
            }
            Node::Branch { children, value } => {
                out.push(TAG_BRANCH);
                let mut mask = 0u16;
                for (i, child) in children.iter().enumerate() {
                    if child.is_some() {
                        mask |= 1 << i;
                    }
                }
                out.extend_from_slice(&mask.to_le_bytes());
                let value_bytes = value.as_deref().unwrap_or(&[]);
                out.extend_from_slice(&(value_bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(value_bytes);
                for child in children.iter().flatten() {
                    match child {
                        NodeRef::Disk { offset, merkle } => {
                            serialize_ref(&mut out, *offset, merkle)
                        }
                        NodeRef::Mem(_) => unreachable!("dirty child at serialize time"),
                    }
                }
            }
        }
        out
    }

    pub(crate) fn deserialize(buf: &[u8]) -> Result<Node, &'static str> {
        let mut reader = Reader { buf, pos: 0 };
        match reader.u8()? {
            TAG_LEAF => {
                let has_subtree = reader.u8()? != 0;
                let path = reader.path()?;
                let value_len = reader.u32()? as usize;
                let value = reader.take(value_len)?.to_vec();
                let subtree = if has_subtree {
                    Some(reader.node_ref()?)
                } else {
                    None
                };
                Ok(Node::Leaf {
                    path,
                    value,
                    subtree,
                })
            }
            TAG_EXTENSION => {
                let path = reader.path()?;
                let child = reader.node_ref()?;
                Ok(Node::Extension { path, child })
            }
            TAG_BRANCH => {
                let mask = reader.u16()?;
                let value_len = reader.u32()? as usize;
                let value = reader.take(value_len)?.to_vec();
                let value = if value.is_empty() { None } else { Some(value) };
                let mut children: [Option<NodeRef>; 16] = Default::default();
                for (i, slot) in children.iter_mut().enumerate() {
                    if mask & (1 << i) != 0 {
                        *slot = Some(reader.node_ref()?);
                    }
                }
                Ok(Node::Branch { children, value })
            }
            _ => Err("bad node tag"),
        }
    }
}

/// RLP form of a node whose children's references are already computed.
/// `leaf_value` lets the caller substitute the Merkle leaf value (the
/// account RLP with the storage root spliced in).
pub(crate) fn node_rlp(
    node: &Node,
    child_refs: &[Option<RlpRef>; 16],
    leaf_value: Option<&[u8]>,
    extension_child: Option<&RlpRef>,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    match node {
        Node::Leaf { path, value, .. } => {
            let compact = compact_encode(path, true);
            compact.as_slice().encode(&mut payload);
            leaf_value.unwrap_or(value).encode(&mut payload);
        }
        Node::Extension { path, .. } => {
            let compact = compact_encode(path, false);
            compact.as_slice().encode(&mut payload);
            extension_child
                .expect("extension child reference required")
                .encode_into(&mut payload);
        }
        Node::Branch { value, .. } => {
            for child in child_refs {
                match child {
                    Some(reference) => reference.encode_into(&mut payload),
                    None => payload.push(EMPTY_STRING_CODE),
                }
            }
            match value {
                Some(value) => value.as_slice().encode(&mut payload),
                None => payload.push(EMPTY_STRING_CODE),
            }
        }
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_roundtrip() {
        let nibbles = nibbles_from_bytes(&[0xab, 0xcd]);
        assert_eq!(nibbles, vec![0xa, 0xb, 0xc, 0xd]);
        assert_eq!(unpack_nibbles(&pack_nibbles(&nibbles), 4), nibbles);
        let odd = vec![0x1, 0x2, 0x3];
        assert_eq!(unpack_nibbles(&pack_nibbles(&odd), 3), odd);
    }

    #[test]
    fn compact_encoding_vectors() {
        // Examples from the yellow paper appendix C.
        assert_eq!(compact_encode(&[0x1, 0x2, 0x3, 0x4, 0x5], false), vec![0x11, 0x23, 0x45]);
        assert_eq!(
            compact_encode(&[0x0, 0x1, 0x2, 0x3, 0x4, 0x5], false),
            vec![0x00, 0x01, 0x23, 0x45]
        );
        assert_eq!(
            compact_encode(&[0x0, 0xf, 0x1, 0xc, 0xb, 0x8], true),
            vec![0x20, 0x0f, 0x1c, 0xb8]
        );
        assert_eq!(
            compact_encode(&[0xf, 0x1, 0xc, 0xb, 0x8], true),
            vec![0x3f, 0x1c, 0xb8]
        );
    }

    #[test]
    fn serialize_roundtrip() {
        let leaf = Node::Leaf {
            path: vec![0x1, 0x2, 0x3],
            value: b"hello".to_vec(),
            subtree: Some(NodeRef::Disk {
                offset: ChunkOffset::new(1, 512).with_pages(1),
                merkle: RlpRef::Hash(B256::repeat_byte(7)),
            }),
        };
        let bytes = leaf.serialize();
        let Node::Leaf {
            path,
            value,
            subtree,
        } = Node::deserialize(&bytes).unwrap()
        else {
            panic!("wrong node kind");
        };
        assert_eq!(path, vec![0x1, 0x2, 0x3]);
        assert_eq!(value, b"hello");
        assert!(matches!(
            subtree,
            Some(NodeRef::Disk { merkle: RlpRef::Hash(h), .. }) if h == B256::repeat_byte(7)
        ));

        let mut children: [Option<NodeRef>; 16] = Default::default();
        children[3] = Some(NodeRef::Disk {
            offset: ChunkOffset::new(0, 0),
            merkle: RlpRef::Inline(vec![0xc0]),
        });
        let branch = Node::Branch {
            children,
            value: None,
        };
        let bytes = branch.serialize();
        let Node::Branch { children, value } = Node::deserialize(&bytes).unwrap() else {
            panic!("wrong node kind");
        };
        assert!(value.is_none());
        assert!(children[3].is_some());
        assert!(children[4].is_none());
    }

    #[test]
    fn truncated_node_is_rejected() {
        let leaf = Node::Leaf {
            path: vec![0x1],
            value: b"v".to_vec(),
            subtree: None,
        };
        let bytes = leaf.serialize();
        assert!(Node::deserialize(&bytes[..bytes.len() - 1]).is_err());
    }
}
