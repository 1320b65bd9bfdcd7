//! Chunk storage backends: on-disk files behind the I/O ring, and an
//! in-memory variant with the same geometry for tests and ephemeral runs.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use super::chunk::{ChunkOffset, CHUNK_SIZE, DISK_PAGE_SIZE};
use super::node::Node;
use super::ring::IoRing;
use crate::db::DbError;

/// Page-granular chunk storage. Offsets handed to `write_pages` are
/// page-aligned and the data page-padded; `publish_meta` must be atomic
/// with respect to crashes.
pub trait NodeStore: Send + Sync + 'static {
    fn read_pages(&self, chunk_id: u32, page_offset: u64, len: usize) -> Result<Vec<u8>, DbError>;

    fn write_pages(&self, chunk_id: u32, page_offset: u64, data: Vec<u8>) -> Result<(), DbError>;

    fn sync(&self) -> Result<(), DbError>;

    fn read_meta(&self) -> Result<Option<Vec<u8>>, DbError>;

    fn publish_meta(&self, bytes: &[u8]) -> Result<(), DbError>;
}

/// Read and decode the node addressed by `offset`.
pub(crate) fn read_node<S: NodeStore>(store: &S, offset: ChunkOffset) -> Result<Node, DbError> {
    let len = (offset.pages() * DISK_PAGE_SIZE) as usize;
    let buf = store.read_pages(offset.chunk_id(), offset.page_aligned_offset(), len)?;
    Node::deserialize(&buf[offset.buffer_offset()..]).map_err(|reason| DbError::CorruptNode {
        offset: offset.raw(),
        reason,
    })
}

/// In-memory chunks; the database the runloop uses when `--db` is
/// omitted.
#[derive(Debug, Default)]
pub struct MemStore {
    chunks: RwLock<HashMap<u32, Vec<u8>>>,
    meta: Mutex<Option<Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for MemStore {
    fn read_pages(&self, chunk_id: u32, page_offset: u64, len: usize) -> Result<Vec<u8>, DbError> {
        let chunks = self.chunks.read().expect("chunk map lock poisoned");
        let chunk = chunks.get(&chunk_id).ok_or(DbError::CorruptNode {
            offset: u64::from(chunk_id) << 43,
            reason: "read of unwritten chunk",
        })?;
        let start = page_offset as usize;
        let end = start + len;
        if end > chunk.len() {
            return Err(DbError::CorruptNode {
                offset: page_offset,
                reason: "read past end of chunk",
            });
        }
        Ok(chunk[start..end].to_vec())
    }

    fn write_pages(&self, chunk_id: u32, page_offset: u64, data: Vec<u8>) -> Result<(), DbError> {
        debug_assert_eq!(page_offset % DISK_PAGE_SIZE, 0);
        debug_assert_eq!(data.len() as u64 % DISK_PAGE_SIZE, 0);
        let mut chunks = self.chunks.write().expect("chunk map lock poisoned");
        let chunk = chunks.entry(chunk_id).or_default();
        let end = page_offset as usize + data.len();
        if chunk.len() < end {
            chunk.resize(end, 0);
        }
        chunk[page_offset as usize..end].copy_from_slice(&data);
        Ok(())
    }

    fn sync(&self) -> Result<(), DbError> {
        Ok(())
    }

    fn read_meta(&self) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.meta.lock().expect("meta lock poisoned").clone())
    }

    fn publish_meta(&self, bytes: &[u8]) -> Result<(), DbError> {
        *self.meta.lock().expect("meta lock poisoned") = Some(bytes.to_vec());
        Ok(())
    }
}

/// Append-only chunk files served by the I/O ring. Chunks are striped
/// across the files round-robin.
#[derive(Debug)]
pub struct DiskStore {
    ring: IoRing,
    nfiles: usize,
    meta_path: PathBuf,
}

impl DiskStore {
    pub fn open(paths: &[PathBuf], sq_thread_cpu: Option<u32>) -> std::io::Result<Self> {
        assert!(!paths.is_empty(), "at least one database file is required");
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?,
            );
        }
        let meta_path = paths[0].with_extension("meta");
        Ok(Self {
            ring: IoRing::new(files, sq_thread_cpu),
            nfiles: paths.len(),
            meta_path,
        })
    }

    fn locate(&self, chunk_id: u32, page_offset: u64) -> (usize, u64) {
        let file = chunk_id as usize % self.nfiles;
        let stripe = u64::from(chunk_id) / self.nfiles as u64;
        (file, stripe * CHUNK_SIZE + page_offset)
    }
}

impl NodeStore for DiskStore {
    fn read_pages(&self, chunk_id: u32, page_offset: u64, len: usize) -> Result<Vec<u8>, DbError> {
        let (file, offset) = self.locate(chunk_id, page_offset);
        self.ring.read(file, offset, len)
    }

    fn write_pages(&self, chunk_id: u32, page_offset: u64, data: Vec<u8>) -> Result<(), DbError> {
        debug_assert_eq!(page_offset % DISK_PAGE_SIZE, 0);
        let (file, offset) = self.locate(chunk_id, page_offset);
        self.ring.write(file, offset, data)
    }

    fn sync(&self) -> Result<(), DbError> {
        self.ring.sync()
    }

    fn read_meta(&self) -> Result<Option<Vec<u8>>, DbError> {
        match std::fs::read(&self.meta_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DbError::Io(err)),
        }
    }

    /// Write-then-rename so a crash mid-publish leaves the previous head
    /// intact; chunks written after that head are garbage for compaction.
    fn publish_meta(&self, bytes: &[u8]) -> Result<(), DbError> {
        let tmp = self.meta_path.with_extension("meta.tmp");
        write_and_sync(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.meta_path).map_err(DbError::Io)?;
        Ok(())
    }
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<(), DbError> {
    use std::io::Write;
    let mut file = File::create(path).map_err(DbError::Io)?;
    file.write_all(bytes).map_err(DbError::Io)?;
    file.sync_all().map_err(DbError::Io)?;
    Ok(())
}
