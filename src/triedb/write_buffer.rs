//! Buffered, page-padded appends into the chunk space. Nodes pack
//! back-to-back inside the buffer; each flush is a single page-aligned
//! write, and crossing a chunk boundary flushes and re-homes to the next
//! chunk.

use super::chunk::{pages_for, round_up_page, ChunkOffset, CHUNK_SIZE, DISK_PAGE_SIZE};
use super::store::NodeStore;
use crate::db::DbError;

pub(crate) const WRITE_BUFFER_SIZE: usize = 256 * 1024;

pub(crate) struct WriteBuffer<'a, S: NodeStore> {
    store: &'a S,
    chunk: u32,
    /// Page-aligned offset within the chunk where `buf` starts.
    base: u64,
    buf: Vec<u8>,
}

impl<'a, S: NodeStore> WriteBuffer<'a, S> {
    pub(crate) fn new(store: &'a S, head_chunk: u32, head_offset: u64) -> Self {
        debug_assert_eq!(head_offset % DISK_PAGE_SIZE, 0);
        Self {
            store,
            chunk: head_chunk,
            base: head_offset,
            buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
        }
    }

    /// Append one serialized node, returning its address with the page
    /// count in the spare bits.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<ChunkOffset, DbError> {
        let len = bytes.len() as u64;
        assert!(len <= CHUNK_SIZE, "node larger than a chunk");

        if self.base + self.buf.len() as u64 + len > CHUNK_SIZE {
            self.flush()?;
            self.chunk += 1;
            self.base = 0;
        }
        if self.buf.len() + bytes.len() > WRITE_BUFFER_SIZE && !self.buf.is_empty() {
            self.flush()?;
        }

        let position = self.base + self.buf.len() as u64;
        self.buf.extend_from_slice(bytes);
        // Oversized nodes go straight out rather than growing the buffer.
        if self.buf.len() > WRITE_BUFFER_SIZE {
            self.flush()?;
        }
        Ok(ChunkOffset::new(self.chunk, position).with_pages(pages_for(position, len)))
    }

    /// Pad to a page boundary and hand the buffer to the store.
    pub(crate) fn flush(&mut self) -> Result<(), DbError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let padded = round_up_page(self.buf.len() as u64) as usize;
        self.buf.resize(padded, 0);
        let data = std::mem::replace(&mut self.buf, Vec::with_capacity(WRITE_BUFFER_SIZE));
        self.store.write_pages(self.chunk, self.base, data)?;
        self.base += padded as u64;
        Ok(())
    }

    /// Flush and return the new append head `(chunk, page_offset)`.
    pub(crate) fn finish(mut self) -> Result<(u32, u64), DbError> {
        self.flush()?;
        Ok((self.chunk, self.base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triedb::store::MemStore;

    #[test]
    fn nodes_pack_within_pages() {
        let store = MemStore::new();
        let mut buffer = WriteBuffer::new(&store, 0, 0);
        let a = buffer.append(&[1u8; 100]).unwrap();
        let b = buffer.append(&[2u8; 100]).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 100);
        assert_eq!(a.pages(), 1);
        assert_eq!(b.pages(), 1);
        let (chunk, head) = buffer.finish().unwrap();
        assert_eq!(chunk, 0);
        assert_eq!(head, 512);

        let read = store.read_pages(0, 0, 512).unwrap();
        assert_eq!(&read[100..200], &[2u8; 100]);
    }

    #[test]
    fn flush_rehomes_to_page_boundary() {
        let store = MemStore::new();
        let mut buffer = WriteBuffer::new(&store, 0, 0);
        buffer.append(&[7u8; 10]).unwrap();
        buffer.flush().unwrap();
        let next = buffer.append(&[8u8; 10]).unwrap();
        // After a flush the next node starts on a fresh page.
        assert_eq!(next.offset(), 512);
    }

    #[test]
    fn crossing_chunk_boundary_rehomes() {
        let store = MemStore::new();
        // Start one page short of the chunk end.
        let mut buffer = WriteBuffer::new(&store, 3, CHUNK_SIZE - DISK_PAGE_SIZE);
        let offset = buffer.append(&vec![9u8; 600]).unwrap();
        assert_eq!(offset.chunk_id(), 4);
        assert_eq!(offset.offset(), 0);
        assert_eq!(offset.pages(), 2);
    }
}
