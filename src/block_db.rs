//! Block source: a directory of JSON-encoded blocks, one file per block
//! number. The production ingestion path replaces this with the network
//! feed; the runloop only depends on `read_block`.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::primitives::Block;

#[derive(Debug, Error)]
pub enum BlockDbError {
    #[error("block db i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("block {number} decode error: {source}")]
    Decode {
        number: u64,
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct BlockDb {
    dir: PathBuf,
}

impl BlockDb {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        std::fs::metadata(path)?;
        Ok(Self {
            dir: path.to_path_buf(),
        })
    }

    fn block_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{number}.json"))
    }

    /// `None` once the chain of block files ends.
    pub fn read_block(&self, number: u64) -> Result<Option<Block>, BlockDbError> {
        let path = self.block_path(number);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(BlockDbError::Io(err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| BlockDbError::Decode { number, source })
    }

    pub fn write_block(&self, block: &Block) -> Result<(), BlockDbError> {
        let path = self.block_path(block.header.number);
        let bytes = serde_json::to_vec_pretty(block).map_err(|source| BlockDbError::Decode {
            number: block.header.number,
            source,
        })?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}
