//! Ring buffer of the most recent 256 block hashes backing the BLOCKHASH
//! opcode.

use alloy_primitives::B256;

const BUFFER_LEN: usize = 256;

#[derive(Clone, Debug)]
pub struct BlockHashBuffer {
    hashes: Box<[B256; BUFFER_LEN]>,
    next_block: u64,
}

impl Default for BlockHashBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockHashBuffer {
    pub fn new() -> Self {
        Self {
            hashes: Box::new([B256::ZERO; BUFFER_LEN]),
            next_block: 0,
        }
    }

    /// Record the hash of `block_number`; numbers must arrive in order.
    pub fn push(&mut self, block_number: u64, hash: B256) {
        debug_assert!(block_number + 1 >= self.next_block);
        self.hashes[(block_number % BUFFER_LEN as u64) as usize] = hash;
        self.next_block = block_number + 1;
    }

    /// Hash of `block_number`, or zero when it is out of the 256-block
    /// window or not yet recorded.
    pub fn get(&self, block_number: u64) -> B256 {
        if block_number >= self.next_block
            || self.next_block - block_number > BUFFER_LEN as u64
        {
            return B256::ZERO;
        }
        self.hashes[(block_number % BUFFER_LEN as u64) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    #[test]
    fn window_of_256_blocks() {
        let mut buffer = BlockHashBuffer::new();
        let h = b256!("00000000000000000000000000000000000000000000000000000000000000ff");
        for number in 0..300u64 {
            let mut hash = h;
            hash.0[0] = number as u8;
            buffer.push(number, hash);
        }
        // Parent of the "current" block 300.
        assert_ne!(buffer.get(299), B256::ZERO);
        // 300 - 256 = 44 is the oldest reachable hash.
        assert_ne!(buffer.get(44), B256::ZERO);
        assert_eq!(buffer.get(43), B256::ZERO);
        assert_eq!(buffer.get(300), B256::ZERO);
    }
}
