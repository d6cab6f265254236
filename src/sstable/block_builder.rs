use std::{
    cmp::{self, Ordering},
    sync::Arc,
};

use integer_encoding::{FixedIntWriter, VarIntWriter};

use crate::cmp::Comparator;

// Entries are prefix-compressed against the previous key, with a full key
// stored at every restart point.
pub struct BlockBuilder {
    comparator: Arc<dyn Comparator>,
    block_restart_interval: u32,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_counter: u32,
    counter: u32,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(comparator: Arc<dyn Comparator>, block_restart_interval: u32) -> Self {
        assert!(block_restart_interval >= 1);
        BlockBuilder {
            comparator,
            block_restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            restart_counter: 0,
            counter: 0,
            last_key: Vec::new(),
        }
    }

    pub fn entries(&self) -> usize {
        self.counter as usize
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + 4 * self.restarts.len() + 4
    }

    pub fn add<T: AsRef<[u8]>>(&mut self, key: T, val: T) {
        let key = key.as_ref();
        let val = val.as_ref();

        assert!(self.restart_counter <= self.block_restart_interval);
        assert!(
            self.buffer.is_empty()
                || self.comparator.compare(key, &self.last_key) == Ordering::Greater
        );

        let mut shared = 0;
        if self.restart_counter < self.block_restart_interval {
            let smallest = cmp::min(key.len(), self.last_key.len());
            while shared < smallest && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.restart_counter = 0;
        }

        let non_shared = key.len() - shared;

        self.buffer.write_varint(shared as u32).unwrap();
        self.buffer.write_varint(non_shared as u32).unwrap();
        self.buffer.write_varint(val.len() as u32).unwrap();
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(val);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);

        self.restart_counter += 1;
        self.counter += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buffer.reserve(self.restarts.len() * 4 + 4);
        for r in self.restarts.iter() {
            self.buffer.write_fixedint(*r).unwrap();
        }
        self.buffer
            .write_fixedint(self.restarts.len() as u32)
            .unwrap();
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::BitwiseComparator;

    #[test]
    fn test_build_shares_prefixes() {
        let comparator = Arc::new(BitwiseComparator {});
        let mut builder = BlockBuilder::new(comparator, 16);

        builder.add(b"prefix_key1".as_ref(), b"v1".as_ref());
        builder.add(b"prefix_key2".as_ref(), b"v2".as_ref());
        assert_eq!(builder.entries(), 2);

        let block = builder.finish();
        // Second entry shares "prefix_key" and stores only one new byte.
        assert!(block.len() < 2 * (11 + 2 + 3) + 8 + 4);
    }

    #[test]
    fn test_empty_block_still_has_restart_array() {
        let comparator = Arc::new(BitwiseComparator {});
        let builder = BlockBuilder::new(comparator, 4);
        assert!(builder.is_empty());
        let block = builder.finish();
        assert_eq!(block.len(), 8);
    }
}
