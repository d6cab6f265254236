use std::{cmp::Ordering, sync::Arc};

use super::format::BlockContent;
use crate::{
    cmp::Comparator,
    codec::{self, VarIntReader},
    error::{Error, Result},
    iterator::DBIterator,
    slice::UnsafeSlice,
};

const RESTART_SIZE: usize = 4;

pub struct Block {
    content: Arc<BlockContent>,
    restart_offset: u32,
    num_restarts: u32,
}

impl Block {
    pub fn from_raw(content: BlockContent) -> Result<Self> {
        let n = content.len();
        if n < RESTART_SIZE {
            return Err(Error::Corruption("block too small".into()));
        }
        let num_restarts = codec::decode_u32_le(&content[n - RESTART_SIZE..]);
        let max_restarts_allowed = (n - RESTART_SIZE) / RESTART_SIZE;
        if num_restarts as usize > max_restarts_allowed {
            Err(Error::Corruption("bad restart array in block".into()))
        } else {
            Ok(Block {
                content: Arc::new(content),
                restart_offset: (n - (1 + num_restarts as usize) * RESTART_SIZE) as u32,
                num_restarts,
            })
        }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn iter(&self, comparator: Arc<dyn Comparator>) -> BlockIter {
        BlockIter::new(self, comparator)
    }
}

pub struct BlockIter {
    content: Arc<BlockContent>,
    comparator: Arc<dyn Comparator>,

    restarts: u32,
    num_restarts: u32,

    // Offset of the current entry, == restarts when exhausted.
    current: u32,
    restart_index: u32,
    key: Vec<u8>,
    value: UnsafeSlice,
    err: Option<Error>,
}

impl BlockIter {
    pub fn new(block: &Block, comparator: Arc<dyn Comparator>) -> Self {
        BlockIter {
            content: block.content.clone(),
            comparator,
            restarts: block.restart_offset,
            num_restarts: block.num_restarts,
            current: block.restart_offset,
            restart_index: block.num_restarts,
            key: Vec::new(),
            value: Default::default(),
            err: None,
        }
    }

    fn next_entry_offset(&self) -> u32 {
        if self.value.is_empty() && self.value.data().is_null() {
            return self.current;
        }
        let offset = unsafe {
            self.value
                .data()
                .add(self.value.size())
                .offset_from(self.content.data.as_ptr())
        };
        offset as u32
    }

    fn get_restart_point(&self, index: u32) -> u32 {
        assert!(index < self.num_restarts);
        let offset = self.restarts as usize + RESTART_SIZE * index as usize;
        codec::decode_u32_le(&self.content.data[offset..])
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        self.current = self.get_restart_point(index);
        let ptr = unsafe { self.content.as_ptr().add(self.current as usize) };
        self.value = UnsafeSlice::new(ptr, 0);
    }

    // (shared, non_shared, value_len, header_len) of the entry at offset.
    fn decode_entry(&self, offset: u32) -> Result<(u32, u32, u32, u32)> {
        if self.restarts - offset < 3 {
            return Err(Error::Corruption("bad entry in block".into()));
        }
        let data = &self.content[offset as usize..self.restarts as usize];
        let (shared, non_shared, value_len, header_len) =
            if data[0] < 128 && data[1] < 128 && data[2] < 128 {
                // All three lengths fit one byte each.
                (data[0] as u32, data[1] as u32, data[2] as u32, 3usize)
            } else {
                let mut buf = data;
                let (shared, n0) = buf.read_var_u32()?;
                let (non_shared, n1) = buf.read_var_u32()?;
                let (value_len, n2) = buf.read_var_u32()?;
                (shared, non_shared, value_len, n0 + n1 + n2)
            };

        if (self.restarts - offset) as usize - header_len < (non_shared + value_len) as usize {
            return Err(Error::Corruption("bad entry in block".into()));
        }
        Ok((shared, non_shared, value_len, header_len as u32))
    }

    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.restarts {
            self.current = self.restarts;
            self.restart_index = self.num_restarts;
            return false;
        }

        match self.decode_entry(self.current) {
            Ok((shared, non_shared, value_len, header_len)) => {
                if (self.key.len() as u32) < shared {
                    self.corruption_err();
                    return false;
                }
                let offset = (self.current + header_len) as usize;
                let buf = &self.content[offset..];

                self.key.truncate(shared as usize);
                self.key.extend_from_slice(&buf[..non_shared as usize]);

                let value = &buf[non_shared as usize..(non_shared + value_len) as usize];
                self.value = UnsafeSlice::from(value);

                while self.restart_index + 1 < self.num_restarts
                    && self.get_restart_point(self.restart_index + 1) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
            Err(_) => {
                self.corruption_err();
                false
            }
        }
    }

    fn corruption_err(&mut self) {
        self.current = self.restarts;
        self.restart_index = self.num_restarts;
        self.err
            .get_or_insert(Error::Corruption("bad entry in block".into()));
    }
}

impl DBIterator for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.restarts
    }

    fn seek_to_first(&mut self) {
        if self.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.num_restarts - 1);
        while self.parse_next_entry() && self.next_entry_offset() < self.restarts {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.num_restarts == 0 {
            return;
        }
        // Binary-search restart points for the last full key < target.
        let (mut left, mut right) = (0u32, self.num_restarts - 1);
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.get_restart_point(mid);
            match self.decode_entry(region_offset) {
                Ok((shared, non_shared, _, header_len)) => {
                    if shared != 0 {
                        self.corruption_err();
                        return;
                    }
                    let offset = (region_offset + header_len) as usize;
                    let key = &self.content[offset..offset + non_shared as usize];
                    if self.comparator.compare(key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                Err(_) => {
                    self.corruption_err();
                    return;
                }
            }
        }

        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        assert!(self.valid());

        // Back up to the restart point before the current entry, then walk
        // forward until just short of it.
        let original = self.current;
        while self.get_restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.current = self.restarts;
                self.restart_index = self.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        unsafe { self.value.as_ref() }
    }

    fn status(&mut self) -> Result<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cmp::BitwiseComparator, sstable::block_builder::BlockBuilder};

    fn get_data() -> Vec<(&'static [u8], &'static [u8])> {
        vec![
            (b"key1", b"value1"),
            (b"loooooooooooooooooooooongerkey1", b"shrtvl1"),
            (b"medium length key 1", b"some value 2"),
            (b"prefix_key1", b"value"),
            (b"prefix_key2", b"value"),
            (b"prefix_key3", b"value"),
        ]
    }

    fn build_block(restart_interval: u32) -> Block {
        let comparator = Arc::new(BitwiseComparator {});
        let mut builder = BlockBuilder::new(comparator, restart_interval);
        for &(k, v) in get_data().iter() {
            builder.add(k, v);
        }
        Block::from_raw(BlockContent::new(builder.finish())).unwrap()
    }

    #[test]
    fn test_forward_iteration() {
        let comparator = Arc::new(BitwiseComparator {});
        let block = build_block(3);
        let mut iter = block.iter(comparator);

        iter.seek_to_first();
        for &(key, val) in get_data().iter() {
            assert!(iter.valid());
            assert_eq!(key, iter.key());
            assert_eq!(val, iter.value());
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_backward_iteration() {
        let comparator = Arc::new(BitwiseComparator {});
        let block = build_block(2);
        let mut iter = block.iter(comparator);

        iter.seek_to_last();
        for &(key, val) in get_data().iter().rev() {
            assert!(iter.valid());
            assert_eq!(key, iter.key());
            assert_eq!(val, iter.value());
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek() {
        let comparator = Arc::new(BitwiseComparator {});
        let block = build_block(3);
        let mut iter = block.iter(comparator);

        iter.seek(b"medium");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"medium length key 1");

        iter.seek(b"prefix_key2");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"prefix_key2");

        iter.seek(b"prefix_key4");
        assert!(!iter.valid());

        iter.seek(b"");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key1");
    }
}
