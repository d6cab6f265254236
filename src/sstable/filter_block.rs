use std::sync::Arc;

use crate::{
    codec::{decode_u32_le, NumberEncoder},
    filter::FilterPolicy,
    slice::UnsafeSlice,
};

// A new filter is started every 2 KiB of table offset.
const FILTER_BASE_LG: usize = 11;
const FILTER_BASE: usize = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    keys: Vec<u8>,
    start: Vec<usize>,
    result: Vec<u8>,
    tmp_keys: Vec<UnsafeSlice>,
    filter_offsets: Vec<usize>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            start: Vec::new(),
            result: Vec::new(),
            tmp_keys: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn start_block(&mut self, block_offset: usize) {
        let filter_index = block_offset / FILTER_BASE;
        assert!(filter_index >= self.filter_offsets.len());
        while filter_index > self.filter_offsets.len() {
            self.generate_filter();
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len();
        for offset in self.filter_offsets.iter() {
            self.result.encode_u32_le(*offset as u32).unwrap();
        }
        self.result.encode_u32_le(array_offset as u32).unwrap();
        self.result.push(FILTER_BASE_LG as u8);
        self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.start.len();
        if num_keys == 0 {
            self.filter_offsets.push(self.result.len());
            return;
        }

        self.start.push(self.keys.len());
        self.tmp_keys.resize(num_keys, Default::default());
        for i in 0..num_keys {
            let (begin, end) = (self.start[i], self.start[i + 1]);
            self.tmp_keys[i] = UnsafeSlice::new(self.keys[begin..end].as_ptr(), end - begin);
        }

        self.filter_offsets.push(self.result.len());
        self.policy.create_filter(&self.tmp_keys, &mut self.result);

        self.keys.clear();
        self.start.clear();
        self.tmp_keys.clear();
    }
}

pub struct FilterBlockReader<'a> {
    policy: Arc<dyn FilterPolicy>,
    data: &'a [u8],
    offset: usize,
    num: usize,
    base_lg: usize,
}

impl<'a> FilterBlockReader<'a> {
    pub fn new(policy: Arc<dyn FilterPolicy>, data: &'a [u8]) -> Self {
        let mut reader = FilterBlockReader {
            policy,
            data: Default::default(),
            offset: 0,
            num: 0,
            base_lg: 0,
        };

        let n = data.len();
        if n < 5 {
            return reader;
        }
        reader.base_lg = data[n - 1] as usize;
        let array_offset = decode_u32_le(&data[n - 5..]) as usize;
        if array_offset > n - 5 {
            return reader;
        }
        reader.offset = array_offset;
        reader.data = data;
        reader.num = (n - 5 - array_offset) / 4;
        reader
    }

    pub fn key_may_match(&self, block_offset: usize, key: &[u8]) -> bool {
        let index = block_offset >> self.base_lg;
        if index < self.num {
            let start = decode_u32_le(&self.data[self.offset + index * 4..]) as usize;
            let limit = decode_u32_le(&self.data[self.offset + index * 4 + 4..]) as usize;
            if start < limit && limit <= self.offset {
                return self.policy.key_match(key, &self.data[start..limit]);
            } else if start == limit {
                // Empty filter covers no keys.
                return false;
            }
        }
        // Errors are treated as potential matches.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::BloomFilterPolicy;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    #[test]
    fn test_empty_builder() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        let block = builder.finish();
        assert_eq!(&block[block.len() - 5..], &[0, 0, 0, 0, FILTER_BASE_LG as u8]);

        let reader = FilterBlockReader::new(policy(), &block);
        assert!(reader.key_may_match(0, b"anything"));
    }

    #[test]
    fn test_single_chunk() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.add_key(b"box");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");
        let block = builder.finish();

        let reader = FilterBlockReader::new(policy(), &block);
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(reader.key_may_match(100, b"box"));
        assert!(reader.key_may_match(100, b"hello"));
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn test_multi_chunk() {
        let mut builder = FilterBlockBuilder::new(policy());

        // First filter.
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.start_block(2000);
        builder.add_key(b"bar");

        // Second filter.
        builder.start_block(3100);
        builder.add_key(b"box");

        // Third filter is empty.

        // Last filter.
        builder.start_block(9000);
        builder.add_key(b"box");
        builder.add_key(b"hello");

        let block = builder.finish();
        let reader = FilterBlockReader::new(policy(), &block);

        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(2000, b"bar"));
        assert!(!reader.key_may_match(0, b"box"));

        assert!(reader.key_may_match(3100, b"box"));
        assert!(!reader.key_may_match(3100, b"foo"));

        assert!(!reader.key_may_match(4100, b"box"));

        assert!(reader.key_may_match(9000, b"box"));
        assert!(reader.key_may_match(9000, b"hello"));
        assert!(!reader.key_may_match(9000, b"foo"));
    }
}
