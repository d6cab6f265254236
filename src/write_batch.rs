use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Buf;

use crate::{
    codec::{read_length_prefixed_slice, write_length_prefixed_slice},
    error::{Error, Result},
    memtable::MemTable,
    types::{SequenceNumber, ValueType},
};

// Serialized layout: sequence (u64 LE) | count (u32 LE) | ops, where each
// op is tag (u8) | key | [value], both length-prefixed. This is also the
// exact payload framed into one WAL record.
const HEAD_SIZE: usize = 12;

pub struct WriteBatch {
    rep: Vec<u8>,
    approximate_size: usize,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch {
            rep: vec![0; HEAD_SIZE],
            approximate_size: HEAD_SIZE,
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        write_length_prefixed_slice(&mut self.rep, key);
        write_length_prefixed_slice(&mut self.rep, value);
        self.approximate_size += HEAD_SIZE + key.len() + value.len();
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        write_length_prefixed_slice(&mut self.rep, key);
        self.approximate_size += 6 + key.len();
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEAD_SIZE, 0);
        self.approximate_size = HEAD_SIZE;
    }

    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep
            .as_mut_slice()
            .write_u64::<LittleEndian>(seq)
            .unwrap()
    }

    pub fn sequence(&self) -> SequenceNumber {
        let mut buf = &self.rep[..8];
        buf.read_u64::<LittleEndian>().unwrap()
    }

    fn set_count(&mut self, n: u32) {
        let mut buf = self.rep[8..].as_mut();
        buf.write_u32::<LittleEndian>(n).unwrap()
    }

    pub fn count(&self) -> u32 {
        let mut buf = &self.rep[8..];
        buf.read_u32::<LittleEndian>().unwrap()
    }

    // Coarse per-entry accounting used only for group-commit thresholds.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    pub fn append(&mut self, source: &WriteBatch) {
        assert!(source.rep.len() >= HEAD_SIZE);
        self.set_count(self.count() + source.count());
        self.rep.extend_from_slice(&source.rep[HEAD_SIZE..]);
        self.approximate_size += source.approximate_size - HEAD_SIZE;
    }

    pub fn content(&self) -> &[u8] {
        &self.rep
    }

    pub fn set_content(&mut self, content: Vec<u8>) -> Result<()> {
        if content.len() < HEAD_SIZE {
            return Err(Error::Corruption("malformed write batch (too small)".into()));
        }
        self.approximate_size = content.len();
        self.rep = content;
        Ok(())
    }

    pub fn iterate<H: Handler>(&self, handler: &mut H) -> Result<()> {
        let mut buf = self.rep.as_slice();
        if buf.len() < HEAD_SIZE {
            return Err(Error::Corruption("malformed write batch (too small)".into()));
        }
        buf.advance(HEAD_SIZE);

        let mut found = 0;
        while !buf.is_empty() {
            found += 1;
            let tag = ValueType::try_from(buf[0])?;
            buf.advance(1);
            match tag {
                ValueType::Value => {
                    let key = read_length_prefixed_slice(&mut buf)?;
                    let value = read_length_prefixed_slice(&mut buf)?;
                    handler.put(key, value);
                }
                ValueType::Deletion => {
                    let key = read_length_prefixed_slice(&mut buf)?;
                    handler.delete(key);
                }
            }
        }
        if found != self.count() {
            return Err(Error::Corruption("write batch has wrong count".into()));
        }
        Ok(())
    }

    // Replay into a memtable, stamping entries from the batch sequence up.
    pub fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut inserter = MemTableInserter {
            sequence: self.sequence(),
            mem,
        };
        self.iterate(&mut inserter)
    }
}

pub trait Handler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

struct MemTableInserter<'a> {
    sequence: SequenceNumber,
    mem: &'a MemTable,
}

impl<'a> Handler for MemTableInserter<'a> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, b"");
        self.sequence += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        cmp::{BitwiseComparator, InternalKeyComparator},
        memtable::LookupKey,
    };

    struct Collector {
        ops: Vec<(u8, Vec<u8>, Vec<u8>)>,
    }

    impl Handler for Collector {
        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.ops.push((1, key.to_vec(), value.to_vec()));
        }
        fn delete(&mut self, key: &[u8]) {
            self.ops.push((0, key.to_vec(), Vec::new()));
        }
    }

    #[test]
    fn test_count_and_sequence() {
        let mut batch = WriteBatch::new();
        assert_eq!(batch.count(), 0);
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        assert_eq!(batch.count(), 3);

        batch.set_sequence(100);
        assert_eq!(batch.sequence(), 100);
    }

    #[test]
    fn test_iterate_round_trip() {
        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1");
        batch.delete(b"k2");
        batch.put(b"", b"");

        let mut collector = Collector { ops: Vec::new() };
        batch.iterate(&mut collector).unwrap();
        assert_eq!(
            collector.ops,
            vec![
                (1, b"k1".to_vec(), b"v1".to_vec()),
                (0, b"k2".to_vec(), Vec::new()),
                (1, Vec::new(), Vec::new()),
            ]
        );
    }

    #[test]
    fn test_append() {
        let mut left = WriteBatch::new();
        left.put(b"a", b"1");
        let mut right = WriteBatch::new();
        right.delete(b"b");
        right.put(b"c", b"3");

        left.append(&right);
        assert_eq!(left.count(), 3);

        let mut collector = Collector { ops: Vec::new() };
        left.iterate(&mut collector).unwrap();
        assert_eq!(collector.ops.len(), 3);
        assert_eq!(collector.ops[2].1, b"c".to_vec());
    }

    #[test]
    fn test_empty_batch_round_trip() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(7);
        let content = batch.content().to_vec();

        let mut decoded = WriteBatch::new();
        decoded.set_content(content).unwrap();
        assert_eq!(decoded.count(), 0);
        assert_eq!(decoded.sequence(), 7);

        let mut collector = Collector { ops: Vec::new() };
        decoded.iterate(&mut collector).unwrap();
        assert!(collector.ops.is_empty());
    }

    #[test]
    fn test_insert_into_memtable() {
        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let mem = MemTable::new(icmp);

        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v1");
        batch.delete(b"k");
        batch.set_sequence(10);
        batch.insert_into(&mem).unwrap();

        // At sequence 10 the put is visible; at 11 the delete shadows it.
        let at_put = LookupKey::new(b"k", 10);
        assert_eq!(mem.get(&at_put), Some(Some(b"v1".to_vec())));
        let at_delete = LookupKey::new(b"k", 11);
        assert_eq!(mem.get(&at_delete), Some(None));
    }
}
