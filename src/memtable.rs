use std::{
    cmp::Ordering,
    sync::{
        atomic::{self, AtomicUsize},
        Arc,
    },
};

use crate::{
    cmp::{Comparator, InternalKeyComparator, MemKeyComparator},
    codec::{read_bytes, NumberDecoder, NumberEncoder, VarIntReader, VarIntWriter},
    error::Result,
    format::pack_sequence_and_type,
    iterator::DBIterator,
    skiplist::{SkipList, SkipListIter},
    types::{SequenceNumber, ValueType, VALUE_TYPE_FOR_SEEK},
};

pub struct MemTable {
    table: Arc<SkipList<Vec<u8>>>,
    comparator: Arc<dyn Comparator>,
    memory_usage: AtomicUsize,
}

impl MemTable {
    pub fn new(internal_comparator: InternalKeyComparator) -> MemTable {
        let comparator = internal_comparator.user_comparator();
        let key_comparator = MemKeyComparator::new(internal_comparator);
        MemTable {
            table: Arc::new(SkipList::new(Arc::new(key_comparator))),
            comparator,
            memory_usage: AtomicUsize::new(0),
        }
    }

    pub fn add<T: AsRef<[u8]>>(&self, seq: SequenceNumber, t: ValueType, key: T, value: T) {
        // Entry layout:
        //  key_size     : varint32 of internal_key.len()
        //  key bytes    : internal key (user key + 8-byte tag)
        //  value_size   : varint32 of value.len()
        //  value bytes
        let key = key.as_ref();
        let value = value.as_ref();
        let internal_key_size = key.len() + 8;

        let mut buf = Vec::with_capacity(internal_key_size + value.len() + 10);
        buf.write_var_u32(internal_key_size as u32).unwrap();
        buf.extend_from_slice(key);
        buf.encode_u64_le(pack_sequence_and_type(seq, t)).unwrap();
        buf.write_var_u32(value.len() as u32).unwrap();
        buf.extend_from_slice(value);

        self.memory_usage
            .fetch_add(buf.len(), atomic::Ordering::Relaxed);
        self.table.insert(buf);
    }

    // Some(Some(v)): live value. Some(None): tombstone. None: no entry at
    // or below the lookup sequence.
    pub fn get(&self, search_key: &LookupKey) -> Option<Option<Vec<u8>>> {
        let mut iter = SkipListIter::new(self.table.clone());
        iter.seek(search_key.memtable_key());

        if iter.valid() {
            let mut entry = iter.key();
            let (internal_key_len, _) = entry.read_var_u32().unwrap();
            let mut internal_key = read_bytes(&mut entry, internal_key_len as usize).unwrap();
            let user_key_len = internal_key.len() - 8;
            let seek_user_key = read_bytes(&mut internal_key, user_key_len).unwrap();
            if self
                .comparator
                .compare(search_key.user_key(), seek_user_key)
                == Ordering::Equal
            {
                let tag = internal_key.decode_u64_le().unwrap();
                match ValueType::try_from((tag & 0xff) as u8) {
                    Ok(ValueType::Value) => {
                        let (value_len, _) = entry.read_var_u32().unwrap();
                        let value = read_bytes(&mut entry, value_len as usize).unwrap();
                        return Some(Some(value.to_vec()));
                    }
                    Ok(ValueType::Deletion) => return Some(None),
                    Err(_) => return None,
                }
            }
        }
        None
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.memory_usage.load(atomic::Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.approximate_memory_usage() == 0
    }

    pub fn iter(&self) -> Box<dyn DBIterator> {
        Box::new(MemTableIterator::new(SkipListIter::new(self.table.clone())))
    }
}

pub struct MemTableIterator {
    iter: SkipListIter<Vec<u8>>,
    scratch: Vec<u8>,
}

impl MemTableIterator {
    pub fn new(iter: SkipListIter<Vec<u8>>) -> Self {
        MemTableIterator {
            iter,
            scratch: Vec::new(),
        }
    }

    fn entry(&self) -> (&[u8], &[u8]) {
        let mut raw = self.iter.key();
        let (key_len, _) = raw.read_var_u32().unwrap();
        let key = read_bytes(&mut raw, key_len as usize).unwrap();
        let (value_len, _) = raw.read_var_u32().unwrap();
        let value = read_bytes(&mut raw, value_len as usize).unwrap();
        (key, value)
    }
}

impl DBIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        // Targets are internal keys; wrap into the entry layout.
        self.scratch.clear();
        self.scratch.write_var_u32(target.len() as u32).unwrap();
        self.scratch.extend_from_slice(target);
        self.iter.seek(&self.scratch);
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        self.entry().0
    }

    fn value(&self) -> &[u8] {
        self.entry().1
    }

    fn status(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LookupKey {
    key: Vec<u8>,
    key_offset: usize,
}

impl LookupKey {
    pub fn new(user_key: impl AsRef<[u8]>, seq: SequenceNumber) -> Self {
        let user_key = user_key.as_ref();
        let internal_key_size = user_key.len() + 8;

        let mut buf = Vec::with_capacity(internal_key_size + 5);
        let prefix_len = buf.write_var_u32(internal_key_size as u32).unwrap();
        buf.extend_from_slice(user_key);
        buf.encode_u64_le(pack_sequence_and_type(seq, VALUE_TYPE_FOR_SEEK))
            .unwrap();

        LookupKey {
            key: buf,
            key_offset: prefix_len,
        }
    }

    pub fn memtable_key(&self) -> &[u8] {
        &self.key
    }

    pub fn user_key(&self) -> &[u8] {
        &self.key[self.key_offset..self.key.len() - 8]
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.key[self.key_offset..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::BitwiseComparator;

    fn new_memtable() -> MemTable {
        let comparator = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        MemTable::new(comparator)
    }

    #[test]
    fn test_add_get() {
        let table = new_memtable();
        let datas = &[
            ("estuary", 1u64, ValueType::Value, "mud"),
            ("delta", 2u64, ValueType::Value, "sand"),
            ("reed", 3u64, ValueType::Deletion, ""),
        ];

        for (key, seq, typ, val) in datas {
            table.add(*seq, *typ, key.as_bytes(), val.as_bytes());
        }

        for &(key, seq, typ, val) in datas {
            let lookup_key = LookupKey::new(key, seq);
            let result = table.get(&lookup_key);
            if typ == ValueType::Value {
                assert_eq!(result, Some(Some(val.as_bytes().to_vec())));
            } else {
                assert_eq!(result, Some(None));
            }
        }

        assert_eq!(table.get(&LookupKey::new("missing", 100)), None);
    }

    #[test]
    fn test_sequence_visibility() {
        let table = new_memtable();
        table.add(5, ValueType::Value, b"k".as_ref(), b"v5".as_ref());
        table.add(9, ValueType::Value, b"k".as_ref(), b"v9".as_ref());

        // A snapshot below the first write sees nothing.
        assert_eq!(table.get(&LookupKey::new(b"k", 4)), None);
        assert_eq!(table.get(&LookupKey::new(b"k", 5)), Some(Some(b"v5".to_vec())));
        assert_eq!(table.get(&LookupKey::new(b"k", 8)), Some(Some(b"v5".to_vec())));
        assert_eq!(table.get(&LookupKey::new(b"k", 9)), Some(Some(b"v9".to_vec())));
        assert_eq!(table.get(&LookupKey::new(b"k", 100)), Some(Some(b"v9".to_vec())));
    }

    #[test]
    fn test_iterator_orders_internal_keys() {
        let table = new_memtable();
        table.add(1, ValueType::Value, b"b".as_ref(), b"1".as_ref());
        table.add(2, ValueType::Value, b"a".as_ref(), b"2".as_ref());
        table.add(3, ValueType::Value, b"a".as_ref(), b"3".as_ref());

        let mut iter = table.iter();
        iter.seek_to_first();

        // "a" revisions first, newest (seq 3) before seq 2, then "b".
        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = crate::format::ParsedInternalKey::try_parse(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.sequence));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 3),
                (b"a".to_vec(), 2),
                (b"b".to_vec(), 1),
            ]
        );
    }

    #[test]
    fn test_approximate_memory_usage_grows() {
        let table = new_memtable();
        assert!(table.is_empty());
        table.add(1, ValueType::Value, b"key".as_ref(), b"value".as_ref());
        assert!(table.approximate_memory_usage() > 0);
    }
}
