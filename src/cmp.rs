use std::{
    cmp::{self, Ordering},
    sync::Arc,
};

use crate::{
    codec::VarIntReader,
    format::{extract_tag, extract_user_key, pack_sequence_and_type},
    types::{MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK},
};

pub trait Comparator: Send + Sync {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering;

    fn name(&self) -> &'static str;

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    fn find_shortest_successor(&self, key: &mut Vec<u8>);
}

#[derive(Clone, Copy)]
pub struct BitwiseComparator {}

impl Comparator for BitwiseComparator {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }

    fn name(&self) -> &'static str {
        "silt.BytewiseComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let min_length = cmp::min(start.len(), limit.len());
        let mut diff_index = 0;
        while diff_index < min_length && start[diff_index] == limit[diff_index] {
            diff_index += 1;
        }
        if diff_index < min_length {
            // One is not a prefix of the other; bump the first differing
            // byte when the result still sorts below limit.
            let diff_byte = start[diff_index];
            if diff_byte < 0xff && diff_byte + 1 < limit[diff_index] {
                start[diff_index] += 1;
                start.truncate(diff_index + 1);
            }
        }
    }

    fn find_shortest_successor(&self, key: &mut Vec<u8>) {
        for i in 0..key.len() {
            if key[i] != 0xff {
                key[i] += 1;
                key.truncate(i + 1);
                return;
            }
        }
        // key is a run of 0xff bytes; leave it as is.
    }
}

#[derive(Clone)]
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        InternalKeyComparator { user_comparator }
    }

    pub fn user_comparator(&self) -> Arc<dyn Comparator> {
        self.user_comparator.clone()
    }
}

impl Comparator for InternalKeyComparator {
    // Order by increasing user key, then decreasing sequence, then
    // decreasing value tag, so the newest revision sorts first.
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        let left_key = extract_user_key(left);
        let right_key = extract_user_key(right);
        match self.user_comparator.compare(left_key, right_key) {
            Ordering::Less => Ordering::Less,
            Ordering::Greater => Ordering::Greater,
            Ordering::Equal => extract_tag(right).cmp(&extract_tag(left)),
        }
    }

    fn name(&self) -> &'static str {
        "silt.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user_comparator
            .find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len()
            && self.user_comparator.compare(user_start, &tmp) == Ordering::Less
        {
            // The user portion shrank but grew logically; append the
            // highest-sorting tag to keep it below every real entry.
            tmp.extend_from_slice(
                &pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK).to_le_bytes(),
            );
            debug_assert!(self.compare(start, &tmp) == Ordering::Less);
            debug_assert!(self.compare(&tmp, limit) == Ordering::Less);
            *start = tmp;
        }
    }

    fn find_shortest_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user_comparator.find_shortest_successor(&mut tmp);
        if tmp.len() < user_key.len()
            && self.user_comparator.compare(user_key, &tmp) == Ordering::Less
        {
            tmp.extend_from_slice(
                &pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK).to_le_bytes(),
            );
            debug_assert!(self.compare(key, &tmp) == Ordering::Less);
            *key = tmp;
        }
    }
}

// Compares the length-prefixed entry layout the memtable stores.
pub struct MemKeyComparator {
    comparator: InternalKeyComparator,
}

impl MemKeyComparator {
    pub fn new(comparator: InternalKeyComparator) -> Self {
        MemKeyComparator { comparator }
    }
}

impl Comparator for MemKeyComparator {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        let left_key = get_length_prefixed_slice(left);
        let right_key = get_length_prefixed_slice(right);
        self.comparator.compare(left_key, right_key)
    }

    fn name(&self) -> &'static str {
        "silt.MemKeyComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        self.comparator.find_shortest_separator(start, limit)
    }

    fn find_shortest_successor(&self, key: &mut Vec<u8>) {
        self.comparator.find_shortest_successor(key)
    }
}

pub fn get_length_prefixed_slice(buf: &[u8]) -> &[u8] {
    let mut reader = buf;
    let (len, read) = reader.read_var_u32().unwrap();
    &buf[read..read + len as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{format::InternalKey, types::ValueType};

    #[test]
    fn test_bitwise_compare() {
        let tests: Vec<(&[u8], &[u8], Ordering)> = vec![
            (b"", b"", Ordering::Equal),
            (b"a", b"", Ordering::Greater),
            (b"", b"a", Ordering::Less),
            (b"abc", b"abd", Ordering::Less),
            (b"abc", b"abc", Ordering::Equal),
            (b"abcd", b"abc", Ordering::Greater),
        ];
        let comparator = BitwiseComparator {};
        for (a, b, expect) in tests {
            assert_eq!(comparator.compare(a, b), expect);
        }
    }

    #[test]
    fn test_find_shortest_separator() {
        let tests: Vec<(&[u8], &[u8], &[u8])> = vec![
            (b"abc1", b"abc3", b"abc2"),
            (b"abc", b"abd", b"abc"),
            (b"abc", b"abc", b"abc"),
            (b"a\xffb", b"b", b"a\xffb"),
            (b"abc1xyz", b"abc9", b"abc2"),
            (b"", b"", b""),
            (b"abc", b"", b"abc"),
        ];
        let comparator = BitwiseComparator {};
        for (i, (a, b, expect)) in tests.iter().enumerate() {
            let mut start = a.to_vec();
            comparator.find_shortest_separator(&mut start, b);
            assert_eq!(&start, expect, "case {}", i);
        }
    }

    #[test]
    fn test_find_shortest_successor() {
        let tests: Vec<(&[u8], &[u8])> = vec![
            (b"abc", b"b"),
            (b"\xff\xffa", b"\xff\xffb"),
            (b"\xff\xff", b"\xff\xff"),
            (b"", b""),
        ];
        let comparator = BitwiseComparator {};
        for (a, expect) in tests {
            let mut key = a.to_vec();
            comparator.find_shortest_successor(&mut key);
            assert_eq!(&key, expect);
        }
    }

    #[test]
    fn test_internal_key_ordering() {
        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let a = InternalKey::new(b"k", 5, ValueType::Value);
        let b = InternalKey::new(b"k", 4, ValueType::Value);
        let c = InternalKey::new(b"l", 1, ValueType::Value);

        // Same user key: newer sequence sorts first.
        assert_eq!(icmp.compare(a.encode(), b.encode()), Ordering::Less);
        assert_eq!(icmp.compare(b.encode(), c.encode()), Ordering::Less);

        // A deletion sorts after the value at the same sequence.
        let v = InternalKey::new(b"k", 5, ValueType::Value);
        let d = InternalKey::new(b"k", 5, ValueType::Deletion);
        assert_eq!(icmp.compare(v.encode(), d.encode()), Ordering::Less);
    }
}
