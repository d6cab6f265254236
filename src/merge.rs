use std::cmp::Ordering;

use crate::{cmp::Comparator, error::Result, iterator::DBIterator, slice::UnsafeSlice};

#[derive(PartialEq)]
enum Direction {
    Forward,
    Backward,
}

pub struct MergingIterator<C: Comparator> {
    children: Vec<Box<dyn DBIterator>>,
    current: Option<usize>,
    comparator: C,
    direction: Direction,
}

impl<C: Comparator> MergingIterator<C> {
    pub fn new(comparator: C, children: Vec<Box<dyn DBIterator>>) -> Self {
        MergingIterator {
            children,
            current: None,
            comparator,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (idx, child) in self.children.iter().enumerate() {
            if child.valid() {
                match smallest {
                    Some(small)
                        if self
                            .comparator
                            .compare(child.key(), self.children[small].key())
                            != Ordering::Less => {}
                    _ => smallest = Some(idx),
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (idx, child) in self.children.iter().enumerate() {
            if child.valid() {
                match largest {
                    Some(large)
                        if self
                            .comparator
                            .compare(child.key(), self.children[large].key())
                            != Ordering::Greater => {}
                    _ => largest = Some(idx),
                }
            }
        }
        self.current = largest;
    }
}

impl<C: Comparator> DBIterator for MergingIterator<C> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.children
            .iter_mut()
            .for_each(|child| child.seek_to_first());
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        self.children
            .iter_mut()
            .for_each(|child| child.seek_to_last());
        self.find_largest();
        self.direction = Direction::Backward;
    }

    fn seek(&mut self, target: &[u8]) {
        self.children
            .iter_mut()
            .for_each(|child| child.seek(target));
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        assert!(self.valid());

        // After reversing, position every other child past the current key
        // so a forward step yields the successor.
        let current = self.current.unwrap();
        let current_key = UnsafeSlice::from(self.key());
        if self.direction == Direction::Backward {
            for (pos, child) in self.children.iter_mut().enumerate() {
                if pos != current {
                    child.seek(unsafe { current_key.as_ref() });
                    if child.valid()
                        && self
                            .comparator
                            .compare(unsafe { current_key.as_ref() }, child.key())
                            == Ordering::Equal
                    {
                        child.next();
                    }
                }
            }
            self.direction = Direction::Forward;
        }
        self.children[current].next();
        self.find_smallest()
    }

    fn prev(&mut self) {
        assert!(self.valid());

        let current = self.current.unwrap();
        let current_key = UnsafeSlice::from(self.key());
        if self.direction == Direction::Forward {
            for (pos, child) in self.children.iter_mut().enumerate() {
                if pos != current {
                    child.seek(unsafe { current_key.as_ref() });
                    if child.valid() {
                        child.prev();
                    } else {
                        child.seek_to_last();
                    }
                }
            }
            self.direction = Direction::Backward;
        }
        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.children[self.current.unwrap()].key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        self.children[self.current.unwrap()].value()
    }

    fn status(&mut self) -> Result<()> {
        for child in self.children.iter_mut() {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        cmp::{BitwiseComparator, InternalKeyComparator},
        memtable::MemTable,
        types::ValueType,
    };

    fn memtable_with(entries: &[(&str, u64, &str)]) -> MemTable {
        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let mem = MemTable::new(icmp);
        for (k, seq, v) in entries {
            mem.add(*seq, ValueType::Value, k.as_bytes(), v.as_bytes());
        }
        mem
    }

    #[test]
    fn test_merge_two_sources() {
        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let a = memtable_with(&[("a", 1, "1"), ("c", 3, "3")]);
        let b = memtable_with(&[("b", 2, "2"), ("d", 4, "4")]);

        let mut merged = MergingIterator::new(icmp, vec![a.iter(), b.iter()]);
        merged.seek_to_first();

        let mut user_keys = Vec::new();
        while merged.valid() {
            let parsed = crate::format::ParsedInternalKey::try_parse(merged.key()).unwrap();
            user_keys.push(parsed.user_key.to_vec());
            merged.next();
        }
        assert_eq!(
            user_keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn test_merge_empty_children() {
        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let empty = memtable_with(&[]);
        let mut merged = MergingIterator::new(icmp, vec![empty.iter()]);
        merged.seek_to_first();
        assert!(!merged.valid());
    }

    #[test]
    fn test_merge_backward() {
        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let a = memtable_with(&[("a", 1, "1"), ("c", 3, "3")]);
        let b = memtable_with(&[("b", 2, "2")]);

        let mut merged = MergingIterator::new(icmp, vec![a.iter(), b.iter()]);
        merged.seek_to_last();

        let mut user_keys = Vec::new();
        while merged.valid() {
            let parsed = crate::format::ParsedInternalKey::try_parse(merged.key()).unwrap();
            user_keys.push(parsed.user_key.to_vec());
            merged.prev();
        }
        assert_eq!(
            user_keys,
            vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );
    }
}
