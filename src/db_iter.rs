use std::{cmp::Ordering, sync::Arc};

use crate::{
    cmp::Comparator,
    env::Env,
    error::Result,
    format::{extract_user_key, ParsedInternalKey},
    iterator::DBIterator,
    memtable::{LookupKey, MemTable},
    types::{SequenceNumber, ValueType},
    version::Version,
};

#[derive(PartialEq, Clone, Copy)]
enum Direction {
    // The inner iterator sits exactly at the entry yielding the current
    // key/value.
    Forward,
    // The inner iterator sits before all entries for the current user
    // key; the entry itself is buffered in saved_key/saved_value.
    Reverse,
}

// Folds the internal-key stream from a merged view of memtables and
// tables down to the newest live revision per user key at or below the
// iterator's sequence. Deletions suppress older revisions.
pub struct DbIter<E: Env> {
    inner: Box<dyn DBIterator>,
    user_comparator: Arc<dyn Comparator>,
    sequence: SequenceNumber,

    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,

    // Pins for everything the inner iterator borrows from.
    _mem: Arc<MemTable>,
    _imm: Option<Arc<MemTable>>,
    _version: Arc<Version<E>>,
}

impl<E: Env> DbIter<E> {
    pub(crate) fn new(
        inner: Box<dyn DBIterator>,
        user_comparator: Arc<dyn Comparator>,
        sequence: SequenceNumber,
        mem: Arc<MemTable>,
        imm: Option<Arc<MemTable>>,
        version: Arc<Version<E>>,
    ) -> Self {
        DbIter {
            inner,
            user_comparator,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            _mem: mem,
            _imm: imm,
            _version: version,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    pub fn value(&self) -> &[u8] {
        assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn status(&mut self) -> Result<()> {
        self.inner.status()
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        let lookup = LookupKey::new(target, self.sequence);
        self.inner.seek(lookup.internal_key());
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        assert!(self.valid);

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The inner iterator is before the current entry; step back to
            // it (or to the front) before skipping forward.
            if !self.inner.valid() {
                self.inner.seek_to_first();
            } else {
                self.inner.next();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key already holds the current user key to skip.
        } else {
            let key = extract_user_key(self.inner.key());
            self.saved_key.clear();
            self.saved_key.extend_from_slice(key);

            self.inner.next();
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        assert!(self.valid);

        if self.direction == Direction::Forward {
            // Back the inner iterator off all entries for the current
            // user key.
            let key = extract_user_key(self.inner.key());
            self.saved_key.clear();
            self.saved_key.extend_from_slice(key);
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .user_comparator
                    .compare(extract_user_key(self.inner.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    // Forward scan to the newest visible, non-deleted entry of the next
    // acceptable user key. When skipping, entries for saved_key (and any
    // user key shadowed by a newer deletion) are passed over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);
        loop {
            if !self.inner.valid() {
                break;
            }
            if let Some(parsed) = ParsedInternalKey::try_parse(self.inner.key()) {
                if parsed.sequence <= self.sequence {
                    match parsed.val_type {
                        ValueType::Deletion => {
                            // Every older revision of this key is dead.
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(parsed.user_key);
                            skipping = true;
                        }
                        ValueType::Value => {
                            if skipping
                                && self
                                    .user_comparator
                                    .compare(parsed.user_key, &self.saved_key)
                                    != Ordering::Greater
                            {
                                // Hidden by a deletion or already yielded.
                            } else {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }
            self.inner.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    // Backward scan: buffer the newest visible entry of the current user
    // key while moving the inner iterator past all its revisions.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        while self.inner.valid() {
            if let Some(parsed) = ParsedInternalKey::try_parse(self.inner.key()) {
                if parsed.sequence <= self.sequence {
                    if value_type != ValueType::Deletion
                        && self
                            .user_comparator
                            .compare(parsed.user_key, &self.saved_key)
                            == Ordering::Less
                    {
                        // Crossed into the previous user key; the buffered
                        // entry is the answer.
                        break;
                    }
                    value_type = parsed.val_type;
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.inner.value());
                    }
                }
            }
            self.inner.prev();
        }

        if value_type == ValueType::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}
