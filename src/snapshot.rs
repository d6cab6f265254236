use std::{collections::VecDeque, sync::Arc};

use crate::types::SequenceNumber;

// A pinned point in time. While any handle is live, compaction keeps
// enough revisions to answer reads at its sequence.
pub struct Snapshot {
    sequence: SequenceNumber,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

// Held under the engine mutex, ordered oldest first.
#[derive(Default)]
pub struct SnapshotList {
    snapshots: VecDeque<Arc<Snapshot>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        SnapshotList {
            snapshots: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn oldest(&self) -> SequenceNumber {
        self.snapshots.front().unwrap().sequence
    }

    pub fn newest(&self) -> SequenceNumber {
        self.snapshots.back().unwrap().sequence
    }

    pub fn acquire(&mut self, sequence: SequenceNumber) -> Arc<Snapshot> {
        debug_assert!(self.is_empty() || self.newest() <= sequence);
        let snapshot = Arc::new(Snapshot { sequence });
        self.snapshots.push_back(snapshot.clone());
        snapshot
    }

    pub fn release(&mut self, snapshot: &Arc<Snapshot>) {
        if let Some(pos) = self
            .snapshots
            .iter()
            .position(|s| Arc::ptr_eq(s, snapshot))
        {
            self.snapshots.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_order() {
        let mut list = SnapshotList::new();
        assert!(list.is_empty());

        let a = list.acquire(10);
        let b = list.acquire(20);
        let c = list.acquire(20);
        assert_eq!(list.oldest(), 10);
        assert_eq!(list.newest(), 20);

        list.release(&a);
        assert_eq!(list.oldest(), 20);

        list.release(&c);
        assert_eq!(list.oldest(), 20);
        list.release(&b);
        assert!(list.is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut list = SnapshotList::new();
        let a = list.acquire(1);
        list.release(&a);
        list.release(&a);
        assert!(list.is_empty());
    }
}
