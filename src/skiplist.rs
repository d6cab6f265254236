use std::{
    cmp::Ordering,
    ptr,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
};

use rand::{thread_rng, Rng};

use crate::cmp::Comparator;

const MAX_HEIGHT: usize = 12;
const BRANCHING_FACTOR: u32 = 4;

struct Node<T> {
    key: T,
    // skips[0] links every node in key order; taller levels are express
    // lanes. Pointer stores are release, loads acquire, so a reader that
    // observes a node sees its key fully written.
    skips: Vec<AtomicPtr<Node<T>>>,
}

impl<T> Node<T> {
    fn new(key: T, height: usize) -> Box<Node<T>> {
        let mut skips = Vec::with_capacity(height);
        for _ in 0..height {
            skips.push(AtomicPtr::new(ptr::null_mut()));
        }
        Box::new(Node { key, skips })
    }

    fn next(&self, level: usize) -> *mut Node<T> {
        self.skips[level].load(AtomicOrdering::Acquire)
    }

    fn set_next(&self, level: usize, node: *mut Node<T>) {
        self.skips[level].store(node, AtomicOrdering::Release);
    }
}

// An ordered set of byte buffers supporting one writer and any number of
// concurrent readers. Writers must be serialized externally (the engine
// mutex does this); nodes are never removed before the list drops.
pub struct SkipList<T> {
    head: *mut Node<T>,
    max_height: AtomicUsize,
    comparator: Arc<dyn Comparator>,
}

unsafe impl<T: Send> Send for SkipList<T> {}
unsafe impl<T: Send + Sync> Sync for SkipList<T> {}

impl<T: Default + AsRef<[u8]>> SkipList<T> {
    pub fn new(comparator: Arc<dyn Comparator>) -> Self {
        SkipList {
            head: Box::into_raw(Node::new(T::default(), MAX_HEIGHT)),
            max_height: AtomicUsize::new(1),
            comparator,
        }
    }

    fn random_height() -> usize {
        let mut height = 1;
        let mut rng = thread_rng();
        while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING_FACTOR) == 0 {
            height += 1;
        }
        height
    }

    fn max_height(&self) -> usize {
        self.max_height.load(AtomicOrdering::Relaxed)
    }

    fn key_is_after_node(&self, key: &[u8], node: *mut Node<T>) -> bool {
        if node.is_null() {
            return false;
        }
        let node_key = unsafe { (*node).key.as_ref() };
        self.comparator.compare(node_key, key) == Ordering::Less
    }

    // First node with key >= target, filling prev[] when requested.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node<T>; MAX_HEIGHT]>,
    ) -> *mut Node<T> {
        let mut current = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*current).next(level) };
            if self.key_is_after_node(key, next) {
                current = next;
            } else {
                if let Some(ref mut prev) = prev {
                    prev[level] = current;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    fn find_less_than(&self, key: &[u8]) -> *mut Node<T> {
        let mut current = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*current).next(level) };
            let before = next.is_null() || {
                let next_key = unsafe { (*next).key.as_ref() };
                self.comparator.compare(next_key, key) != Ordering::Less
            };
            if before {
                if level == 0 {
                    return current;
                }
                level -= 1;
            } else {
                current = next;
            }
        }
    }

    fn find_last(&self) -> *mut Node<T> {
        let mut current = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*current).next(level) };
            if next.is_null() {
                if level == 0 {
                    return current;
                }
                level -= 1;
            } else {
                current = next;
            }
        }
    }

    pub fn insert(&self, key: T) {
        let mut prev: [*mut Node<T>; MAX_HEIGHT] = [ptr::null_mut(); MAX_HEIGHT];
        let next = self.find_greater_or_equal(key.as_ref(), Some(&mut prev));

        // Internal keys carry unique sequence numbers.
        debug_assert!(
            next.is_null()
                || self
                    .comparator
                    .compare(unsafe { (*next).key.as_ref() }, key.as_ref())
                    != Ordering::Equal
        );

        let height = Self::random_height();
        if height > self.max_height() {
            for p in prev.iter_mut().take(height).skip(self.max_height()) {
                *p = self.head;
            }
            self.max_height.store(height, AtomicOrdering::Relaxed);
        }

        let node = Box::into_raw(Node::new(key, height));
        for (level, p) in prev.iter().enumerate().take(height) {
            unsafe {
                (*node).set_next(level, (**p).next(level));
                (**p).set_next(level, node);
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let node = self.find_greater_or_equal(key, None);
        !node.is_null()
            && self
                .comparator
                .compare(unsafe { (*node).key.as_ref() }, key)
                == Ordering::Equal
    }
}

impl<T> Drop for SkipList<T> {
    fn drop(&mut self) {
        let mut current = self.head;
        while !current.is_null() {
            let next = unsafe { (*current).next(0) };
            drop(unsafe { Box::from_raw(current) });
            current = next;
        }
    }
}

pub struct SkipListIter<T> {
    list: Arc<SkipList<T>>,
    current: *mut Node<T>,
}

unsafe impl<T: Send + Sync> Send for SkipListIter<T> {}

impl<T: Default + AsRef<[u8]>> SkipListIter<T> {
    pub fn new(list: Arc<SkipList<T>>) -> Self {
        SkipListIter {
            list,
            current: ptr::null_mut(),
        }
    }

    pub fn valid(&self) -> bool {
        !self.current.is_null()
    }

    pub fn seek_to_first(&mut self) {
        self.current = unsafe { (*self.list.head).next(0) };
    }

    pub fn seek_to_last(&mut self) {
        let last = self.list.find_last();
        self.current = if last == self.list.head {
            ptr::null_mut()
        } else {
            last
        };
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.current = self.list.find_greater_or_equal(target, None);
    }

    pub fn next(&mut self) {
        assert!(self.valid());
        self.current = unsafe { (*self.current).next(0) };
    }

    pub fn prev(&mut self) {
        assert!(self.valid());
        let key = unsafe { (*self.current).key.as_ref() };
        let node = self.list.find_less_than(key);
        self.current = if node == self.list.head {
            ptr::null_mut()
        } else {
            node
        };
    }

    pub fn key(&self) -> &[u8] {
        assert!(self.valid());
        unsafe { (*self.current).key.as_ref() }
    }
}
