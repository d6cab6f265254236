use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use lru::LruCache;

const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: u32 = 1 << NUM_SHARD_BITS;

pub trait Cache<K, V>: Send + Sync {
    fn insert(&self, key: K, value: V, charge: u64) -> Option<Arc<V>>;
    fn lookup(&self, key: &K) -> Option<Arc<V>>;
    fn erase(&self, key: &K);

    fn new_id(&self) -> u64;
    fn total_charge(&self) -> u64;
}

pub struct ShardLruCache<K, V>
where
    K: Eq + Hash,
{
    shards: Box<[Mutex<LruCacheInner<K, V>>]>,
    last_id: AtomicU64,
}

impl<K, V> ShardLruCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new(capacity: u64) -> Self {
        let per_shard = (capacity + NUM_SHARDS as u64 - 1) / NUM_SHARDS as u64;
        let mut shards = Vec::with_capacity(NUM_SHARDS as usize);
        for _ in 0..NUM_SHARDS {
            shards.push(Mutex::new(LruCacheInner::new(per_shard)));
        }
        ShardLruCache {
            shards: shards.into_boxed_slice(),
            last_id: AtomicU64::new(0),
        }
    }

    fn shard(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() >> (64 - NUM_SHARD_BITS)
    }

    fn get_shard(&self, key: &K) -> MutexGuard<'_, LruCacheInner<K, V>> {
        let shard = Self::shard(key);
        self.shards[shard as usize].lock().unwrap()
    }
}

impl<K, V> Cache<K, V> for ShardLruCache<K, V>
where
    K: Eq + Hash + Send,
    V: Send + Sync,
{
    fn insert(&self, key: K, value: V, charge: u64) -> Option<Arc<V>> {
        let mut lru = self.get_shard(&key);
        lru.insert(key, value, charge)
    }

    fn lookup(&self, key: &K) -> Option<Arc<V>> {
        let mut lru = self.get_shard(key);
        lru.lookup(key)
    }

    fn erase(&self, key: &K) {
        let mut lru = self.get_shard(key);
        lru.erase(key);
    }

    fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::SeqCst)
    }

    fn total_charge(&self) -> u64 {
        let mut total = 0;
        for shard in self.shards.iter() {
            total += shard.lock().unwrap().total_charge();
        }
        total
    }
}

struct LruValue<V> {
    value: Arc<V>,
    charge: u64,
}

struct LruCacheInner<K: Eq + Hash, V> {
    lru: LruCache<K, LruValue<V>>,
    usage: u64,
    capacity: u64,
}

impl<K: Eq + Hash, V> LruCacheInner<K, V> {
    fn new(capacity: u64) -> Self {
        LruCacheInner {
            lru: LruCache::unbounded(),
            usage: 0,
            capacity,
        }
    }

    fn insert(&mut self, key: K, value: V, charge: u64) -> Option<Arc<V>> {
        if self.capacity == 0 {
            // Nothing is retained, but the caller still gets its handle.
            return Some(Arc::new(value));
        }

        self.usage += charge;
        while self.usage > self.capacity && !self.lru.is_empty() {
            let (_, evicted) = self.lru.pop_lru().unwrap();
            self.usage -= evicted.charge;
        }

        let value = Arc::new(value);
        self.lru.put(
            key,
            LruValue {
                value: value.clone(),
                charge,
            },
        );
        Some(value)
    }

    fn lookup(&mut self, key: &K) -> Option<Arc<V>> {
        self.lru.get(key).map(|h| h.value.clone())
    }

    fn erase(&mut self, key: &K) {
        if let Some(v) = self.lru.pop(key) {
            self.usage -= v.charge;
        }
    }

    fn total_charge(&self) -> u64 {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_erase() {
        let cache = ShardLruCache::new(2000);
        cache.insert(43, 200, 1);
        cache.insert(40, 100, 1);

        assert_eq!(*cache.lookup(&43).unwrap(), 200);
        assert_eq!(*cache.lookup(&40).unwrap(), 100);
        assert!(cache.lookup(&99).is_none());

        cache.erase(&43);
        assert!(cache.lookup(&43).is_none());
        assert_eq!(cache.total_charge(), 1);
    }

    #[test]
    fn test_eviction_under_pressure() {
        // Everything hashes into some shard with capacity 1 each.
        let cache: ShardLruCache<u32, u32> = ShardLruCache::new(NUM_SHARDS as u64);
        for i in 0..1000u32 {
            cache.insert(i, i, 1);
        }
        assert!(cache.total_charge() <= NUM_SHARDS as u64);
    }

    #[test]
    fn test_ids_are_unique() {
        let cache: ShardLruCache<u32, u32> = ShardLruCache::new(10);
        let a = cache.new_id();
        let b = cache.new_id();
        assert_ne!(a, b);
    }
}
