use std::{cmp, sync::Arc};

use crate::{format::extract_user_key, slice::UnsafeSlice, utils::hash::bloom_hash};

pub trait FilterPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_filter(&self, keys: &[UnsafeSlice], dst: &mut Vec<u8>);

    fn key_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

pub struct BloomFilterPolicy {
    bits_per_key: usize,
    hash_num: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // ln(2) * bits/key minimizes the false-positive rate.
        let mut hash_num = (bits_per_key as f64 * 0.69) as usize;
        hash_num = cmp::max(1, hash_num);
        hash_num = cmp::min(30, hash_num);

        BloomFilterPolicy {
            bits_per_key,
            hash_num,
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "silt.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[UnsafeSlice], dst: &mut Vec<u8>) {
        let mut bits = keys.len() * self.bits_per_key;
        // Tiny filters have high false-positive rates; floor the size.
        bits = cmp::max(bits, 64);

        let bytes = (bits + 7) / 8;
        bits = bytes * 8;

        let init_size = dst.len();
        dst.resize(init_size + bytes + 1, 0);
        *dst.last_mut().unwrap() = self.hash_num as u8;

        let data = &mut dst[init_size..init_size + bytes];
        for key in keys {
            // Double hashing: one base hash, rotated delta per probe.
            let mut h = bloom_hash(unsafe { key.as_ref() }) as usize;
            let delta = (h >> 17) | (h << 15);
            for _ in 0..self.hash_num {
                let bitpos = h % bits;
                data[bitpos / 8] |= 1 << (bitpos % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }
        let bits = (len - 1) * 8;
        let hash_num = filter[len - 1] as usize;
        if hash_num > 30 {
            // Reserved for future encodings; do not reject keys.
            return true;
        }

        let mut h = bloom_hash(key) as usize;
        let delta = (h >> 17) | (h << 15);
        for _ in 0..hash_num {
            let bitpos = h % bits;
            if filter[bitpos / 8] & (1 << (bitpos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

// Tables store internal keys; the engine-level wrapper strips the 8-byte
// tag so filtering happens on user keys.
pub struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user_policy: Arc<dyn FilterPolicy>) -> Self {
        InternalFilterPolicy { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[UnsafeSlice], dst: &mut Vec<u8>) {
        let stripped: Vec<UnsafeSlice> = keys
            .iter()
            .map(|k| UnsafeSlice::new(k.data(), k.size().saturating_sub(8)))
            .collect();
        self.user_policy.create_filter(&stripped, dst);
    }

    fn key_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user_policy.key_match(extract_user_key(key), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_filter(policy: &BloomFilterPolicy, keys: &[&[u8]]) -> Vec<u8> {
        let slices: Vec<UnsafeSlice> = keys.iter().map(|k| UnsafeSlice::from(*k)).collect();
        let mut filter = Vec::new();
        policy.create_filter(&slices, &mut filter);
        filter
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let policy = BloomFilterPolicy::new(10);
        assert!(!policy.key_match(b"hello", &[]));
    }

    #[test]
    fn test_small_filter() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build_filter(&policy, &[b"hello", b"world"]);

        assert!(policy.key_match(b"hello", &filter));
        assert!(policy.key_match(b"world", &filter));
        assert!(!policy.key_match(b"x", &filter));
        assert!(!policy.key_match(b"foo", &filter));
    }

    #[test]
    fn test_false_positive_rate_is_sane() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<Vec<u8>> = (0..1000u32).map(|i| i.to_le_bytes().to_vec()).collect();
        let key_refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let filter = build_filter(&policy, &key_refs);

        for k in &key_refs {
            assert!(policy.key_match(k, &filter));
        }

        let mut false_positives = 0;
        for i in 1000..11000u32 {
            if policy.key_match(&i.to_le_bytes(), &filter) {
                false_positives += 1;
            }
        }
        // 10 bits/key should stay around 1%; allow generous slack.
        assert!(false_positives < 500, "{} false positives", false_positives);
    }
}
