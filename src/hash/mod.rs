use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

/// Deterministic hasher for the directory math: integral keys hash to
/// themselves, other data folds through FNV-1a. The extendible directory
/// masks low bits of the hash, which a randomized sip-hash would scatter.
#[derive(Default)]
pub struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 = (self.0 ^ *byte as u64).wrapping_mul(0x100000001b3);
        }
    }

    fn write_u8(&mut self, v: u8) {
        self.0 = v as u64;
    }

    fn write_u16(&mut self, v: u16) {
        self.0 = v as u64;
    }

    fn write_u32(&mut self, v: u32) {
        self.0 = v as u64;
    }

    fn write_u64(&mut self, v: u64) {
        self.0 = v;
    }

    fn write_usize(&mut self, v: usize) {
        self.0 = v as u64;
    }

    fn write_i8(&mut self, v: i8) {
        self.0 = v as u64;
    }

    fn write_i16(&mut self, v: i16) {
        self.0 = v as u64;
    }

    fn write_i32(&mut self, v: i32) {
        self.0 = v as u64;
    }

    fn write_i64(&mut self, v: i64) {
        self.0 = v as u64;
    }

    fn write_isize(&mut self, v: isize) {
        self.0 = v as u64;
    }
}

struct Bucket<K, V> {
    local_depth: usize,
    records: Vec<(K, V)>,
}

struct Inner<K, V> {
    global_depth: usize,
    bucket_capacity: usize,
    /// directory slot -> index into `buckets`; buckets are shared by several
    /// slots while their local depth is below the global depth
    directory: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

/// Directory-based resizable hash map with a coarse mutex, used as the
/// buffer pool's page table.
pub struct ExtendibleHashTable<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Hash + Eq, V: Clone> ExtendibleHashTable<K, V> {
    pub fn new(bucket_capacity: usize) -> Self {
        assert!(bucket_capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                global_depth: 0,
                bucket_capacity,
                directory: vec![0],
                buckets: vec![Bucket {
                    local_depth: 0,
                    records: Vec::new(),
                }],
            }),
        }
    }

    fn hash_of(key: &K) -> u64 {
        let mut hasher = IdentityHasher::default();
        key.hash(&mut hasher);
        hasher.finish()
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let bucket = &inner.buckets[inner.directory[inner.slot_of(key)]];
        bucket
            .records
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert or overwrite. Splits the target bucket (doubling the directory
    /// when its local depth already equals the global depth) until the new
    /// record fits.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        loop {
            let slot = inner.slot_of(&key);
            let bucket_index = inner.directory[slot];
            let capacity = inner.bucket_capacity;
            let bucket = &mut inner.buckets[bucket_index];

            if let Some(record) = bucket.records.iter_mut().find(|(k, _)| *k == key) {
                record.1 = value;
                return;
            }
            if bucket.records.len() < capacity {
                bucket.records.push((key, value));
                return;
            }
            inner.split(slot);
        }
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let slot = inner.slot_of(key);
        let bucket_index = inner.directory[slot];
        let records = &mut inner.buckets[bucket_index].records;
        let original_len = records.len();
        records.retain(|(k, _)| k != key);
        records.len() != original_len
    }

    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    pub fn local_depth(&self, slot: usize) -> usize {
        let inner = self.inner.lock();
        assert!(slot < inner.directory.len());
        inner.buckets[inner.directory[slot]].local_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    #[cfg(test)]
    fn check_directory_rule(&self) {
        let inner = self.inner.lock();
        for (slot, bucket_index) in inner.directory.iter().enumerate() {
            let bucket = &inner.buckets[*bucket_index];
            assert!(bucket.local_depth <= inner.global_depth);
            let mask = (1u64 << bucket.local_depth) - 1;
            for (key, _) in &bucket.records {
                assert_eq!(
                    Self::hash_of(key) & mask,
                    slot as u64 & mask,
                    "record hashed into the wrong bucket"
                );
            }
        }
    }
}

impl<K: Hash + Eq, V> Inner<K, V> {
    fn slot_of(&self, key: &K) -> usize {
        let mut hasher = IdentityHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() & ((1u64 << self.global_depth) - 1)) as usize
    }

    fn hash_of(key: &K) -> u64 {
        let mut hasher = IdentityHasher::default();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Split the bucket behind `slot`: bump its local depth (doubling the
    /// directory first when needed), repartition its records on the newly
    /// significant hash bit, and repoint every matching directory slot.
    fn split(&mut self, slot: usize) {
        let bucket_index = self.directory[slot];

        if self.buckets[bucket_index].local_depth == self.global_depth {
            // double the directory, each new slot points at its twin's bucket
            let len = self.directory.len();
            for i in 0..len {
                let twin = self.directory[i];
                self.directory.push(twin);
            }
            self.global_depth += 1;
        }

        let new_depth = self.buckets[bucket_index].local_depth + 1;
        self.buckets[bucket_index].local_depth = new_depth;
        let split_bit = 1u64 << (new_depth - 1);

        let records = std::mem::take(&mut self.buckets[bucket_index].records);
        let new_index = self.buckets.len();
        self.buckets.push(Bucket {
            local_depth: new_depth,
            records: Vec::new(),
        });

        for (key, value) in records {
            if Self::hash_of(&key) & split_bit != 0 {
                self.buckets[new_index].records.push((key, value));
            } else {
                self.buckets[bucket_index].records.push((key, value));
            }
        }

        let low_mask = split_bit as usize - 1;
        let pattern = slot & low_mask;
        for i in 0..self.directory.len() {
            if i & low_mask == pattern {
                self.directory[i] = if i & split_bit as usize != 0 {
                    new_index
                } else {
                    bucket_index
                };
            }
        }
    }
}
