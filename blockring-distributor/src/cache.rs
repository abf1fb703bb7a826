//! A bounded, frequency aware cache of block contents.
//!
//! Access frequencies are tracked by a small count-min sketch which ages by
//! halving every counter once enough accesses have been recorded. A new block
//! is only admitted at capacity if it has been requested more often than the
//! least valuable resident, so one-off reads never push out the working set.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::core::BlockId;

const SKETCH_DEPTH: usize = 4;
const SKETCH_SEEDS: [u64; SKETCH_DEPTH] = [
    0x9E37_79B9_7F4A_7C15,
    0xC2B2_AE3D_27D4_EB4F,
    0x1656_67B1_9E37_79F9,
    0x27D4_EB2F_1656_67C5,
];
const MAX_FREQUENCY: u8 = 15;
const SAMPLE_FACTOR: usize = 10;
const MIN_SKETCH_WIDTH: usize = 256;
const MAX_SKETCH_WIDTH: usize = 1 << 24;
const MAX_PREALLOCATED_ENTRIES: usize = 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The outcome of offering a block to the cache.
pub enum Admission {
    /// The block is now resident.
    Admitted,
    /// The block was not valuable enough to replace a resident.
    Rejected,
    /// The key was invalidated after the read which produced this value began.
    Stale,
    /// The cache has no capacity.
    Disabled,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// A marker of the cache's invalidation epoch.
///
/// A reader takes a ticket before fetching a block from its replicas and
/// hands it back when offering the result, any invalidation in between
/// causes the result to be discarded.
pub struct CacheTicket(u64);

/// A fixed capacity cache mapping blocks to their contents.
///
/// A cache with a capacity of `0` is disabled, every lookup misses and
/// nothing is ever stored.
pub struct ReadCache {
    state: Option<Mutex<CacheState>>,
    capacity: usize,
}

impl ReadCache {
    /// Creates a new cache holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        let state = if capacity == 0 {
            None
        } else {
            Some(Mutex::new(CacheState::new(capacity)))
        };

        Self { state, capacity }
    }

    /// Creates a new cache sized to fit `size_bytes` worth of `block_size` blocks.
    pub fn with_byte_budget(size_bytes: u64, block_size: u64) -> Self {
        let capacity = if block_size == 0 {
            0
        } else {
            usize::try_from(size_bytes / block_size).unwrap_or(usize::MAX)
        };
        Self::new(capacity)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    /// The number of resident blocks.
    pub fn len(&self) -> usize {
        self.state
            .as_ref()
            .map(|state| state.lock().entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a block, recording the access.
    pub fn get(&self, key: &BlockId) -> Option<Bytes> {
        let mut state = self.state.as_ref()?.lock();
        state.record_access(key);
        state.touch(key)
    }

    /// Takes a ticket of the current invalidation epoch.
    pub fn ticket(&self) -> CacheTicket {
        let epoch = self
            .state
            .as_ref()
            .map(|state| state.lock().epoch)
            .unwrap_or_default();
        CacheTicket(epoch)
    }

    /// Offers a block to the cache.
    pub fn put(&self, key: BlockId, value: Bytes) -> Admission {
        match self.state.as_ref() {
            None => Admission::Disabled,
            Some(state) => state.lock().offer(key, value),
        }
    }

    /// Offers a block to the cache which was read under the given ticket.
    ///
    /// The block is discarded if any invalidation happened since the ticket
    /// was taken.
    pub fn put_with_ticket(
        &self,
        ticket: CacheTicket,
        key: BlockId,
        value: Bytes,
    ) -> Admission {
        let state = match self.state.as_ref() {
            None => return Admission::Disabled,
            Some(state) => state,
        };

        let mut state = state.lock();
        if state.epoch != ticket.0 {
            return Admission::Stale;
        }
        state.offer(key, value)
    }

    /// Removes a block from the cache and starts a new invalidation epoch.
    pub fn invalidate(&self, key: &BlockId) {
        if let Some(state) = self.state.as_ref() {
            let mut state = state.lock();
            state.epoch = state.epoch.wrapping_add(1);
            state.remove(key);
        }
    }
}

struct Entry {
    value: Bytes,
    score: u8,
    seq: u64,
}

struct CacheState {
    capacity: usize,
    epoch: u64,
    next_seq: u64,
    sketch: FrequencySketch,
    entries: HashMap<BlockId, Entry>,
    /// Residents ordered from least to most valuable, ties broken by insertion order.
    order: BTreeSet<(u8, u64, BlockId)>,
}

impl CacheState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            epoch: 0,
            next_seq: 0,
            sketch: FrequencySketch::new(capacity),
            entries: HashMap::with_capacity(capacity.min(MAX_PREALLOCATED_ENTRIES)),
            order: BTreeSet::new(),
        }
    }

    fn record_access(&mut self, key: &BlockId) {
        if self.sketch.increment(key) {
            self.rescore_all();
        }
    }

    fn touch(&mut self, key: &BlockId) -> Option<Bytes> {
        let score = self.sketch.estimate(key);
        let entry = self.entries.get_mut(key)?;
        if entry.score != score {
            self.order.remove(&(entry.score, entry.seq, *key));
            entry.score = score;
            self.order.insert((entry.score, entry.seq, *key));
        }
        Some(entry.value.clone())
    }

    fn offer(&mut self, key: BlockId, value: Bytes) -> Admission {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            return Admission::Admitted;
        }

        if self.entries.len() >= self.capacity {
            let candidate = self.sketch.estimate(&key);
            let victim = match self.order.iter().next() {
                Some((_, _, victim)) => *victim,
                None => return Admission::Rejected,
            };

            if candidate <= self.sketch.estimate(&victim) {
                return Admission::Rejected;
            }

            self.remove(&victim);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let score = self.sketch.estimate(&key);
        self.order.insert((score, seq, key));
        self.entries.insert(key, Entry { value, score, seq });

        Admission::Admitted
    }

    fn remove(&mut self, key: &BlockId) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&(entry.score, entry.seq, *key));
        }
    }

    fn rescore_all(&mut self) {
        self.order.clear();
        for (key, entry) in self.entries.iter_mut() {
            entry.score = self.sketch.estimate(key);
            self.order.insert((entry.score, entry.seq, *key));
        }
    }
}

/// A count-min sketch of saturating 4-bit access counters.
struct FrequencySketch {
    rows: [Vec<u8>; SKETCH_DEPTH],
    mask: usize,
    additions: usize,
    sample_size: usize,
}

impl FrequencySketch {
    fn new(capacity: usize) -> Self {
        let width = capacity
            .clamp(MIN_SKETCH_WIDTH, MAX_SKETCH_WIDTH)
            .next_power_of_two();
        Self {
            rows: std::array::from_fn(|_| vec![0; width]),
            mask: width - 1,
            additions: 0,
            sample_size: capacity.saturating_mul(SAMPLE_FACTOR).max(16),
        }
    }

    fn slots(&self, key: &BlockId) -> [usize; SKETCH_DEPTH] {
        let bytes = key.placement_key();
        std::array::from_fn(|row| {
            xxh3_64_with_seed(&bytes, SKETCH_SEEDS[row]) as usize & self.mask
        })
    }

    fn estimate(&self, key: &BlockId) -> u8 {
        let slots = self.slots(key);
        slots
            .iter()
            .enumerate()
            .map(|(row, &slot)| self.rows[row][slot])
            .min()
            .unwrap_or_default()
    }

    /// Records an access, returns `true` if the sketch aged as a result.
    fn increment(&mut self, key: &BlockId) -> bool {
        let slots = self.slots(key);
        let mut changed = false;
        for (row, slot) in slots.into_iter().enumerate() {
            let counter = &mut self.rows[row][slot];
            if *counter < MAX_FREQUENCY {
                *counter += 1;
                changed = true;
            }
        }

        if changed {
            self.additions += 1;
        }

        if self.additions >= self.sample_size {
            self.age();
            return true;
        }

        false
    }

    fn age(&mut self) {
        for row in self.rows.iter_mut() {
            for counter in row.iter_mut() {
                *counter >>= 1;
            }
        }
        self.additions /= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(index: u64) -> BlockId {
        BlockId::new(1, 1, index)
    }

    fn value(index: u64) -> Bytes {
        Bytes::from(format!("block-{index}"))
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ReadCache::new(0);
        assert!(!cache.is_enabled());
        assert_eq!(cache.put(block(1), value(1)), Admission::Disabled);
        assert!(cache.get(&block(1)).is_none());
        assert_eq!(cache.len(), 0);

        let cache = ReadCache::with_byte_budget(4096, 8192);
        assert!(!cache.is_enabled());
    }

    #[test]
    fn test_byte_budget() {
        let cache = ReadCache::with_byte_budget(64 << 10, 4 << 10);
        assert_eq!(cache.capacity(), 16);
        let cache = ReadCache::with_byte_budget(64 << 10, 0);
        assert_eq!(cache.capacity(), 0);
    }

    #[test]
    fn test_oversized_byte_budget_saturates() {
        let cache = ReadCache::with_byte_budget(u64::MAX, 1);
        assert_eq!(cache.capacity(), usize::MAX);
        assert_eq!(cache.put(block(1), value(1)), Admission::Admitted);
        assert_eq!(cache.get(&block(1)), Some(value(1)));
    }

    #[test]
    fn test_basic_get_put() {
        let cache = ReadCache::new(4);
        assert!(cache.get(&block(1)).is_none());
        assert_eq!(cache.put(block(1), value(1)), Admission::Admitted);
        assert_eq!(cache.get(&block(1)), Some(value(1)));

        assert_eq!(cache.put(block(1), value(9)), Admission::Admitted);
        assert_eq!(cache.get(&block(1)), Some(value(9)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let cache = ReadCache::new(8);
        for index in 0..1_000 {
            let _ = cache.get(&block(index % 37));
            cache.put(block(index % 37), value(index));
            assert!(cache.len() <= 8);
        }
    }

    #[test]
    fn test_cold_reads_do_not_evict_hot_entries() {
        let cache = ReadCache::new(4);

        for _ in 0..5 {
            for hot in 0..4 {
                if cache.get(&block(hot)).is_none() {
                    cache.put(block(hot), value(hot));
                }
            }
        }

        for cold in 100..110 {
            assert!(cache.get(&block(cold)).is_none());
            assert_eq!(cache.put(block(cold), value(cold)), Admission::Rejected);
        }

        for hot in 0..4 {
            assert_eq!(cache.get(&block(hot)), Some(value(hot)));
        }
    }

    #[test]
    fn test_frequent_newcomer_replaces_least_valuable() {
        let cache = ReadCache::new(2);
        let _ = cache.get(&block(1));
        cache.put(block(1), value(1));
        let _ = cache.get(&block(2));
        cache.put(block(2), value(2));

        for _ in 0..5 {
            let _ = cache.get(&block(3));
        }
        assert_eq!(cache.put(block(3), value(3)), Admission::Admitted);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&block(3)), Some(value(3)));
    }

    #[test]
    fn test_invalidate_rejects_stale_ticket() {
        let cache = ReadCache::new(4);
        let ticket = cache.ticket();

        cache.invalidate(&block(1));
        assert_eq!(
            cache.put_with_ticket(ticket, block(1), value(1)),
            Admission::Stale
        );
        assert!(cache.get(&block(1)).is_none());

        let ticket = cache.ticket();
        assert_eq!(
            cache.put_with_ticket(ticket, block(1), value(1)),
            Admission::Admitted
        );
        cache.invalidate(&block(1));
        assert!(cache.get(&block(1)).is_none());
    }

    #[test]
    fn test_sketch_ages() {
        let mut sketch = FrequencySketch::new(1);
        let key = block(1);
        for _ in 0..10 {
            assert!(!sketch.increment(&key));
        }
        assert!(sketch.estimate(&key) >= 10);

        let aged = (100..110)
            .map(|index| sketch.increment(&block(index)))
            .any(|aged| aged);
        assert!(aged, "Sketch should age after its sample size is reached");
        assert!(sketch.estimate(&key) < 10);
    }
}
