use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the distributor.
pub struct DistributorStatistics(Arc<DistributorStatisticsInner>);

impl Deref for DistributorStatistics {
    type Target = DistributorStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct DistributorStatisticsInner {
    pub(crate) num_cache_hits: Counter,
    pub(crate) num_cache_misses: Counter,
    pub(crate) num_cache_admissions: Counter,
    pub(crate) num_cache_rejections: Counter,
    pub(crate) num_replica_failures: Counter,
    pub(crate) num_quorum_failures: Counter,
    pub(crate) num_shards_gained: Counter,
    pub(crate) num_shards_purged: Counter,
    pub(crate) num_failed_migrations: Counter,
}

impl DistributorStatisticsInner {
    /// The number of block reads served from the read cache.
    pub fn num_cache_hits(&self) -> u64 {
        self.num_cache_hits.load(Ordering::Relaxed)
    }

    /// The number of block reads which had to be fetched from replicas.
    pub fn num_cache_misses(&self) -> u64 {
        self.num_cache_misses.load(Ordering::Relaxed)
    }

    /// The number of fetched blocks admitted into the read cache.
    pub fn num_cache_admissions(&self) -> u64 {
        self.num_cache_admissions.load(Ordering::Relaxed)
    }

    /// The number of fetched blocks the read cache declined to hold.
    pub fn num_cache_rejections(&self) -> u64 {
        self.num_cache_rejections.load(Ordering::Relaxed)
    }

    /// The number of individual replica calls which failed.
    pub fn num_replica_failures(&self) -> u64 {
        self.num_replica_failures.load(Ordering::Relaxed)
    }

    /// The number of writes which failed to reach a quorum.
    pub fn num_quorum_failures(&self) -> u64 {
        self.num_quorum_failures.load(Ordering::Relaxed)
    }

    /// The number of shards migrated onto this node.
    pub fn num_shards_gained(&self) -> u64 {
        self.num_shards_gained.load(Ordering::Relaxed)
    }

    /// The number of shards removed from this node after it stopped owning them.
    pub fn num_shards_purged(&self) -> u64 {
        self.num_shards_purged.load(Ordering::Relaxed)
    }

    /// The number of shard migrations which failed and were scheduled for retry.
    pub fn num_failed_migrations(&self) -> u64 {
        self.num_failed_migrations.load(Ordering::Relaxed)
    }
}

#[inline]
pub(crate) fn incr(counter: &Counter) {
    counter.fetch_add(1, Ordering::Relaxed);
}
