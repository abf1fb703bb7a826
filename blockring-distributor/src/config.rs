use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_RPC_ATTEMPTS: usize = 2;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);
const DEFAULT_GRACE_PERIOD: Duration = if cfg!(any(test, feature = "test-utils")) {
    Duration::from_millis(250)
} else {
    Duration::from_secs(30)
};
const DEFAULT_REBALANCE_RETRY: Duration = if cfg!(any(test, feature = "test-utils")) {
    Duration::from_millis(100)
} else {
    Duration::from_secs(5)
};

#[derive(Debug, Clone)]
/// Local configuration of a single distributor.
///
/// Replication factors are not configured here, the block replication
/// factor is part of the ring and the inode replication factor is part of
/// the cluster's global metadata.
pub struct DistributorConfig {
    /// The address the peer facing storage server binds to.
    ///
    /// If `None` the distributor runs as a client only and never serves
    /// requests from other peers.
    pub listen_addr: Option<SocketAddr>,
    /// The size of the read cache in bytes, `0` disables the cache.
    pub read_cache_size: u64,
    /// The time limit of a single attempt of a single replica call.
    pub rpc_timeout: Duration,
    /// The number of attempts made against a replica before it is
    /// considered failed for the remainder of the call.
    pub rpc_attempts: usize,
    /// The pause between attempts against the same replica.
    pub retry_backoff: Duration,
    /// How long a ring must stay unchanged before shards this node no
    /// longer owns are purged.
    pub rebalance_grace_period: Duration,
    /// The pause before failed shard migrations and ring fetches are retried.
    pub rebalance_retry_interval: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            read_cache_size: 0,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            rpc_attempts: DEFAULT_RPC_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            rebalance_grace_period: DEFAULT_GRACE_PERIOD,
            rebalance_retry_interval: DEFAULT_REBALANCE_RETRY,
        }
    }
}

impl DistributorConfig {
    /// Creates a new config serving peers on the given address.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr: Some(listen_addr),
            ..Default::default()
        }
    }

    /// Creates a new config which never serves requests from other peers.
    pub fn client_only() -> Self {
        Self::default()
    }

    /// Set the size of the read cache in bytes.
    pub fn with_read_cache_size(mut self, size: u64) -> Self {
        self.read_cache_size = size;
        self
    }

    /// Set a custom per attempt replica call timeout rather than the default (2 seconds.)
    pub fn with_rpc_timeout(mut self, dur: Duration) -> Self {
        self.rpc_timeout = dur;
        self
    }

    /// Set the number of attempts made against each replica, at least one
    /// attempt is always made.
    pub fn with_rpc_attempts(mut self, attempts: usize) -> Self {
        self.rpc_attempts = attempts.max(1);
        self
    }

    /// Set the pause between attempts against the same replica.
    pub fn with_retry_backoff(mut self, dur: Duration) -> Self {
        self.retry_backoff = dur;
        self
    }

    /// Set how long a ring must be stable before shed shards are purged.
    pub fn with_rebalance_grace_period(mut self, dur: Duration) -> Self {
        self.rebalance_grace_period = dur;
        self
    }

    /// Set the pause before failed rebalancing work is retried.
    pub fn with_rebalance_retry_interval(mut self, dur: Duration) -> Self {
        self.rebalance_retry_interval = dur;
        self
    }
}
