//! # Blockring Distributor
//! The replication core of a blockring storage node.
//!
//! Every block and inode record is placed on a fixed number of peers chosen
//! by rendezvous hashing over a versioned ring published by the cluster's
//! metadata service. The [Distributor] fans reads and writes out to those
//! replicas, serves the node's own share of the data to its peers and moves
//! shards between peers whenever a new ring is published.
//!
//! Local persistence is delegated to a [BlockStore] and an [INodeStore],
//! the in-memory implementations are enough to run a cluster within a
//! single process.
//!
//! ## Basic Example
//!
//! ```rust
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use blockring_distributor::{
//!     BlockId,
//!     Distributor,
//!     DistributorConfig,
//!     GlobalMetadata,
//!     MemoryBlockStore,
//!     MemoryINodeStore,
//!     MemoryMetadataCluster,
//!     PeerAddress,
//!     Ring,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let addr = "127.0.0.1:8080".parse()?;
//!     let cluster = MemoryMetadataCluster::new(GlobalMetadata::default());
//!     cluster.set_ring(Ring::new(1, vec![PeerAddress::new("node-1", addr)], 1)?);
//!
//!     let distributor = Distributor::connect(
//!         DistributorConfig::client_only(),
//!         Arc::new(cluster.node("node-1")),
//!         Arc::new(MemoryBlockStore::default()),
//!         Arc::new(MemoryINodeStore::default()),
//!     )
//!     .await?;
//!
//!     let id = BlockId::new(1, 1, 0);
//!     distributor.write_block(id, Bytes::from_static(b"Hello, world!")).await?;
//!     assert_eq!(distributor.read_block(id).await?, Bytes::from_static(b"Hello, world!"));
//!
//!     distributor.close().await?;
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod cache;
mod config;
mod core;
mod error;
mod metadata;
mod replication;
mod ring;
mod rpc;
mod statistics;
mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

pub use self::cache::{Admission, CacheTicket, ReadCache};
pub use self::config::DistributorConfig;
pub use self::core::{BlockId, GlobalMetadata, INodeId, PeerAddress, DEFAULT_INODE_REPLICATION};
pub use self::error::{DistributorError, ReplicaFailure, ReplicaFailures};
pub use self::metadata::{
    MemoryMetadata,
    MemoryMetadataCluster,
    MetadataError,
    MetadataService,
};
pub use self::replication::{quorum, RebalancerState, RebalancerStatus};
pub use self::ring::{
    partition_of,
    Ring,
    RingError,
    RingHandle,
    ShardId,
    ShardKind,
    DEFAULT_PARTITIONS,
};
pub use self::rpc::{ErrorCode, Status, StorageReply, StorageRequest};
pub use self::statistics::DistributorStatistics;
#[cfg(feature = "test-utils")]
pub use self::storage::test_suite;
pub use self::storage::{
    BlockStore,
    INodeStore,
    MemoryBlockStore,
    MemoryINodeStore,
    StorageError,
};
use crate::replication::{
    resolve_inode_replication,
    start_rebalancer,
    DistClient,
    RebalancerContext,
    RebalancerHandle,
};
use crate::rpc::services::StorageServer;
use crate::rpc::{RpcNetwork, RpcServer};
use crate::statistics::incr;

/// A single node's entry point into the replicated block store.
///
/// The distributor owns the node's storage server, its peer clients, its
/// read cache and its rebalancer. Every operation is safe to call
/// concurrently from many tasks.
pub struct Distributor {
    uuid: String,
    global: GlobalMetadata,
    mds: Arc<dyn MetadataService>,
    ring: RingHandle,
    cache: ReadCache,
    local: Arc<StorageServer>,
    client: Arc<DistClient>,
    server: Mutex<Option<RpcServer>>,
    local_addr: Option<SocketAddr>,
    rebalancer: RebalancerHandle,
    statistics: DistributorStatistics,
    closed: AtomicBool,
    close_lock: tokio::sync::Mutex<bool>,
}

impl Distributor {
    /// Connects the node to the cluster.
    ///
    /// The global metadata and the latest ring must be available, if either
    /// cannot be fetched the node cannot start.
    pub async fn connect(
        config: DistributorConfig,
        mds: Arc<dyn MetadataService>,
        blocks: Arc<dyn BlockStore>,
        inodes: Arc<dyn INodeStore>,
    ) -> Result<Self, DistributorError> {
        let uuid = mds.uuid();

        // Subscribe before fetching the ring so no publication is missed.
        let ring_changes = mds.ring_changes();
        let global = mds.global_metadata().await?;
        let ring = mds.get_ring().await?;

        info!(
            uuid = %uuid,
            ring_version = ring.version(),
            num_peers = ring.peers().len(),
            block_size = global.block_size,
            inode_replication = global.inode_replication,
            "Connecting distributor.",
        );

        let ring = RingHandle::new(ring);
        let statistics = DistributorStatistics::default();
        let cache = ReadCache::with_byte_budget(config.read_cache_size, global.block_size);
        let local = Arc::new(StorageServer::new(blocks, inodes, global.block_size));

        let server = match config.listen_addr {
            Some(addr) => Some(
                RpcServer::listen(addr, local.clone()).map_err(DistributorError::Bind)?,
            ),
            None => None,
        };
        let local_addr = server.as_ref().map(|server| server.local_addr());

        // Only nodes serving peers are live members of the cluster.
        if server.is_some() {
            mds.begin_heartbeat();
        }

        let client = Arc::new(DistClient::new(
            uuid.clone(),
            local.clone(),
            RpcNetwork::default(),
            &config,
            statistics.clone(),
        ));

        let rebalancer = start_rebalancer(RebalancerContext {
            uuid: uuid.clone(),
            mds: mds.clone(),
            ring: ring.clone(),
            ring_changes,
            client: client.clone(),
            local: local.clone(),
            initial_inode_replication: global.inode_replication,
            grace_period: config.rebalance_grace_period,
            retry_interval: config.rebalance_retry_interval,
            statistics: statistics.clone(),
        });

        Ok(Self {
            uuid,
            global,
            mds,
            ring,
            cache,
            local,
            client,
            server: Mutex::new(server),
            local_addr,
            rebalancer,
            statistics,
            closed: AtomicBool::new(false),
            close_lock: tokio::sync::Mutex::new(false),
        })
    }

    #[inline]
    /// The uuid of this node.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[inline]
    /// The address the storage server is bound to, if the node serves peers.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[inline]
    /// The maximum size of a single block in bytes.
    pub fn block_size(&self) -> u64 {
        self.global.block_size
    }

    #[inline]
    /// The ring currently used to place keys.
    pub fn ring(&self) -> Arc<Ring> {
        self.ring.load()
    }

    #[inline]
    pub fn ring_version(&self) -> u64 {
        self.ring.current_version()
    }

    #[inline]
    pub fn read_cache(&self) -> &ReadCache {
        &self.cache
    }

    #[inline]
    /// Live metrics of the distributor.
    pub fn statistics(&self) -> &DistributorStatistics {
        &self.statistics
    }

    /// A snapshot of the rebalancer's progress.
    pub fn rebalancer_status(&self) -> RebalancerStatus {
        self.rebalancer.status()
    }

    /// The number of copies kept of each inode record under the current ring.
    ///
    /// This never fails, if the global metadata is unreachable the default
    /// of [DEFAULT_INODE_REPLICATION] copies is used.
    pub async fn inode_replication(&self) -> usize {
        let ring = self.ring.load();
        resolve_inode_replication(self.mds.as_ref(), &ring).await
    }

    /// Returns if the distributor has started shutting down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), DistributorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DistributorError::ShuttingDown);
        }
        Ok(())
    }

    /// Reads a block from the cache or from the first replica to answer.
    pub async fn read_block(&self, id: BlockId) -> Result<Bytes, DistributorError> {
        self.ensure_open()?;
        validate_block(&id)?;

        if let Some(data) = self.cache.get(&id) {
            incr(&self.statistics.num_cache_hits);
            return Ok(data);
        }

        if self.cache.is_enabled() {
            incr(&self.statistics.num_cache_misses);
        }

        let ticket = self.cache.ticket();
        let replicas = self.ring.load().replicas_for_block(&id);
        let reply = self
            .client
            .read(replicas, StorageRequest::GetBlock(id))
            .await?;

        let data = match reply {
            StorageReply::Block(data) => Bytes::from(data),
            other => return Err(unexpected_reply(other)),
        };

        match self.cache.put_with_ticket(ticket, id, data.clone()) {
            Admission::Admitted => incr(&self.statistics.num_cache_admissions),
            Admission::Rejected => incr(&self.statistics.num_cache_rejections),
            Admission::Stale | Admission::Disabled => {},
        }

        Ok(data)
    }

    /// Writes a block to every replica, succeeding once a quorum acknowledged it.
    ///
    /// The cached copy of the block is invalidated whatever the outcome.
    pub async fn write_block(&self, id: BlockId, data: Bytes) -> Result<(), DistributorError> {
        self.ensure_open()?;
        validate_block(&id)?;
        if data.len() as u64 > self.global.block_size {
            return Err(DistributorError::InvalidRequest(format!(
                "{id} payload of {} bytes exceeds the block size of {} bytes",
                data.len(),
                self.global.block_size,
            )));
        }

        let ring = self.ring.load();
        let replicas = ring.replicas_for_block(&id);
        let request = StorageRequest::PutBlock {
            id,
            data: data.to_vec(),
        };
        let result = self
            .client
            .write(replicas, request, quorum(ring.replication()))
            .await;

        self.cache.invalidate(&id);

        let acknowledged = result?;
        trace!(block = %id, acknowledged = acknowledged, "Block written.");
        Ok(())
    }

    /// Reads an inode record from the first replica to answer.
    pub async fn read_inode(&self, id: INodeId) -> Result<Bytes, DistributorError> {
        self.ensure_open()?;
        validate_inode(&id)?;

        let ring = self.ring.load();
        let replication = self.inode_replication().await;
        let replicas = ring.replicas_for_inode(&id, replication);
        let reply = self
            .client
            .read(replicas, StorageRequest::GetINode(id))
            .await?;

        match reply {
            StorageReply::INode(record) => Ok(Bytes::from(record)),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Writes an inode record to every replica, succeeding once a quorum
    /// acknowledged it.
    pub async fn write_inode(&self, id: INodeId, record: Bytes) -> Result<(), DistributorError> {
        self.ensure_open()?;
        validate_inode(&id)?;

        let ring = self.ring.load();
        let replication = self.inode_replication().await;
        let replicas = ring.replicas_for_inode(&id, replication);
        let request = StorageRequest::PutINode {
            id,
            record: record.to_vec(),
        };
        let acknowledged = self
            .client
            .write(replicas, request, quorum(replication))
            .await?;

        trace!(inode = %id, acknowledged = acknowledged, "Inode written.");
        Ok(())
    }

    /// Shuts the node down.
    ///
    /// The storage server stops serving peers, the rebalancer is stopped,
    /// in-flight fan-outs are cancelled and finally the local stores are
    /// closed. Every step runs even if an earlier one failed and the first
    /// failure is returned. Closing an already closed distributor is a no-op.
    pub async fn close(&self) -> Result<(), DistributorError> {
        let mut done = self.close_lock.lock().await;
        if *done {
            return Ok(());
        }

        info!(uuid = %self.uuid, "Closing distributor.");
        self.closed.store(true, Ordering::Release);

        self.local.close();
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown().await;
        }

        self.rebalancer.stop().await;
        self.client.close();

        let inodes_result = self.local.inodes().close().await;
        if let Err(e) = inodes_result.as_ref() {
            error!(uuid = %self.uuid, error = ?e, "Failed to close inode store.");
        }

        let blocks_result = self.local.blocks().close().await;
        if let Err(e) = blocks_result.as_ref() {
            error!(uuid = %self.uuid, error = ?e, "Failed to close block store.");
        }

        *done = true;
        info!(uuid = %self.uuid, "Distributor closed.");

        inodes_result.and(blocks_result)?;
        Ok(())
    }
}

fn validate_block(id: &BlockId) -> Result<(), DistributorError> {
    if !id.is_valid() {
        return Err(DistributorError::InvalidRequest(format!(
            "{id} has a zero volume or inode"
        )));
    }
    Ok(())
}

fn validate_inode(id: &INodeId) -> Result<(), DistributorError> {
    if !id.is_valid() {
        return Err(DistributorError::InvalidRequest(format!(
            "{id} has a zero volume or inode"
        )));
    }
    Ok(())
}

fn unexpected_reply(reply: StorageReply) -> DistributorError {
    error!(reply = ?reply, "Replica answered with an unexpected reply.");
    DistributorError::PeerUnavailable(ReplicaFailures::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn single_node(cache_size: u64) -> (MemoryMetadataCluster, Distributor) {
        let cluster = MemoryMetadataCluster::new(GlobalMetadata {
            block_size: 64,
            inode_replication: 3,
        });
        let addr = test_helper::get_unused_addr();
        cluster.set_ring(Ring::new(1, vec![PeerAddress::new("node-1", addr)], 1).unwrap());

        let distributor = Distributor::connect(
            DistributorConfig::new(addr).with_read_cache_size(cache_size),
            Arc::new(cluster.node("node-1")),
            Arc::new(MemoryBlockStore::default()),
            Arc::new(MemoryINodeStore::default()),
        )
        .await
        .expect("Connect distributor");

        (cluster, distributor)
    }

    #[tokio::test]
    async fn test_single_node_block_and_inode() {
        let _ = tracing_subscriber::fmt::try_init();
        let (cluster, distributor) = single_node(0).await;
        assert!(cluster.has_heartbeat("node-1"));
        assert!(distributor.local_addr().is_some());

        let id = BlockId::new(1, 2, 3);
        distributor
            .write_block(id, Bytes::from_static(b"block"))
            .await
            .expect("Write block");
        assert_eq!(
            distributor.read_block(id).await.expect("Read block"),
            Bytes::from_static(b"block")
        );

        // Clamped to the single peer of the ring.
        assert_eq!(distributor.inode_replication().await, 1);
        let inode = INodeId::new(1, 2);
        distributor
            .write_inode(inode, Bytes::from_static(b"record"))
            .await
            .expect("Write inode");
        assert_eq!(
            distributor.read_inode(inode).await.expect("Read inode"),
            Bytes::from_static(b"record")
        );

        distributor.close().await.expect("Close distributor");
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected_locally() {
        let (_cluster, distributor) = single_node(0).await;

        let result = distributor
            .write_block(BlockId::new(1, 1, 0), Bytes::from(vec![0; 65]))
            .await;
        assert!(matches!(result, Err(DistributorError::InvalidRequest(_))));

        let result = distributor.read_block(BlockId::new(0, 1, 0)).await;
        assert!(matches!(result, Err(DistributorError::InvalidRequest(_))));

        let result = distributor.read_inode(INodeId::new(1, 0)).await;
        assert!(matches!(result, Err(DistributorError::InvalidRequest(_))));

        let result = distributor.read_block(BlockId::new(1, 1, 0)).await;
        assert!(matches!(result, Err(DistributorError::NotFound)));

        distributor.close().await.expect("Close distributor");
    }

    #[tokio::test]
    async fn test_reads_are_cached_and_writes_invalidate() {
        let _ = tracing_subscriber::fmt::try_init();
        let (_cluster, distributor) = single_node(64 * 16).await;
        let id = BlockId::new(1, 1, 0);

        distributor
            .write_block(id, Bytes::from_static(b"v1"))
            .await
            .expect("Write block");
        distributor.read_block(id).await.expect("Read block");
        assert_eq!(distributor.statistics().num_cache_misses(), 1);
        assert_eq!(distributor.statistics().num_cache_admissions(), 1);

        distributor.read_block(id).await.expect("Read block");
        assert_eq!(distributor.statistics().num_cache_hits(), 1);

        distributor
            .write_block(id, Bytes::from_static(b"v2"))
            .await
            .expect("Write block");
        assert!(distributor.read_cache().is_empty());
        assert_eq!(
            distributor.read_block(id).await.expect("Read block"),
            Bytes::from_static(b"v2")
        );

        distributor.close().await.expect("Close distributor");
    }

    #[tokio::test]
    async fn test_connect_requires_metadata() {
        let cluster = MemoryMetadataCluster::new(GlobalMetadata::default());
        let result = Distributor::connect(
            DistributorConfig::client_only(),
            Arc::new(cluster.node("node-1")),
            Arc::new(MemoryBlockStore::default()),
            Arc::new(MemoryINodeStore::default()),
        )
        .await;
        assert!(matches!(
            result,
            Err(DistributorError::MetadataUnavailable(MetadataError::NoRing))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_cluster, distributor) = single_node(0).await;
        distributor.close().await.expect("Close distributor");
        distributor.close().await.expect("Close again");

        let result = distributor.read_block(BlockId::new(1, 1, 0)).await;
        assert!(matches!(result, Err(DistributorError::ShuttingDown)));
    }
}
