use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::core::{BlockId, GlobalMetadata, INodeId, PeerAddress};
use crate::ring::{Ring, RingError};
use crate::storage::{BlockStore, INodeStore, MemoryBlockStore, MemoryINodeStore, StorageError};
use crate::{Distributor, DistributorConfig, DistributorError, MemoryMetadataCluster};

#[derive(Debug, Clone, Default)]
/// A shared, ordered log of the notable calls made against instrumented stores.
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// A wrapping type around another [BlockStore] implementation that
/// logs all the activity going into and out of the store.
///
/// The store can also be told to fail when it is closed.
pub struct InstrumentedBlockStore<S: BlockStore> {
    inner: S,
    log: EventLog,
    fail_close: bool,
}

impl<S: BlockStore> InstrumentedBlockStore<S> {
    pub fn new(inner: S, log: EventLog) -> Self {
        Self {
            inner,
            log,
            fail_close: false,
        }
    }

    pub fn fail_on_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

#[async_trait]
impl<S: BlockStore> BlockStore for InstrumentedBlockStore<S> {
    async fn get(&self, id: BlockId) -> Result<Bytes, StorageError> {
        info!(block = %id, "get");
        self.inner.get(id).await
    }

    async fn put(&self, id: BlockId, data: Bytes) -> Result<(), StorageError> {
        info!(block = %id, len = data.len(), "put");
        self.inner.put(id, data).await
    }

    async fn put_if_absent(&self, id: BlockId, data: Bytes) -> Result<bool, StorageError> {
        info!(block = %id, len = data.len(), "put_if_absent");
        self.inner.put_if_absent(id, data).await
    }

    async fn delete(&self, id: BlockId) -> Result<(), StorageError> {
        info!(block = %id, "delete");
        self.inner.delete(id).await
    }

    async fn keys(&self) -> Result<Vec<BlockId>, StorageError> {
        info!("keys");
        self.inner.keys().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        info!("close");
        self.log.record("blocks.close");
        let result = self.inner.close().await;
        if self.fail_close {
            return Err(StorageError::Io("injected block store close failure".to_string()));
        }
        result
    }
}

/// A wrapping type around another [INodeStore] implementation that
/// logs all the activity going into and out of the store.
pub struct InstrumentedINodeStore<S: INodeStore> {
    inner: S,
    log: EventLog,
    fail_close: bool,
}

impl<S: INodeStore> InstrumentedINodeStore<S> {
    pub fn new(inner: S, log: EventLog) -> Self {
        Self {
            inner,
            log,
            fail_close: false,
        }
    }

    pub fn fail_on_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

#[async_trait]
impl<S: INodeStore> INodeStore for InstrumentedINodeStore<S> {
    async fn get(&self, id: INodeId) -> Result<Bytes, StorageError> {
        info!(inode = %id, "get");
        self.inner.get(id).await
    }

    async fn put(&self, id: INodeId, record: Bytes) -> Result<(), StorageError> {
        info!(inode = %id, len = record.len(), "put");
        self.inner.put(id, record).await
    }

    async fn put_if_absent(&self, id: INodeId, record: Bytes) -> Result<bool, StorageError> {
        info!(inode = %id, len = record.len(), "put_if_absent");
        self.inner.put_if_absent(id, record).await
    }

    async fn delete(&self, id: INodeId) -> Result<(), StorageError> {
        info!(inode = %id, "delete");
        self.inner.delete(id).await
    }

    async fn keys(&self) -> Result<Vec<INodeId>, StorageError> {
        info!("keys");
        self.inner.keys().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        info!("close");
        self.log.record("inodes.close");
        let result = self.inner.close().await;
        if self.fail_close {
            return Err(StorageError::Io("injected inode store close failure".to_string()));
        }
        result
    }
}

/// A single node of a [TestCluster].
pub struct TestNode {
    pub peer: PeerAddress,
    pub distributor: Distributor,
    pub blocks: Arc<MemoryBlockStore>,
    pub inodes: Arc<MemoryINodeStore>,
}

impl TestNode {
    /// Returns if the node's local store holds the block.
    pub async fn blocks_contains(&self, id: BlockId) -> bool {
        self.blocks.get(id).await.is_ok()
    }

    /// Returns if the node's local store holds the inode record.
    pub async fn inodes_contains(&self, id: INodeId) -> bool {
        self.inodes.get(id).await.is_ok()
    }
}

/// A cluster of distributors running within the current process and
/// sharing a single in-memory metadata service.
pub struct TestCluster {
    pub metadata: MemoryMetadataCluster,
    pub nodes: Vec<TestNode>,
    config: DistributorConfig,
    replication: usize,
    next_version: u64,
}

impl TestCluster {
    /// Starts `num_nodes` nodes which all belong to the first ring.
    pub async fn start(
        num_nodes: usize,
        replication: usize,
        global: GlobalMetadata,
    ) -> Result<Self, DistributorError> {
        Self::start_with_config(num_nodes, replication, global, DistributorConfig::default())
            .await
    }

    /// Starts `num_nodes` nodes using the given config, the listen address
    /// of the config is replaced for every node.
    pub async fn start_with_config(
        num_nodes: usize,
        replication: usize,
        global: GlobalMetadata,
        config: DistributorConfig,
    ) -> Result<Self, DistributorError> {
        let peers = test_helper::get_unused_addrs(num_nodes)
            .into_iter()
            .enumerate()
            .map(|(i, addr)| PeerAddress::new(format!("node-{i}"), addr))
            .collect::<Vec<_>>();

        let metadata = MemoryMetadataCluster::new(global);
        metadata.set_ring(Ring::new(1, peers.clone(), replication)?);

        let mut cluster = Self {
            metadata,
            nodes: Vec::with_capacity(num_nodes),
            config,
            replication,
            next_version: 2,
        };

        for peer in peers {
            cluster.connect_node(peer).await?;
        }

        Ok(cluster)
    }

    async fn connect_node(&mut self, peer: PeerAddress) -> Result<(), DistributorError> {
        let blocks = Arc::new(MemoryBlockStore::default());
        let inodes = Arc::new(MemoryINodeStore::default());

        let mut config = self.config.clone();
        config.listen_addr = Some(peer.addr);

        let distributor = Distributor::connect(
            config,
            Arc::new(self.metadata.node(peer.uuid.clone())),
            blocks.clone(),
            inodes.clone(),
        )
        .await?;

        self.nodes.push(TestNode {
            peer,
            distributor,
            blocks,
            inodes,
        });

        Ok(())
    }

    /// Starts a new node which does not belong to the current ring.
    ///
    /// Returns the index of the new node.
    pub async fn add_node(&mut self) -> Result<usize, DistributorError> {
        let uuid = format!("node-{}", self.nodes.len());
        let peer = PeerAddress::new(uuid, test_helper::get_unused_addr());
        self.connect_node(peer).await?;
        Ok(self.nodes.len() - 1)
    }

    pub fn node(&self, index: usize) -> &Distributor {
        &self.nodes[index].distributor
    }

    pub fn peer(&self, index: usize) -> PeerAddress {
        self.nodes[index].peer.clone()
    }

    /// Publishes a new ring made up of the nodes with the given indexes.
    pub fn publish_ring(&mut self, members: &[usize]) -> Result<Ring, RingError> {
        let peers = members.iter().map(|i| self.peer(*i)).collect::<Vec<_>>();
        self.publish_peers(peers)
    }

    /// Publishes a new ring made up of the given peers, which need not be
    /// running nodes of the cluster.
    pub fn publish_peers(&mut self, peers: Vec<PeerAddress>) -> Result<Ring, RingError> {
        let ring = Ring::new(self.next_version, peers, self.replication)?;
        self.next_version += 1;
        self.metadata.set_ring(ring.clone());
        Ok(ring)
    }

    /// Waits until every node which is still running adopted the given ring version and
    /// holds exactly the shards it owns.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn wait_for_convergence(&self, version: u64, timeout: Duration) -> bool {
        let converged = async {
            loop {
                let done = self
                    .nodes
                    .iter()
                    .filter(|node| !node.distributor.is_closed())
                    .all(|node| {
                        let status = node.distributor.rebalancer_status();
                        status.ring_version == version && status.is_converged()
                    });

                if done {
                    return;
                }

                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        tokio::time::timeout(timeout, converged).await.is_ok()
    }

    /// Closes every node of the cluster.
    ///
    /// Nodes which were already closed are skipped.
    pub async fn close(&self) -> Result<(), DistributorError> {
        for node in self.nodes.iter() {
            node.distributor.close().await?;
        }
        Ok(())
    }
}
