use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;

use crate::core::GlobalMetadata;
use crate::ring::Ring;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("The metadata service is unavailable: {0}")]
    Unavailable(String),

    #[error("No ring has been published to the metadata service.")]
    NoRing,
}

#[async_trait]
/// The cluster's metadata and consensus service as seen by a single node.
pub trait MetadataService: Send + Sync + 'static {
    /// Fetches the cluster wide constants.
    async fn global_metadata(&self) -> Result<GlobalMetadata, MetadataError>;

    /// Fetches the latest published ring.
    async fn get_ring(&self) -> Result<Ring, MetadataError>;

    /// The uuid of the node this handle belongs to.
    fn uuid(&self) -> String;

    /// A subscription yielding the version of every newly published ring.
    fn ring_changes(&self) -> watch::Receiver<u64>;

    /// Starts publishing this node's liveness.
    fn begin_heartbeat(&self);
}

struct ClusterState {
    global: RwLock<GlobalMetadata>,
    ring: RwLock<Option<Ring>>,
    versions: watch::Sender<u64>,
    heartbeats: RwLock<BTreeSet<String>>,
    global_available: AtomicBool,
    ring_available: AtomicBool,
}

#[derive(Clone)]
/// An in-process metadata service shared by every node of a test or
/// single process cluster.
pub struct MemoryMetadataCluster {
    state: Arc<ClusterState>,
}

impl MemoryMetadataCluster {
    pub fn new(global: GlobalMetadata) -> Self {
        let (versions, _) = watch::channel(0);
        Self {
            state: Arc::new(ClusterState {
                global: RwLock::new(global),
                ring: RwLock::new(None),
                versions,
                heartbeats: RwLock::new(BTreeSet::new()),
                global_available: AtomicBool::new(true),
                ring_available: AtomicBool::new(true),
            }),
        }
    }

    /// Publishes a new ring and notifies every subscribed node.
    pub fn set_ring(&self, ring: Ring) {
        let version = ring.version();
        *self.state.ring.write() = Some(ring);
        self.state.versions.send_replace(version);
    }

    /// Replaces the cluster wide constants.
    pub fn set_global_metadata(&self, global: GlobalMetadata) {
        *self.state.global.write() = global;
    }

    /// Makes global metadata fetches fail until re-enabled.
    pub fn set_global_metadata_available(&self, available: bool) {
        self.state
            .global_available
            .store(available, Ordering::Relaxed);
    }

    /// Makes ring fetches fail until re-enabled.
    pub fn set_ring_available(&self, available: bool) {
        self.state.ring_available.store(available, Ordering::Relaxed);
    }

    /// Returns if the node with the given uuid has started its heartbeat.
    pub fn has_heartbeat(&self, uuid: &str) -> bool {
        self.state.heartbeats.read().contains(uuid)
    }

    /// Creates a handle to the service for the node with the given uuid.
    pub fn node(&self, uuid: impl Into<String>) -> MemoryMetadata {
        MemoryMetadata {
            uuid: uuid.into(),
            cluster: self.clone(),
        }
    }
}

#[derive(Clone)]
/// A single node's handle to a [MemoryMetadataCluster].
pub struct MemoryMetadata {
    uuid: String,
    cluster: MemoryMetadataCluster,
}

#[async_trait]
impl MetadataService for MemoryMetadata {
    async fn global_metadata(&self) -> Result<GlobalMetadata, MetadataError> {
        let state = &self.cluster.state;
        if !state.global_available.load(Ordering::Relaxed) {
            return Err(MetadataError::Unavailable(
                "global metadata is unreachable".to_string(),
            ));
        }
        Ok(*state.global.read())
    }

    async fn get_ring(&self) -> Result<Ring, MetadataError> {
        let state = &self.cluster.state;
        if !state.ring_available.load(Ordering::Relaxed) {
            return Err(MetadataError::Unavailable(
                "ring is unreachable".to_string(),
            ));
        }
        state.ring.read().clone().ok_or(MetadataError::NoRing)
    }

    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn ring_changes(&self) -> watch::Receiver<u64> {
        self.cluster.state.versions.subscribe()
    }

    fn begin_heartbeat(&self) {
        debug!(uuid = %self.uuid, "Heartbeat started.");
        self.cluster.state.heartbeats.write().insert(self.uuid.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PeerAddress;

    fn ring(version: u64) -> Ring {
        let peers = vec![PeerAddress::new("peer-0", "127.0.0.1:9000".parse().unwrap())];
        Ring::new(version, peers, 1).unwrap()
    }

    #[tokio::test]
    async fn test_ring_publication() {
        let cluster = MemoryMetadataCluster::new(GlobalMetadata::default());
        let node = cluster.node("peer-0");
        let mut changes = node.ring_changes();

        assert_eq!(node.get_ring().await, Err(MetadataError::NoRing));

        cluster.set_ring(ring(4));
        changes.changed().await.expect("Receive ring change");
        assert_eq!(*changes.borrow(), 4);
        assert_eq!(node.get_ring().await.unwrap().version(), 4);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let cluster = MemoryMetadataCluster::new(GlobalMetadata::default());
        cluster.set_ring(ring(1));
        let node = cluster.node("peer-0");

        cluster.set_global_metadata_available(false);
        cluster.set_ring_available(false);
        assert!(matches!(
            node.global_metadata().await,
            Err(MetadataError::Unavailable(_))
        ));
        assert!(matches!(node.get_ring().await, Err(MetadataError::Unavailable(_))));

        cluster.set_global_metadata_available(true);
        cluster.set_ring_available(true);
        assert!(node.global_metadata().await.is_ok());
        assert!(node.get_ring().await.is_ok());
    }

    #[test]
    fn test_heartbeat() {
        let cluster = MemoryMetadataCluster::new(GlobalMetadata::default());
        let node = cluster.node("peer-1");
        assert!(!cluster.has_heartbeat("peer-1"));
        node.begin_heartbeat();
        assert!(cluster.has_heartbeat("peer-1"));
    }
}
