//! Versioned placement of blocks and inodes onto cluster peers.
//!
//! Keys are first hashed onto one of a fixed number of partitions, each partition
//! is then ranked against every peer using rendezvous (highest random weight)
//! hashing. Adding or removing a single peer only moves the partitions which
//! ranked that peer within their replica set.

use std::collections::{BTreeSet, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;
use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use crate::core::{BlockId, INodeId, PeerAddress};

/// The number of partitions the key space is split into unless stated otherwise.
pub const DEFAULT_PARTITIONS: u32 = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("A ring must contain at least one peer.")]
    NoPeers,

    #[error("The replication factor must be at least 1.")]
    InvalidReplication,

    #[error("The replication factor {replication} exceeds the {peers} peers in the ring.")]
    NotEnoughPeers { replication: usize, peers: usize },

    #[error("The peer {0:?} is present in the ring more than once.")]
    DuplicatePeer(String),

    #[error("A ring must contain at least one partition.")]
    InvalidPartitions,
}

#[repr(u8)]
#[derive(
    Serialize, Deserialize, Archive, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
/// The namespace a shard belongs to.
pub enum ShardKind {
    Block,
    INode,
}

#[repr(C)]
#[derive(
    Serialize, Deserialize, Archive, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
/// The unit of data the rebalancer moves between peers.
pub struct ShardId {
    pub kind: ShardKind,
    pub partition: u32,
}

impl ShardId {
    pub fn block(partition: u32) -> Self {
        Self {
            kind: ShardKind::Block,
            partition,
        }
    }

    pub fn inode(partition: u32) -> Self {
        Self {
            kind: ShardKind::INode,
            partition,
        }
    }

    /// The shard a block belongs to given the ring's partition count.
    pub fn of_block(id: &BlockId, partitions: u32) -> Self {
        Self::block(partition_of(&id.placement_key(), partitions))
    }

    /// The shard an inode belongs to given the ring's partition count.
    pub fn of_inode(id: &INodeId, partitions: u32) -> Self {
        Self::inode(partition_of(&id.placement_key(), partitions))
    }

    fn seed(&self) -> u64 {
        let kind: u64 = match self.kind {
            ShardKind::Block => 0,
            ShardKind::INode => 1,
        };
        (kind << 32) | self.partition as u64
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ShardKind::Block => write!(f, "block-shard-{}", self.partition),
            ShardKind::INode => write!(f, "inode-shard-{}", self.partition),
        }
    }
}

/// Maps a placement key onto one of `partitions` partitions.
pub fn partition_of(key: &[u8], partitions: u32) -> u32 {
    (xxh3_64(key) % partitions.max(1) as u64) as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An immutable snapshot of the cluster's placement at a given version.
pub struct Ring {
    version: u64,
    peers: Vec<PeerAddress>,
    replication: usize,
    partitions: u32,
}

impl Ring {
    /// Creates a new ring using the default number of partitions.
    pub fn new(
        version: u64,
        peers: Vec<PeerAddress>,
        replication: usize,
    ) -> Result<Self, RingError> {
        Self::with_partitions(version, peers, replication, DEFAULT_PARTITIONS)
    }

    /// Creates a new ring with a custom number of partitions.
    pub fn with_partitions(
        version: u64,
        peers: Vec<PeerAddress>,
        replication: usize,
        partitions: u32,
    ) -> Result<Self, RingError> {
        if peers.is_empty() {
            return Err(RingError::NoPeers);
        }

        if replication == 0 {
            return Err(RingError::InvalidReplication);
        }

        if replication > peers.len() {
            return Err(RingError::NotEnoughPeers {
                replication,
                peers: peers.len(),
            });
        }

        if partitions == 0 {
            return Err(RingError::InvalidPartitions);
        }

        let mut seen = HashSet::with_capacity(peers.len());
        for peer in peers.iter() {
            if !seen.insert(peer.uuid.as_str()) {
                return Err(RingError::DuplicatePeer(peer.uuid.clone()));
            }
        }

        Ok(Self {
            version,
            peers,
            replication,
            partitions,
        })
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    #[inline]
    /// The block replication factor.
    pub fn replication(&self) -> usize {
        self.replication
    }

    #[inline]
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Looks up a peer in the ring by its uuid.
    pub fn peer(&self, uuid: &str) -> Option<&PeerAddress> {
        self.peers.iter().find(|peer| peer.uuid == uuid)
    }

    /// The shard a given block belongs to.
    pub fn shard_of_block(&self, id: &BlockId) -> ShardId {
        ShardId::of_block(id, self.partitions)
    }

    /// The shard a given inode belongs to.
    pub fn shard_of_inode(&self, id: &INodeId) -> ShardId {
        ShardId::of_inode(id, self.partitions)
    }

    /// Ranks every peer against the shard and returns the first `n`.
    ///
    /// If `n` exceeds the number of peers every peer is returned.
    pub fn replicas_for_shard(&self, shard: ShardId, n: usize) -> Vec<PeerAddress> {
        let seed = shard.seed();
        let mut ranked = self
            .peers
            .iter()
            .map(|peer| (xxh3_64_with_seed(peer.uuid.as_bytes(), seed), peer))
            .collect::<Vec<_>>();

        ranked.sort_by(|(a_score, a), (b_score, b)| {
            b_score.cmp(a_score).then_with(|| a.uuid.cmp(&b.uuid))
        });

        ranked
            .into_iter()
            .take(n)
            .map(|(_, peer)| peer.clone())
            .collect()
    }

    /// The replica set of a block using the ring's replication factor.
    pub fn replicas_for_block(&self, id: &BlockId) -> Vec<PeerAddress> {
        self.replicas_for_shard(self.shard_of_block(id), self.replication)
    }

    /// The replica set of an inode using the given inode replication factor.
    pub fn replicas_for_inode(&self, id: &INodeId, replication: usize) -> Vec<PeerAddress> {
        self.replicas_for_shard(self.shard_of_inode(id), replication)
    }

    /// Every shard the given peer is a replica of under this ring.
    pub fn owned_shards(&self, uuid: &str, inode_replication: usize) -> BTreeSet<ShardId> {
        let mut owned = BTreeSet::new();
        for partition in 0..self.partitions {
            let block = ShardId::block(partition);
            if self.is_replica(block, self.replication, uuid) {
                owned.insert(block);
            }

            let inode = ShardId::inode(partition);
            if self.is_replica(inode, inode_replication, uuid) {
                owned.insert(inode);
            }
        }
        owned
    }

    fn is_replica(&self, shard: ShardId, n: usize, uuid: &str) -> bool {
        self.replicas_for_shard(shard, n)
            .iter()
            .any(|peer| peer.uuid == uuid)
    }
}

#[derive(Debug, Clone)]
/// A shared, atomically replaceable reference to the current ring.
///
/// Readers take a cheap clone of the current snapshot and never observe
/// a partially updated ring.
pub struct RingHandle {
    current: Arc<RwLock<Arc<Ring>>>,
}

impl RingHandle {
    pub fn new(ring: Ring) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(ring))),
        }
    }

    #[inline]
    /// Gets the current ring snapshot.
    pub fn load(&self) -> Arc<Ring> {
        self.current.read().clone()
    }

    #[inline]
    pub fn current_version(&self) -> u64 {
        self.current.read().version()
    }

    /// Replaces the current ring if the new ring has a higher version.
    ///
    /// Returns the previous ring if it was replaced.
    pub fn replace_if_newer(&self, ring: Ring) -> Option<Arc<Ring>> {
        let mut current = self.current.write();
        if ring.version() <= current.version() {
            return None;
        }

        Some(std::mem::replace(&mut *current, Arc::new(ring)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn peers(n: usize) -> Vec<PeerAddress> {
        (0..n)
            .map(|i| {
                PeerAddress::new(
                    format!("peer-{i}"),
                    format!("127.0.0.1:{}", 9000 + i).parse().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_ring_validation() {
        assert_eq!(Ring::new(1, vec![], 1), Err(RingError::NoPeers));
        assert_eq!(Ring::new(1, peers(3), 0), Err(RingError::InvalidReplication));
        assert_eq!(
            Ring::new(1, peers(2), 3),
            Err(RingError::NotEnoughPeers {
                replication: 3,
                peers: 2
            }),
        );
        assert_eq!(
            Ring::with_partitions(1, peers(2), 1, 0),
            Err(RingError::InvalidPartitions),
        );

        let mut duplicated = peers(2);
        duplicated.push(duplicated[0].clone());
        assert_eq!(
            Ring::new(1, duplicated, 1),
            Err(RingError::DuplicatePeer("peer-0".to_string())),
        );
    }

    #[test]
    fn test_partition_of_matches_shards() {
        let id = BlockId::new(3, 9, 27);
        let partition = crate::partition_of(&id.placement_key(), 64);
        assert!(partition < 64);
        assert_eq!(ShardId::of_block(&id, 64), ShardId::block(partition));
        assert_eq!(crate::partition_of(b"anything", 1), 0);
    }

    #[test]
    fn test_replicas_are_deterministic() {
        let ring = Ring::new(1, peers(5), 3).unwrap();
        let copy = Ring::new(1, peers(5), 3).unwrap();

        for index in 0..500 {
            let id = BlockId::new(1, 42, index);
            let replicas = ring.replicas_for_block(&id);
            assert_eq!(replicas, ring.replicas_for_block(&id));
            assert_eq!(replicas, copy.replicas_for_block(&id));
        }
    }

    #[test]
    fn test_peer_order_does_not_change_placement() {
        let ring = Ring::new(1, peers(5), 3).unwrap();
        let mut reversed = peers(5);
        reversed.reverse();
        let reversed = Ring::new(1, reversed, 3).unwrap();

        for inode in 1..200 {
            let id = INodeId::new(7, inode);
            assert_eq!(ring.replicas_for_inode(&id, 3), reversed.replicas_for_inode(&id, 3));
        }
    }

    #[test]
    fn test_replica_count_and_distinct_peers() {
        let ring = Ring::new(1, peers(6), 3).unwrap();

        for index in 0..500 {
            let replicas = ring.replicas_for_block(&BlockId::new(2, 3, index));
            assert_eq!(replicas.len(), 3);

            let unique = replicas.iter().map(|p| &p.uuid).collect::<HashSet<_>>();
            assert_eq!(unique.len(), 3, "Replicas must be distinct peers");
        }

        for inode in 1..200 {
            let replicas = ring.replicas_for_inode(&INodeId::new(2, inode), 5);
            assert_eq!(replicas.len(), 5);
        }
    }

    #[test]
    fn test_adding_a_peer_moves_few_partitions() {
        let before = Ring::new(1, peers(4), 1).unwrap();
        let after = Ring::new(2, peers(5), 1).unwrap();

        let moved = (0..before.partitions())
            .filter(|&p| {
                before.replicas_for_shard(ShardId::block(p), 1)
                    != after.replicas_for_shard(ShardId::block(p), 1)
            })
            .count();

        // Roughly 1/5th of the partitions should move to the new peer.
        assert!(moved > 0);
        assert!(moved < (before.partitions() as usize) / 2, "moved={moved}");

        for p in 0..before.partitions() {
            let old = &before.replicas_for_shard(ShardId::block(p), 1)[0];
            let new = &after.replicas_for_shard(ShardId::block(p), 1)[0];
            if old != new {
                assert_eq!(new.uuid, "peer-4", "Partitions only move to the new peer");
            }
        }
    }

    #[test]
    fn test_owned_shards_cover_every_replica() {
        let ring = Ring::with_partitions(1, peers(4), 2, 32).unwrap();

        let mut counts = HashMap::new();
        for peer in ring.peers() {
            for shard in ring.owned_shards(&peer.uuid, 3) {
                *counts.entry(shard).or_insert(0) += 1;
            }
        }

        for p in 0..32 {
            assert_eq!(counts[&ShardId::block(p)], 2);
            assert_eq!(counts[&ShardId::inode(p)], 3);
        }
    }

    #[test]
    fn test_ring_handle_only_moves_forward() {
        let handle = RingHandle::new(Ring::new(2, peers(3), 1).unwrap());

        assert!(handle
            .replace_if_newer(Ring::new(1, peers(3), 1).unwrap())
            .is_none());
        assert_eq!(handle.current_version(), 2);

        let old = handle
            .replace_if_newer(Ring::new(3, peers(4), 2).unwrap())
            .expect("Ring should be replaced");
        assert_eq!(old.version(), 2);
        assert_eq!(handle.load().version(), 3);
        assert_eq!(handle.load().replication(), 2);
    }
}
