use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use rkyv::{Archive, Deserialize, Serialize};

/// The default number of copies kept of every inode record when the
/// global metadata cannot be read.
pub const DEFAULT_INODE_REPLICATION: usize = 3;

const BLOCK_TAG: u8 = b'B';
const INODE_TAG: u8 = b'I';

#[repr(C)]
#[derive(
    Serialize, Deserialize, Archive, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
/// A single fixed size block of an inode's data.
pub struct BlockId {
    /// The volume the block belongs to.
    pub volume: u64,
    /// The inode the block belongs to.
    pub inode: u64,
    /// The position of the block within the inode.
    pub index: u64,
}

impl BlockId {
    pub fn new(volume: u64, inode: u64, index: u64) -> Self {
        Self {
            volume,
            inode,
            index,
        }
    }

    /// The inode which owns this block.
    pub fn inode_id(&self) -> INodeId {
        INodeId::new(self.volume, self.inode)
    }

    /// A namespaced encoding of the id used as the placement hash input.
    ///
    /// The leading tag guarantees a block never shares a hash input with an inode.
    pub fn placement_key(&self) -> [u8; 25] {
        let mut buf = [0; 25];
        buf[0] = BLOCK_TAG;
        buf[1..9].copy_from_slice(&self.volume.to_be_bytes());
        buf[9..17].copy_from_slice(&self.inode.to_be_bytes());
        buf[17..25].copy_from_slice(&self.index.to_be_bytes());
        buf
    }

    /// Checks the id refers to a real volume and inode.
    pub fn is_valid(&self) -> bool {
        self.volume != 0 && self.inode != 0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "block({}:{}:{})", self.volume, self.inode, self.index)
    }
}

#[repr(C)]
#[derive(
    Serialize, Deserialize, Archive, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
/// The metadata record of a file or object.
pub struct INodeId {
    pub volume: u64,
    pub inode: u64,
}

impl INodeId {
    pub fn new(volume: u64, inode: u64) -> Self {
        Self { volume, inode }
    }

    /// A namespaced encoding of the id used as the placement hash input.
    pub fn placement_key(&self) -> [u8; 17] {
        let mut buf = [0; 17];
        buf[0] = INODE_TAG;
        buf[1..9].copy_from_slice(&self.volume.to_be_bytes());
        buf[9..17].copy_from_slice(&self.inode.to_be_bytes());
        buf
    }

    /// Checks the id refers to a real volume and inode.
    pub fn is_valid(&self) -> bool {
        self.volume != 0 && self.inode != 0
    }
}

impl Display for INodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "inode({}:{})", self.volume, self.inode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A single member of the cluster.
pub struct PeerAddress {
    /// The unique id of the peer, stable across restarts.
    pub uuid: String,
    /// The address the peer's storage server listens on.
    pub addr: SocketAddr,
}

impl PeerAddress {
    pub fn new(uuid: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            uuid: uuid.into(),
            addr,
        }
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.uuid, self.addr)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Cluster wide constants published by the metadata service.
pub struct GlobalMetadata {
    /// The maximum size of a single block in bytes.
    pub block_size: u64,
    /// The number of copies kept of every inode record.
    pub inode_replication: usize,
}

impl Default for GlobalMetadata {
    fn default() -> Self {
        Self {
            block_size: 8 << 10,
            inode_replication: DEFAULT_INODE_REPLICATION,
        }
    }
}
