use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use crate::core::{BlockId, INodeId};
use crate::ring::{ShardId, ShardKind};
use crate::rpc::{Status, StorageReply, StorageRequest};
use crate::storage::{BlockStore, INodeStore, StorageError};

/// Room for the archived request framing around a payload.
const MESSAGE_OVERHEAD: usize = 4096;
const WRITE_LOCK_STRIPES: usize = 64;

macro_rules! log_failure {
    ($op:expr, $key:expr, $result:expr) => {{
        match $result {
            Err(StorageError::NotFound) => Err(Status::not_found($key)),
            Err(e) => {
                error!(error = ?e, key = %$key, operation = $op, "Local store failed to handle storage request.");
                Err(Status::from(e))
            },
            Ok(v) => Ok(v),
        }
    }};
}

#[derive(Default)]
/// Keys written by clients within shards this node is handing off.
///
/// Once a handed off shard comes back the node refreshes it from the peers
/// which owned it in the meantime, these keys are newer than anything those
/// peers hold and are never replaced.
struct HandoffWrites {
    partitions: u32,
    /// Shards handed off or being refreshed.
    shards: BTreeSet<ShardId>,
    /// Shards whose local copy is being refreshed and not listed to peers.
    refreshing: BTreeSet<ShardId>,
    blocks: HashSet<BlockId>,
    inodes: HashSet<INodeId>,
}

impl HandoffWrites {
    fn record_block(&mut self, id: &BlockId) {
        if self.shards.contains(&ShardId::of_block(id, self.partitions)) {
            self.blocks.insert(*id);
        }
    }

    fn record_inode(&mut self, id: &INodeId) {
        if self.shards.contains(&ShardId::of_inode(id, self.partitions)) {
            self.inodes.insert(*id);
        }
    }
}

/// Services storage requests against the node's local stores.
///
/// The server has no knowledge of other peers, replication is entirely
/// the caller's responsibility.
pub struct StorageServer {
    blocks: Arc<dyn BlockStore>,
    inodes: Arc<dyn INodeStore>,
    block_size: u64,
    closed: AtomicBool,
    /// Serializes client writes with refreshes of the same key.
    write_locks: Vec<tokio::sync::Mutex<()>>,
    handoff: Mutex<HandoffWrites>,
}

impl StorageServer {
    pub fn new(
        blocks: Arc<dyn BlockStore>,
        inodes: Arc<dyn INodeStore>,
        block_size: u64,
    ) -> Self {
        Self {
            blocks,
            inodes,
            block_size,
            closed: AtomicBool::new(false),
            write_locks: (0..WRITE_LOCK_STRIPES)
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
            handoff: Mutex::new(HandoffWrites::default()),
        }
    }

    fn write_lock(&self, placement_key: &[u8]) -> &tokio::sync::Mutex<()> {
        let stripe = xxh3_64(placement_key) as usize % WRITE_LOCK_STRIPES;
        &self.write_locks[stripe]
    }

    #[inline]
    pub(crate) fn blocks(&self) -> &Arc<dyn BlockStore> {
        &self.blocks
    }

    #[inline]
    pub(crate) fn inodes(&self) -> &Arc<dyn INodeStore> {
        &self.inodes
    }

    /// The largest request body accepted over the network.
    ///
    /// Inode records share the block size limit.
    pub(crate) fn max_request_size(&self) -> usize {
        usize::try_from(self.block_size)
            .unwrap_or(usize::MAX)
            .saturating_add(MESSAGE_OVERHEAD)
    }

    /// Stops the server from accepting any further requests.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), Status> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::shutting_down());
        }
        Ok(())
    }

    fn validate_block(&self, id: &BlockId) -> Result<(), Status> {
        if !id.is_valid() {
            return Err(Status::invalid_key(format!("{id} has a zero volume or inode")));
        }
        Ok(())
    }

    fn validate_inode(&self, id: &INodeId) -> Result<(), Status> {
        if !id.is_valid() {
            return Err(Status::invalid_key(format!("{id} has a zero volume or inode")));
        }
        Ok(())
    }

    /// Dispatches a decoded request to its handler.
    pub async fn handle(&self, request: StorageRequest) -> Result<StorageReply, Status> {
        match request {
            StorageRequest::GetBlock(id) => {
                let data = self.get_block(id).await?;
                Ok(StorageReply::Block(data.to_vec()))
            },
            StorageRequest::PutBlock { id, data } => {
                self.put_block(id, Bytes::from(data)).await?;
                Ok(StorageReply::Ack)
            },
            StorageRequest::GetINode(id) => {
                let record = self.get_inode(id).await?;
                Ok(StorageReply::INode(record.to_vec()))
            },
            StorageRequest::PutINode { id, record } => {
                self.put_inode(id, Bytes::from(record)).await?;
                Ok(StorageReply::Ack)
            },
            StorageRequest::ListShard { shard, partitions } => {
                let (blocks, inodes) = self.list_shard(shard, partitions).await?;
                Ok(StorageReply::Shard { blocks, inodes })
            },
        }
    }

    pub async fn get_block(&self, id: BlockId) -> Result<Bytes, Status> {
        self.ensure_open()?;
        self.validate_block(&id)?;
        log_failure!("get_block", id, self.blocks.get(id).await)
    }

    pub async fn put_block(&self, id: BlockId, data: Bytes) -> Result<(), Status> {
        self.ensure_open()?;
        self.validate_block(&id)?;
        if data.len() as u64 > self.block_size {
            return Err(Status::invalid_key(format!(
                "{id} payload of {} bytes exceeds the block size of {} bytes",
                data.len(),
                self.block_size,
            )));
        }

        let _guard = self.write_lock(&id.placement_key()).lock().await;
        self.handoff.lock().record_block(&id);
        log_failure!("put_block", id, self.blocks.put(id, data).await)
    }

    pub async fn get_inode(&self, id: INodeId) -> Result<Bytes, Status> {
        self.ensure_open()?;
        self.validate_inode(&id)?;
        log_failure!("get_inode", id, self.inodes.get(id).await)
    }

    pub async fn put_inode(&self, id: INodeId, record: Bytes) -> Result<(), Status> {
        self.ensure_open()?;
        self.validate_inode(&id)?;

        let _guard = self.write_lock(&id.placement_key()).lock().await;
        self.handoff.lock().record_inode(&id);
        log_failure!("put_inode", id, self.inodes.put(id, record).await)
    }

    /// Lists every key held locally which belongs to the given shard.
    pub async fn list_shard(
        &self,
        shard: ShardId,
        partitions: u32,
    ) -> Result<(Vec<BlockId>, Vec<INodeId>), Status> {
        self.ensure_open()?;
        if partitions == 0 || shard.partition >= partitions {
            return Err(Status::invalid_key(format!(
                "{shard} is outside of the {partitions} ring partitions"
            )));
        }

        {
            let handoff = self.handoff.lock();
            if handoff.partitions == partitions && handoff.refreshing.contains(&shard) {
                return Err(Status::not_ready(format!("{shard} is being refreshed")));
            }
        }

        match shard.kind {
            ShardKind::Block => {
                let keys = log_failure!("list_shard", shard, self.blocks.keys().await)?;
                let blocks = keys
                    .into_iter()
                    .filter(|id| ShardId::of_block(id, partitions) == shard)
                    .collect();
                Ok((blocks, Vec::new()))
            },
            ShardKind::INode => {
                let keys = log_failure!("list_shard", shard, self.inodes.keys().await)?;
                let inodes = keys
                    .into_iter()
                    .filter(|id| ShardId::of_inode(id, partitions) == shard)
                    .collect();
                Ok((Vec::new(), inodes))
            },
        }
    }

    /// Writes a migrated block unless a newer copy was already written locally.
    pub(crate) async fn migrate_block(&self, id: BlockId, data: Bytes) -> Result<bool, Status> {
        self.ensure_open()?;
        log_failure!("migrate_block", id, self.blocks.put_if_absent(id, data).await)
    }

    /// Writes a migrated record unless a newer copy was already written locally.
    pub(crate) async fn migrate_inode(&self, id: INodeId, record: Bytes) -> Result<bool, Status> {
        self.ensure_open()?;
        log_failure!("migrate_inode", id, self.inodes.put_if_absent(id, record).await)
    }

    /// Sets the shards being handed off and the shards being refreshed.
    ///
    /// Client writes to either are recorded until the shard is purged or
    /// refreshed. Shards being refreshed are not listed to peers as their
    /// local copy may still be missing newer writes.
    pub(crate) fn track_handoff(
        &self,
        handed_off: &BTreeSet<ShardId>,
        refreshing: &BTreeSet<ShardId>,
        partitions: u32,
    ) {
        let shards = handed_off.union(refreshing).copied().collect::<BTreeSet<_>>();
        let mut handoff = self.handoff.lock();
        if handoff.partitions != partitions {
            handoff.blocks.clear();
            handoff.inodes.clear();
            handoff.partitions = partitions;
        }

        handoff
            .blocks
            .retain(|id| shards.contains(&ShardId::of_block(id, partitions)));
        handoff
            .inodes
            .retain(|id| shards.contains(&ShardId::of_inode(id, partitions)));
        handoff.shards = shards;
        handoff.refreshing = refreshing.clone();
    }

    /// Replaces the local copy of a block with a copy from the shard's interim
    /// owner unless a client wrote the block during the hand off.
    pub(crate) async fn refresh_block(&self, id: BlockId, data: Bytes) -> Result<bool, Status> {
        self.ensure_open()?;
        let _guard = self.write_lock(&id.placement_key()).lock().await;
        if self.handoff.lock().blocks.contains(&id) {
            return Ok(false);
        }
        log_failure!("refresh_block", id, self.blocks.put(id, data).await)?;
        Ok(true)
    }

    /// Replaces the local copy of an inode record with a copy from the shard's
    /// interim owner unless a client wrote the record during the hand off.
    pub(crate) async fn refresh_inode(&self, id: INodeId, record: Bytes) -> Result<bool, Status> {
        self.ensure_open()?;
        let _guard = self.write_lock(&id.placement_key()).lock().await;
        if self.handoff.lock().inodes.contains(&id) {
            return Ok(false);
        }
        log_failure!("refresh_inode", id, self.inodes.put(id, record).await)?;
        Ok(true)
    }
}
