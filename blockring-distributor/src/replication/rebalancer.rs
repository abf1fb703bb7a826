use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{quorum, DistClient};
use crate::core::{BlockId, INodeId, PeerAddress};
use crate::metadata::MetadataService;
use crate::ring::{Ring, RingHandle, ShardId, ShardKind};
use crate::rpc::services::StorageServer;
use crate::rpc::{ErrorCode, Status, StorageReply, StorageRequest};
use crate::statistics::{incr, DistributorStatistics};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RebalancerState {
    /// Waiting for a ring change, a retry or a purge deadline.
    Idle,
    /// Comparing the shards held locally with the shards owned under the latest ring.
    Diffing,
    /// Fetching newly owned shards from their previous owners, or refreshing
    /// shards which came back to this node.
    Migrating,
}

#[derive(Debug, Clone)]
/// A snapshot of the rebalancer's progress.
pub struct RebalancerStatus {
    pub state: RebalancerState,
    /// The version of the ring the held shards were last reconciled against.
    pub ring_version: u64,
    /// Every shard whose data is held locally.
    pub held_shards: BTreeSet<ShardId>,
    /// Held shards which are no longer owned and waiting to be purged.
    pub pending_purge: BTreeSet<ShardId>,
    /// Owned shards which have not been fetched or refreshed yet.
    pub pending_fetch: BTreeSet<ShardId>,
}

impl RebalancerStatus {
    /// Returns if the held shards match the owned shards exactly.
    pub fn is_converged(&self) -> bool {
        self.state == RebalancerState::Idle
            && self.pending_purge.is_empty()
            && self.pending_fetch.is_empty()
    }
}

pub(crate) struct RebalancerContext {
    pub(crate) uuid: String,
    pub(crate) mds: Arc<dyn MetadataService>,
    pub(crate) ring: RingHandle,
    pub(crate) ring_changes: watch::Receiver<u64>,
    pub(crate) client: Arc<DistClient>,
    pub(crate) local: Arc<StorageServer>,
    pub(crate) initial_inode_replication: usize,
    pub(crate) grace_period: Duration,
    pub(crate) retry_interval: Duration,
    pub(crate) statistics: DistributorStatistics,
}

/// The running rebalancer task.
pub(crate) struct RebalancerHandle {
    running: Mutex<Option<(flume::Sender<()>, JoinHandle<()>)>>,
    status: Arc<RwLock<RebalancerStatus>>,
}

impl RebalancerHandle {
    pub(crate) fn status(&self) -> RebalancerStatus {
        self.status.read().clone()
    }

    /// Closes the rebalancer's stop channel and waits for the task to exit.
    ///
    /// The stop is observed between shards, so a shard migration in progress
    /// runs to completion unless it outlives the stop timeout.
    pub(crate) async fn stop(&self) {
        let running = self.running.lock().take();
        let (stop, mut task) = match running {
            Some(running) => running,
            None => return,
        };
        drop(stop);

        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!("Rebalancer did not stop in time, aborting.");
            task.abort();
        }
    }
}

/// Starts the rebalancer, assuming this node holds exactly the shards it
/// owns under the current ring.
pub(crate) fn start_rebalancer(ctx: RebalancerContext) -> RebalancerHandle {
    let ring = ctx.ring.load();
    let inode_replication = ctx.initial_inode_replication.min(ring.peers().len());
    let held = ring.owned_shards(&ctx.uuid, inode_replication);

    let status = Arc::new(RwLock::new(RebalancerStatus {
        state: RebalancerState::Idle,
        ring_version: ring.version(),
        held_shards: held.clone(),
        pending_purge: BTreeSet::new(),
        pending_fetch: BTreeSet::new(),
    }));

    let (stop, stop_rx) = flume::bounded(1);
    let rebalancer = Rebalancer {
        ctx,
        held,
        pending_purge: BTreeSet::new(),
        refreshing: BTreeSet::new(),
        history: vec![ring],
        stable_since: Instant::now(),
        purge_after: Instant::now(),
        retry_at: None,
        needs_ring_fetch: false,
        stop: stop_rx,
        status: status.clone(),
    };
    let task = tokio::spawn(rebalancer.run());

    RebalancerHandle {
        running: Mutex::new(Some((stop, task))),
        status,
    }
}

enum Outcome {
    /// Every owned shard is held.
    Complete,
    /// Some shards could not be fetched and must be retried.
    Incomplete,
    /// A newer ring was published mid migration.
    Superseded,
    /// The stop channel was closed.
    Stopped,
}

struct Rebalancer {
    ctx: RebalancerContext,
    /// Shards whose data is held locally.
    held: BTreeSet<ShardId>,
    /// Held shards which are no longer owned.
    pending_purge: BTreeSet<ShardId>,
    /// Owned shards which were handed off and came back, they must be
    /// refreshed from their interim owners.
    refreshing: BTreeSet<ShardId>,
    /// Every ring adopted since the held shards last matched the owned shards,
    /// oldest first.
    history: Vec<Arc<Ring>>,
    stable_since: Instant,
    /// Purges deferred because the new owners did not confirm their copies
    /// are not attempted again before this instant.
    purge_after: Instant,
    retry_at: Option<Instant>,
    needs_ring_fetch: bool,
    stop: flume::Receiver<()>,
    status: Arc<RwLock<RebalancerStatus>>,
}

impl Rebalancer {
    async fn run(mut self) {
        info!(uuid = %self.ctx.uuid, "Rebalancer started.");

        loop {
            self.set_state(RebalancerState::Idle);

            let purge_at = if self.pending_purge.is_empty() {
                None
            } else {
                Some(self.purge_deadline())
            };
            let wake_at = match (purge_at, self.retry_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let wake = async move {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.stop.recv_async() => break,
                changed = self.ctx.ring_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.needs_ring_fetch = true;
                },
                _ = wake => {},
            }

            if self.needs_ring_fetch && !self.refresh_ring().await {
                continue;
            }

            if !self.pending_purge.is_empty() && Instant::now() >= self.purge_deadline() {
                self.purge().await;
            }

            match self.reconcile().await {
                Outcome::Complete => {
                    self.retry_at = None;
                    if let Some(latest) = self.history.pop() {
                        self.history = vec![latest];
                    }
                },
                Outcome::Incomplete => {
                    self.retry_at = Some(Instant::now() + self.ctx.retry_interval);
                },
                Outcome::Superseded => {},
                Outcome::Stopped => break,
            }
        }

        self.set_state(RebalancerState::Idle);
        info!(uuid = %self.ctx.uuid, "Rebalancer stopped.");
    }

    /// Fetches the latest ring and adopts it if it is newer.
    ///
    /// Returns `false` if the fetch failed and was scheduled for retry.
    async fn refresh_ring(&mut self) -> bool {
        let ring = match self.ctx.mds.get_ring().await {
            Ok(ring) => ring,
            Err(e) => {
                warn!(error = ?e, "Failed to fetch the latest ring, retrying later.");
                self.retry_at = Some(Instant::now() + self.ctx.retry_interval);
                return false;
            },
        };
        self.needs_ring_fetch = false;

        if let Some(old) = self.ctx.ring.replace_if_newer(ring) {
            let latest = self.ctx.ring.load();
            info!(
                old_version = old.version(),
                ring_version = latest.version(),
                num_peers = latest.peers().len(),
                "Adopted new ring.",
            );

            for peer in old.peers() {
                if latest.peer(&peer.uuid).is_none() {
                    self.ctx.client.network().disconnect(peer.addr);
                }
            }

            self.history.push(latest);
            self.stable_since = Instant::now();
        }

        true
    }

    async fn reconcile(&mut self) -> Outcome {
        self.set_state(RebalancerState::Diffing);

        let ring = self.ctx.ring.load();
        let inode_replication =
            super::resolve_inode_replication(self.ctx.mds.as_ref(), &ring).await;
        let owned = ring.owned_shards(&self.ctx.uuid, inode_replication);

        // Shards which flapped back to this node may have missed writes while
        // they were owned elsewhere.
        let flapped = owned
            .intersection(&self.pending_purge)
            .copied()
            .collect::<Vec<_>>();
        self.refreshing.extend(flapped);
        self.refreshing.retain(|shard| owned.contains(shard));

        let mut to_fetch = owned
            .difference(&self.held)
            .copied()
            .collect::<BTreeSet<_>>();
        to_fetch.extend(self.refreshing.iter().copied());

        self.pending_purge = self.held.difference(&owned).copied().collect();
        self.track_handoff(ring.partitions());

        debug!(
            ring_version = ring.version(),
            num_owned = owned.len(),
            num_fetch = to_fetch.len(),
            num_refresh = self.refreshing.len(),
            num_purge = self.pending_purge.len(),
            "Computed shard difference.",
        );

        self.publish_status(ring.version(), &to_fetch);
        if to_fetch.is_empty() {
            return Outcome::Complete;
        }

        self.set_state(RebalancerState::Migrating);
        let mut remaining = to_fetch.clone();
        for shard in to_fetch {
            if self.stop_requested() {
                return Outcome::Stopped;
            }

            if self.ctx.ring_changes.has_changed().unwrap_or(false) {
                info!(ring_version = ring.version(), "Ring changed mid migration, restarting.");
                return Outcome::Superseded;
            }

            let refresh = self.refreshing.contains(&shard);
            let sources = if refresh {
                self.interim_owners(shard, inode_replication)
            } else {
                self.sources_for(shard, &ring, inode_replication)
            };

            let mode = if refresh {
                Transfer::Refresh
            } else {
                Transfer::Fill
            };
            match migrate_shard(&self.ctx, shard, ring.partitions(), sources, mode).await {
                Ok(num_keys) if refresh => {
                    info!(shard = %shard, num_keys = num_keys, "Shard refreshed.");
                    self.refreshing.remove(&shard);
                    self.track_handoff(ring.partitions());
                    remaining.remove(&shard);
                },
                Ok(num_keys) => {
                    incr(&self.ctx.statistics.num_shards_gained);
                    info!(shard = %shard, num_keys = num_keys, "Shard gained.");
                    self.held.insert(shard);
                    remaining.remove(&shard);
                },
                Err(status) => {
                    incr(&self.ctx.statistics.num_failed_migrations);
                    error!(shard = %shard, error = %status, "Failed to migrate shard, retrying later.");
                },
            }

            self.publish_status(ring.version(), &remaining);
        }

        if remaining.is_empty() {
            Outcome::Complete
        } else {
            Outcome::Incomplete
        }
    }

    /// Every peer which may hold a copy of the shard, owners under the most
    /// recent rings first.
    fn sources_for(
        &self,
        shard: ShardId,
        latest: &Ring,
        inode_replication: usize,
    ) -> Vec<PeerAddress> {
        let rings = std::iter::once(latest)
            .chain(self.history.iter().rev().map(|ring| ring.as_ref()));

        let mut sources: Vec<PeerAddress> = Vec::new();
        for ring in rings {
            for peer in shard_replicas(ring, shard, inode_replication) {
                if peer.uuid != self.ctx.uuid && !sources.iter().any(|p| p.uuid == peer.uuid) {
                    sources.push(peer);
                }
            }
        }

        sources
    }

    /// The peers which owned the shard under rings where this node did not,
    /// most recent first.
    fn interim_owners(&self, shard: ShardId, inode_replication: usize) -> Vec<PeerAddress> {
        let mut owners: Vec<PeerAddress> = Vec::new();
        for ring in self.history.iter().rev() {
            let replicas = shard_replicas(ring, shard, inode_replication);
            if replicas.iter().any(|peer| peer.uuid == self.ctx.uuid) {
                continue;
            }

            for peer in replicas {
                if !owners.iter().any(|p| p.uuid == peer.uuid) {
                    owners.push(peer);
                }
            }
        }

        owners
    }

    fn purge_deadline(&self) -> Instant {
        (self.stable_since + self.ctx.grace_period).max(self.purge_after)
    }

    #[instrument(name = "purge-shards", skip_all)]
    async fn purge(&mut self) {
        let ring = self.ctx.ring.load();
        let inode_replication =
            super::resolve_inode_replication(self.ctx.mds.as_ref(), &ring).await;

        let mut pending = std::mem::take(&mut self.pending_purge).into_iter();
        let mut unreachable = HashSet::new();
        let mut deferred = 0;
        while let Some(shard) = pending.next() {
            if self.stop_requested() {
                self.pending_purge.insert(shard);
                self.pending_purge.extend(pending);
                break;
            }

            let result =
                purge_shard(&self.ctx, &ring, shard, inode_replication, &mut unreachable).await;
            match result {
                Ok(Some(num_keys)) => {
                    incr(&self.ctx.statistics.num_shards_purged);
                    info!(shard = %shard, num_keys = num_keys, "Shard purged.");
                    self.held.remove(&shard);
                },
                Ok(None) => {
                    deferred += 1;
                    self.pending_purge.insert(shard);
                },
                Err(status) => {
                    error!(shard = %shard, error = %status, "Failed to purge shard, retrying later.");
                    deferred += 1;
                    self.pending_purge.insert(shard);
                },
            }
        }

        if deferred > 0 {
            warn!(
                num_deferred = deferred,
                "Shards are not yet confirmed by their new owners, deferring purge.",
            );
            self.purge_after = Instant::now() + self.ctx.retry_interval;
        }

        self.track_handoff(ring.partitions());
        let mut status = self.status.write();
        status.held_shards = self.held.clone();
        status.pending_purge = self.pending_purge.clone();
    }

    fn track_handoff(&self, partitions: u32) {
        self.ctx
            .local
            .track_handoff(&self.pending_purge, &self.refreshing, partitions);
    }

    fn stop_requested(&self) -> bool {
        self.stop.is_disconnected() || !self.stop.is_empty()
    }

    fn set_state(&self, state: RebalancerState) {
        self.status.write().state = state;
    }

    fn publish_status(&self, ring_version: u64, pending_fetch: &BTreeSet<ShardId>) {
        let mut status = self.status.write();
        status.ring_version = ring_version;
        status.held_shards = self.held.clone();
        status.pending_purge = self.pending_purge.clone();
        status.pending_fetch = pending_fetch.clone();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// How keys fetched from a source are written locally.
enum Transfer {
    /// Only keys missing locally are written, a newly gained shard.
    Fill,
    /// Every key is replaced unless a client wrote it during the hand off,
    /// a shard which came back to this node.
    Refresh,
}

/// The keys of a shard which were already taken from a source.
#[derive(Default)]
struct Transferred {
    blocks: HashSet<BlockId>,
    inodes: HashSet<INodeId>,
}

/// The replica set of a shard under a given ring.
fn shard_replicas(ring: &Ring, shard: ShardId, inode_replication: usize) -> Vec<PeerAddress> {
    let n = match shard.kind {
        ShardKind::Block => ring.replication(),
        ShardKind::INode => inode_replication.min(ring.peers().len()),
    };
    ring.replicas_for_shard(shard, n)
}

#[instrument(name = "migrate-shard", skip_all, fields(shard = %shard, mode = ?mode))]
/// Pulls the keys of a shard from every source which can be reached.
///
/// Sources are visited in order and each key is taken from the first source
/// which has it. The migration succeeds if at least one source listed the
/// shard and every key it listed was transferred.
async fn migrate_shard(
    ctx: &RebalancerContext,
    shard: ShardId,
    partitions: u32,
    sources: Vec<PeerAddress>,
    mode: Transfer,
) -> Result<usize, Status> {
    if sources.is_empty() {
        debug!("No other peer holds the shard, nothing to fetch.");
        return Ok(0);
    }

    let mut transferred = Transferred::default();
    let mut num_keys = 0;
    let mut num_complete = 0;
    let mut last_error = None;
    for source in sources.iter() {
        match migrate_from(ctx, shard, partitions, source, mode, &mut transferred).await {
            Ok(n) => {
                num_keys += n;
                num_complete += 1;
            },
            Err(status) => {
                warn!(source_peer = %source, error = %status, "Failed to fetch shard from source.");
                last_error = Some(status);
            },
        }
    }

    match last_error {
        Some(status) if num_complete == 0 => Err(status),
        _ => Ok(num_keys),
    }
}

async fn migrate_from(
    ctx: &RebalancerContext,
    shard: ShardId,
    partitions: u32,
    source: &PeerAddress,
    mode: Transfer,
    transferred: &mut Transferred,
) -> Result<usize, Status> {
    let reply = ctx
        .client
        .call(source, &StorageRequest::ListShard { shard, partitions })
        .await?;

    let (blocks, inodes) = match reply {
        StorageReply::Shard { blocks, inodes } => (blocks, inodes),
        other => return Err(unexpected_reply(&other)),
    };

    let mut num_keys = 0;
    for id in blocks {
        if transferred.blocks.contains(&id) {
            continue;
        }

        if mode == Transfer::Fill && ctx.local.blocks().get(id).await.is_ok() {
            transferred.blocks.insert(id);
            continue;
        }

        let data = match ctx.client.call(source, &StorageRequest::GetBlock(id)).await {
            Ok(StorageReply::Block(data)) => Bytes::from(data),
            Ok(other) => return Err(unexpected_reply(&other)),
            // Removed by the source after it was listed.
            Err(status) if status.code == ErrorCode::NotFound => continue,
            Err(status) => return Err(status),
        };

        let written = match mode {
            Transfer::Fill => ctx.local.migrate_block(id, data).await?,
            Transfer::Refresh => ctx.local.refresh_block(id, data).await?,
        };
        transferred.blocks.insert(id);
        if written {
            num_keys += 1;
        }
    }

    for id in inodes {
        if transferred.inodes.contains(&id) {
            continue;
        }

        if mode == Transfer::Fill && ctx.local.inodes().get(id).await.is_ok() {
            transferred.inodes.insert(id);
            continue;
        }

        let record = match ctx.client.call(source, &StorageRequest::GetINode(id)).await {
            Ok(StorageReply::INode(record)) => Bytes::from(record),
            Ok(other) => return Err(unexpected_reply(&other)),
            Err(status) if status.code == ErrorCode::NotFound => continue,
            Err(status) => return Err(status),
        };

        let written = match mode {
            Transfer::Fill => ctx.local.migrate_inode(id, record).await?,
            Transfer::Refresh => ctx.local.refresh_inode(id, record).await?,
        };
        transferred.inodes.insert(id);
        if written {
            num_keys += 1;
        }
    }

    Ok(num_keys)
}

/// Deletes the local copy of a shard which is no longer owned.
///
/// Every key held locally must be listed by a quorum of the shard's replicas
/// under the latest ring first, otherwise `None` is returned and nothing is
/// deleted. Replicas which failed to respond are recorded in `unreachable`
/// and not asked again for the rest of the pass.
async fn purge_shard(
    ctx: &RebalancerContext,
    ring: &Ring,
    shard: ShardId,
    inode_replication: usize,
    unreachable: &mut HashSet<String>,
) -> Result<Option<usize>, Status> {
    let partitions = ring.partitions();
    let (blocks, inodes) = ctx.local.list_shard(shard, partitions).await?;
    let num_keys = blocks.len() + inodes.len();

    if num_keys > 0 {
        let replicas = shard_replicas(ring, shard, inode_replication);
        let required = quorum(replicas.len());

        let mut block_copies = blocks.iter().map(|id| (*id, 0)).collect::<HashMap<_, usize>>();
        let mut inode_copies = inodes.iter().map(|id| (*id, 0)).collect::<HashMap<_, usize>>();
        for peer in replicas.iter() {
            if peer.uuid == ctx.uuid || unreachable.contains(&peer.uuid) {
                continue;
            }

            let request = StorageRequest::ListShard { shard, partitions };
            match ctx.client.call(peer, &request).await {
                Ok(StorageReply::Shard { blocks, inodes }) => {
                    for id in blocks {
                        if let Some(copies) = block_copies.get_mut(&id) {
                            *copies += 1;
                        }
                    }
                    for id in inodes {
                        if let Some(copies) = inode_copies.get_mut(&id) {
                            *copies += 1;
                        }
                    }
                },
                Ok(other) => {
                    warn!(target_peer = %peer, error = %unexpected_reply(&other), "Replica did not list the shard.");
                },
                Err(status) => {
                    warn!(target_peer = %peer, error = %status, "Replica did not list the shard.");
                    if status.is_transient() {
                        unreachable.insert(peer.uuid.clone());
                    }
                },
            }
        }

        let confirmed = block_copies
            .values()
            .chain(inode_copies.values())
            .all(|copies| *copies >= required);
        if !confirmed {
            debug!(shard = %shard, required = required, "Shard is not replicated elsewhere yet.");
            return Ok(None);
        }
    }

    for id in blocks {
        ctx.local.blocks().delete(id).await.map_err(Status::from)?;
    }

    for id in inodes {
        ctx.local.inodes().delete(id).await.map_err(Status::from)?;
    }

    Ok(Some(num_keys))
}

fn unexpected_reply(reply: &StorageReply) -> Status {
    Status::internal(format!("Unexpected reply from peer: {reply:?}"))
}
