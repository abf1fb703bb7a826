mod dist_client;
mod rebalancer;

pub(crate) use dist_client::DistClient;
pub use rebalancer::{RebalancerState, RebalancerStatus};
pub(crate) use rebalancer::{start_rebalancer, RebalancerContext, RebalancerHandle};

use crate::core::DEFAULT_INODE_REPLICATION;
use crate::metadata::MetadataService;
use crate::ring::Ring;

/// The number of acknowledgements a write needs to be accepted.
///
/// Replication factors of 2 or less need every replica, larger factors
/// need a strict majority.
pub const fn quorum(replication: usize) -> usize {
    if replication <= 2 {
        replication
    } else {
        replication / 2 + 1
    }
}

/// Fetches the inode replication factor and clamps it to the ring's peers.
///
/// If the global metadata cannot be fetched [DEFAULT_INODE_REPLICATION] is used.
pub(crate) async fn resolve_inode_replication(mds: &dyn MetadataService, ring: &Ring) -> usize {
    let configured = match mds.global_metadata().await {
        Ok(global) => global.inode_replication,
        Err(e) => {
            warn!(
                error = ?e,
                fallback = DEFAULT_INODE_REPLICATION,
                "Failed to fetch global metadata, using default inode replication.",
            );
            DEFAULT_INODE_REPLICATION
        },
    };

    clamp_replication(configured, ring.peers().len())
}

/// Clamps a replication factor to the number of peers available.
pub(crate) fn clamp_replication(replication: usize, num_peers: usize) -> usize {
    let replication = replication.max(1);
    if replication > num_peers {
        warn!(
            replication = replication,
            num_peers = num_peers,
            "Inode replication exceeds the number of peers, clamping.",
        );
        return num_peers.max(1);
    }
    replication
}
