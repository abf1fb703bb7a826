use std::time::Duration;

use blockring_distributor::test_utils::TestCluster;
use blockring_distributor::{
    BlockId,
    BlockStore,
    DistributorConfig,
    GlobalMetadata,
    INodeId,
    INodeStore,
    PeerAddress,
    ShardId,
};
use bytes::Bytes;

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(20);

fn global() -> GlobalMetadata {
    GlobalMetadata {
        block_size: 1024,
        inode_replication: 2,
    }
}

fn config() -> DistributorConfig {
    DistributorConfig::default()
        .with_rebalance_grace_period(Duration::from_secs(1))
        .with_rebalance_retry_interval(Duration::from_millis(100))
}

async fn write_dataset(cluster: &TestCluster) -> anyhow::Result<()> {
    for index in 0..64 {
        cluster
            .node(0)
            .write_block(BlockId::new(1, 1, index), Bytes::from(format!("block-{index}")))
            .await?;
    }

    for inode in 1..=16 {
        cluster
            .node(0)
            .write_inode(INodeId::new(1, inode), Bytes::from(format!("inode-{inode}")))
            .await?;
    }

    Ok(())
}

async fn check_dataset(cluster: &TestCluster, node: usize) -> anyhow::Result<()> {
    for index in 0..64 {
        let data = cluster.node(node).read_block(BlockId::new(1, 1, index)).await?;
        assert_eq!(data, Bytes::from(format!("block-{index}")));
    }

    for inode in 1..=16 {
        let record = cluster.node(node).read_inode(INodeId::new(1, inode)).await?;
        assert_eq!(record, Bytes::from(format!("inode-{inode}")));
    }

    Ok(())
}

/// Checks every node holds exactly the keys its owned shards contain.
async fn check_placement(cluster: &TestCluster) -> anyhow::Result<()> {
    for node in cluster.nodes.iter() {
        let ring = node.distributor.ring();
        let inode_replication = node.distributor.inode_replication().await;
        let owned = ring.owned_shards(&node.peer.uuid, inode_replication);

        let status = node.distributor.rebalancer_status();
        assert_eq!(
            status.held_shards, owned,
            "{} should hold exactly the shards it owns",
            node.peer.uuid
        );

        for id in node.blocks.keys().await? {
            let shard = ShardId::of_block(&id, ring.partitions());
            assert!(owned.contains(&shard), "{} holds {id} of unowned {shard}", node.peer.uuid);
        }

        for id in node.inodes.keys().await? {
            let shard = ShardId::of_inode(&id, ring.partitions());
            assert!(owned.contains(&shard), "{} holds {id} of unowned {shard}", node.peer.uuid);
        }

        for index in 0..64 {
            let id = BlockId::new(1, 1, index);
            if owned.contains(&ring.shard_of_block(&id)) {
                assert!(node.blocks_contains(id).await, "{} is missing {id}", node.peer.uuid);
            }
        }
    }

    Ok(())
}

#[tokio::test]
async fn test_rebalance_after_join_and_leave() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let mut cluster = TestCluster::start_with_config(3, 2, global(), config()).await?;
    write_dataset(&cluster).await?;
    check_placement(&cluster).await?;

    // A new node joins the ring.
    let joined = cluster.add_node().await?;
    let ring = cluster.publish_ring(&[0, 1, 2, joined])?;
    assert!(
        cluster
            .wait_for_convergence(ring.version(), CONVERGENCE_TIMEOUT)
            .await,
        "Cluster should converge after the join"
    );
    check_placement(&cluster).await?;
    assert!(cluster.node(joined).statistics().num_shards_gained() > 0);
    check_dataset(&cluster, joined).await?;

    // The first node leaves the ring but keeps running.
    let ring = cluster.publish_ring(&[1, 2, joined])?;
    assert!(
        cluster
            .wait_for_convergence(ring.version(), CONVERGENCE_TIMEOUT)
            .await,
        "Cluster should converge after the leave"
    );
    check_placement(&cluster).await?;

    let status = cluster.node(0).rebalancer_status();
    assert!(status.held_shards.is_empty());
    assert!(cluster.nodes[0].blocks.keys().await?.is_empty());
    assert!(cluster.node(0).statistics().num_shards_purged() > 0);

    check_dataset(&cluster, 1).await?;

    cluster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_ring_flap_keeps_data() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let config = config().with_rebalance_grace_period(Duration::from_secs(5));
    let mut cluster = TestCluster::start_with_config(3, 2, global(), config).await?;
    write_dataset(&cluster).await?;
    let num_keys = cluster.nodes[2].blocks.keys().await?.len();

    // The third node is removed and re-added before its grace period ends.
    let ring = cluster.publish_ring(&[0, 1])?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.node(2).ring_version(), ring.version());
    assert!(!cluster.node(2).rebalancer_status().pending_purge.is_empty());

    // Writes made while the node is out of the ring only reach the other nodes.
    for index in 0..64 {
        cluster
            .node(0)
            .write_block(BlockId::new(1, 1, index), Bytes::from(format!("block-{index}-rewritten")))
            .await?;
    }

    let ring = cluster.publish_ring(&[0, 1, 2])?;
    assert!(
        cluster
            .wait_for_convergence(ring.version(), CONVERGENCE_TIMEOUT)
            .await,
        "Cluster should converge after the flap"
    );

    assert_eq!(cluster.node(2).statistics().num_shards_purged(), 0);
    assert_eq!(cluster.nodes[2].blocks.keys().await?.len(), num_keys);
    check_placement(&cluster).await?;

    // The returning node replaced its stale copies with the newer writes.
    for id in cluster.nodes[2].blocks.keys().await? {
        let expected = Bytes::from(format!("block-{}-rewritten", id.index));
        assert_eq!(cluster.nodes[2].blocks.get(id).await?, expected, "{id} should be refreshed");
    }
    for index in 0..64 {
        let data = cluster.node(2).read_block(BlockId::new(1, 1, index)).await?;
        assert_eq!(data, Bytes::from(format!("block-{index}-rewritten")));
    }

    cluster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_ring_fetch_failures_are_retried() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let mut cluster = TestCluster::start_with_config(2, 2, global(), config()).await?;
    write_dataset(&cluster).await?;

    cluster.metadata.set_ring_available(false);
    let joined = cluster.add_node().await;
    // The new node cannot fetch the ring while it is unavailable.
    assert!(joined.is_err());

    cluster.metadata.set_ring_available(true);
    let joined = cluster.add_node().await?;

    cluster.metadata.set_ring_available(false);
    let ring = cluster.publish_ring(&[0, 1, joined])?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(cluster.node(joined).ring_version() < ring.version());

    cluster.metadata.set_ring_available(true);
    assert!(
        cluster
            .wait_for_convergence(ring.version(), CONVERGENCE_TIMEOUT)
            .await,
        "Cluster should converge once the ring is reachable again"
    );
    check_placement(&cluster).await?;
    check_dataset(&cluster, joined).await?;

    cluster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_back_to_back_rings_converge_on_latest() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let mut cluster = TestCluster::start_with_config(3, 2, global(), config()).await?;
    write_dataset(&cluster).await?;

    let first = cluster.add_node().await?;
    let second = cluster.add_node().await?;

    // The second ring is published before anyone finished migrating to the first.
    let skipped = cluster.publish_ring(&[0, 1, 2, first])?;
    let ring = cluster.publish_ring(&[0, 1, 2, first, second])?;
    assert!(ring.version() > skipped.version());
    assert!(
        cluster
            .wait_for_convergence(ring.version(), CONVERGENCE_TIMEOUT)
            .await,
        "Cluster should converge on the latest ring"
    );

    check_placement(&cluster).await?;
    assert!(cluster.node(second).statistics().num_shards_gained() > 0);
    check_dataset(&cluster, first).await?;
    check_dataset(&cluster, second).await?;

    cluster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_purge_waits_for_new_owners() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let mut cluster = TestCluster::start_with_config(1, 1, global(), config()).await?;
    write_dataset(&cluster).await?;
    let num_blocks = cluster.nodes[0].blocks.keys().await?.len();
    let num_inodes = cluster.nodes[0].inodes.keys().await?.len();

    // Every shard moves to a peer which never comes up.
    let owner = PeerAddress::new("node-unreachable", test_helper::get_unused_addr());
    let ring = cluster.publish_peers(vec![owner])?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.node(0).ring_version(), ring.version());

    // Well past the grace period, several purge attempts have been made.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let status = cluster.node(0).rebalancer_status();
    assert!(!status.pending_purge.is_empty());
    assert!(!status.is_converged());
    assert_eq!(cluster.node(0).statistics().num_shards_purged(), 0);
    assert_eq!(cluster.nodes[0].blocks.keys().await?.len(), num_blocks);
    assert_eq!(cluster.nodes[0].inodes.keys().await?.len(), num_inodes);

    cluster.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_stopping_mid_migration_keeps_held_shards_whole() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let mut cluster = TestCluster::start_with_config(3, 2, global(), config()).await?;
    write_dataset(&cluster).await?;

    let joined = cluster.add_node().await?;
    cluster.publish_ring(&[0, 1, 2, joined])?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    cluster.node(joined).close().await?;

    // Whatever was migrated before the stop, every held shard is complete.
    let node = &cluster.nodes[joined];
    let ring = node.distributor.ring();
    let status = node.distributor.rebalancer_status();
    for index in 0..64 {
        let id = BlockId::new(1, 1, index);
        if status.held_shards.contains(&ring.shard_of_block(&id)) {
            assert!(node.blocks_contains(id).await, "held shard is missing {id}");
        }
    }
    for inode in 1..=16 {
        let id = INodeId::new(1, inode);
        if status.held_shards.contains(&ring.shard_of_inode(&id)) {
            assert!(node.inodes_contains(id).await, "held shard is missing {id}");
        }
    }

    cluster.close().await?;
    Ok(())
}
