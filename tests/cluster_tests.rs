/// Integration tests for cluster nodes over real TCP connections.
///
/// These tests verify:
/// - Nodes without a local configuration learn it from peers
/// - A change applied on one node reaches every other node
/// - A node restarting with an in-progress plan finishes it
/// - A node that never receives a configuration gives up
use clustertopo::config::CONFIGURATION_FILE;
use clustertopo::{
    ChangeExecutors, ClusterChangeOperation, ClusterConfiguration, ClusterNode,
    DynamicPartitionConfig, GossipConfig, InitializationOutcome, MemberId, MemberState, NodeConfig,
    PartitionId, PartitionState, StaticConfiguration, TopologyError, persistence, requests,
};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{Instant, sleep};

/// Helper function to get a loopback address with a random port.
fn local() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0)
}

fn fast_gossip() -> GossipConfig {
    GossipConfig::new()
        .interval(Duration::from_millis(100))
        .jitter(Duration::from_millis(20))
}

fn layout(members: &[(&str, &[PartitionId])], partition_count: u32, replication_factor: u32) -> ClusterConfiguration {
    members.iter().fold(
        ClusterConfiguration::new(DynamicPartitionConfig::new(partition_count, replication_factor)),
        |config, (member, partitions)| {
            let partitions = partitions
                .iter()
                .map(|partition| (*partition, PartitionState::active(1)))
                .collect();
            config.with_member(*member, MemberState::active(partitions))
        },
    )
}

async fn persist(config: &ClusterConfiguration, dir: &Path) {
    persistence::save(config, &dir.join(CONFIGURATION_FILE))
        .await
        .unwrap();
}

/// Poll `node` until its configuration satisfies `predicate`.
async fn wait_for(node: &ClusterNode, predicate: impl Fn(&ClusterConfiguration) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate(&node.configuration()) {
        assert!(
            Instant::now() < deadline,
            "member {} did not converge: {:?}",
            node.member_id(),
            node.configuration()
        );
        sleep(Duration::from_millis(20)).await;
    }
}

async fn joining_node(id: &str, seed: &ClusterNode) -> ClusterNode {
    let node = ClusterNode::open(
        NodeConfig::new(id)
            .bind_addr(local())
            .gossip(fast_gossip())
            .peer(seed.member_id().clone(), seed.local_addr())
            .initialization_timeout(Duration::from_secs(5)),
        ChangeExecutors::noop(),
    )
    .await
    .unwrap();
    assert_eq!(node.start().await.unwrap(), InitializationOutcome::FromPeers);
    node
}

#[tokio::test]
async fn test_partition_move_reaches_every_member() {
    let dir = TempDir::new().unwrap();
    persist(&layout(&[("0", &[1, 2]), ("1", &[1]), ("2", &[1])], 2, 3), dir.path()).await;

    let node0 = ClusterNode::open(
        NodeConfig::new("0")
            .bind_addr(local())
            .data_dir(dir.path())
            .gossip(fast_gossip()),
        ChangeExecutors::noop(),
    )
    .await
    .unwrap();
    assert_eq!(node0.start().await.unwrap(), InitializationOutcome::Persisted);

    let node1 = joining_node("1", &node0).await;
    let node2 = joining_node("2", &node0).await;

    // Member 0 already hosts partition 1; moving it off member 1 is a leave.
    let result = node0
        .coordinator()
        .apply_operations(requests::leave_partition(MemberId::from("1"), 1))
        .await
        .unwrap();

    assert_eq!(result.partitions_of(&MemberId::from("0")), BTreeSet::from([1, 2]));
    assert!(result.partitions_of(&MemberId::from("1")).is_empty());
    assert_eq!(result.partitions_of(&MemberId::from("2")), BTreeSet::from([1]));
    assert!(result.pending_operations().is_empty());

    let version = result.version;
    for node in [&node1, &node2] {
        wait_for(node, |config| config.version == version).await;
        assert_eq!(*node.configuration(), *result);
    }

    for node in [&node2, &node1, &node0] {
        node.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_restarted_coordinator_finishes_committed_plan() {
    let dir = TempDir::new().unwrap();
    let committed = layout(&[("0", &[1]), ("1", &[])], 1, 1)
        .start_plan(vec![
            ClusterChangeOperation::partition_join("1", 1, 1),
            ClusterChangeOperation::partition_leave("0", 1, 1),
        ])
        .unwrap();
    persist(&committed, dir.path()).await;

    let node = ClusterNode::open(
        NodeConfig::new("0").bind_addr(local()).data_dir(dir.path()),
        ChangeExecutors::noop(),
    )
    .await
    .unwrap();
    assert_eq!(node.start().await.unwrap(), InitializationOutcome::Persisted);

    wait_for(&node, |config| !config.has_pending_changes()).await;
    let config = node.configuration();
    assert!(config.partitions_of(&MemberId::from("0")).is_empty());
    assert_eq!(config.partitions_of(&MemberId::from("1")), BTreeSet::from([1]));
    assert_eq!(config.last_change.as_ref().map(|change| change.id), Some(1));

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_non_coordinator_does_not_resume_plan() {
    let dir = TempDir::new().unwrap();
    let committed = layout(&[("0", &[1]), ("1", &[])], 1, 1)
        .start_plan(vec![ClusterChangeOperation::partition_join("1", 1, 1)])
        .unwrap();
    persist(&committed, dir.path()).await;

    let node = ClusterNode::open(
        NodeConfig::new("1").bind_addr(local()).data_dir(dir.path()),
        ChangeExecutors::noop(),
    )
    .await
    .unwrap();
    node.start().await.unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(*node.configuration(), committed);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_node_without_peers_is_not_initialized() {
    let node = ClusterNode::open(
        NodeConfig::new("1")
            .bind_addr(local())
            .bootstrap(StaticConfiguration::new(["0", "1"], 1, 1))
            .initialization_timeout(Duration::from_millis(300)),
        ChangeExecutors::noop(),
    )
    .await
    .unwrap();

    let result = node.start().await;
    assert!(matches!(result, Err(TopologyError::NotInitialized)));
    assert!(!node.is_running().await);
    assert!(node.configuration().is_uninitialized());
}

#[tokio::test]
async fn test_status_reports_peers() {
    let node0 = ClusterNode::open(
        NodeConfig::new("0")
            .bind_addr(local())
            .gossip(fast_gossip())
            .bootstrap(StaticConfiguration::new(["0", "1"], 2, 1)),
        ChangeExecutors::noop(),
    )
    .await
    .unwrap();
    assert_eq!(node0.start().await.unwrap(), InitializationOutcome::Bootstrapped);
    let node1 = joining_node("1", &node0).await;

    let status = node1.status().await;
    assert!(status.initialized);
    assert_eq!(status.member_count, 2);
    assert_eq!(status.partition_count, 2);
    assert_eq!(status.peers.len(), 1);
    assert_eq!(status.peers[0].member_id, MemberId::from("0"));
    assert_eq!(status.peers[0].address, node0.local_addr());

    node1.stop().await.unwrap();
    node0.stop().await.unwrap();
}
