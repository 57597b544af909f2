//! Convergence tests for configuration gossip.
//!
//! Nodes run on an in-process network so exchange order and failures can be
//! chosen by the test.

use clustertopo::gossip::LocalGossipNetwork;
use clustertopo::{
    ClusterConfiguration, ConfigurationGossiper, ConfigurationStore, DynamicPartitionConfig,
    GossipConfig, MemberId, MemberState,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

/// A configuration at `version` whose member set identifies its origin.
fn configuration(version: u64, origin: usize) -> ClusterConfiguration {
    let mut config = (0..=origin).fold(
        ClusterConfiguration::new(DynamicPartitionConfig::new(1, 1)),
        |config, member| config.with_member(member as u32, MemberState::active(Default::default())),
    );
    config.version = version;
    config
}

fn spawn_nodes(
    network: &Arc<LocalGossipNetwork>,
    configs: Vec<ClusterConfiguration>,
    gossip: GossipConfig,
) -> Vec<Arc<ConfigurationGossiper>> {
    configs
        .into_iter()
        .enumerate()
        .map(|(index, config)| {
            let id = MemberId::from(index as u32);
            let gossiper = Arc::new(ConfigurationGossiper::new(
                id.clone(),
                Arc::new(ConfigurationStore::in_memory(config)),
                network.transport(id),
                gossip.clone(),
            ));
            network.register(Arc::clone(&gossiper));
            gossiper
        })
        .collect()
}

fn version_of(node: &ConfigurationGossiper) -> u64 {
    node.local_state().configuration.version
}

/// Node count, initial versions, the index of the node holding the unique
/// highest version, and a random exchange sequence.
fn scenario() -> impl Strategy<Value = (Vec<u64>, usize, Vec<(usize, usize)>)> {
    (2usize..6).prop_flat_map(|n| {
        (
            prop::collection::vec(1u64..50, n),
            0..n,
            prop::collection::vec((0..n, 0..n), 0..40),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the exchange order, every node ends with the highest version
    /// and no node ever goes backwards.
    #[test]
    fn gossip_converges_to_highest_version((versions, winner, exchanges) in scenario()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let n = versions.len();
            let configs: Vec<_> = versions
                .iter()
                .enumerate()
                .map(|(index, version)| {
                    let version = if index == winner { 100 } else { *version };
                    configuration(version, index)
                })
                .collect();
            let expected = configs[winner].clone();

            let network = LocalGossipNetwork::new();
            let nodes = spawn_nodes(&network, configs, GossipConfig::new());

            // Random exchanges, then a full sweep so every pair has talked.
            let sweep = (0..n).flat_map(|from| (0..n).map(move |to| (from, to)));
            for (from, to) in exchanges.into_iter().chain(sweep) {
                if from == to {
                    continue;
                }
                let before = version_of(&nodes[from]);
                let peer_before = version_of(&nodes[to]);
                nodes[from].sync_with(&MemberId::from(to as u32)).await.unwrap();
                prop_assert!(version_of(&nodes[from]) >= before);
                prop_assert!(version_of(&nodes[to]) >= peer_before);
                prop_assert_eq!(version_of(&nodes[from]), version_of(&nodes[to]).max(before));
            }

            for node in &nodes {
                prop_assert_eq!(&node.local_state().configuration, &expected);
            }
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_disconnected_node_catches_up_after_reconnect() {
    let network = LocalGossipNetwork::new();
    let nodes = spawn_nodes(
        &network,
        vec![configuration(1, 0), configuration(1, 0), configuration(7, 2)],
        GossipConfig::new().fanout(2),
    );
    network.disconnect(0u32);

    for _ in 0..3 {
        nodes[1].gossip_round().await;
        nodes[0].gossip_round().await;
    }
    assert_eq!(version_of(&nodes[0]), 1);
    assert_eq!(version_of(&nodes[1]), 7);

    network.reconnect(0u32);
    assert_eq!(nodes[0].gossip_round().await, 2);
    assert_eq!(version_of(&nodes[0]), 7);
}

#[tokio::test]
async fn test_background_gossip_spreads_updates() {
    let network = LocalGossipNetwork::new();
    let nodes = spawn_nodes(
        &network,
        vec![configuration(3, 1), configuration(0, 0), configuration(0, 0)],
        GossipConfig::new()
            .interval(Duration::from_millis(50))
            .jitter(Duration::from_millis(10))
            .fanout(1),
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    let handles: Vec<_> = nodes
        .iter()
        .map(|node| Arc::clone(node).spawn(shutdown_tx.subscribe()))
        .collect();

    let deadline = Instant::now() + Duration::from_secs(5);
    while nodes.iter().any(|node| version_of(node) != 3) {
        assert!(Instant::now() < deadline, "gossip did not converge");
        sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}
