//! Round-robin partition distribution.
//!
//! Partition `p` (1-based) is replicated on `replication_factor` consecutive
//! members starting at member `(p - 1) % n`. The first replica gets the
//! highest priority, so primaries rotate across the cluster.
use crate::error::{TopologyError, TopologyResult};
use crate::types::{MemberId, PartitionId};
use std::collections::{BTreeMap, BTreeSet};

/// Replicas of one partition with their priorities.
pub type PartitionReplicas = BTreeMap<MemberId, u32>;

/// Target distribution: partition -> replicas.
pub type PartitionDistribution = BTreeMap<PartitionId, PartitionReplicas>;

/// Distributes partitions over members round-robin.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinDistributor;

impl RoundRobinDistributor {
    /// Distribute `partitions` over `members`.
    pub fn distribute(
        &self,
        members: &BTreeSet<MemberId>,
        partitions: impl IntoIterator<Item = PartitionId>,
        replication_factor: u32,
    ) -> TopologyResult<PartitionDistribution> {
        if replication_factor == 0 {
            return Err(TopologyError::invalid("replication factor must be at least 1"));
        }
        if members.len() < replication_factor as usize {
            return Err(TopologyError::invalid(format!(
                "replication factor {} exceeds the number of members {}",
                replication_factor,
                members.len()
            )));
        }

        let ordered: Vec<&MemberId> = members.iter().collect();
        let mut distribution = PartitionDistribution::new();
        for partition in partitions {
            if partition == 0 {
                return Err(TopologyError::invalid("partition ids start at 1"));
            }
            let offset = (partition - 1) as usize;
            let replicas = (0..replication_factor as usize)
                .map(|replica| {
                    let member = ordered[(offset + replica) % ordered.len()].clone();
                    (member, replication_factor - replica as u32)
                })
                .collect();
            distribution.insert(partition, replicas);
        }
        Ok(distribution)
    }
}
