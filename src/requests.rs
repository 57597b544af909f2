//! Change requests: turn an administrative intent into an operation list.
//!
//! Each function returns a transform for
//! [`ConfigurationChangeCoordinator::apply_operations`](crate::coordinator::ConfigurationChangeCoordinator::apply_operations),
//! so the operations are computed from the configuration current at commit
//! time, not from an earlier read.
use crate::configuration::ClusterConfiguration;
use crate::distribution::{PartitionDistribution, RoundRobinDistributor};
use crate::error::{TopologyError, TopologyResult};
use crate::operations::ClusterChangeOperation;
use crate::types::{MemberId, PartitionId};
use std::collections::BTreeSet;

/// A deferred computation of a plan against the current configuration.
pub type ChangeRequest =
    Box<dyn FnOnce(&ClusterConfiguration) -> TopologyResult<Vec<ClusterChangeOperation>> + Send>;

/// Submit an explicit operation list as-is.
pub fn operations(operations: Vec<ClusterChangeOperation>) -> ChangeRequest {
    Box::new(move |_| Ok(operations))
}

/// Add members and rebalance partitions over the enlarged member set.
pub fn add_members(members: BTreeSet<MemberId>) -> ChangeRequest {
    Box::new(move |config| {
        let mut target: BTreeSet<MemberId> = config.members.keys().cloned().collect();
        target.extend(members);
        plan_reassignment(config, &target, config.partition_config.replication_factor)
    })
}

/// Remove members, moving their replicas to the remaining members first.
pub fn remove_members(members: BTreeSet<MemberId>) -> ChangeRequest {
    Box::new(move |config| {
        for member in &members {
            if !config.has_member(member) {
                return Err(TopologyError::invalid(format!(
                    "member {} does not exist",
                    member
                )));
            }
        }
        let target: BTreeSet<MemberId> = config
            .members
            .keys()
            .filter(|id| !members.contains(*id))
            .cloned()
            .collect();
        plan_reassignment(config, &target, config.partition_config.replication_factor)
    })
}

/// Redistribute every partition over exactly `members`.
pub fn reassign_partitions(members: BTreeSet<MemberId>, replication_factor: Option<u32>) -> ChangeRequest {
    Box::new(move |config| {
        let replication_factor =
            replication_factor.unwrap_or(config.partition_config.replication_factor);
        if replication_factor != config.partition_config.replication_factor {
            return Err(TopologyError::invalid(format!(
                "changing the replication factor from {} to {} is not supported",
                config.partition_config.replication_factor, replication_factor
            )));
        }
        plan_reassignment(config, &members, replication_factor)
    })
}

/// Add a replica of `partition` on `member`.
pub fn join_partition(member: MemberId, partition: PartitionId, priority: u32) -> ChangeRequest {
    Box::new(move |_| {
        Ok(vec![ClusterChangeOperation::PartitionJoin {
            member,
            partition,
            priority,
        }])
    })
}

/// Remove `member`'s replica of `partition`, keeping at least one replica.
pub fn leave_partition(member: MemberId, partition: PartitionId) -> ChangeRequest {
    Box::new(move |_| {
        Ok(vec![ClusterChangeOperation::PartitionLeave {
            member,
            partition,
            minimum_allowed_replicas: 1,
        }])
    })
}

/// Change the leader priority of one replica.
pub fn reconfigure_priority(member: MemberId, partition: PartitionId, priority: u32) -> ChangeRequest {
    Box::new(move |_| {
        Ok(vec![ClusterChangeOperation::PartitionReconfigurePriority {
            member,
            partition,
            priority,
        }])
    })
}

/// Disable `exporter` on every replica where it is enabled.
pub fn disable_exporter(exporter: String) -> ChangeRequest {
    Box::new(move |config| {
        let exporter = exporter.as_str();
        let operations: Vec<_> = config
            .members
            .iter()
            .flat_map(|(member, state)| {
                state
                    .partitions
                    .iter()
                    .filter(move |(_, p)| p.exporters.get(exporter).is_some_and(|e| e.enabled))
                    .map(move |(partition, _)| ClusterChangeOperation::PartitionDisableExporter {
                        member: member.clone(),
                        partition: *partition,
                        exporter: exporter.to_string(),
                    })
            })
            .collect();
        if operations.is_empty() {
            return Err(TopologyError::invalid(format!(
                "exporter {} is not enabled on any partition",
                exporter
            )));
        }
        Ok(operations)
    })
}

/// Enable `exporter` on every replica where it is not enabled.
pub fn enable_exporter(exporter: String) -> ChangeRequest {
    Box::new(move |config| {
        let exporter = exporter.as_str();
        Ok(config
            .members
            .iter()
            .flat_map(|(member, state)| {
                state
                    .partitions
                    .iter()
                    .filter(move |(_, p)| !p.exporters.get(exporter).is_some_and(|e| e.enabled))
                    .map(move |(partition, _)| ClusterChangeOperation::PartitionEnableExporter {
                        member: member.clone(),
                        partition: *partition,
                        exporter: exporter.to_string(),
                    })
            })
            .collect())
    })
}

/// Grow the partition count to `desired_partition_count`.
///
/// New partitions are bootstrapped on their round-robin primary and joined
/// by the remaining replicas; `coordinator` runs the scaling steps.
pub fn scale_partitions(coordinator: MemberId, desired_partition_count: u32) -> ChangeRequest {
    Box::new(move |config| {
        let current = config.partition_config.partition_count;
        if desired_partition_count <= current {
            return Err(TopologyError::invalid(format!(
                "desired partition count {} must exceed the current count {}",
                desired_partition_count, current
            )));
        }
        let members: BTreeSet<MemberId> = config.members.keys().cloned().collect();
        let new_partitions = current + 1..=desired_partition_count;
        let distribution = RoundRobinDistributor.distribute(
            &members,
            new_partitions.clone(),
            config.partition_config.replication_factor,
        )?;

        let mut operations = vec![ClusterChangeOperation::StartPartitionScaleUp {
            member: coordinator.clone(),
            desired_partition_count,
        }];
        for (partition, replicas) in &distribution {
            let mut by_priority: Vec<_> = replicas.iter().collect();
            by_priority.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let mut replicas = by_priority.into_iter();
            if let Some((primary, priority)) = replicas.next() {
                operations.push(ClusterChangeOperation::PartitionBootstrap {
                    member: primary.clone(),
                    partition: *partition,
                    priority: *priority,
                });
            }
            operations.extend(replicas.map(|(member, priority)| {
                ClusterChangeOperation::PartitionJoin {
                    member: member.clone(),
                    partition: *partition,
                    priority: *priority,
                }
            }));
        }
        operations.push(ClusterChangeOperation::AwaitRedistributionCompletion {
            member: coordinator,
            desired_partition_count,
            partitions: new_partitions.collect(),
        });
        Ok(operations)
    })
}

/// Diff the round-robin distribution over `target` against `config`.
///
/// Ordering: member joins, then per partition the joins, priority changes
/// and leaves, then member leaves. Joining before leaving keeps every
/// partition at or above its replica count throughout.
pub fn plan_reassignment(
    config: &ClusterConfiguration,
    target: &BTreeSet<MemberId>,
    replication_factor: u32,
) -> TopologyResult<Vec<ClusterChangeOperation>> {
    if target.is_empty() {
        return Err(TopologyError::invalid("cannot reassign partitions to zero members"));
    }
    let partitions: BTreeSet<PartitionId> = (1..=config.partition_config.partition_count)
        .chain(config.partition_ids())
        .collect();
    let desired: PartitionDistribution =
        RoundRobinDistributor.distribute(target, partitions.iter().copied(), replication_factor)?;

    let mut operations: Vec<ClusterChangeOperation> = target
        .iter()
        .filter(|member| !config.has_member(member))
        .map(|member| ClusterChangeOperation::MemberJoin {
            member: member.clone(),
        })
        .collect();

    for (partition, replicas) in &desired {
        let current = config.priorities_of(*partition);

        for (member, priority) in replicas {
            if !current.contains_key(member) {
                operations.push(ClusterChangeOperation::PartitionJoin {
                    member: member.clone(),
                    partition: *partition,
                    priority: *priority,
                });
            }
        }
        for (member, priority) in replicas {
            if current.get(member).is_some_and(|existing| existing != priority) {
                operations.push(ClusterChangeOperation::PartitionReconfigurePriority {
                    member: member.clone(),
                    partition: *partition,
                    priority: *priority,
                });
            }
        }
        for member in current.keys() {
            if !replicas.contains_key(member) {
                operations.push(ClusterChangeOperation::PartitionLeave {
                    member: member.clone(),
                    partition: *partition,
                    minimum_allowed_replicas: 1,
                });
            }
        }
    }

    operations.extend(
        config
            .members
            .keys()
            .filter(|member| !target.contains(*member))
            .map(|member| ClusterChangeOperation::MemberLeave {
                member: member.clone(),
            }),
    );
    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DynamicPartitionConfig, MemberState, PartitionState};
    use std::collections::BTreeMap;

    fn bootstrapped(members: &[&str], partitions: u32, rf: u32) -> ClusterConfiguration {
        let ids: BTreeSet<MemberId> = members.iter().map(|m| MemberId::from(*m)).collect();
        let distribution = RoundRobinDistributor.distribute(&ids, 1..=partitions, rf).unwrap();
        let mut config = ClusterConfiguration::new(DynamicPartitionConfig::new(partitions, rf));
        for id in &ids {
            let hosted: BTreeMap<_, _> = distribution
                .iter()
                .filter_map(|(p, replicas)| replicas.get(id).map(|prio| (*p, PartitionState::active(*prio))))
                .collect();
            config = config.with_member(id.clone(), MemberState::active(hosted));
        }
        config
    }

    #[test]
    fn test_add_member_plan_is_valid_and_rebalances() {
        let config = bootstrapped(&["0", "1"], 3, 2);
        let operations = add_members(BTreeSet::from([MemberId::from("2")]))(&config).unwrap();

        assert_eq!(
            operations[0],
            ClusterChangeOperation::MemberJoin {
                member: MemberId::from("2")
            }
        );
        let planned = config.start_plan(operations).unwrap();
        let result = planned.simulate().unwrap();
        for metadata in result.partition_metadata() {
            assert!(metadata.is_fully_replicated());
        }
        assert!(!result.partitions_of(&MemberId::from("2")).is_empty());
    }

    #[test]
    fn test_remove_member_plan_ends_with_member_leave() {
        let config = bootstrapped(&["0", "1", "2"], 3, 2);
        let operations = remove_members(BTreeSet::from([MemberId::from("2")]))(&config).unwrap();
        assert_eq!(
            operations.last(),
            Some(&ClusterChangeOperation::MemberLeave {
                member: MemberId::from("2")
            })
        );
        let result = config.start_plan(operations).unwrap().simulate().unwrap();
        assert!(!result.has_member(&MemberId::from("2")));
        assert_eq!(result.partition_ids().len(), 3);
    }

    #[test]
    fn test_reassign_to_same_members_is_empty() {
        let config = bootstrapped(&["0", "1", "2"], 3, 2);
        let target = config.members.keys().cloned().collect();
        let operations = plan_reassignment(&config, &target, 2).unwrap();
        assert!(operations.is_empty());
    }

    #[test]
    fn test_remove_unknown_member_rejected() {
        let config = bootstrapped(&["0", "1"], 2, 1);
        let result = remove_members(BTreeSet::from([MemberId::from("9")]))(&config);
        assert!(result.is_err());
    }

    #[test]
    fn test_scale_partitions_plan_is_valid() {
        let config = bootstrapped(&["0", "1", "2"], 3, 2);
        let operations = scale_partitions(MemberId::from("0"), 5)(&config).unwrap();
        let result = config.start_plan(operations).unwrap().simulate().unwrap();
        assert_eq!(result.partition_config.partition_count, 5);
        assert_eq!(result.partition_ids().len(), 5);
        assert_eq!(result.replicas_of(5).len(), 2);
    }

    #[test]
    fn test_enable_then_disable_exporter_everywhere() {
        let config = bootstrapped(&["0", "1"], 2, 2);
        let enable = enable_exporter("elastic".to_string())(&config).unwrap();
        assert_eq!(enable.len(), 4);
        let enabled = config.start_plan(enable).unwrap().simulate().unwrap();

        let disable = disable_exporter("elastic".to_string())(&enabled).unwrap();
        assert_eq!(disable.len(), 4);
        assert!(disable_exporter("missing".to_string())(&enabled).is_err());
    }
}
