//! Topology change operations.
//!
//! Every [`ClusterChangeOperation`] moves through two transitions:
//!
//! - `start` validates the operation against the configuration and moves the
//!   affected member or replica into its in-progress state. Starting an
//!   operation that is already in progress is a no-op, so a plan can be
//!   resumed after a restart.
//! - `complete` records the outcome once the executor finished.
//!
//! Neither transition touches the plan itself; see
//! [`ClusterConfiguration::complete_operation`].
use crate::configuration::ClusterConfiguration;
use crate::error::{TopologyError, TopologyResult};
use crate::types::{
    ExporterState, MemberId, MemberState, MemberStatus, PartitionId, PartitionScaling,
    PartitionState, PartitionStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single topology mutation. Plans are ordered lists of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterChangeOperation {
    /// Add a member to the cluster.
    MemberJoin { member: MemberId },
    /// Remove a member that no longer hosts partitions.
    MemberLeave { member: MemberId },
    /// Add a replica of an existing partition on `member`.
    PartitionJoin {
        member: MemberId,
        partition: PartitionId,
        priority: u32,
    },
    /// Remove `member`'s replica, keeping at least `minimum_allowed_replicas` others.
    PartitionLeave {
        member: MemberId,
        partition: PartitionId,
        minimum_allowed_replicas: u32,
    },
    /// Change the leader priority of `member`'s replica.
    PartitionReconfigurePriority {
        member: MemberId,
        partition: PartitionId,
        priority: u32,
    },
    /// Create a new partition on `member` during a scale-up.
    PartitionBootstrap {
        member: MemberId,
        partition: PartitionId,
        priority: u32,
    },
    /// Stop an exporter on `member`'s replica.
    PartitionDisableExporter {
        member: MemberId,
        partition: PartitionId,
        exporter: String,
    },
    /// Start (or restart) an exporter on `member`'s replica.
    PartitionEnableExporter {
        member: MemberId,
        partition: PartitionId,
        exporter: String,
    },
    /// Begin growing the partition count.
    StartPartitionScaleUp {
        member: MemberId,
        desired_partition_count: u32,
    },
    /// Wait until data has been redistributed to the given new partitions.
    AwaitRedistributionCompletion {
        member: MemberId,
        desired_partition_count: u32,
        partitions: BTreeSet<PartitionId>,
    },
}

impl ClusterChangeOperation {
    /// `PartitionJoin` shorthand.
    pub fn partition_join(member: impl Into<MemberId>, partition: PartitionId, priority: u32) -> Self {
        Self::PartitionJoin {
            member: member.into(),
            partition,
            priority,
        }
    }

    /// `PartitionLeave` shorthand.
    pub fn partition_leave(
        member: impl Into<MemberId>,
        partition: PartitionId,
        minimum_allowed_replicas: u32,
    ) -> Self {
        Self::PartitionLeave {
            member: member.into(),
            partition,
            minimum_allowed_replicas,
        }
    }

    /// The member that executes the operation.
    pub fn member(&self) -> &MemberId {
        match self {
            Self::MemberJoin { member }
            | Self::MemberLeave { member }
            | Self::PartitionJoin { member, .. }
            | Self::PartitionLeave { member, .. }
            | Self::PartitionReconfigurePriority { member, .. }
            | Self::PartitionBootstrap { member, .. }
            | Self::PartitionDisableExporter { member, .. }
            | Self::PartitionEnableExporter { member, .. }
            | Self::StartPartitionScaleUp { member, .. }
            | Self::AwaitRedistributionCompletion { member, .. } => member,
        }
    }

    /// The partition the operation targets, if it targets one.
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            Self::PartitionJoin { partition, .. }
            | Self::PartitionLeave { partition, .. }
            | Self::PartitionReconfigurePriority { partition, .. }
            | Self::PartitionBootstrap { partition, .. }
            | Self::PartitionDisableExporter { partition, .. }
            | Self::PartitionEnableExporter { partition, .. } => Some(*partition),
            _ => None,
        }
    }

    /// Short name of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MemberJoin { .. } => "MemberJoin",
            Self::MemberLeave { .. } => "MemberLeave",
            Self::PartitionJoin { .. } => "PartitionJoin",
            Self::PartitionLeave { .. } => "PartitionLeave",
            Self::PartitionReconfigurePriority { .. } => "PartitionReconfigurePriority",
            Self::PartitionBootstrap { .. } => "PartitionBootstrap",
            Self::PartitionDisableExporter { .. } => "PartitionDisableExporter",
            Self::PartitionEnableExporter { .. } => "PartitionEnableExporter",
            Self::StartPartitionScaleUp { .. } => "StartPartitionScaleUp",
            Self::AwaitRedistributionCompletion { .. } => "AwaitRedistributionCompletion",
        }
    }

    /// Validate against `config` and enter the in-progress state.
    pub fn start(&self, config: &ClusterConfiguration) -> TopologyResult<ClusterConfiguration> {
        match self {
            Self::MemberJoin { member } => match config.member(member).map(|m| m.status) {
                None => Ok(config.put_member(member, MemberState::new(MemberStatus::Joining))),
                Some(MemberStatus::Joining) => Ok(config.clone()),
                Some(status) => Err(TopologyError::invalid(format!(
                    "member {} is already part of the cluster ({:?})",
                    member, status
                ))),
            },

            Self::MemberLeave { member } => {
                let state = existing_member(config, member)?;
                if !state.partitions.is_empty() {
                    return Err(TopologyError::invalid(format!(
                        "member {} still hosts partitions {:?}",
                        member,
                        state.partitions.keys().collect::<Vec<_>>()
                    )));
                }
                match state.status {
                    MemberStatus::Active => {
                        config.update_member(member, |m| m.status = MemberStatus::Leaving)
                    }
                    MemberStatus::Leaving => Ok(config.clone()),
                    status => Err(TopologyError::invalid(format!(
                        "member {} cannot leave while {:?}",
                        member, status
                    ))),
                }
            }

            Self::PartitionJoin {
                member,
                partition,
                priority,
            } => {
                active_member(config, member)?;
                match config.partition_status(member, *partition) {
                    Some(PartitionStatus::Joining) => return Ok(config.clone()),
                    Some(status) => {
                        return Err(TopologyError::invalid(format!(
                            "member {} already hosts partition {} ({:?})",
                            member, partition, status
                        )));
                    }
                    None => {}
                }
                let replicas = config.replicas_of(*partition);
                let Some((_, template)) = replicas.iter().next() else {
                    return Err(TopologyError::invalid(format!(
                        "partition {} does not exist",
                        partition
                    )));
                };
                // New replicas inherit the exporter set of an existing one.
                let exporters = template.exporters.clone();
                config.update_member(member, |m| {
                    m.partitions.insert(
                        *partition,
                        PartitionState {
                            status: PartitionStatus::Joining,
                            priority: *priority,
                            exporters,
                        },
                    );
                })
            }

            Self::PartitionLeave {
                member,
                partition,
                minimum_allowed_replicas,
            } => {
                existing_member(config, member)?;
                let status = hosted_status(config, member, *partition)?;
                let remaining = config
                    .replicas_of(*partition)
                    .into_iter()
                    .filter(|(id, state)| *id != member && state.status != PartitionStatus::Leaving)
                    .count();
                if remaining < *minimum_allowed_replicas as usize {
                    return Err(TopologyError::invalid(format!(
                        "partition {} would keep {} replicas after {} leaves, at least {} required",
                        partition, remaining, member, minimum_allowed_replicas
                    )));
                }
                match status {
                    PartitionStatus::Active => config.update_member(member, |m| {
                        if let Some(p) = m.partitions.get_mut(partition) {
                            p.status = PartitionStatus::Leaving;
                        }
                    }),
                    PartitionStatus::Leaving => Ok(config.clone()),
                    status => Err(TopologyError::invalid(format!(
                        "partition {} on member {} cannot leave while {:?}",
                        partition, member, status
                    ))),
                }
            }

            Self::PartitionReconfigurePriority {
                member, partition, ..
            }
            | Self::PartitionDisableExporter {
                member, partition, ..
            }
            | Self::PartitionEnableExporter {
                member, partition, ..
            } => {
                existing_member(config, member)?;
                let status = hosted_status(config, member, *partition)?;
                if status != PartitionStatus::Active {
                    return Err(TopologyError::invalid(format!(
                        "partition {} on member {} is not active ({:?})",
                        partition, member, status
                    )));
                }
                self.check_exporter(config)?;
                Ok(config.clone())
            }

            Self::PartitionBootstrap {
                member,
                partition,
                priority,
            } => {
                active_member(config, member)?;
                if config.partition_status(member, *partition) == Some(PartitionStatus::Bootstrapping) {
                    return Ok(config.clone());
                }
                if !config.replicas_of(*partition).is_empty() {
                    return Err(TopologyError::invalid(format!(
                        "partition {} already exists",
                        partition
                    )));
                }
                let partitions = &config.partition_config;
                let Some(scaling) = &partitions.scaling else {
                    return Err(TopologyError::invalid(format!(
                        "partition {} can only be bootstrapped during a scale-up",
                        partition
                    )));
                };
                if *partition <= partitions.partition_count
                    || *partition > scaling.desired_partition_count
                {
                    return Err(TopologyError::invalid(format!(
                        "partition {} is outside the scale-up range {}..={}",
                        partition,
                        partitions.partition_count + 1,
                        scaling.desired_partition_count
                    )));
                }
                config.update_member(member, |m| {
                    m.partitions.insert(
                        *partition,
                        PartitionState::with_status(PartitionStatus::Bootstrapping, *priority),
                    );
                })
            }

            Self::StartPartitionScaleUp {
                member,
                desired_partition_count,
            } => {
                existing_member(config, member)?;
                let partitions = &config.partition_config;
                if partitions.scaling.is_some() {
                    return Err(TopologyError::invalid("a scale-up is already in progress"));
                }
                if *desired_partition_count <= partitions.partition_count {
                    return Err(TopologyError::invalid(format!(
                        "desired partition count {} must exceed the current count {}",
                        desired_partition_count, partitions.partition_count
                    )));
                }
                Ok(config.clone())
            }

            Self::AwaitRedistributionCompletion {
                member,
                desired_partition_count,
                partitions,
            } => {
                existing_member(config, member)?;
                let scaling = active_scaling(config, *desired_partition_count)?;
                let current = config.partition_config.partition_count;
                for partition in partitions {
                    if *partition <= current || *partition > scaling.desired_partition_count {
                        return Err(TopologyError::invalid(format!(
                            "partition {} is not part of the scale-up",
                            partition
                        )));
                    }
                    let active = config
                        .replicas_of(*partition)
                        .values()
                        .any(|state| state.status == PartitionStatus::Active);
                    if !active {
                        return Err(TopologyError::invalid(format!(
                            "partition {} has no active replica yet",
                            partition
                        )));
                    }
                }
                Ok(config.clone())
            }
        }
    }

    /// Record the outcome after the executor finished.
    pub fn complete(&self, config: &ClusterConfiguration) -> TopologyResult<ClusterConfiguration> {
        match self {
            Self::MemberJoin { member } => {
                expect_member_status(config, member, MemberStatus::Joining)?;
                config.update_member(member, |m| m.status = MemberStatus::Active)
            }

            Self::MemberLeave { member } => {
                expect_member_status(config, member, MemberStatus::Leaving)?;
                Ok(config.remove_member(member))
            }

            Self::PartitionJoin {
                member, partition, ..
            } => {
                expect_partition_status(config, member, *partition, PartitionStatus::Joining)?;
                set_partition_status(config, member, *partition, PartitionStatus::Active)
            }

            Self::PartitionBootstrap {
                member, partition, ..
            } => {
                expect_partition_status(config, member, *partition, PartitionStatus::Bootstrapping)?;
                set_partition_status(config, member, *partition, PartitionStatus::Active)
            }

            Self::PartitionLeave {
                member, partition, ..
            } => {
                expect_partition_status(config, member, *partition, PartitionStatus::Leaving)?;
                config.update_member(member, |m| {
                    m.partitions.remove(partition);
                })
            }

            Self::PartitionReconfigurePriority {
                member,
                partition,
                priority,
            } => {
                expect_partition_status(config, member, *partition, PartitionStatus::Active)?;
                config.update_member(member, |m| {
                    if let Some(p) = m.partitions.get_mut(partition) {
                        p.priority = *priority;
                    }
                })
            }

            Self::PartitionDisableExporter {
                member,
                partition,
                exporter,
            } => {
                expect_partition_status(config, member, *partition, PartitionStatus::Active)?;
                config.update_member(member, |m| {
                    if let Some(state) = m
                        .partitions
                        .get_mut(partition)
                        .and_then(|p| p.exporters.get_mut(exporter))
                    {
                        state.enabled = false;
                    }
                })
            }

            Self::PartitionEnableExporter {
                member,
                partition,
                exporter,
            } => {
                expect_partition_status(config, member, *partition, PartitionStatus::Active)?;
                config.update_member(member, |m| {
                    if let Some(p) = m.partitions.get_mut(partition) {
                        p.exporters
                            .entry(exporter.clone())
                            .and_modify(|state| {
                                state.enabled = true;
                                state.metadata_version += 1;
                            })
                            .or_insert_with(ExporterState::enabled);
                    }
                })
            }

            Self::StartPartitionScaleUp {
                desired_partition_count,
                ..
            } => Ok(config.update_partition_config(|partitions| {
                partitions.scaling = Some(PartitionScaling {
                    desired_partition_count: *desired_partition_count,
                    redistributed: BTreeSet::new(),
                });
            })),

            Self::AwaitRedistributionCompletion {
                desired_partition_count,
                partitions,
                ..
            } => {
                let scaling = active_scaling(config, *desired_partition_count)?;
                let mut redistributed = scaling.redistributed.clone();
                redistributed.extend(partitions.iter().copied());

                let current = config.partition_config.partition_count;
                let finished = (current + 1..=*desired_partition_count)
                    .all(|partition| redistributed.contains(&partition));

                Ok(config.update_partition_config(|config| {
                    if finished {
                        config.partition_count = *desired_partition_count;
                        config.scaling = None;
                    } else if let Some(scaling) = config.scaling.as_mut() {
                        scaling.redistributed = redistributed;
                    }
                }))
            }
        }
    }

    fn check_exporter(&self, config: &ClusterConfiguration) -> TopologyResult<()> {
        let (member, partition, exporter, enabling) = match self {
            Self::PartitionDisableExporter {
                member,
                partition,
                exporter,
            } => (member, partition, exporter, false),
            Self::PartitionEnableExporter {
                member,
                partition,
                exporter,
            } => (member, partition, exporter, true),
            _ => return Ok(()),
        };
        let state = config
            .member(member)
            .and_then(|m| m.partitions.get(partition))
            .and_then(|p| p.exporters.get(exporter));
        match (enabling, state) {
            (false, None) => Err(TopologyError::invalid(format!(
                "exporter {} is not configured on partition {}",
                exporter, partition
            ))),
            (false, Some(state)) if !state.enabled => Err(TopologyError::invalid(format!(
                "exporter {} is already disabled on partition {}",
                exporter, partition
            ))),
            (true, Some(state)) if state.enabled => Err(TopologyError::invalid(format!(
                "exporter {} is already enabled on partition {}",
                exporter, partition
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ClusterChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemberJoin { member } | Self::MemberLeave { member } => {
                write!(f, "{}(member={})", self.name(), member)
            }
            Self::PartitionJoin {
                member,
                partition,
                priority,
            }
            | Self::PartitionReconfigurePriority {
                member,
                partition,
                priority,
            }
            | Self::PartitionBootstrap {
                member,
                partition,
                priority,
            } => write!(
                f,
                "{}(member={}, partition={}, priority={})",
                self.name(),
                member,
                partition,
                priority
            ),
            Self::PartitionLeave {
                member,
                partition,
                minimum_allowed_replicas,
            } => write!(
                f,
                "{}(member={}, partition={}, minimumReplicas={})",
                self.name(),
                member,
                partition,
                minimum_allowed_replicas
            ),
            Self::PartitionDisableExporter {
                member,
                partition,
                exporter,
            }
            | Self::PartitionEnableExporter {
                member,
                partition,
                exporter,
            } => write!(
                f,
                "{}(member={}, partition={}, exporter={})",
                self.name(),
                member,
                partition,
                exporter
            ),
            Self::StartPartitionScaleUp {
                member,
                desired_partition_count,
            } => write!(
                f,
                "{}(member={}, partitionCount={})",
                self.name(),
                member,
                desired_partition_count
            ),
            Self::AwaitRedistributionCompletion {
                member,
                desired_partition_count,
                partitions,
            } => write!(
                f,
                "{}(member={}, partitionCount={}, partitions={:?})",
                self.name(),
                member,
                desired_partition_count,
                partitions
            ),
        }
    }
}

fn existing_member<'a>(
    config: &'a ClusterConfiguration,
    member: &MemberId,
) -> TopologyResult<&'a MemberState> {
    config
        .member(member)
        .ok_or_else(|| TopologyError::invalid(format!("member {} does not exist", member)))
}

fn active_member<'a>(
    config: &'a ClusterConfiguration,
    member: &MemberId,
) -> TopologyResult<&'a MemberState> {
    let state = existing_member(config, member)?;
    if state.status != MemberStatus::Active {
        return Err(TopologyError::invalid(format!(
            "member {} is not active ({:?})",
            member, state.status
        )));
    }
    Ok(state)
}

fn hosted_status(
    config: &ClusterConfiguration,
    member: &MemberId,
    partition: PartitionId,
) -> TopologyResult<PartitionStatus> {
    config.partition_status(member, partition).ok_or_else(|| {
        TopologyError::invalid(format!(
            "member {} does not host partition {}",
            member, partition
        ))
    })
}

fn active_scaling(
    config: &ClusterConfiguration,
    desired_partition_count: u32,
) -> TopologyResult<&PartitionScaling> {
    match &config.partition_config.scaling {
        Some(scaling) if scaling.desired_partition_count == desired_partition_count => Ok(scaling),
        Some(scaling) => Err(TopologyError::invalid(format!(
            "scale-up in progress targets {} partitions, not {}",
            scaling.desired_partition_count, desired_partition_count
        ))),
        None => Err(TopologyError::invalid("no scale-up is in progress")),
    }
}

fn expect_member_status(
    config: &ClusterConfiguration,
    member: &MemberId,
    expected: MemberStatus,
) -> TopologyResult<()> {
    let status = existing_member(config, member)?.status;
    if status != expected {
        return Err(TopologyError::invalid(format!(
            "member {} is {:?}, expected {:?}",
            member, status, expected
        )));
    }
    Ok(())
}

fn expect_partition_status(
    config: &ClusterConfiguration,
    member: &MemberId,
    partition: PartitionId,
    expected: PartitionStatus,
) -> TopologyResult<()> {
    let status = hosted_status(config, member, partition)?;
    if status != expected {
        return Err(TopologyError::invalid(format!(
            "partition {} on member {} is {:?}, expected {:?}",
            partition, member, status, expected
        )));
    }
    Ok(())
}

fn set_partition_status(
    config: &ClusterConfiguration,
    member: &MemberId,
    partition: PartitionId,
    status: PartitionStatus,
) -> TopologyResult<ClusterConfiguration> {
    config.update_member(member, |m| {
        if let Some(p) = m.partitions.get_mut(&partition) {
            p.status = status;
        }
    })
}
