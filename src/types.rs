//! Common types used throughout the topology model.
//!
//! These are the per-member and per-partition building blocks of a
//! [`ClusterConfiguration`](crate::configuration::ClusterConfiguration). All
//! of them are plain values: a change produces a new value rather than
//! mutating a shared one.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of a partition.
pub type PartitionId = u32;

/// Stable identifier of a cluster member.
///
/// Member ids are opaque strings. When two ids are both numeric they order
/// numerically, so `"2" < "10"`. Numeric ids sort before all others, and
/// non-numeric ids order lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for MemberId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MemberId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u32> for MemberId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle of a member within the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// A `MemberJoin` operation is in progress.
    Joining,
    /// The member participates in the cluster.
    Active,
    /// A `MemberLeave` operation is in progress.
    Leaving,
    /// The member left; it is removed once the leave completes.
    Left,
}

/// Lifecycle of one partition replica on one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    /// A `PartitionJoin` is in progress.
    Joining,
    /// The replica is serving.
    Active,
    /// A `PartitionLeave` is in progress.
    Leaving,
    /// A `PartitionBootstrap` is creating the partition here.
    Bootstrapping,
}

/// State of one exporter on one partition replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterState {
    /// Whether the exporter runs.
    pub enabled: bool,
    /// Bumped every time the exporter is re-enabled.
    pub metadata_version: u64,
}

impl ExporterState {
    /// A freshly enabled exporter.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            metadata_version: 0,
        }
    }
}

/// A partition replica hosted by a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    /// Current lifecycle state.
    pub status: PartitionStatus,
    /// Priority used to rank leader candidates; higher wins.
    pub priority: u32,
    /// Exporters configured on this replica.
    pub exporters: BTreeMap<String, ExporterState>,
}

impl PartitionState {
    /// An active replica with the given priority.
    pub fn active(priority: u32) -> Self {
        Self::with_status(PartitionStatus::Active, priority)
    }

    /// A replica in the given state.
    pub fn with_status(status: PartitionStatus, priority: u32) -> Self {
        Self {
            status,
            priority,
            exporters: BTreeMap::new(),
        }
    }
}

/// Everything the configuration knows about one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    /// Bumped on every change to this member.
    pub version: u64,
    /// When this member's state last changed.
    pub last_updated: DateTime<Utc>,
    /// Membership lifecycle.
    pub status: MemberStatus,
    /// Partitions hosted by the member.
    pub partitions: BTreeMap<PartitionId, PartitionState>,
}

impl MemberState {
    /// A member in the given state hosting no partitions.
    pub fn new(status: MemberStatus) -> Self {
        Self {
            version: 0,
            last_updated: Utc::now(),
            status,
            partitions: BTreeMap::new(),
        }
    }

    /// An active member hosting the given partitions.
    pub fn active(partitions: BTreeMap<PartitionId, PartitionState>) -> Self {
        Self {
            partitions,
            ..Self::new(MemberStatus::Active)
        }
    }

    /// Whether the member hosts `partition` in any state.
    pub fn hosts(&self, partition: PartitionId) -> bool {
        self.partitions.contains_key(&partition)
    }

    /// Produce the next version of this member after `change`.
    pub(crate) fn updated(&self, change: impl FnOnce(&mut MemberState)) -> Self {
        let mut next = self.clone();
        change(&mut next);
        next.version = self.version + 1;
        next.last_updated = Utc::now();
        next
    }
}

/// Marker for an in-flight partition scale-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionScaling {
    /// Partition count once scaling completes.
    pub desired_partition_count: u32,
    /// New partitions whose data has been redistributed so far.
    pub redistributed: BTreeSet<PartitionId>,
}

/// Partition-wide settings shared by every partition.
///
/// Versioned on its own so that a partition-count change and a replica
/// movement never race over the same field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicPartitionConfig {
    /// Bumped whenever any field below changes.
    pub version: u64,
    /// Partitions requests are routed to.
    pub partition_count: u32,
    /// Target number of replicas per partition.
    pub replication_factor: u32,
    /// Present while a scale-up is in flight.
    pub scaling: Option<PartitionScaling>,
}

impl DynamicPartitionConfig {
    /// Settings for a freshly bootstrapped cluster.
    pub fn new(partition_count: u32, replication_factor: u32) -> Self {
        Self {
            version: 1,
            partition_count,
            replication_factor,
            scaling: None,
        }
    }

    /// Apply `change` and bump the version.
    pub(crate) fn updated(&self, change: impl FnOnce(&mut DynamicPartitionConfig)) -> Self {
        let mut next = self.clone();
        change(&mut next);
        next.version = self.version + 1;
        next
    }
}

impl Default for DynamicPartitionConfig {
    fn default() -> Self {
        Self {
            version: 0,
            partition_count: 0,
            replication_factor: 0,
            scaling: None,
        }
    }
}

/// Read-only view of one partition, derived from the configuration.
///
/// This is what routing layers consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    /// The partition.
    pub partition_id: PartitionId,
    /// Members hosting a replica.
    pub members: BTreeSet<MemberId>,
    /// Leader priority per replica.
    pub priorities: BTreeMap<MemberId, u32>,
    /// Target replica count.
    pub target_replication_factor: u32,
    /// Replica preferred as leader.
    pub primary: Option<MemberId>,
}

impl PartitionMetadata {
    /// Whether the replica set matches the target replication factor.
    pub fn is_fully_replicated(&self) -> bool {
        self.members.len() == self.target_replication_factor as usize
    }
}
