//! The converging cluster configuration snapshot.
//!
//! A [`ClusterConfiguration`] is an immutable value: every change produces a
//! new snapshot. The store assigns versions; everything here only computes
//! the next state. Gossip keeps whichever snapshot carries the higher
//! version and never merges two snapshots field by field.
use crate::error::{TopologyError, TopologyResult};
use crate::operations::ClusterChangeOperation;
use crate::types::{
    DynamicPartitionConfig, MemberId, MemberState, MemberStatus, PartitionId, PartitionMetadata,
    PartitionState, PartitionStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Version carried by a node that has not been initialized yet.
pub const UNINITIALIZED_VERSION: u64 = 0;

/// Status of the plan currently being applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    /// Operations are being applied in order.
    InProgress,
    /// An executor failed; the plan is halted until retried or cancelled.
    Failed {
        /// The operation that failed.
        operation: ClusterChangeOperation,
        /// Why it failed.
        reason: String,
    },
}

/// An operation that has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedOperation {
    /// The applied operation.
    pub operation: ClusterChangeOperation,
    /// When it was applied.
    pub completed_at: DateTime<Utc>,
}

/// An ordered batch of operations committed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterChangePlan {
    /// Change id, unique within the cluster's lifetime.
    pub id: u64,
    /// The member that committed the plan and drives it.
    pub coordinator: MemberId,
    /// Bumped on every step of the plan.
    pub version: u64,
    /// When the plan was committed.
    pub started_at: DateTime<Utc>,
    /// Whether the plan is running or halted.
    pub status: ChangeStatus,
    /// Operations not applied yet, in execution order.
    pub pending: Vec<ClusterChangeOperation>,
    /// Operations already applied, in the order they were applied.
    pub completed: Vec<CompletedOperation>,
}

impl ClusterChangePlan {
    fn new(id: u64, coordinator: MemberId, pending: Vec<ClusterChangeOperation>) -> Self {
        Self {
            id,
            coordinator,
            version: 1,
            started_at: Utc::now(),
            status: ChangeStatus::InProgress,
            pending,
            completed: Vec::new(),
        }
    }

    /// The operation to apply next.
    pub fn next_operation(&self) -> Option<&ClusterChangeOperation> {
        self.pending.first()
    }

    /// Whether an executor failure halted the plan.
    pub fn is_failed(&self) -> bool {
        matches!(self.status, ChangeStatus::Failed { .. })
    }
}

/// How a change ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletedChangeStatus {
    /// Every operation was applied.
    Completed,
    /// A failed plan was dropped by an operator.
    Cancelled,
}

/// Summary of the most recent finished change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedChange {
    /// Change id.
    pub id: u64,
    /// How it ended.
    pub status: CompletedChangeStatus,
    /// When it was committed.
    pub started_at: DateTime<Utc>,
    /// When it finished.
    pub completed_at: DateTime<Utc>,
}

/// Result of comparing a received snapshot with the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The received snapshot has a higher version and replaces the local one.
    Adopted,
    /// Both snapshots are identical.
    Identical,
    /// The received snapshot is older than the local one.
    Stale,
    /// Same version, different content. The local snapshot is kept.
    Conflict,
}

/// The cluster's membership, partition distribution and in-flight changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    /// Primary ordering field for convergence.
    pub version: u64,
    /// Every known member and the partitions it hosts.
    pub members: BTreeMap<MemberId, MemberState>,
    /// The plan being applied, if any.
    pub pending_changes: Option<ClusterChangePlan>,
    /// The most recently finished plan.
    pub last_change: Option<CompletedChange>,
    /// Partition-wide settings.
    pub partition_config: DynamicPartitionConfig,
}

impl ClusterConfiguration {
    /// The configuration of a node that has not learned the topology yet.
    pub fn uninitialized() -> Self {
        Self {
            version: UNINITIALIZED_VERSION,
            members: BTreeMap::new(),
            pending_changes: None,
            last_change: None,
            partition_config: DynamicPartitionConfig::default(),
        }
    }

    /// An initialized configuration without members.
    pub fn new(partition_config: DynamicPartitionConfig) -> Self {
        Self {
            version: 1,
            partition_config,
            ..Self::uninitialized()
        }
    }

    /// Add or replace a member.
    pub fn with_member(mut self, member: impl Into<MemberId>, state: MemberState) -> Self {
        self.members.insert(member.into(), state);
        self
    }

    /// Whether this node has not learned the topology yet.
    pub fn is_uninitialized(&self) -> bool {
        self.version == UNINITIALIZED_VERSION
    }

    /// State of one member.
    pub fn member(&self, member: &MemberId) -> Option<&MemberState> {
        self.members.get(member)
    }

    /// Whether `member` is part of the configuration.
    pub fn has_member(&self, member: &MemberId) -> bool {
        self.members.contains_key(member)
    }

    /// The member that conventionally coordinates changes: the lowest active one.
    pub fn coordinator(&self) -> Option<&MemberId> {
        self.members
            .iter()
            .find(|(_, state)| state.status == MemberStatus::Active)
            .or_else(|| self.members.iter().next())
            .map(|(id, _)| id)
    }

    /// The member allowed to commit, drive, retry or cancel changes.
    ///
    /// A pending plan stays with the member that committed it, even when a
    /// later step makes that member leave. Otherwise it is [`Self::coordinator`].
    pub fn change_owner(&self) -> Option<&MemberId> {
        match &self.pending_changes {
            Some(plan) => Some(&plan.coordinator),
            None => self.coordinator(),
        }
    }

    /// Partitions hosted by `member`, in any state.
    pub fn partitions_of(&self, member: &MemberId) -> BTreeSet<PartitionId> {
        self.members
            .get(member)
            .map(|state| state.partitions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Every partition hosted by at least one member.
    pub fn partition_ids(&self) -> BTreeSet<PartitionId> {
        self.members
            .values()
            .flat_map(|state| state.partitions.keys().copied())
            .collect()
    }

    /// Replicas of `partition`, keyed by hosting member.
    pub fn replicas_of(&self, partition: PartitionId) -> BTreeMap<&MemberId, &PartitionState> {
        self.members
            .iter()
            .filter_map(|(id, state)| state.partitions.get(&partition).map(|p| (id, p)))
            .collect()
    }

    /// Leader priority per replica of `partition`.
    pub fn priorities_of(&self, partition: PartitionId) -> BTreeMap<MemberId, u32> {
        self.replicas_of(partition)
            .into_iter()
            .map(|(id, state)| (id.clone(), state.priority))
            .collect()
    }

    /// Routing view of every partition.
    pub fn partition_metadata(&self) -> Vec<PartitionMetadata> {
        self.partition_ids()
            .into_iter()
            .map(|partition| {
                let priorities = self.priorities_of(partition);
                // Highest priority wins; among equals the lowest member id.
                let primary = priorities
                    .iter()
                    .max_by(|(a_id, a), (b_id, b)| a.cmp(b).then_with(|| b_id.cmp(a_id)))
                    .map(|(id, _)| id.clone());
                PartitionMetadata {
                    partition_id: partition,
                    members: priorities.keys().cloned().collect(),
                    priorities,
                    target_replication_factor: self.partition_config.replication_factor,
                    primary,
                }
            })
            .collect()
    }

    /// Whether a plan is committed and not finished.
    pub fn has_pending_changes(&self) -> bool {
        self.pending_changes.is_some()
    }

    /// Operations still to apply, in order.
    pub fn pending_operations(&self) -> &[ClusterChangeOperation] {
        self.pending_changes
            .as_ref()
            .map(|plan| plan.pending.as_slice())
            .unwrap_or_default()
    }

    /// Id for the next committed plan.
    pub fn next_change_id(&self) -> u64 {
        let pending = self.pending_changes.as_ref().map_or(0, |plan| plan.id);
        let last = self.last_change.as_ref().map_or(0, |change| change.id);
        pending.max(last) + 1
    }

    /// Decide what to do with a snapshot received from a peer.
    pub fn merge(&self, received: &ClusterConfiguration) -> MergeOutcome {
        match received.version.cmp(&self.version) {
            Ordering::Greater => MergeOutcome::Adopted,
            Ordering::Less => MergeOutcome::Stale,
            Ordering::Equal if received == self => MergeOutcome::Identical,
            Ordering::Equal => MergeOutcome::Conflict,
        }
    }

    /// Replace one member's state.
    pub(crate) fn put_member(&self, member: &MemberId, state: MemberState) -> Self {
        let mut next = self.clone();
        next.members.insert(member.clone(), state);
        next
    }

    /// Update an existing member, bumping its version.
    pub(crate) fn update_member(
        &self,
        member: &MemberId,
        change: impl FnOnce(&mut MemberState),
    ) -> TopologyResult<Self> {
        let state = self
            .member(member)
            .ok_or_else(|| TopologyError::invalid(format!("member {} does not exist", member)))?;
        Ok(self.put_member(member, state.updated(change)))
    }

    /// Drop a member entirely.
    pub(crate) fn remove_member(&self, member: &MemberId) -> Self {
        let mut next = self.clone();
        next.members.remove(member);
        next
    }

    /// Update the partition-wide settings, bumping their version.
    pub(crate) fn update_partition_config(
        &self,
        change: impl FnOnce(&mut DynamicPartitionConfig),
    ) -> Self {
        let mut next = self.clone();
        next.partition_config = self.partition_config.updated(change);
        next
    }

    /// Commit `operations` as a plan.
    ///
    /// A halted (failed) plan absorbs the new operations and resumes from
    /// the failed one. The resulting pending list is validated by simulating
    /// it in order from this configuration. An empty list returns `self`
    /// unchanged.
    pub fn start_plan(&self, operations: Vec<ClusterChangeOperation>) -> TopologyResult<Self> {
        if self.is_uninitialized() {
            return Err(TopologyError::NotInitialized);
        }
        if operations.is_empty() {
            return Ok(self.clone());
        }

        let mut next = self.clone();
        next.pending_changes = Some(match &self.pending_changes {
            Some(plan) if !plan.is_failed() => {
                return Err(TopologyError::ChangeInProgress { change_id: plan.id });
            }
            Some(plan) => {
                let mut plan = plan.clone();
                plan.pending.extend(operations);
                plan.status = ChangeStatus::InProgress;
                plan.version += 1;
                plan
            }
            None => {
                let coordinator = self
                    .coordinator()
                    .cloned()
                    .ok_or_else(|| TopologyError::invalid("the configuration has no members"))?;
                ClusterChangePlan::new(self.next_change_id(), coordinator, operations)
            }
        });

        next.simulate()?;
        Ok(next)
    }

    /// Apply every pending operation to a copy and return the final state.
    pub fn simulate(&self) -> TopologyResult<Self> {
        let mut current = self.clone();
        for (index, operation) in self.pending_operations().iter().enumerate() {
            current = operation
                .start(&current)
                .and_then(|started| operation.complete(&started))
                .map_err(|error| match error {
                    TopologyError::InvalidRequest { reason } => TopologyError::invalid(format!(
                        "operation #{} {} is not applicable: {}",
                        index + 1,
                        operation,
                        reason
                    )),
                    other => other,
                })?;
        }
        current.pending_changes = None;
        Ok(current)
    }

    /// Move the next pending operation into its in-progress state.
    pub(crate) fn start_operation(&self, operation: &ClusterChangeOperation) -> TopologyResult<Self> {
        self.expect_next(operation)?;
        operation.start(self)
    }

    /// Apply the next pending operation and dequeue it.
    pub(crate) fn complete_operation(
        &self,
        operation: &ClusterChangeOperation,
    ) -> TopologyResult<Self> {
        let plan = self.expect_next(operation)?;
        let mut next = operation.complete(self)?;

        let mut plan = plan.clone();
        plan.pending.remove(0);
        plan.completed.push(CompletedOperation {
            operation: operation.clone(),
            completed_at: Utc::now(),
        });
        plan.version += 1;

        if plan.pending.is_empty() {
            next.last_change = Some(CompletedChange {
                id: plan.id,
                status: CompletedChangeStatus::Completed,
                started_at: plan.started_at,
                completed_at: Utc::now(),
            });
            next.pending_changes = None;
        } else {
            next.pending_changes = Some(plan);
        }
        Ok(next)
    }

    /// Halt the plan at `operation`.
    pub(crate) fn fail_operation(
        &self,
        operation: &ClusterChangeOperation,
        reason: impl Into<String>,
    ) -> TopologyResult<Self> {
        let mut plan = self.expect_next(operation)?.clone();
        plan.status = ChangeStatus::Failed {
            operation: operation.clone(),
            reason: reason.into(),
        };
        plan.version += 1;

        let mut next = self.clone();
        next.pending_changes = Some(plan);
        Ok(next)
    }

    /// Resume a failed plan from the failed operation.
    pub fn retry_failed_plan(&self) -> TopologyResult<Self> {
        let mut plan = self.failed_plan()?.clone();
        plan.status = ChangeStatus::InProgress;
        plan.version += 1;

        let mut next = self.clone();
        next.pending_changes = Some(plan);
        Ok(next)
    }

    /// Drop the remaining operations of a failed plan.
    ///
    /// Replicas left in a transitional state stay as they are; later plans
    /// can complete or revert them.
    pub fn cancel_failed_plan(&self) -> TopologyResult<Self> {
        let plan = self.failed_plan()?;

        let mut next = self.clone();
        next.last_change = Some(CompletedChange {
            id: plan.id,
            status: CompletedChangeStatus::Cancelled,
            started_at: plan.started_at,
            completed_at: Utc::now(),
        });
        next.pending_changes = None;
        Ok(next)
    }

    fn failed_plan(&self) -> TopologyResult<&ClusterChangePlan> {
        match &self.pending_changes {
            Some(plan) if plan.is_failed() => Ok(plan),
            Some(plan) => Err(TopologyError::ChangeInProgress { change_id: plan.id }),
            None => Err(TopologyError::NoChangeToCancel),
        }
    }

    fn expect_next(&self, operation: &ClusterChangeOperation) -> TopologyResult<&ClusterChangePlan> {
        let plan = self
            .pending_changes
            .as_ref()
            .ok_or_else(|| TopologyError::invalid("there is no pending change"))?;
        match plan.next_operation() {
            Some(next) if next == operation => Ok(plan),
            Some(next) => Err(TopologyError::invalid(format!(
                "expected next operation {}, got {}",
                next, operation
            ))),
            None => Err(TopologyError::invalid("the pending change has no operations")),
        }
    }

    /// Status of `member`'s replica of `partition`.
    pub fn partition_status(&self, member: &MemberId, partition: PartitionId) -> Option<PartitionStatus> {
        self.member(member)
            .and_then(|state| state.partitions.get(&partition))
            .map(|state| state.status)
    }
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self::uninitialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionState;

    fn member(partitions: &[(PartitionId, u32)]) -> MemberState {
        MemberState::active(
            partitions
                .iter()
                .map(|(id, priority)| (*id, PartitionState::active(*priority)))
                .collect(),
        )
    }

    fn three_members() -> ClusterConfiguration {
        ClusterConfiguration::new(DynamicPartitionConfig::new(2, 3))
            .with_member("0", member(&[(1, 3), (2, 1)]))
            .with_member("1", member(&[(1, 2)]))
            .with_member("2", member(&[(1, 1)]))
    }

    #[test]
    fn test_uninitialized() {
        let config = ClusterConfiguration::uninitialized();
        assert!(config.is_uninitialized());
        assert!(!config.has_pending_changes());
        assert_eq!(config.next_change_id(), 1);
    }

    #[test]
    fn test_merge_prefers_higher_version() {
        let local = three_members();
        let mut remote = local.clone();
        remote.version = local.version + 1;

        assert_eq!(local.merge(&remote), MergeOutcome::Adopted);
        assert_eq!(remote.merge(&local), MergeOutcome::Stale);
        assert_eq!(local.merge(&local.clone()), MergeOutcome::Identical);
    }

    #[test]
    fn test_merge_equal_version_different_content_is_conflict() {
        let local = three_members();
        let remote = local.remove_member(&MemberId::from("2"));
        assert_eq!(local.merge(&remote), MergeOutcome::Conflict);
    }

    #[test]
    fn test_partition_metadata_primary_is_highest_priority() {
        let metadata = three_members().partition_metadata();
        assert_eq!(metadata.len(), 2);

        let p1 = &metadata[0];
        assert_eq!(p1.partition_id, 1);
        assert_eq!(p1.members.len(), 3);
        assert_eq!(p1.primary, Some(MemberId::from("0")));
        assert!(p1.is_fully_replicated());

        let p2 = &metadata[1];
        assert_eq!(p2.members.len(), 1);
        assert!(!p2.is_fully_replicated());
    }

    #[test]
    fn test_primary_tie_breaks_on_lowest_member() {
        let config = ClusterConfiguration::new(DynamicPartitionConfig::new(1, 2))
            .with_member("5", member(&[(1, 1)]))
            .with_member("3", member(&[(1, 1)]));
        let metadata = config.partition_metadata();
        assert_eq!(metadata[0].primary, Some(MemberId::from("3")));
    }

    #[test]
    fn test_start_plan_empty_is_noop() {
        let config = three_members();
        let next = config.start_plan(Vec::new()).unwrap();
        assert_eq!(next, config);
    }

    #[test]
    fn test_start_plan_rejects_uninitialized() {
        let config = ClusterConfiguration::uninitialized();
        let result = config.start_plan(vec![ClusterChangeOperation::MemberJoin {
            member: MemberId::from("0"),
        }]);
        assert!(matches!(result, Err(TopologyError::NotInitialized)));
    }

    #[test]
    fn test_start_plan_rejects_while_in_progress() {
        let config = three_members()
            .start_plan(vec![ClusterChangeOperation::MemberJoin {
                member: MemberId::from("3"),
            }])
            .unwrap();
        let result = config.start_plan(vec![ClusterChangeOperation::MemberJoin {
            member: MemberId::from("4"),
        }]);
        assert!(matches!(result, Err(TopologyError::ChangeInProgress { change_id: 1 })));
    }

    #[test]
    fn test_complete_operations_in_order() {
        let join = ClusterChangeOperation::MemberJoin {
            member: MemberId::from("3"),
        };
        let config = three_members().start_plan(vec![join.clone()]).unwrap();

        let started = config.start_operation(&join).unwrap();
        assert_eq!(
            started.member(&MemberId::from("3")).unwrap().status,
            MemberStatus::Joining
        );

        let done = started.complete_operation(&join).unwrap();
        assert!(!done.has_pending_changes());
        let last = done.last_change.unwrap();
        assert_eq!(last.id, 1);
        assert_eq!(last.status, CompletedChangeStatus::Completed);
        assert_eq!(done.members[&MemberId::from("3")].status, MemberStatus::Active);
    }

    #[test]
    fn test_complete_rejects_out_of_order_operation() {
        let first = ClusterChangeOperation::MemberJoin {
            member: MemberId::from("3"),
        };
        let second = ClusterChangeOperation::MemberJoin {
            member: MemberId::from("4"),
        };
        let config = three_members()
            .start_plan(vec![first, second.clone()])
            .unwrap();
        assert!(config.complete_operation(&second).is_err());
    }

    #[test]
    fn test_failed_plan_can_be_cancelled_but_not_in_progress_plan() {
        let join = ClusterChangeOperation::MemberJoin {
            member: MemberId::from("3"),
        };
        let config = three_members().start_plan(vec![join.clone()]).unwrap();
        assert!(matches!(
            config.cancel_failed_plan(),
            Err(TopologyError::ChangeInProgress { .. })
        ));

        let failed = config.fail_operation(&join, "boom").unwrap();
        assert!(failed.pending_changes.as_ref().unwrap().is_failed());

        let cancelled = failed.cancel_failed_plan().unwrap();
        assert!(!cancelled.has_pending_changes());
        assert_eq!(
            cancelled.last_change.unwrap().status,
            CompletedChangeStatus::Cancelled
        );
    }

    #[test]
    fn test_failed_plan_absorbs_new_operations() {
        let join = ClusterChangeOperation::MemberJoin {
            member: MemberId::from("3"),
        };
        let another = ClusterChangeOperation::MemberJoin {
            member: MemberId::from("4"),
        };
        let failed = three_members()
            .start_plan(vec![join.clone()])
            .unwrap()
            .fail_operation(&join, "boom")
            .unwrap();

        let resumed = failed.start_plan(vec![another.clone()]).unwrap();
        let plan = resumed.pending_changes.unwrap();
        assert_eq!(plan.id, 1);
        assert_eq!(plan.status, ChangeStatus::InProgress);
        assert_eq!(plan.pending, vec![join, another]);
    }

    #[test]
    fn test_plan_stays_with_committing_coordinator() {
        let config = three_members();
        assert_eq!(config.change_owner(), Some(&MemberId::from("0")));

        let leave = ClusterChangeOperation::MemberLeave {
            member: MemberId::from("0"),
        };
        let mut planned = config.clone();
        planned.members.get_mut(&MemberId::from("0")).unwrap().partitions.clear();
        let planned = planned.start_plan(vec![leave.clone()]).unwrap();
        let leaving = planned.start_operation(&leave).unwrap();

        // The lowest active member moved on, the plan did not.
        assert_eq!(leaving.coordinator(), Some(&MemberId::from("1")));
        assert_eq!(leaving.change_owner(), Some(&MemberId::from("0")));

        let done = leaving.complete_operation(&leave).unwrap();
        assert_eq!(done.change_owner(), Some(&MemberId::from("1")));
    }

    #[test]
    fn test_start_plan_without_members_is_rejected() {
        let config = ClusterConfiguration::new(DynamicPartitionConfig::new(1, 1));
        let result = config.start_plan(vec![ClusterChangeOperation::MemberJoin {
            member: MemberId::from("0"),
        }]);
        assert!(matches!(result, Err(TopologyError::InvalidRequest { .. })));
    }

    #[test]
    fn test_cancel_without_plan() {
        assert!(matches!(
            three_members().cancel_failed_plan(),
            Err(TopologyError::NoChangeToCancel)
        ));
    }
}
