//! Executor SPI invoked by the coordinator, one call per operation.
//!
//! The partition lifecycle subsystem provides real implementations; the
//! `Noop*` types complete immediately and exist for tests and for nodes
//! that only track topology.
use crate::configuration::ClusterConfiguration;
use crate::error::TopologyResult;
use crate::operations::ClusterChangeOperation;
use crate::types::{DynamicPartitionConfig, MemberId, PartitionId};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Applies partition replica changes on a member.
#[async_trait]
pub trait PartitionChangeExecutor: Send + Sync {
    /// Start a replica of `partition` on `member` alongside `replicas`.
    async fn join(
        &self,
        member: &MemberId,
        partition: PartitionId,
        replicas: &BTreeMap<MemberId, u32>,
    ) -> TopologyResult<()>;

    /// Stop and remove `member`'s replica of `partition`.
    async fn leave(&self, member: &MemberId, partition: PartitionId) -> TopologyResult<()>;

    /// Apply a new leader priority.
    async fn reconfigure_priority(
        &self,
        member: &MemberId,
        partition: PartitionId,
        priority: u32,
    ) -> TopologyResult<()>;

    /// Create a brand new partition on `member`.
    async fn bootstrap(
        &self,
        member: &MemberId,
        partition: PartitionId,
        priority: u32,
        config: &DynamicPartitionConfig,
    ) -> TopologyResult<()>;

    /// Stop an exporter.
    async fn disable_exporter(
        &self,
        member: &MemberId,
        partition: PartitionId,
        exporter: &str,
    ) -> TopologyResult<()>;

    /// Start an exporter.
    async fn enable_exporter(
        &self,
        member: &MemberId,
        partition: PartitionId,
        exporter: &str,
    ) -> TopologyResult<()>;
}

/// Drives partition-count changes.
#[async_trait]
pub trait PartitionScalingChangeExecutor: Send + Sync {
    /// Prepare the cluster for `desired_partition_count` partitions.
    async fn initiate_scale_up(&self, desired_partition_count: u32) -> TopologyResult<()>;

    /// Resolve once data has been redistributed to `partitions`.
    async fn await_redistribution_completion(
        &self,
        desired_partition_count: u32,
        partitions: &BTreeSet<PartitionId>,
    ) -> TopologyResult<()>;
}

/// Adds members to and removes members from the underlying membership.
#[async_trait]
pub trait ClusterMembershipChangeExecutor: Send + Sync {
    /// A member is joining.
    async fn add_member(&self, member: &MemberId) -> TopologyResult<()>;

    /// A member is leaving.
    async fn remove_member(&self, member: &MemberId) -> TopologyResult<()>;
}

/// Partition executor that succeeds immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPartitionChangeExecutor;

#[async_trait]
impl PartitionChangeExecutor for NoopPartitionChangeExecutor {
    async fn join(
        &self,
        _member: &MemberId,
        _partition: PartitionId,
        _replicas: &BTreeMap<MemberId, u32>,
    ) -> TopologyResult<()> {
        Ok(())
    }

    async fn leave(&self, _member: &MemberId, _partition: PartitionId) -> TopologyResult<()> {
        Ok(())
    }

    async fn reconfigure_priority(
        &self,
        _member: &MemberId,
        _partition: PartitionId,
        _priority: u32,
    ) -> TopologyResult<()> {
        Ok(())
    }

    async fn bootstrap(
        &self,
        _member: &MemberId,
        _partition: PartitionId,
        _priority: u32,
        _config: &DynamicPartitionConfig,
    ) -> TopologyResult<()> {
        Ok(())
    }

    async fn disable_exporter(
        &self,
        _member: &MemberId,
        _partition: PartitionId,
        _exporter: &str,
    ) -> TopologyResult<()> {
        Ok(())
    }

    async fn enable_exporter(
        &self,
        _member: &MemberId,
        _partition: PartitionId,
        _exporter: &str,
    ) -> TopologyResult<()> {
        Ok(())
    }
}

/// Scaling executor that succeeds immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPartitionScalingChangeExecutor;

#[async_trait]
impl PartitionScalingChangeExecutor for NoopPartitionScalingChangeExecutor {
    async fn initiate_scale_up(&self, _desired_partition_count: u32) -> TopologyResult<()> {
        Ok(())
    }

    async fn await_redistribution_completion(
        &self,
        _desired_partition_count: u32,
        _partitions: &BTreeSet<PartitionId>,
    ) -> TopologyResult<()> {
        Ok(())
    }
}

/// Membership executor that succeeds immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClusterMembershipChangeExecutor;

#[async_trait]
impl ClusterMembershipChangeExecutor for NoopClusterMembershipChangeExecutor {
    async fn add_member(&self, _member: &MemberId) -> TopologyResult<()> {
        Ok(())
    }

    async fn remove_member(&self, _member: &MemberId) -> TopologyResult<()> {
        Ok(())
    }
}

/// The executors a coordinator dispatches to.
#[derive(Clone)]
pub struct ChangeExecutors {
    partitions: Arc<dyn PartitionChangeExecutor>,
    scaling: Arc<dyn PartitionScalingChangeExecutor>,
    membership: Arc<dyn ClusterMembershipChangeExecutor>,
}

impl ChangeExecutors {
    /// Bundle explicit executors.
    pub fn new(
        partitions: Arc<dyn PartitionChangeExecutor>,
        scaling: Arc<dyn PartitionScalingChangeExecutor>,
        membership: Arc<dyn ClusterMembershipChangeExecutor>,
    ) -> Self {
        Self {
            partitions,
            scaling,
            membership,
        }
    }

    /// Executors that do nothing.
    pub fn noop() -> Self {
        Self::new(
            Arc::new(NoopPartitionChangeExecutor),
            Arc::new(NoopPartitionScalingChangeExecutor),
            Arc::new(NoopClusterMembershipChangeExecutor),
        )
    }

    /// Replace the partition executor.
    pub fn with_partitions(mut self, partitions: Arc<dyn PartitionChangeExecutor>) -> Self {
        self.partitions = partitions;
        self
    }

    /// Replace the scaling executor.
    pub fn with_scaling(mut self, scaling: Arc<dyn PartitionScalingChangeExecutor>) -> Self {
        self.scaling = scaling;
        self
    }

    /// Replace the membership executor.
    pub fn with_membership(mut self, membership: Arc<dyn ClusterMembershipChangeExecutor>) -> Self {
        self.membership = membership;
        self
    }

    /// Run `operation` on the executor matching its variant.
    ///
    /// `config` is the configuration after the operation was started.
    pub async fn execute(
        &self,
        operation: &ClusterChangeOperation,
        config: &ClusterConfiguration,
    ) -> TopologyResult<()> {
        match operation {
            ClusterChangeOperation::MemberJoin { member } => self.membership.add_member(member).await,
            ClusterChangeOperation::MemberLeave { member } => {
                self.membership.remove_member(member).await
            }
            ClusterChangeOperation::PartitionJoin {
                member, partition, ..
            } => {
                let replicas = config.priorities_of(*partition);
                self.partitions.join(member, *partition, &replicas).await
            }
            ClusterChangeOperation::PartitionLeave {
                member, partition, ..
            } => self.partitions.leave(member, *partition).await,
            ClusterChangeOperation::PartitionReconfigurePriority {
                member,
                partition,
                priority,
            } => {
                self.partitions
                    .reconfigure_priority(member, *partition, *priority)
                    .await
            }
            ClusterChangeOperation::PartitionBootstrap {
                member,
                partition,
                priority,
            } => {
                self.partitions
                    .bootstrap(member, *partition, *priority, &config.partition_config)
                    .await
            }
            ClusterChangeOperation::PartitionDisableExporter {
                member,
                partition,
                exporter,
            } => {
                self.partitions
                    .disable_exporter(member, *partition, exporter)
                    .await
            }
            ClusterChangeOperation::PartitionEnableExporter {
                member,
                partition,
                exporter,
            } => {
                self.partitions
                    .enable_exporter(member, *partition, exporter)
                    .await
            }
            ClusterChangeOperation::StartPartitionScaleUp {
                desired_partition_count,
                ..
            } => self.scaling.initiate_scale_up(*desired_partition_count).await,
            ClusterChangeOperation::AwaitRedistributionCompletion {
                desired_partition_count,
                partitions,
                ..
            } => {
                self.scaling
                    .await_redistribution_completion(*desired_partition_count, partitions)
                    .await
            }
        }
    }
}

impl Default for ChangeExecutors {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for ChangeExecutors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeExecutors").finish_non_exhaustive()
    }
}
