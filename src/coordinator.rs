//! Serializes topology changes into plans and drives them to completion.
//!
//! A plan is committed by persisting it in the configuration's
//! `pending_changes`. From then on the operations run strictly in order, one
//! executor call each, and every completed step is persisted as a new
//! configuration version before the next one starts. A failing executor
//! halts the plan where it is; the plan stays visible and can be retried,
//! extended or cancelled.
//!
//! Only the configuration's coordinator commits plans, and a committed plan
//! stays with the member that committed it (see
//! [`ClusterConfiguration::change_owner`]). Requests on any other member fail
//! with `NotCoordinator` before anything is written.
//!
//! Only one plan runs per coordinator at a time. Driving happens in a spawned
//! task that owns the plan lock, so a caller that stops waiting does not
//! abort a committed plan.
use crate::configuration::{ChangeStatus, ClusterConfiguration};
use crate::error::{TopologyError, TopologyResult};
use crate::executor::ChangeExecutors;
use crate::operations::ClusterChangeOperation;
use crate::store::ConfigurationStore;
use crate::types::MemberId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Accepts change requests and applies them through the executors.
#[derive(Clone)]
pub struct ConfigurationChangeCoordinator {
    local: MemberId,
    store: Arc<ConfigurationStore>,
    executors: ChangeExecutors,
    plan_lock: Arc<Mutex<()>>,
}

impl ConfigurationChangeCoordinator {
    pub fn new(local: MemberId, store: Arc<ConfigurationStore>, executors: ChangeExecutors) -> Self {
        Self {
            local,
            store,
            executors,
            plan_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The store this coordinator writes to.
    pub fn store(&self) -> &Arc<ConfigurationStore> {
        &self.store
    }

    /// Commit the operations computed by `transform` and wait until every
    /// one of them has been applied.
    ///
    /// `transform` sees the configuration current at commit time. If it
    /// fails, or returns no operations, nothing is written.
    ///
    /// # Errors
    ///
    /// - validation errors from `transform` or from simulating the plan
    /// - `NotCoordinator` if this member does not coordinate changes
    /// - `ChangeInProgress` if another plan is running
    /// - `OperationFailed` if an executor failed; the plan is left halted
    pub async fn apply_operations<F>(&self, transform: F) -> TopologyResult<Arc<ClusterConfiguration>>
    where
        F: FnOnce(&ClusterConfiguration) -> TopologyResult<Vec<ClusterChangeOperation>> + Send,
    {
        let guard = Arc::clone(&self.plan_lock).lock_owned().await;
        let committed = self.commit(transform).await?;
        if !is_runnable(&committed) {
            return Ok(committed);
        }
        self.spawn_driver(guard).await
    }

    /// Commit the operations computed by `transform` and return the committed
    /// configuration without waiting for them to be applied.
    pub async fn submit_operations<F>(&self, transform: F) -> TopologyResult<Arc<ClusterConfiguration>>
    where
        F: FnOnce(&ClusterConfiguration) -> TopologyResult<Vec<ClusterChangeOperation>> + Send,
    {
        let guard = Arc::clone(&self.plan_lock).lock_owned().await;
        let committed = self.commit(transform).await?;
        if is_runnable(&committed) {
            let coordinator = self.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.drive(guard).await {
                    warn!(error = %e, "Submitted change did not complete");
                }
            });
        }
        Ok(committed)
    }

    /// The configuration that applying `transform` would produce.
    pub async fn simulate_operations<F>(&self, transform: F) -> TopologyResult<ClusterConfiguration>
    where
        F: FnOnce(&ClusterConfiguration) -> TopologyResult<Vec<ClusterChangeOperation>>,
    {
        let current = self.store.get();
        let operations = transform(&current)?;
        current.start_plan(operations)?.simulate()
    }

    /// Drive a committed plan that is still in progress, e.g. after a
    /// restart. The plan is not validated again.
    ///
    /// Plans committed by another member are left alone.
    pub async fn resume(&self) -> TopologyResult<Arc<ClusterConfiguration>> {
        let guard = Arc::clone(&self.plan_lock).lock_owned().await;
        let current = self.store.get();
        if !is_runnable(&current) {
            return Ok(current);
        }
        if let Some(plan) = &current.pending_changes {
            if plan.coordinator != self.local {
                debug!(change = plan.id, coordinator = %plan.coordinator, "Change is driven elsewhere");
                return Ok(current);
            }
            info!(
                change = plan.id,
                remaining = plan.pending.len(),
                "Resuming cluster change"
            );
        }
        self.spawn_driver(guard).await
    }

    /// Resume a failed plan from the operation that failed.
    ///
    /// A plan that is still in progress while no driver holds the plan lock
    /// was abandoned by a failed write; it is driven again from where it
    /// stopped.
    pub async fn retry_failed_change(&self) -> TopologyResult<Arc<ClusterConfiguration>> {
        let guard = Arc::clone(&self.plan_lock).lock_owned().await;
        let current = self.store.get();
        if is_runnable(&current) {
            self.check_owner(&current)?;
            if let Some(plan) = &current.pending_changes {
                warn!(change = plan.id, "Resuming stalled cluster change");
            }
            return self.spawn_driver(guard).await;
        }

        let retried = self
            .store
            .update(|config| {
                self.check_owner(config)?;
                config.retry_failed_plan()
            })
            .await?;
        if let Some(plan) = &retried.pending_changes {
            info!(change = plan.id, "Retrying failed cluster change");
        }
        self.spawn_driver(guard).await
    }

    /// Drop the remaining operations of a failed plan.
    pub async fn cancel_failed_change(&self) -> TopologyResult<Arc<ClusterConfiguration>> {
        let _guard = self.plan_lock.lock().await;
        let cancelled = self
            .store
            .update(|config| {
                self.check_owner(config)?;
                config.cancel_failed_plan()
            })
            .await?;
        if let Some(change) = &cancelled.last_change {
            warn!(change = change.id, "Cancelled failed cluster change");
        }
        Ok(cancelled)
    }

    async fn commit<F>(&self, transform: F) -> TopologyResult<Arc<ClusterConfiguration>>
    where
        F: FnOnce(&ClusterConfiguration) -> TopologyResult<Vec<ClusterChangeOperation>>,
    {
        let committed = self
            .store
            .update(|config| {
                if config.is_uninitialized() {
                    return Err(TopologyError::NotInitialized);
                }
                if let Some(plan) = &config.pending_changes {
                    if !plan.is_failed() {
                        return Err(TopologyError::ChangeInProgress { change_id: plan.id });
                    }
                }
                self.check_owner(config)?;
                let operations = transform(config)?;
                config.start_plan(operations)
            })
            .await?;

        if let Some(plan) = &committed.pending_changes {
            info!(
                coordinator = %self.local,
                change = plan.id,
                operations = plan.pending.len(),
                version = committed.version,
                "Committed cluster change"
            );
        }
        Ok(committed)
    }

    fn check_owner(&self, config: &ClusterConfiguration) -> TopologyResult<()> {
        match config.change_owner() {
            Some(owner) if *owner == self.local => Ok(()),
            owner => Err(TopologyError::NotCoordinator {
                coordinator: owner.cloned(),
            }),
        }
    }

    /// Drive in a separate task so the plan keeps running if the caller
    /// goes away.
    async fn spawn_driver(&self, guard: OwnedMutexGuard<()>) -> TopologyResult<Arc<ClusterConfiguration>> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.drive(guard).await })
            .await
            .map_err(|e| TopologyError::OperationFailed {
                operation: "cluster change".to_string(),
                reason: e.to_string(),
            })?
    }

    async fn drive(&self, _guard: OwnedMutexGuard<()>) -> TopologyResult<Arc<ClusterConfiguration>> {
        loop {
            let current = self.store.get();
            let Some(plan) = &current.pending_changes else {
                return Ok(current);
            };
            if let ChangeStatus::Failed { operation, reason } = &plan.status {
                return Err(TopologyError::OperationFailed {
                    operation: operation.to_string(),
                    reason: reason.clone(),
                });
            }
            let Some(operation) = plan.next_operation().cloned() else {
                return Ok(current);
            };
            let change = plan.id;

            debug!(change, %operation, "Starting operation");
            let started = match self
                .store
                .update(|config| config.start_operation(&operation))
                .await
            {
                Ok(started) => started,
                Err(e) => return Err(self.halt(change, &operation, e).await),
            };

            if let Err(e) = self.executors.execute(&operation, &started).await {
                return Err(self.halt(change, &operation, e).await);
            }

            let completed = match self
                .store
                .update(|config| config.complete_operation(&operation))
                .await
            {
                Ok(completed) => completed,
                Err(e) => return Err(self.halt(change, &operation, e).await),
            };
            info!(change, %operation, version = completed.version, "Applied operation");
            if !completed.has_pending_changes() {
                info!(change, version = completed.version, "Completed cluster change");
            }
        }
    }

    /// Stop driving at `operation` and try to record the failure, so the
    /// plan shows up as failed and can be retried or cancelled.
    async fn halt(&self, change: u64, operation: &ClusterChangeOperation, cause: TopologyError) -> TopologyError {
        let reason = cause.to_string();
        error!(change, %operation, error = %reason, "Operation failed, halting change");
        if let Err(e) = self
            .store
            .update(|config| config.fail_operation(operation, reason.clone()))
            .await
        {
            warn!(change, error = %e, "Could not record the failure, the change stays in progress until retried");
        }
        TopologyError::OperationFailed {
            operation: operation.to_string(),
            reason,
        }
    }
}

fn is_runnable(config: &ClusterConfiguration) -> bool {
    config
        .pending_changes
        .as_ref()
        .is_some_and(|plan| !plan.is_failed())
}

impl std::fmt::Debug for ConfigurationChangeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationChangeCoordinator")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DynamicPartitionConfig, MemberState, PartitionState};
    use std::collections::BTreeMap;

    fn two_members() -> ClusterConfiguration {
        let mut partitions = BTreeMap::new();
        partitions.insert(1, PartitionState::active(1));
        ClusterConfiguration::new(DynamicPartitionConfig::new(1, 1))
            .with_member("0", MemberState::active(partitions))
            .with_member("1", MemberState::active(BTreeMap::new()))
    }

    fn coordinator_of(local: &str, config: ClusterConfiguration) -> ConfigurationChangeCoordinator {
        ConfigurationChangeCoordinator::new(
            MemberId::from(local),
            Arc::new(ConfigurationStore::in_memory(config)),
            ChangeExecutors::noop(),
        )
    }

    fn coordinator() -> ConfigurationChangeCoordinator {
        coordinator_of("0", two_members())
    }

    #[tokio::test]
    async fn test_apply_runs_to_completion() {
        let coordinator = coordinator();
        let result = coordinator
            .apply_operations(|_| {
                Ok(vec![
                    ClusterChangeOperation::partition_join("1", 1, 2),
                    ClusterChangeOperation::partition_leave("0", 1, 1),
                ])
            })
            .await
            .unwrap();

        assert!(!result.has_pending_changes());
        assert_eq!(result.partitions_of(&MemberId::from("1")).len(), 1);
        assert!(result.partitions_of(&MemberId::from("0")).is_empty());
        // Commit plus start and complete for each of the two operations.
        assert_eq!(result.version, 1 + 1 + 4);
    }

    #[tokio::test]
    async fn test_rejected_transform_changes_nothing() {
        let coordinator = coordinator();
        let before = coordinator.store().get();

        let result = coordinator
            .apply_operations(|_| Err(TopologyError::invalid("no")))
            .await;
        assert!(result.unwrap_err().is_validation());

        let empty = coordinator.apply_operations(|_| Ok(Vec::new())).await.unwrap();
        assert_eq!(*empty, *before);
    }

    #[tokio::test]
    async fn test_simulate_does_not_write() {
        let coordinator = coordinator();
        let simulated = coordinator
            .simulate_operations(|_| Ok(vec![ClusterChangeOperation::partition_join("1", 1, 2)]))
            .await
            .unwrap();
        assert!(simulated.partitions_of(&MemberId::from("1")).contains(&1));
        assert_eq!(coordinator.store().get().version, 1);
    }

    #[tokio::test]
    async fn test_invalid_plan_is_rejected_before_commit() {
        let coordinator = coordinator();
        let result = coordinator
            .apply_operations(|_| Ok(vec![ClusterChangeOperation::partition_join("7", 1, 1)]))
            .await;
        assert!(result.unwrap_err().is_validation());
        assert!(!coordinator.store().get().has_pending_changes());
    }

    #[tokio::test]
    async fn test_non_coordinator_is_rejected_before_commit() {
        let member = coordinator_of("1", two_members());
        let result = member
            .apply_operations(|_| Ok(vec![ClusterChangeOperation::partition_join("1", 1, 2)]))
            .await;
        match result {
            Err(TopologyError::NotCoordinator { coordinator }) => {
                assert_eq!(coordinator, Some(MemberId::from("0")));
            }
            other => panic!("expected NotCoordinator, got {:?}", other),
        }
        assert_eq!(member.store().get().version, 1);
    }

    #[tokio::test]
    async fn test_resume_leaves_plans_of_other_members_alone() {
        let committed = two_members()
            .start_plan(vec![ClusterChangeOperation::partition_join("1", 1, 2)])
            .unwrap();
        let member = coordinator_of("1", committed.clone());

        let result = member.resume().await.unwrap();
        assert_eq!(*result, committed);

        let result = member.retry_failed_change().await;
        assert!(matches!(result, Err(TopologyError::NotCoordinator { .. })));
    }
}
