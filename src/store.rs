//! The per-node configuration store.
//!
//! Holds the one current [`ClusterConfiguration`] of this node. Every write
//! goes through a single async mutex, is persisted before it becomes visible,
//! and is then published on a `watch` channel so the gossiper and any other
//! subscriber see each accepted version.
use crate::configuration::{ClusterConfiguration, MergeOutcome};
use crate::error::{TopologyError, TopologyResult};
use crate::persistence;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info};

/// Versioned, durable holder of the current cluster configuration.
pub struct ConfigurationStore {
    path: Option<PathBuf>,
    current: watch::Sender<Arc<ClusterConfiguration>>,
    write_lock: Mutex<()>,
}

impl ConfigurationStore {
    /// Open a store backed by the file at `path`.
    ///
    /// A missing file yields an uninitialized configuration.
    pub async fn open(path: impl AsRef<Path>) -> TopologyResult<Self> {
        let path = path.as_ref().to_path_buf();
        let initial = match persistence::load(&path).await? {
            Some(config) => {
                info!(
                    version = config.version,
                    members = config.members.len(),
                    path = %path.display(),
                    "Loaded persisted cluster configuration"
                );
                config
            }
            None => ClusterConfiguration::uninitialized(),
        };
        Ok(Self::with_state(Some(path), initial))
    }

    /// A store that keeps everything in memory.
    pub fn in_memory(initial: ClusterConfiguration) -> Self {
        Self::with_state(None, initial)
    }

    fn with_state(path: Option<PathBuf>, initial: ClusterConfiguration) -> Self {
        let (current, _) = watch::channel(Arc::new(initial));
        Self {
            path,
            current,
            write_lock: Mutex::new(()),
        }
    }

    /// Where the configuration is persisted, if anywhere.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The current configuration.
    pub fn get(&self) -> Arc<ClusterConfiguration> {
        self.current.borrow().clone()
    }

    /// Receive every accepted configuration.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterConfiguration>> {
        self.current.subscribe()
    }

    /// Replace the configuration if its version is still `expected_version`.
    ///
    /// `new` is stored as given, including its version.
    pub async fn compare_and_set(
        &self,
        expected_version: u64,
        new: ClusterConfiguration,
    ) -> TopologyResult<Arc<ClusterConfiguration>> {
        let _guard = self.write_lock.lock().await;
        let actual = self.current.borrow().version;
        if actual != expected_version {
            return Err(TopologyError::ConcurrentModification {
                expected: expected_version,
                actual,
            });
        }
        self.commit(new).await
    }

    /// Derive the next configuration from the current one.
    ///
    /// The result gets version `current + 1`. If `change` returns a
    /// configuration equal to the current one nothing is written and the
    /// current configuration is returned.
    pub async fn update<F>(&self, change: F) -> TopologyResult<Arc<ClusterConfiguration>>
    where
        F: FnOnce(&ClusterConfiguration) -> TopologyResult<ClusterConfiguration>,
    {
        let _guard = self.write_lock.lock().await;
        let current = self.get();
        let mut next = change(&current)?;
        if next == *current {
            return Ok(current);
        }
        next.version = current.version + 1;
        self.commit(next).await
    }

    /// Merge a configuration received from a peer.
    pub async fn merge(&self, received: &ClusterConfiguration) -> TopologyResult<MergeOutcome> {
        let _guard = self.write_lock.lock().await;
        let current = self.get();
        let outcome = current.merge(received);
        match outcome {
            MergeOutcome::Adopted => {
                debug!(
                    from = current.version,
                    to = received.version,
                    "Adopting newer cluster configuration"
                );
                self.commit(received.clone()).await?;
            }
            MergeOutcome::Conflict => {
                error!(
                    version = current.version,
                    "Received a different cluster configuration with the same version, keeping local"
                );
            }
            MergeOutcome::Identical | MergeOutcome::Stale => {}
        }
        Ok(outcome)
    }

    async fn commit(&self, next: ClusterConfiguration) -> TopologyResult<Arc<ClusterConfiguration>> {
        if let Some(path) = &self.path {
            persistence::save(&next, path).await?;
        }
        let next = Arc::new(next);
        self.current.send_replace(next.clone());
        Ok(next)
    }
}

impl std::fmt::Debug for ConfigurationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationStore")
            .field("path", &self.path)
            .field("version", &self.current.borrow().version)
            .finish()
    }
}
