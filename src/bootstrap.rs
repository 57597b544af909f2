//! Startup decision: persisted configuration, fresh bootstrap, or peers.
//!
//! A persisted configuration always wins, even when the static layout given
//! on this run differs from it. Otherwise the lowest member of the static
//! layout writes the generated configuration and every other node waits
//! until gossip brings it an initialized one.
use crate::configuration::ClusterConfiguration;
use crate::distribution::RoundRobinDistributor;
use crate::error::{TopologyError, TopologyResult};
use crate::gossip::ConfigurationGossiper;
use crate::store::ConfigurationStore;
use crate::types::{
    DynamicPartitionConfig, ExporterState, MemberId, MemberState, PartitionId, PartitionState,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

/// Initial cluster layout supplied out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticConfiguration {
    pub members: BTreeSet<MemberId>,
    pub partition_count: u32,
    pub replication_factor: u32,
    /// Exporters enabled on every partition.
    pub exporters: BTreeSet<String>,
}

impl StaticConfiguration {
    pub fn new(
        members: impl IntoIterator<Item = impl Into<MemberId>>,
        partition_count: u32,
        replication_factor: u32,
    ) -> Self {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            partition_count,
            replication_factor,
            exporters: BTreeSet::new(),
        }
    }

    pub fn with_exporter(mut self, exporter: impl Into<String>) -> Self {
        self.exporters.insert(exporter.into());
        self
    }

    /// The member that writes the initial configuration.
    pub fn bootstrapper(&self) -> Option<&MemberId> {
        self.members.iter().next()
    }

    /// Generate the initial configuration with round-robin placement.
    pub fn generate(&self) -> TopologyResult<ClusterConfiguration> {
        if self.partition_count == 0 {
            return Err(TopologyError::invalid("partition count must be at least 1"));
        }
        let distribution = RoundRobinDistributor.distribute(
            &self.members,
            1..=self.partition_count,
            self.replication_factor,
        )?;

        let exporters: BTreeMap<String, ExporterState> = self
            .exporters
            .iter()
            .map(|name| (name.clone(), ExporterState::enabled()))
            .collect();

        let mut hosted: BTreeMap<&MemberId, BTreeMap<PartitionId, PartitionState>> =
            self.members.iter().map(|member| (member, BTreeMap::new())).collect();
        for (partition, replicas) in &distribution {
            for (member, priority) in replicas {
                if let Some(partitions) = hosted.get_mut(member) {
                    partitions.insert(
                        *partition,
                        PartitionState {
                            exporters: exporters.clone(),
                            ..PartitionState::active(*priority)
                        },
                    );
                }
            }
        }

        let partition_config =
            DynamicPartitionConfig::new(self.partition_count, self.replication_factor);
        Ok(hosted
            .into_iter()
            .fold(ClusterConfiguration::new(partition_config), |config, (member, partitions)| {
                config.with_member(member.clone(), MemberState::active(partitions))
            }))
    }
}

/// How the node obtained its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializationOutcome {
    /// Loaded from local storage.
    Persisted,
    /// Generated from the static layout by this node.
    Bootstrapped,
    /// Received from an initialized peer.
    FromPeers,
}

/// Brings the local store to an initialized configuration.
pub struct ConfigurationInitializer {
    local: MemberId,
    store: Arc<ConfigurationStore>,
    static_configuration: Option<StaticConfiguration>,
    gossiper: Option<Arc<ConfigurationGossiper>>,
    timeout: Duration,
    retry_interval: Duration,
}

impl ConfigurationInitializer {
    pub fn new(local: MemberId, store: Arc<ConfigurationStore>) -> Self {
        Self {
            local,
            store,
            static_configuration: None,
            gossiper: None,
            timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
        }
    }

    pub fn with_static_configuration(mut self, configuration: StaticConfiguration) -> Self {
        self.static_configuration = Some(configuration);
        self
    }

    /// Pull from peers through `gossiper` while waiting.
    pub fn with_gossiper(mut self, gossiper: Arc<ConfigurationGossiper>) -> Self {
        self.gossiper = Some(gossiper);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// # Errors
    ///
    /// `NotInitialized` if no initialized configuration arrived within the
    /// timeout; storage errors if the bootstrapped configuration could not
    /// be persisted.
    pub async fn initialize(&self) -> TopologyResult<InitializationOutcome> {
        let current = self.store.get();
        if !current.is_uninitialized() {
            self.warn_if_diverged(&current);
            info!(version = current.version, "Using persisted cluster configuration");
            return Ok(InitializationOutcome::Persisted);
        }

        if let Some(configuration) = &self.static_configuration {
            if configuration.bootstrapper() == Some(&self.local) {
                let generated = configuration.generate()?;
                let stored = self.store.update(|_| Ok(generated)).await?;
                info!(
                    version = stored.version,
                    members = stored.members.len(),
                    partitions = configuration.partition_count,
                    "Bootstrapped cluster configuration"
                );
                return Ok(InitializationOutcome::Bootstrapped);
            }
        }

        self.await_peers().await?;
        info!(version = self.store.get().version, "Received cluster configuration from peers");
        Ok(InitializationOutcome::FromPeers)
    }

    async fn await_peers(&self) -> TopologyResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut updates = self.store.subscribe();
        loop {
            if !updates.borrow_and_update().is_uninitialized() {
                return Ok(());
            }
            if let Some(gossiper) = &self.gossiper {
                gossiper.gossip_round().await;
                if !self.store.get().is_uninitialized() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(TopologyError::NotInitialized);
            }
            let wait_until = (Instant::now() + self.retry_interval).min(deadline);
            if let Ok(Err(_)) = timeout_at(wait_until, updates.changed()).await {
                return Err(TopologyError::NotInitialized);
            }
        }
    }

    fn warn_if_diverged(&self, persisted: &ClusterConfiguration) {
        let Some(configuration) = &self.static_configuration else {
            return;
        };
        let Ok(generated) = configuration.generate() else {
            warn!("Ignoring invalid static configuration, a persisted configuration exists");
            return;
        };
        let layout = |config: &ClusterConfiguration| -> BTreeMap<MemberId, BTreeSet<PartitionId>> {
            config
                .members
                .keys()
                .map(|member| (member.clone(), config.partitions_of(member)))
                .collect()
        };
        if layout(persisted) != layout(&generated) {
            warn!(
                version = persisted.version,
                "Static configuration differs from the persisted one, keeping the persisted configuration"
            );
        }
    }
}
