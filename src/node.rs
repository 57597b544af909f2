/// A cluster member.
///
/// `ClusterNode` wires the components together by explicit injection:
///
/// - the configuration store, file backed when a data directory is set
/// - the messaging service with heartbeats on every connection
/// - the member directory, seeded from the static peers
/// - the gossiper, registered as the handler of gossip requests
/// - the change coordinator with the supplied executors
///
/// `start` initializes the configuration and launches gossip; `stop` shuts
/// the background tasks down.
use crate::bootstrap::{ConfigurationInitializer, InitializationOutcome};
use crate::config::NodeConfig;
use crate::configuration::{ChangeStatus, ClusterConfiguration, CompletedChange};
use crate::coordinator::ConfigurationChangeCoordinator;
use crate::error::{TopologyError, TopologyResult};
use crate::executor::ChangeExecutors;
use crate::gossip::{
    ConfigurationGossiper, GOSSIP_SUBJECT, GossipRequestHandler, MemberDirectory,
    MessagingGossipTransport, PeerInfo,
};
use crate::messaging::MessagingService;
use crate::store::ConfigurationStore;
use crate::types::MemberId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

/// Snapshot of a node's view, for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub member_id: MemberId,
    pub address: SocketAddr,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub version: u64,
    pub initialized: bool,
    pub member_count: usize,
    pub partition_count: u32,
    pub replication_factor: u32,
    pub pending_change: Option<PendingChangeStatus>,
    pub last_change: Option<CompletedChange>,
    pub peers: Vec<PeerInfo>,
    pub in_flight_requests: usize,
}

/// The plan currently in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChangeStatus {
    pub id: u64,
    pub failed: bool,
    pub failure: Option<String>,
    pub completed_operations: usize,
    pub pending_operations: Vec<String>,
}

impl PendingChangeStatus {
    fn of(config: &ClusterConfiguration) -> Option<Self> {
        config.pending_changes.as_ref().map(|plan| Self {
            id: plan.id,
            failed: plan.is_failed(),
            failure: match &plan.status {
                ChangeStatus::InProgress => None,
                ChangeStatus::Failed { operation, reason } => {
                    Some(format!("{} failed: {}", operation, reason))
                }
            },
            completed_operations: plan.completed.len(),
            pending_operations: plan.pending.iter().map(ToString::to_string).collect(),
        })
    }
}

/// A running member of the cluster.
pub struct ClusterNode {
    config: NodeConfig,
    store: Arc<ConfigurationStore>,
    messaging: Arc<MessagingService>,
    directory: Arc<MemberDirectory>,
    gossiper: Arc<ConfigurationGossiper>,
    coordinator: ConfigurationChangeCoordinator,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<RwLock<bool>>,
    started_at: DateTime<Utc>,
}

impl ClusterNode {
    /// Open the store and bind messaging. Nothing runs until `start`.
    pub async fn open(config: NodeConfig, executors: ChangeExecutors) -> TopologyResult<Self> {
        let store = Arc::new(match config.configuration_file() {
            Some(path) => ConfigurationStore::open(path).await?,
            None => ConfigurationStore::in_memory(ClusterConfiguration::uninitialized()),
        });

        let messaging = Arc::new(
            MessagingService::bind(
                config.member_id.clone(),
                config.bind_addr,
                config.messaging.clone(),
            )
            .await?,
        );

        let directory = Arc::new(MemberDirectory::new());
        for (member, address) in &config.peers {
            if *member != config.member_id {
                directory.seed(member.clone(), *address);
            }
        }

        let transport = Arc::new(MessagingGossipTransport::new(
            Arc::clone(&messaging),
            Arc::clone(&directory),
        ));
        let gossiper = Arc::new(
            ConfigurationGossiper::new(
                config.member_id.clone(),
                Arc::clone(&store),
                transport,
                config.gossip.clone(),
            )
            .with_address(messaging.local_addr())
            .with_directory(Arc::clone(&directory)),
        );
        messaging.register_handler(
            GOSSIP_SUBJECT,
            Arc::new(GossipRequestHandler::new(Arc::clone(&gossiper))),
        );

        let coordinator =
            ConfigurationChangeCoordinator::new(config.member_id.clone(), Arc::clone(&store), executors);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            store,
            messaging,
            directory,
            gossiper,
            coordinator,
            shutdown_tx,
            running: Arc::new(RwLock::new(false)),
            started_at: Utc::now(),
        })
    }

    /// Initialize the configuration and start gossiping.
    ///
    /// If a committed plan is still in progress and this node committed it,
    /// the plan is resumed in the background.
    pub async fn start(&self) -> TopologyResult<InitializationOutcome> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(TopologyError::invalid("node already running"));
            }
            *running = true;
        }

        let mut initializer =
            ConfigurationInitializer::new(self.config.member_id.clone(), Arc::clone(&self.store))
                .with_gossiper(Arc::clone(&self.gossiper))
                .with_timeout(self.config.initialization_timeout);
        if let Some(bootstrap) = &self.config.bootstrap {
            initializer = initializer.with_static_configuration(bootstrap.clone());
        }
        let outcome = match initializer.initialize().await {
            Ok(outcome) => outcome,
            Err(e) => {
                *self.running.write().await = false;
                return Err(e);
            }
        };

        Arc::clone(&self.gossiper).spawn(self.shutdown_tx.subscribe());

        let current = self.store.get();
        let resumable = current
            .pending_changes
            .as_ref()
            .is_some_and(|plan| !plan.is_failed() && plan.coordinator == self.config.member_id);
        if resumable {
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.resume().await {
                    warn!(error = %e, "Resumed cluster change did not complete");
                }
            });
        }

        info!(
            member = %self.config.member_id,
            addr = %self.messaging.local_addr(),
            version = current.version,
            ?outcome,
            "Cluster node started"
        );
        Ok(outcome)
    }

    /// Stop background tasks and close connections.
    pub async fn stop(&self) -> TopologyResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        *running = false;

        let _ = self.shutdown_tx.send(());
        self.messaging.stop();
        info!(member = %self.config.member_id, "Cluster node stopped");
        Ok(())
    }

    /// Check if the node is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn member_id(&self) -> &MemberId {
        &self.config.member_id
    }

    /// Address other members reach this node at.
    pub fn local_addr(&self) -> SocketAddr {
        self.messaging.local_addr()
    }

    /// The current configuration.
    pub fn configuration(&self) -> Arc<ClusterConfiguration> {
        self.store.get()
    }

    pub fn store(&self) -> &Arc<ConfigurationStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &ConfigurationChangeCoordinator {
        &self.coordinator
    }

    pub fn gossiper(&self) -> &Arc<ConfigurationGossiper> {
        &self.gossiper
    }

    pub fn messaging(&self) -> &Arc<MessagingService> {
        &self.messaging
    }

    pub fn directory(&self) -> &Arc<MemberDirectory> {
        &self.directory
    }

    /// Operator view of this node.
    pub async fn status(&self) -> NodeStatus {
        let config = self.store.get();
        NodeStatus {
            member_id: self.config.member_id.clone(),
            address: self.messaging.local_addr(),
            running: self.is_running().await,
            started_at: self.started_at,
            version: config.version,
            initialized: !config.is_uninitialized(),
            member_count: config.members.len(),
            partition_count: config.partition_config.partition_count,
            replication_factor: config.partition_config.replication_factor,
            pending_change: PendingChangeStatus::of(&config),
            last_change: config.last_change.clone(),
            peers: self.directory.peers(),
            in_flight_requests: self.messaging.in_flight_requests(),
        }
    }
}
