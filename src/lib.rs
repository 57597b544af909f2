//! # clustertopo
//!
//! Cluster topology management for a partitioned, replicated workflow
//! engine: who the members are, which partitions each member hosts, and at
//! what priority, kept consistent on every node without a consensus store.
//!
//! - **Versioned snapshots** - one [`ClusterConfiguration`] per node, replaced
//!   only by a snapshot with a higher version
//! - **Gossip** - periodic push-pull exchange until every node holds the
//!   highest version
//! - **Change plans** - topology changes are committed as ordered operation
//!   lists and applied one step at a time through pluggable executors
//! - **Connection heartbeats** - dead peers are detected and their
//!   connections closed
//!
//! ## Quick Start
//!
//! ```ignore
//! use clustertopo::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new("0")
//!         .data_dir("/var/lib/clustertopo/0")
//!         .bootstrap(StaticConfiguration::new(["0", "1", "2"], 3, 3));
//!
//!     let node = ClusterNode::open(config, ChangeExecutors::noop()).await?;
//!     node.start().await?;
//!
//!     // Move partition 1 from member 1 to member 0.
//!     node.coordinator()
//!         .apply_operations(|_| Ok(vec![
//!             ClusterChangeOperation::partition_join("0", 1, 1),
//!             ClusterChangeOperation::partition_leave("1", 1, 1),
//!         ]))
//!         .await?;
//!
//!     for partition in node.configuration().partition_metadata() {
//!         println!("{}: {:?}", partition.partition_id, partition.primary);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **State model** (`types`, `configuration`, `operations`) - immutable
//!    snapshots and the transitions between them
//! 2. **Store** (`store`, `persistence`) - the node's current snapshot,
//!    persisted before it is published
//! 3. **Coordination** (`coordinator`, `executor`, `requests`) - plans
//! 4. **Dissemination** (`gossip`, `messaging`, `heartbeat`, `network`)
//! 5. **Node** (`bootstrap`, `config`, `node`, `http`) - wiring and admin API

mod error;

pub mod bootstrap;
pub mod config;
pub mod configuration;
pub mod coordinator;
pub mod distribution;
pub mod executor;
pub mod gossip;
pub mod heartbeat;
pub mod messaging;
pub mod network;
pub mod node;
pub mod operations;
pub mod persistence;
pub mod requests;
pub mod store;
pub mod types;

// HTTP API (requires http feature)
#[cfg(feature = "http")]
pub mod http;

// Public API exports
pub use bootstrap::{ConfigurationInitializer, InitializationOutcome, StaticConfiguration};
pub use config::{GossipConfig, HeartbeatConfig, MessagingConfig, NodeConfig};
pub use configuration::{
    ChangeStatus, ClusterChangePlan, ClusterConfiguration, CompletedChange, CompletedChangeStatus,
    MergeOutcome,
};
pub use coordinator::ConfigurationChangeCoordinator;
pub use error::{TopologyError, TopologyResult};
pub use executor::{
    ChangeExecutors, ClusterMembershipChangeExecutor, PartitionChangeExecutor,
    PartitionScalingChangeExecutor,
};
pub use gossip::{ConfigurationGossiper, GossipState, GossipTransport, MemberDirectory, PeerInfo, PeerStatus};
pub use node::{ClusterNode, NodeStatus};
pub use operations::ClusterChangeOperation;
pub use store::ConfigurationStore;
pub use types::{
    DynamicPartitionConfig, MemberId, MemberState, MemberStatus, PartitionId, PartitionMetadata,
    PartitionState, PartitionStatus,
};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use clustertopo::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bootstrap::{InitializationOutcome, StaticConfiguration};
    pub use crate::config::{GossipConfig, HeartbeatConfig, MessagingConfig, NodeConfig};
    pub use crate::configuration::ClusterConfiguration;
    pub use crate::coordinator::ConfigurationChangeCoordinator;
    pub use crate::error::{TopologyError, TopologyResult};
    pub use crate::executor::ChangeExecutors;
    pub use crate::node::ClusterNode;
    pub use crate::operations::ClusterChangeOperation;
    pub use crate::requests;
    pub use crate::types::{MemberId, PartitionId, PartitionMetadata};
}
