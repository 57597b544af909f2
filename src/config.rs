/// Node configuration.
///
/// Every struct has sensible defaults and builder-style setters, so a node
/// can be configured with `NodeConfig::new(id).bind_addr(..).peer(..)`.
use crate::bootstrap::StaticConfiguration;
use crate::network::DEFAULT_PORT;
use crate::types::MemberId;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the persisted configuration file inside the data directory.
pub const CONFIGURATION_FILE: &str = "cluster-configuration.meta";

/// Connection liveness settings. Both ends of a connection must agree.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Write-idle time after which a client sends a heartbeat (default: 5 seconds).
    pub interval: Duration,
    /// Read-idle time after which a connection may be closed (default: 15 seconds).
    pub timeout: Duration,
    /// Deliver heartbeats to the upper protocol layer (default: false).
    pub forward_heartbeats: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
            forward_heartbeats: false,
        }
    }
}

impl HeartbeatConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn forward_heartbeats(mut self, forward: bool) -> Self {
        self.forward_heartbeats = forward;
        self
    }
}

/// Request/response messaging settings.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Timeout for establishing a connection (default: 5 seconds).
    pub connect_timeout: Duration,
    /// Timeout for a reply (default: 10 seconds).
    pub request_timeout: Duration,
    /// Liveness policing of every connection.
    pub heartbeat: HeartbeatConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl MessagingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Configuration gossip settings.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Base period between rounds (default: 10 seconds).
    pub interval: Duration,
    /// Upper bound of the random delay added to each round (default: 1 second).
    pub jitter: Duration,
    /// Peers contacted per round (default: 2).
    pub fanout: usize,
    /// Timeout of one exchange (default: 2 seconds).
    pub request_timeout: Duration,
    /// Start a round as soon as the local configuration changes (default: true).
    pub push_on_update: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            jitter: Duration::from_secs(1),
            fanout: 2,
            request_timeout: Duration::from_secs(2),
            push_on_update: true,
        }
    }
}

impl GossipConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn push_on_update(mut self, push: bool) -> Self {
        self.push_on_update = push;
        self
    }
}

/// Configuration for a cluster node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's member id.
    pub member_id: MemberId,
    /// Address to bind for cluster messaging.
    pub bind_addr: SocketAddr,
    /// Directory holding the persisted configuration. `None` keeps it in memory.
    pub data_dir: Option<PathBuf>,
    /// Statically known peers.
    pub peers: Vec<(MemberId, SocketAddr)>,
    /// Initial cluster layout. Its lowest member writes it on first start.
    pub bootstrap: Option<StaticConfiguration>,
    /// How long a non-bootstrapping node waits for peers (default: 30 seconds).
    pub initialization_timeout: Duration,
    /// Gossip settings.
    pub gossip: GossipConfig,
    /// Messaging settings.
    pub messaging: MessagingConfig,
}

impl NodeConfig {
    /// Create a new node config with default settings.
    pub fn new(member_id: impl Into<MemberId>) -> Self {
        Self {
            member_id: member_id.into(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            data_dir: None,
            peers: Vec::new(),
            bootstrap: None,
            initialization_timeout: Duration::from_secs(30),
            gossip: GossipConfig::default(),
            messaging: MessagingConfig::default(),
        }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Persist the configuration under `dir`.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Add a statically known peer.
    pub fn peer(mut self, member: impl Into<MemberId>, addr: SocketAddr) -> Self {
        self.peers.push((member.into(), addr));
        self
    }

    /// Set the initial cluster layout.
    pub fn bootstrap(mut self, bootstrap: StaticConfiguration) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout = timeout;
        self
    }

    pub fn gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn messaging(mut self, messaging: MessagingConfig) -> Self {
        self.messaging = messaging;
        self
    }

    /// Path of the persisted configuration file, if any.
    pub fn configuration_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(CONFIGURATION_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::new("0");
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.messaging.heartbeat.interval, Duration::from_secs(5));
        assert_eq!(config.messaging.heartbeat.timeout, Duration::from_secs(15));
        assert!(!config.messaging.heartbeat.forward_heartbeats);
        assert_eq!(config.gossip.fanout, 2);
        assert!(config.configuration_file().is_none());
    }

    #[test]
    fn test_builder() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let config = NodeConfig::new("1")
            .bind_addr(addr)
            .data_dir("/tmp/node-1")
            .peer("0", "127.0.0.1:4001".parse().unwrap());

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(
            config.configuration_file(),
            Some(PathBuf::from("/tmp/node-1").join(CONFIGURATION_FILE))
        );
    }
}
