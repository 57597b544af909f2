/// Configuration gossip.
///
/// Every round the gossiper picks up to `fanout` random peers and performs a
/// push-pull exchange: it sends its own snapshot and receives the peer's.
/// Both sides merge what they receive into their store, which keeps the
/// snapshot with the higher version. Because the coordinator serializes
/// changes, the highest version is the agreed latest configuration and
/// every node converges to it.
///
/// Exchange failures are logged and ignored; the next round retries with a
/// possibly different peer. Members that left the configuration are dropped
/// from the directory at the start of each round, and gossip from senders
/// outside the configuration is merged without recording the sender.
use crate::config::GossipConfig;
use crate::configuration::{ClusterConfiguration, MergeOutcome};
use crate::error::{TopologyError, TopologyResult};
use crate::messaging::{MessagingService, RequestHandler};
use crate::network::ProtocolRequest;
use crate::store::ConfigurationStore;
use crate::types::MemberId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace};

/// Messaging subject of gossip exchanges.
pub const GOSSIP_SUBJECT: &str = "cluster-topology-gossip";

/// The single gossip message: who sent it and their current snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipState {
    /// The sending member.
    pub sender: MemberId,
    /// Where the sender accepts messaging connections.
    pub address: Option<SocketAddr>,
    /// The sender's current configuration.
    pub configuration: ClusterConfiguration,
}

impl GossipState {
    pub fn to_bytes(&self) -> TopologyResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> TopologyResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Information about a peer member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's member id.
    pub member_id: MemberId,
    /// Network address of the peer.
    pub address: SocketAddr,
    /// When this peer was first seen.
    pub first_seen: DateTime<Utc>,
    /// When this peer was last seen.
    pub last_seen: DateTime<Utc>,
    /// Current status of the peer.
    pub status: PeerStatus,
}

impl PeerInfo {
    /// Create new peer info.
    pub fn new(member_id: MemberId, address: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            member_id,
            address,
            first_seen: now,
            last_seen: now,
            status: PeerStatus::Unknown,
        }
    }
}

/// Status of a peer member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Not contacted yet.
    Unknown,
    /// The last exchange succeeded.
    Healthy,
    /// The last exchange failed.
    Unreachable,
}

/// Known peers and how to reach them.
#[derive(Debug, Default)]
pub struct MemberDirectory {
    peers: DashMap<MemberId, PeerInfo>,
}

impl MemberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statically configured peer.
    pub fn seed(&self, member: MemberId, address: SocketAddr) {
        self.peers
            .entry(member.clone())
            .or_insert_with(|| PeerInfo::new(member, address));
    }

    /// Record that `member` was heard from, at `address` if known.
    pub fn observe(&self, member: &MemberId, address: Option<SocketAddr>) {
        match self.peers.get_mut(member) {
            Some(mut peer) => {
                if let Some(address) = address {
                    peer.address = address;
                }
                peer.last_seen = Utc::now();
                peer.status = PeerStatus::Healthy;
            }
            None => {
                if let Some(address) = address {
                    let mut peer = PeerInfo::new(member.clone(), address);
                    peer.status = PeerStatus::Healthy;
                    self.peers.insert(member.clone(), peer);
                }
            }
        }
    }

    /// Record a failed exchange with `member`.
    pub fn mark_unreachable(&self, member: &MemberId) {
        if let Some(mut peer) = self.peers.get_mut(member) {
            peer.status = PeerStatus::Unreachable;
        }
    }

    /// Address of `member`.
    pub fn address_of(&self, member: &MemberId) -> Option<SocketAddr> {
        self.peers.get(member).map(|peer| peer.address)
    }

    /// Forget `member`.
    pub fn remove(&self, member: &MemberId) {
        self.peers.remove(member);
    }

    /// Ids of every known peer.
    pub fn member_ids(&self) -> Vec<MemberId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Every known peer, ordered by member id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        peers.sort_by(|a, b| a.member_id.cmp(&b.member_id));
        peers
    }
}

/// How gossip reaches other members.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Members that can be gossiped with, excluding the local one.
    fn peers(&self) -> Vec<MemberId>;

    /// Send `state` to `peer` and return the peer's state.
    async fn exchange(&self, peer: &MemberId, state: GossipState) -> TopologyResult<GossipState>;
}

/// Gossip over the messaging service.
pub struct MessagingGossipTransport {
    local: MemberId,
    messaging: Arc<MessagingService>,
    directory: Arc<MemberDirectory>,
}

impl MessagingGossipTransport {
    pub fn new(messaging: Arc<MessagingService>, directory: Arc<MemberDirectory>) -> Self {
        Self {
            local: messaging.member_id().clone(),
            messaging,
            directory,
        }
    }
}

#[async_trait]
impl GossipTransport for MessagingGossipTransport {
    fn peers(&self) -> Vec<MemberId> {
        self.directory
            .member_ids()
            .into_iter()
            .filter(|member| *member != self.local)
            .collect()
    }

    async fn exchange(&self, peer: &MemberId, state: GossipState) -> TopologyResult<GossipState> {
        let address = self
            .directory
            .address_of(peer)
            .ok_or_else(|| TopologyError::Network(format!("No address known for member {}", peer)))?;

        let result = async {
            let reply = self
                .messaging
                .send_and_receive(address, GOSSIP_SUBJECT, state.to_bytes()?)
                .await?;
            GossipState::from_bytes(&reply)
        }
        .await;

        match &result {
            Ok(response) => self.directory.observe(peer, response.address),
            Err(_) => self.directory.mark_unreachable(peer),
        }
        result
    }
}

/// Answers gossip requests on behalf of a gossiper.
pub struct GossipRequestHandler {
    gossiper: Arc<ConfigurationGossiper>,
}

impl GossipRequestHandler {
    pub fn new(gossiper: Arc<ConfigurationGossiper>) -> Self {
        Self { gossiper }
    }
}

#[async_trait]
impl RequestHandler for GossipRequestHandler {
    async fn handle(&self, request: ProtocolRequest) -> TopologyResult<Vec<u8>> {
        let received = GossipState::from_bytes(&request.payload)?;
        self.gossiper.handle_gossip(received).await?.to_bytes()
    }
}

/// Periodically exchanges the local configuration with peers.
pub struct ConfigurationGossiper {
    local: MemberId,
    address: Option<SocketAddr>,
    store: Arc<ConfigurationStore>,
    transport: Arc<dyn GossipTransport>,
    directory: Option<Arc<MemberDirectory>>,
    config: GossipConfig,
}

impl ConfigurationGossiper {
    pub fn new(
        local: MemberId,
        store: Arc<ConfigurationStore>,
        transport: Arc<dyn GossipTransport>,
        config: GossipConfig,
    ) -> Self {
        Self {
            local,
            address: None,
            store,
            transport,
            directory: None,
            config,
        }
    }

    /// Advertise `address` in outgoing gossip.
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Record senders of incoming gossip in `directory` and prune it as
    /// members leave.
    pub fn with_directory(mut self, directory: Arc<MemberDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn member_id(&self) -> &MemberId {
        &self.local
    }

    /// The message this node sends.
    pub fn local_state(&self) -> GossipState {
        GossipState {
            sender: self.local.clone(),
            address: self.address,
            configuration: (*self.store.get()).clone(),
        }
    }

    /// Merge gossip received from a peer and answer with the local state.
    pub async fn handle_gossip(&self, received: GossipState) -> TopologyResult<GossipState> {
        let outcome = self.store.merge(&received.configuration).await?;
        log_merge(&received.sender, outcome, received.configuration.version);
        if let Some(directory) = &self.directory {
            let current = self.store.get();
            if current.is_uninitialized() || current.has_member(&received.sender) {
                directory.observe(&received.sender, received.address);
            }
        }
        Ok(self.local_state())
    }

    /// Drop directory entries of members no longer in the configuration.
    ///
    /// Returns the forgotten members. Nothing is dropped while the local
    /// configuration is uninitialized, since seeds are all it has.
    pub fn forget_departed_members(&self) -> Vec<MemberId> {
        let Some(directory) = &self.directory else {
            return Vec::new();
        };
        let current = self.store.get();
        if current.is_uninitialized() {
            return Vec::new();
        }
        let departed: Vec<MemberId> = directory
            .member_ids()
            .into_iter()
            .filter(|member| !current.has_member(member))
            .collect();
        for member in &departed {
            info!(%member, version = current.version, "Forgetting member that left the cluster");
            directory.remove(member);
        }
        departed
    }

    /// Push-pull exchange with one peer.
    pub async fn sync_with(&self, peer: &MemberId) -> TopologyResult<MergeOutcome> {
        let response = timeout(
            self.config.request_timeout,
            self.transport.exchange(peer, self.local_state()),
        )
        .await
        .map_err(|_| TopologyError::Timeout(format!("Gossip exchange with {} timed out", peer)))??;

        let outcome = self.store.merge(&response.configuration).await?;
        log_merge(peer, outcome, response.configuration.version);
        Ok(outcome)
    }

    /// Exchange with up to `fanout` random peers. Returns the number of
    /// successful exchanges.
    pub async fn gossip_round(&self) -> usize {
        self.forget_departed_members();
        let targets: Vec<MemberId> = {
            let peers = self.transport.peers();
            let mut rng = rand::thread_rng();
            peers
                .choose_multiple(&mut rng, self.config.fanout)
                .cloned()
                .collect()
        };
        if targets.is_empty() {
            trace!("No peers to gossip with");
            return 0;
        }

        let results =
            futures::future::join_all(targets.iter().map(|peer| self.sync_with(peer))).await;

        let mut succeeded = 0;
        for (peer, result) in targets.iter().zip(results) {
            match result {
                Ok(_) => succeeded += 1,
                Err(e) => debug!(%peer, error = %e, "Gossip exchange failed"),
            }
        }
        succeeded
    }

    /// Run rounds every `interval` plus jitter, and right after every local
    /// update when `push_on_update` is set, until shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut updates = self.store.subscribe();
        tokio::spawn(async move {
            info!(member = %self.local, "Gossip started");
            loop {
                let delay = self.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.gossip_round().await;
                    }
                    changed = updates.changed(), if self.config.push_on_update => {
                        if changed.is_err() {
                            break;
                        }
                        self.gossip_round().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!(member = %self.local, "Gossip stopped");
        })
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.interval;
        }
        self.config.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

fn log_merge(peer: &MemberId, outcome: MergeOutcome, version: u64) {
    match outcome {
        MergeOutcome::Adopted => {
            debug!(%peer, version, "Adopted cluster configuration from peer")
        }
        MergeOutcome::Conflict => {
            debug!(%peer, version, "Kept local configuration over conflicting peer snapshot")
        }
        MergeOutcome::Identical | MergeOutcome::Stale => {
            trace!(%peer, version, ?outcome, "Peer configuration not newer")
        }
    }
}

/// In-process gossip network, for tests and single-process simulations.
#[derive(Default)]
pub struct LocalGossipNetwork {
    nodes: DashMap<MemberId, Arc<ConfigurationGossiper>>,
    disconnected: DashMap<MemberId, ()>,
}

impl LocalGossipNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport for `member` on this network.
    pub fn transport(self: &Arc<Self>, member: impl Into<MemberId>) -> Arc<LocalGossipTransport> {
        Arc::new(LocalGossipTransport {
            local: member.into(),
            network: Arc::clone(self),
        })
    }

    /// Make `gossiper` reachable.
    pub fn register(&self, gossiper: Arc<ConfigurationGossiper>) {
        self.nodes.insert(gossiper.member_id().clone(), gossiper);
    }

    /// Make every exchange with `member` fail.
    pub fn disconnect(&self, member: impl Into<MemberId>) {
        self.disconnected.insert(member.into(), ());
    }

    /// Undo `disconnect`.
    pub fn reconnect(&self, member: impl Into<MemberId>) {
        self.disconnected.remove(&member.into());
    }

    fn is_reachable(&self, member: &MemberId) -> bool {
        !self.disconnected.contains_key(member)
    }
}

/// Transport of one member on a [`LocalGossipNetwork`].
pub struct LocalGossipTransport {
    local: MemberId,
    network: Arc<LocalGossipNetwork>,
}

#[async_trait]
impl GossipTransport for LocalGossipTransport {
    fn peers(&self) -> Vec<MemberId> {
        self.network
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|member| *member != self.local)
            .collect()
    }

    async fn exchange(&self, peer: &MemberId, state: GossipState) -> TopologyResult<GossipState> {
        if !self.network.is_reachable(&self.local) || !self.network.is_reachable(peer) {
            return Err(TopologyError::Network(format!("{} is unreachable", peer)));
        }
        let target = self
            .network
            .nodes
            .get(peer)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TopologyError::Network(format!("Unknown member {}", peer)))?;
        target.handle_gossip(state).await
    }
}
