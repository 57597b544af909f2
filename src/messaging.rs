/// Request/response messaging between members.
///
/// `MessagingService` listens for inbound connections and keeps one pooled
/// outbound connection per peer address. Requests are correlated to replies
/// by message id. Every connection runs in its own task that owns the
/// connection's heartbeat handler and idle timer, so heartbeat state is only
/// ever touched by that task.
///
/// When a connection closes, for any reason, every request still waiting on
/// it fails with `TopologyError::ConnectionClosed`. Waiters that gave up on
/// their own (a request timeout) are pruned while the connection stays open.
use crate::config::{HeartbeatConfig, MessagingConfig};
use crate::error::{TopologyError, TopologyResult};
use crate::heartbeat::{HeartbeatHandler, IdleAction, MessageIdGenerator, HEARTBEAT_SUBJECT};
use crate::network::{
    self, FrameReader, FrameWriter, Listener, ProtocolMessage, ProtocolReply, ProtocolRequest,
    ReplyStatus,
};
use crate::types::MemberId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};

/// Handles requests for one subject.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the reply payload for `request`.
    async fn handle(&self, request: ProtocolRequest) -> TopologyResult<Vec<u8>>;
}

type Handlers = Arc<DashMap<String, Arc<dyn RequestHandler>>>;

type ReplySender = oneshot::Sender<TopologyResult<ProtocolReply>>;

struct OutboundRequest {
    request: ProtocolRequest,
    reply: ReplySender,
}

/// Handle to one pooled outbound connection.
#[derive(Clone)]
struct Connection {
    requests: mpsc::Sender<OutboundRequest>,
    in_flight: Arc<AtomicUsize>,
}

/// Node-wide messaging endpoint.
pub struct MessagingService {
    member_id: MemberId,
    local_addr: SocketAddr,
    config: MessagingConfig,
    ids: Arc<MessageIdGenerator>,
    handlers: Handlers,
    connections: DashMap<SocketAddr, Connection>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MessagingService {
    /// Bind the listener and start accepting connections.
    pub async fn bind(
        member_id: MemberId,
        bind_addr: SocketAddr,
        config: MessagingConfig,
    ) -> TopologyResult<Self> {
        let listener = Listener::bind(bind_addr).await?;
        let local_addr = listener.local_addr();
        let (shutdown_tx, _) = broadcast::channel(1);
        let handlers: Handlers = Arc::new(DashMap::new());

        let accept_handlers = Arc::clone(&handlers);
        let heartbeat = config.heartbeat.clone();
        let accept_shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            trace!(%peer_addr, "Accepted connection");
                            tokio::spawn(run_server_connection(
                                stream,
                                peer_addr,
                                heartbeat.clone(),
                                Arc::clone(&accept_handlers),
                                accept_shutdown.subscribe(),
                            ));
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        info!(member = %member_id, addr = %local_addr, "Messaging service listening");
        Ok(Self {
            member_id,
            local_addr,
            config,
            ids: Arc::new(MessageIdGenerator::new()),
            handlers,
            connections: DashMap::new(),
            shutdown_tx,
        })
    }

    /// This node's member id.
    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    /// The bound address (differs from the requested one when port 0 was used).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Route requests for `subject` to `handler`, replacing any previous one.
    pub fn register_handler(&self, subject: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(subject.into(), handler);
    }

    /// Requests written to a peer whose reply is still awaited, across all
    /// outbound connections.
    pub fn in_flight_requests(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| entry.value().in_flight.load(Ordering::Relaxed))
            .sum()
    }

    /// Send a request to `addr` and wait for the reply payload.
    ///
    /// # Errors
    ///
    /// - `Timeout` if no reply arrives within the request timeout
    /// - `ConnectionClosed` if the connection closes first
    /// - `Remote` if the peer answered with a non-`Ok` status
    pub async fn send_and_receive(
        &self,
        addr: SocketAddr,
        subject: &str,
        payload: Vec<u8>,
    ) -> TopologyResult<Vec<u8>> {
        let connection = self.connection(addr).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ProtocolRequest {
            id: self.ids.next_id(),
            sender: self.member_id.clone(),
            subject: subject.to_string(),
            payload,
        };
        connection
            .requests
            .send(OutboundRequest {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TopologyError::ConnectionClosed)?;

        let reply = match timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(TopologyError::ConnectionClosed),
            Err(_) => {
                return Err(TopologyError::Timeout(format!(
                    "No reply to {} from {} within {:?}",
                    subject, addr, self.config.request_timeout
                )));
            }
        };

        match reply.status {
            ReplyStatus::Ok => Ok(reply.payload),
            status => Err(TopologyError::Remote {
                status,
                message: String::from_utf8_lossy(&reply.payload).into_owned(),
            }),
        }
    }

    /// Close every connection and stop accepting new ones.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.connections.clear();
    }

    async fn connection(&self, addr: SocketAddr) -> TopologyResult<Connection> {
        if let Some(existing) = self.connections.get(&addr).map(|entry| entry.value().clone()) {
            if !existing.requests.is_closed() {
                return Ok(existing);
            }
        }

        let stream = timeout(self.config.connect_timeout, network::connect(addr))
            .await
            .map_err(|_| {
                TopologyError::Timeout(format!(
                    "Connecting to {} took longer than {:?}",
                    addr, self.config.connect_timeout
                ))
            })??;

        let (tx, rx) = mpsc::channel(64);
        let connection = Connection {
            requests: tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        tokio::spawn(run_client_connection(
            stream,
            addr,
            self.config.heartbeat.clone(),
            self.member_id.clone(),
            Arc::clone(&self.ids),
            rx,
            Arc::clone(&connection.in_flight),
            self.shutdown_tx.subscribe(),
        ));
        debug!(peer_addr = %addr, "Opened connection");
        self.connections.insert(addr, connection.clone());
        Ok(connection)
    }
}

impl Drop for MessagingService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Read frames in a separate task so a partially read frame is never lost
/// to a `select!` branch being cancelled.
fn spawn_reader(
    mut reader: FrameReader,
) -> (mpsc::Receiver<TopologyResult<ProtocolMessage>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        loop {
            match reader.read_message().await {
                Ok(Some(message)) => {
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    (rx, handle)
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_client_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: HeartbeatConfig,
    member_id: MemberId,
    ids: Arc<MessageIdGenerator>,
    mut outbound: mpsc::Receiver<OutboundRequest>,
    in_flight: Arc<AtomicUsize>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (reader, mut writer) = network::split(stream);
    let (mut inbound, reader_task) = spawn_reader(reader);
    let mut heartbeat = HeartbeatHandler::client(&config, member_id, ids);
    let mut timer = heartbeat.idle_timer(&config);
    let mut pending: HashMap<u64, ReplySender> = HashMap::new();

    loop {
        tokio::select! {
            request = outbound.recv() => {
                let Some(OutboundRequest { request, reply }) = request else { break };
                let id = request.id;
                if let Err(e) = writer.write_message(&ProtocolMessage::Request(request)).await {
                    let _ = reply.send(Err(e));
                    break;
                }
                timer.record_write();
                pending.retain(|_, waiter| !waiter.is_closed());
                pending.insert(id, reply);
                in_flight.store(pending.len(), Ordering::Relaxed);
            }
            message = inbound.recv() => match message {
                Some(Ok(ProtocolMessage::Reply(reply))) => {
                    timer.record_read();
                    if !heartbeat.on_reply(&reply).forward {
                        continue;
                    }
                    let waiter = pending.remove(&reply.id);
                    in_flight.store(pending.len(), Ordering::Relaxed);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(Ok(reply));
                        }
                        None => trace!(id = reply.id, %peer_addr, "Reply without waiting request"),
                    }
                }
                Some(Ok(ProtocolMessage::Request(request))) => {
                    timer.record_read();
                    warn!(id = request.id, %peer_addr, "Ignoring request on outbound connection");
                }
                Some(Err(e)) => {
                    debug!(error = %e, %peer_addr, "Connection failed");
                    break;
                }
                None => {
                    debug!(%peer_addr, "Connection closed by peer");
                    break;
                }
            },
            _ = idle(timer.next_deadline()) => {
                pending.retain(|_, waiter| !waiter.is_closed());
                in_flight.store(pending.len(), Ordering::Relaxed);
                let mut close = false;
                for state in timer.poll_idle(Instant::now()) {
                    match heartbeat.on_idle(state) {
                        IdleAction::Nothing => {}
                        IdleAction::SendHeartbeat(request) => {
                            if writer.write_message(&ProtocolMessage::Request(request)).await.is_err() {
                                close = true;
                            }
                            timer.record_write();
                        }
                        IdleAction::Close => close = true,
                    }
                }
                if close {
                    info!(%peer_addr, "Closing connection to unresponsive peer");
                    break;
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    reader_task.abort();
    writer.shutdown().await;
    outbound.close();
    in_flight.store(0, Ordering::Relaxed);
    for (_, waiter) in pending.drain() {
        let _ = waiter.send(Err(TopologyError::ConnectionClosed));
    }
    while let Ok(OutboundRequest { reply, .. }) = outbound.try_recv() {
        let _ = reply.send(Err(TopologyError::ConnectionClosed));
    }
}

async fn run_server_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: HeartbeatConfig,
    handlers: Handlers,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (reader, mut writer) = network::split(stream);
    let (mut inbound, reader_task) = spawn_reader(reader);
    let mut heartbeat = HeartbeatHandler::server(&config);
    let mut timer = heartbeat.idle_timer(&config);
    let (replies_tx, mut replies_rx) = mpsc::channel::<ProtocolReply>(64);

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(Ok(ProtocolMessage::Request(request))) => {
                    timer.record_read();
                    let action = heartbeat.on_request(&request);
                    if let Some(reply) = action.reply {
                        if writer.write_message(&ProtocolMessage::Reply(reply)).await.is_err() {
                            break;
                        }
                        timer.record_write();
                    }
                    if action.forward {
                        dispatch(request, &handlers, replies_tx.clone());
                    }
                }
                Some(Ok(ProtocolMessage::Reply(reply))) => {
                    timer.record_read();
                    warn!(id = reply.id, %peer_addr, "Ignoring reply on inbound connection");
                }
                Some(Err(e)) => {
                    debug!(error = %e, %peer_addr, "Connection failed");
                    break;
                }
                None => break,
            },
            Some(reply) = replies_rx.recv() => {
                if writer.write_message(&ProtocolMessage::Reply(reply)).await.is_err() {
                    break;
                }
                timer.record_write();
            }
            _ = idle(timer.next_deadline()) => {
                let close = timer
                    .poll_idle(Instant::now())
                    .into_iter()
                    .any(|state| heartbeat.on_idle(state) == IdleAction::Close);
                if close {
                    info!(%peer_addr, "Closing connection from unresponsive peer");
                    break;
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    reader_task.abort();
    writer.shutdown().await;
}

/// Run the handler for `request` off the connection task.
///
/// Heartbeats reach a handler only when forwarding is enabled; their reply
/// has already been written, so whatever the handler returns is dropped.
fn dispatch(request: ProtocolRequest, handlers: &Handlers, replies: mpsc::Sender<ProtocolReply>) {
    let is_heartbeat = request.subject == HEARTBEAT_SUBJECT;
    let handler = handlers
        .get(&request.subject)
        .map(|entry| Arc::clone(entry.value()));

    let Some(handler) = handler else {
        if !is_heartbeat {
            debug!(subject = %request.subject, "No handler registered");
            let reply = ProtocolReply::error(
                request.id,
                ReplyStatus::ErrorNoHandler,
                format!("No handler for subject {}", request.subject),
            );
            tokio::spawn(async move {
                let _ = replies.send(reply).await;
            });
        }
        return;
    };

    tokio::spawn(async move {
        let id = request.id;
        let subject = request.subject.clone();
        let reply = match handler.handle(request).await {
            Ok(payload) => ProtocolReply::ok(id, payload),
            Err(e) => {
                debug!(error = %e, %subject, "Request handler failed");
                ProtocolReply::error(id, ReplyStatus::ErrorHandlerException, e.to_string())
            }
        };
        if !is_heartbeat {
            let _ = replies.send(reply).await;
        }
    });
}
