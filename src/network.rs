/// Wire protocol for node-to-node messaging.
///
/// Every connection carries [`ProtocolMessage`]s: requests with a subject and
/// an opaque payload, and replies correlated to a request by its id. Each
/// frame is a 4-byte big-endian length header followed by the
/// bincode-encoded message.
///
/// Connections are duplex. [`FrameReader`] and [`FrameWriter`] wrap the two
/// halves so the reading side can live in its own task.
use crate::error::{TopologyError, TopologyResult};
use crate::types::MemberId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Default port for cluster messaging.
pub const DEFAULT_PORT: u16 = 26502;

/// Maximum frame size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A request addressed to the handler registered for `subject`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRequest {
    /// Correlation id, unique per sending node.
    pub id: u64,
    /// The sending member.
    pub sender: MemberId,
    /// Handler selector.
    pub subject: String,
    /// Opaque body.
    pub payload: Vec<u8>,
}

/// Outcome of a request on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// The handler produced a reply.
    Ok,
    /// No handler is registered for the subject.
    ErrorNoHandler,
    /// The handler failed; the payload holds the message.
    ErrorHandlerException,
    /// The request could not be understood.
    ProtocolError,
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::ErrorNoHandler => "no handler",
            ReplyStatus::ErrorHandlerException => "handler error",
            ReplyStatus::ProtocolError => "protocol error",
        };
        f.write_str(name)
    }
}

/// Reply to the request with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolReply {
    /// Id of the request being answered.
    pub id: u64,
    /// Remote outcome.
    pub status: ReplyStatus,
    /// Opaque body.
    pub payload: Vec<u8>,
}

impl ProtocolReply {
    /// Successful reply.
    pub fn ok(id: u64, payload: Vec<u8>) -> Self {
        Self {
            id,
            status: ReplyStatus::Ok,
            payload,
        }
    }

    /// Failed reply with a human readable message.
    pub fn error(id: u64, status: ReplyStatus, message: impl Into<String>) -> Self {
        Self {
            id,
            status,
            payload: message.into().into_bytes(),
        }
    }
}

/// A frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Request(ProtocolRequest),
    Reply(ProtocolReply),
}

impl ProtocolMessage {
    /// Serialize message to bytes.
    pub fn to_bytes(&self) -> TopologyResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message from bytes.
    pub fn from_bytes(bytes: &[u8]) -> TopologyResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Reading half of a connection.
pub struct FrameReader<R = OwnedReadHalf> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next message, or `None` if the peer closed the connection
    /// between frames.
    pub async fn read_message(&mut self) -> TopologyResult<Option<ProtocolMessage>> {
        let mut len_bytes = [0u8; 4];
        match self.inner.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(TopologyError::Network(format!(
                    "Failed to read message length: {}",
                    e
                )));
            }
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(TopologyError::Protocol(format!(
                "Message too large: {} bytes (max: {})",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut bytes = vec![0u8; len];
        self.inner
            .read_exact(&mut bytes)
            .await
            .map_err(|e| TopologyError::Network(format!("Failed to read message body: {}", e)))?;

        ProtocolMessage::from_bytes(&bytes).map(Some)
    }
}

/// Writing half of a connection.
pub struct FrameWriter<W = OwnedWriteHalf> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one message and flush it.
    pub async fn write_message(&mut self, message: &ProtocolMessage) -> TopologyResult<()> {
        let bytes = message.to_bytes()?;

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(TopologyError::Protocol(format!(
                "Message too large: {} bytes (max: {})",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let len = bytes.len() as u32;
        self.inner
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| TopologyError::Network(format!("Failed to write message length: {}", e)))?;
        self.inner
            .write_all(&bytes)
            .await
            .map_err(|e| TopologyError::Network(format!("Failed to write message body: {}", e)))?;
        self.inner
            .flush()
            .await
            .map_err(|e| TopologyError::Network(format!("Failed to flush stream: {}", e)))?;

        Ok(())
    }

    /// Shut down the write side.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Split a TCP stream into framed halves.
pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (FrameReader::new(read_half), FrameWriter::new(write_half))
}

/// Connect to a peer.
pub async fn connect(addr: SocketAddr) -> TopologyResult<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TopologyError::Network(format!("Failed to connect to {}: {}", addr, e)))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// TCP listener for incoming cluster connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to an address and start listening.
    pub async fn bind(addr: SocketAddr) -> TopologyResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TopologyError::Network(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| TopologyError::Network(format!("Failed to get local address: {}", e)))?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> TopologyResult<(TcpStream, SocketAddr)> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TopologyError::Network(format!("Failed to accept connection: {}", e)))?;
        let _ = stream.set_nodelay(true);
        Ok((stream, peer_addr))
    }
}
