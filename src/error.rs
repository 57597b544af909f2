//! Error types for cluster topology management.
//!
//! The variants follow how a failure surfaces to callers: validation errors
//! are raised before any state is touched, execution errors halt a change
//! plan and leave it persisted, and transport errors stay inside the gossip
//! and messaging layers.
use crate::network::ReplyStatus;
use crate::types::MemberId;
use thiserror::Error;

/// The main error type for topology operations.
///
/// All fallible operations in this crate return `Result<T, TopologyError>`.
#[derive(Error, Debug)]
pub enum TopologyError {
    /// A change request was rejected before any mutation took place
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Why the request was rejected
        reason: String,
    },

    /// An executor failed while applying an operation of a committed plan
    #[error("Operation {operation} failed: {reason}")]
    OperationFailed {
        /// Display form of the failed operation
        operation: String,
        /// Failure reported by the executor
        reason: String,
    },

    /// Another change plan is still being applied
    #[error("Change {change_id} is still in progress")]
    ChangeInProgress {
        /// Id of the in-flight change
        change_id: u64,
    },

    /// Changes are only accepted by the member that coordinates them
    #[error(
        "Member is not the change coordinator (coordinator: {})",
        .coordinator.as_ref().map_or_else(|| "none".to_string(), ToString::to_string)
    )]
    NotCoordinator {
        /// The member that accepts changes, if the configuration names one
        coordinator: Option<MemberId>,
    },

    /// Cancellation was requested but there is no failed change to cancel
    #[error("No failed change to cancel or retry")]
    NoChangeToCancel,

    /// Compare-and-set observed a different version than expected
    #[error("Concurrent modification: expected version {expected}, found {actual}")]
    ConcurrentModification {
        /// Version the caller based its update on
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// The local configuration has not been initialized yet
    #[error("Cluster configuration is not initialized")]
    NotInitialized,

    /// Durable storage failed; the in-memory configuration is unchanged
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary (de)serialization failed
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Connecting to or talking with a peer failed
    #[error("Network error: {0}")]
    Network(String),

    /// The connection was closed while a request was in flight
    #[error("Connection closed")]
    ConnectionClosed,

    /// A request did not complete within its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote side answered with a non-OK status
    #[error("Remote error ({status:?}): {message}")]
    Remote {
        /// Status carried by the reply
        status: ReplyStatus,
        /// Message decoded from the reply payload
        message: String,
    },

    /// The peer violated the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TopologyError {
    /// Shorthand for an [`TopologyError::InvalidRequest`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Whether the error was raised before any state changed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest { .. }
                | Self::ChangeInProgress { .. }
                | Self::NotCoordinator { .. }
                | Self::NoChangeToCancel
        )
    }
}

/// Result type alias for topology operations.
pub type TopologyResult<T> = Result<T, TopologyError>;
