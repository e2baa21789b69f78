//! Error types for syncsocket

use thiserror::Error;

use crate::{ChannelId, ChannelState, ProtocolEvent};

/// Core syncsocket errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncSocketError {
    // Protocol errors
    #[error("Invalid transition: {event} in state {state}")]
    InvalidTransition {
        event: ProtocolEvent,
        state: ChannelState,
    },

    #[error("Insufficient privileges for publishing messages (channel: {0})")]
    PublishDenied(ChannelId),

    #[error("Unroutable envelope: {0}")]
    UnroutableEnvelope(String),

    // Clock errors
    #[error("Clock sync failed (error {error}ms)")]
    SyncFailure { error: f64 },

    #[error("Initialized with undefined timeserver")]
    MissingTimeserver,

    #[error("Schedule envelope carries no timeticket")]
    MissingTimeticket,

    #[error("No successful clock sync yet")]
    NotSynchronized,

    // Wire errors
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    // Connection errors
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Channel closed: {0}")]
    ChannelClosed(ChannelId),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    TransportError(String),
}

impl SyncSocketError {
    /// Fatal errors must surface to the caller instead of being absorbed
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncSocketError::MissingTimeserver)
    }
}

/// Result type for syncsocket operations
pub type SyncSocketResult<T> = Result<T, SyncSocketError>;
