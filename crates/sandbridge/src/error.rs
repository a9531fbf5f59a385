use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ConnectionId;

/// Error types for channels, boundary calls and tunnels
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Multiplexer error: {0}")]
    Multiplexer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

impl BridgeError {
    /// Whether the failure concerns a single tunneled connection only.
    ///
    /// Dispatchers isolate these (report, clean up, keep running) and let
    /// everything else terminate the loop.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, BridgeError::Connection(_))
    }
}

/// Type alias for Results using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure confined to one tunneled connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Connection {id} failed: {message}")]
pub struct ConnectionError {
    pub id: ConnectionId,
    pub message: String,
}

impl ConnectionError {
    pub fn new(id: ConnectionId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
        }
    }

    pub fn io(id: ConnectionId, err: &std::io::Error) -> Self {
        Self::new(id, err.to_string())
    }
}

/// An error object that can cross the process boundary
///
/// `kind` names the error type as seen by whoever raised it, `message` is its
/// display text. Both survive serialization unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture any error, naming it after its concrete type.
    pub fn capture<E: std::error::Error>(err: &E) -> Self {
        let kind = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error");
        Self::new(kind, err.to_string())
    }
}

impl From<anyhow::Error> for RemoteError {
    fn from(err: anyhow::Error) -> Self {
        Self::new("Error", format!("{:#}", err))
    }
}

impl From<&BridgeError> for RemoteError {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::Remote(remote) => remote.clone(),
            other => Self::new("BridgeError", other.to_string()),
        }
    }
}
