//! Host/child plumbing for running code inside an isolated process
//!
//! This crate provides the pieces a host needs to talk to work it runs in a
//! separate child context: a boundary call that returns a value or re-raises
//! an error, a framed bidirectional channel, a readiness multiplexer, and a
//! TCP tunnel that forwards connections made inside the child out through
//! the host.

pub mod boundary;
pub mod channel;
pub mod constants;
pub mod error;
pub mod multiplexer;
pub mod protocol;
pub mod proxy;
pub mod utils;

// Re-export commonly used types for convenience
pub use boundary::{
    AttachOptions, Attached, Boundary, BoundaryExt, ChildStatus, ChildTask, ExecuteOptions,
    ForkBoundary, Pid,
};
pub use channel::{Channel, Received, Role};
pub use error::{BridgeError, ConnectionError, RemoteError, Result};
pub use multiplexer::{Flow, Multiplexer, StopHandle};
pub use protocol::{ConnectionId, Outcome, ProxyEvent};
pub use proxy::{Connector, TcpConnector, TunnelClient, TunnelServer};
pub use utils::{decode_payload, encode_payload};
