//! TCP tunneling over a [`Channel`]
//!
//! [`TunnelClient`] runs inside the child: it accepts local connections and
//! pushes their traffic into the channel. [`TunnelServer`] runs on the host:
//! it opens a real upstream socket per forwarded connection and relays
//! replies back. Both sides run a single-threaded [`Multiplexer`] and speak
//! [`ProxyEvent`]s.
//!
//! Failures are split the same way on both sides: anything scoped to one
//! connection is reported to the other side as `connection_error` and that
//! connection is dropped; anything else ends the tunnel and is reported as
//! `server_error`.
//!
//! [`Channel`]: crate::Channel

mod client;
mod server;

#[cfg(test)]
mod tests;

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::channel::{Channel, Received};
use crate::constants::READ_BUFFER_SIZE;
use crate::error::{ConnectionError, Result};
use crate::multiplexer::{Flow, Multiplexer};
use crate::protocol::{ConnectionId, ProxyEvent};

pub use client::TunnelClient;
pub use server::TunnelServer;

/// Opens the real upstream connection for each forwarded connection
pub trait Connector: Send {
    fn connect(&mut self) -> std::io::Result<TcpStream>;
}

impl<F> Connector for F
where
    F: FnMut() -> std::io::Result<TcpStream> + Send,
{
    fn connect(&mut self) -> std::io::Result<TcpStream> {
        self()
    }
}

/// Connects to a fixed address, optionally with a timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub addr: SocketAddr,
    pub timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> std::io::Result<TcpStream> {
        match self.timeout {
            Some(timeout) => TcpStream::connect_timeout(&self.addr, timeout),
            None => TcpStream::connect(self.addr),
        }
    }
}

/// Per-side state driven by the shared dispatch functions below
pub(crate) trait TunnelState: Sized {
    const SIDE: &'static str;

    fn channel(&self) -> &Channel;

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut TcpStream>;

    /// Unregister and close a connection. `false` if it was not tracked.
    fn drop_connection(&mut self, mux: &mut Multiplexer<Self>, id: ConnectionId) -> bool;

    /// Handle one event from the other side
    fn apply(&mut self, mux: &mut Multiplexer<Self>, event: ProxyEvent) -> Result<Flow>;

    /// Write forwarded bytes to the matching local socket
    fn write_to(&mut self, id: ConnectionId, payload: &[u8]) -> Result<()> {
        let stream = self
            .connection_mut(id)
            .ok_or_else(|| ConnectionError::new(id, "unknown connection"))?;
        stream
            .write_all(payload)
            .map_err(|e| ConnectionError::io(id, &e))?;
        Ok(())
    }

    /// Close a connection the other side tore down
    fn close_from_peer(&mut self, mux: &mut Multiplexer<Self>, id: ConnectionId) {
        if self.drop_connection(mux, id) {
            debug!(side = Self::SIDE, %id, "Connection closed by other side");
        } else {
            debug!(side = Self::SIDE, %id, "Close for unknown connection");
        }
    }
}

/// Channel readable: decode one event and apply it, isolating failures
/// scoped to a single connection.
pub(crate) fn on_channel_readable<S: TunnelState>(
    mux: &mut Multiplexer<S>,
    state: &mut S,
) -> Result<Flow> {
    let event = match state.channel().receive::<ProxyEvent>()? {
        Received::Message(event) => event,
        Received::EndOfStream => ProxyEvent::Stop,
    };
    trace!(side = S::SIDE, kind = event.kind(), "Channel event");

    let kind = event.kind();
    let id = event.connection_id();
    let teardown = event.is_teardown();

    match state.apply(mux, event) {
        Err(err) if err.is_connection_scoped() => {
            error!(side = S::SIDE, kind, "Error handling channel event: {}", err);
            if let Some(id) = id {
                if !teardown {
                    state.channel().send(&ProxyEvent::ConnectionError {
                        id,
                        message: Some(err.to_string()),
                    })?;
                }
                state.drop_connection(mux, id);
            }
            Ok(Flow::Continue)
        }
        other => other,
    }
}

/// Local socket readable: forward what arrived, or report the close.
pub(crate) fn on_socket_readable<S: TunnelState>(
    mux: &mut Multiplexer<S>,
    state: &mut S,
    fd: RawFd,
    id: ConnectionId,
) -> Result<Flow> {
    let Some(stream) = state.connection_mut(id) else {
        mux.unregister(fd);
        return Ok(Flow::Continue);
    };

    match read_available(stream) {
        Ok(Readable::Data(payload)) => {
            trace!(side = S::SIDE, %id, bytes = payload.len(), "Forwarding data");
            state.channel().send(&ProxyEvent::Data { id, payload })?;
        }
        Ok(Readable::Closed) => {
            debug!(side = S::SIDE, %id, "Connection closed locally");
            state.drop_connection(mux, id);
            state.channel().send(&ProxyEvent::Close { id })?;
        }
        Ok(Readable::Nothing) => {}
        Err(e) => {
            warn!(side = S::SIDE, %id, "Read failed: {}", e);
            state.drop_connection(mux, id);
            state.channel().send(&ProxyEvent::ConnectionError {
                id,
                message: Some(e.to_string()),
            })?;
        }
    }
    Ok(Flow::Continue)
}

/// Report a fatal tunnel error to the other side, if it can still hear us
pub(crate) fn report_server_error(side: &'static str, channel: &Channel, err: &crate::BridgeError) {
    error!(side, "Tunnel failed: {}", err);
    let event = ProxyEvent::ServerError { error: err.into() };
    if let Err(e) = channel.send(&event) {
        warn!(side, "Could not report failure to other side: {}", e);
    }
}

pub(crate) enum Readable {
    Data(Vec<u8>),
    Closed,
    Nothing,
}

pub(crate) fn read_available(stream: &mut TcpStream) -> std::io::Result<Readable> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        return match stream.read(&mut buf) {
            Ok(0) => Ok(Readable::Closed),
            Ok(n) => {
                buf.truncate(n);
                Ok(Readable::Data(buf))
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Readable::Nothing),
            Err(e) => Err(e),
        };
    }
}
