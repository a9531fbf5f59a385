use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;

use tracing::{debug, info, warn};

use super::{TunnelState, on_channel_readable, on_socket_readable, report_server_error};
use crate::channel::Channel;
use crate::error::{BridgeError, Result};
use crate::multiplexer::{Flow, Multiplexer, StopHandle};
use crate::protocol::{ConnectionId, ProxyEvent};

/// Child side of the tunnel: accepts local connections and forwards them
/// to the host through the channel.
pub struct TunnelClient {
    mux: Multiplexer<ClientState>,
    state: ClientState,
}

struct ClientState {
    channel: Channel,
    listener: TcpListener,
    connections: HashMap<ConnectionId, TcpStream>,
    // The other side asked us to stop, so there is nobody to tell
    peer_stopped: bool,
}

impl TunnelClient {
    pub fn new(channel: Channel, listener: TcpListener) -> Result<Self> {
        Ok(Self {
            mux: Multiplexer::new()?,
            state: ClientState {
                channel,
                listener,
                connections: HashMap::new(),
                peer_stopped: false,
            },
        })
    }

    /// Serve until the host stops, a [`StopHandle`] fires, or a fatal error.
    ///
    /// A fatal error is reported to the host as `server_error` and returned
    /// once every local connection has been closed.
    pub fn start(&mut self) -> Result<()> {
        let channel_fd = self
            .state
            .channel
            .read_fd()
            .ok_or(BridgeError::ChannelClosed)?;
        let listener_fd = self.state.listener.as_raw_fd();

        self.state.peer_stopped = false;
        self.mux
            .register(listener_fd, |mux, state, _| state.on_accept(mux));
        self.mux
            .register(channel_fd, |mux, state, _| on_channel_readable(mux, state));

        info!(
            addr = ?self.state.listener.local_addr().ok(),
            "Tunnel client listening"
        );

        match self.mux.run(&mut self.state) {
            Ok(()) if self.state.peer_stopped => {
                self.state.close_all(&mut self.mux);
                self.mux.clear();
                info!("Tunnel client stopped by host");
                Ok(())
            }
            Ok(()) => self.stop(),
            Err(e) => {
                self.state.close_all(&mut self.mux);
                self.mux.clear();
                report_server_error(ClientState::SIDE, &self.state.channel, &e);
                Err(e)
            }
        }
    }

    /// Close every local connection and tell the host to stop
    pub fn stop(&mut self) -> Result<()> {
        let closed = self.state.close_all(&mut self.mux);
        self.mux.clear();
        info!(closed, "Tunnel client stopping");
        self.state.channel.send(&ProxyEvent::Stop)
    }

    /// Ends a running [`start`](Self::start) from another thread; the host
    /// is told to stop as well.
    pub fn stop_handle(&self) -> StopHandle {
        self.mux.stop_handle()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }
}

impl ClientState {
    fn on_accept(&mut self, mux: &mut Multiplexer<Self>) -> Result<Flow> {
        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionAborted
                ) =>
            {
                warn!("Accept failed, retrying: {}", e);
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e.into()),
        };

        let fd = stream.as_raw_fd();
        let id = ConnectionId(fd);
        mux.register(fd, move |mux, state, fd| on_socket_readable(mux, state, fd, id));
        self.connections.insert(id, stream);
        debug!(%id, %peer_addr, "Accepted local connection");

        self.channel.send(&ProxyEvent::Open { id })?;
        Ok(Flow::Continue)
    }

    fn close_all(&mut self, mux: &mut Multiplexer<Self>) -> usize {
        let count = self.connections.len();
        for (id, _stream) in self.connections.drain() {
            mux.unregister(id.0);
        }
        count
    }
}

impl TunnelState for ClientState {
    const SIDE: &'static str = "client";

    fn channel(&self) -> &Channel {
        &self.channel
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut TcpStream> {
        self.connections.get_mut(&id)
    }

    fn drop_connection(&mut self, mux: &mut Multiplexer<Self>, id: ConnectionId) -> bool {
        mux.unregister(id.0);
        self.connections.remove(&id).is_some()
    }

    fn apply(&mut self, mux: &mut Multiplexer<Self>, event: ProxyEvent) -> Result<Flow> {
        match event {
            ProxyEvent::Data { id, payload } => {
                self.write_to(id, &payload)?;
                Ok(Flow::Continue)
            }
            ProxyEvent::Close { id } => {
                self.close_from_peer(mux, id);
                Ok(Flow::Continue)
            }
            ProxyEvent::ConnectionError { id, message } => {
                warn!(%id, message = message.as_deref().unwrap_or(""), "Host reported connection error");
                self.close_from_peer(mux, id);
                Ok(Flow::Continue)
            }
            ProxyEvent::Stop => {
                self.peer_stopped = true;
                Ok(Flow::Stop)
            }
            ProxyEvent::ServerError { error } => {
                warn!("Host side failed: {}", error);
                self.peer_stopped = true;
                Ok(Flow::Stop)
            }
            ProxyEvent::Open { id } => Err(BridgeError::Protocol(format!(
                "unexpected open for connection {} on client side",
                id
            ))),
        }
    }
}
