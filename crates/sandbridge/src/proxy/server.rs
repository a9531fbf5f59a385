use std::collections::HashMap;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, info, warn};

use super::{Connector, TunnelState, on_channel_readable, on_socket_readable, report_server_error};
use crate::channel::Channel;
use crate::error::{BridgeError, ConnectionError, Result};
use crate::multiplexer::{Flow, Multiplexer, StopHandle};
use crate::protocol::{ConnectionId, ProxyEvent};

/// Host side of the tunnel: opens an upstream connection for every
/// connection the child forwards and relays traffic both ways.
pub struct TunnelServer<C> {
    mux: Multiplexer<ServerState<C>>,
    state: ServerState<C>,
}

struct ServerState<C> {
    channel: Channel,
    connector: C,
    connections: HashMap<ConnectionId, TcpStream>,
    by_socket: HashMap<RawFd, ConnectionId>,
}

impl<C: Connector + 'static> TunnelServer<C> {
    pub fn new(channel: Channel, connector: C) -> Result<Self> {
        Ok(Self {
            mux: Multiplexer::new()?,
            state: ServerState {
                channel,
                connector,
                connections: HashMap::new(),
                by_socket: HashMap::new(),
            },
        })
    }

    /// Relay until the child stops, [`stop`](Self::stop) is called, or a
    /// fatal error. Every upstream socket is closed on return.
    pub fn start(&mut self) -> Result<()> {
        let channel_fd = self
            .state
            .channel
            .read_fd()
            .ok_or(BridgeError::ChannelClosed)?;
        self.mux
            .register(channel_fd, |mux, state, _| on_channel_readable(mux, state));
        info!("Tunnel server started");

        let result = self.mux.run(&mut self.state);
        let closed = self.state.close_all(&mut self.mux);
        self.mux.clear();

        match result {
            Ok(()) => {
                info!(closed, "Tunnel server stopped");
                Ok(())
            }
            Err(e) => {
                report_server_error(ServerState::<C>::SIDE, &self.state.channel, &e);
                Err(e)
            }
        }
    }

    /// Ask a running [`start`](Self::start) to return
    pub fn stop(&self) -> Result<()> {
        self.mux.stop_handle().stop()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.mux.stop_handle()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }
}

impl<C: Connector + 'static> ServerState<C> {
    fn open_upstream(&mut self, mux: &mut Multiplexer<Self>, id: ConnectionId) -> Result<()> {
        if self.connections.contains_key(&id) {
            warn!(%id, "Open for a connection that is already tracked, replacing it");
            self.drop_connection(mux, id);
        }

        let stream = self
            .connector
            .connect()
            .map_err(|e| ConnectionError::io(id, &e))?;
        let fd = stream.as_raw_fd();

        mux.register(fd, |mux, state, fd| {
            let Some(id) = state.by_socket.get(&fd).copied() else {
                mux.unregister(fd);
                return Ok(Flow::Continue);
            };
            on_socket_readable(mux, state, fd, id)
        });
        self.by_socket.insert(fd, id);
        self.connections.insert(id, stream);
        debug!(%id, upstream_fd = fd, "Opened upstream connection");
        Ok(())
    }

    fn close_all(&mut self, mux: &mut Multiplexer<Self>) -> usize {
        self.by_socket.clear();
        let count = self.connections.len();
        for (_, stream) in self.connections.drain() {
            mux.unregister(stream.as_raw_fd());
        }
        count
    }
}

impl<C: Connector + 'static> TunnelState for ServerState<C> {
    const SIDE: &'static str = "server";

    fn channel(&self) -> &Channel {
        &self.channel
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut TcpStream> {
        self.connections.get_mut(&id)
    }

    fn drop_connection(&mut self, mux: &mut Multiplexer<Self>, id: ConnectionId) -> bool {
        let Some(stream) = self.connections.remove(&id) else {
            return false;
        };
        let fd = stream.as_raw_fd();
        mux.unregister(fd);
        self.by_socket.remove(&fd);
        true
    }

    fn apply(&mut self, mux: &mut Multiplexer<Self>, event: ProxyEvent) -> Result<Flow> {
        match event {
            ProxyEvent::Open { id } => {
                self.open_upstream(mux, id)?;
                Ok(Flow::Continue)
            }
            ProxyEvent::Data { id, payload } => {
                self.write_to(id, &payload)?;
                Ok(Flow::Continue)
            }
            ProxyEvent::Close { id } => {
                self.close_from_peer(mux, id);
                Ok(Flow::Continue)
            }
            ProxyEvent::ConnectionError { id, message } => {
                warn!(%id, message = message.as_deref().unwrap_or(""), "Client reported connection error");
                self.close_from_peer(mux, id);
                Ok(Flow::Continue)
            }
            ProxyEvent::Stop => {
                debug!("Client asked to stop");
                Ok(Flow::Stop)
            }
            ProxyEvent::ServerError { error } => {
                warn!("Client side failed: {}", error);
                Ok(Flow::Stop)
            }
        }
    }
}
