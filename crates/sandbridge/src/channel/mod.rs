//! Bidirectional message channel between a host and a peer
//!
//! A channel is two one-way OS pipes. [`Channel::open`] returns one view per
//! role; each view owns only the read end and the write end it uses, so when
//! one side goes away (stopped, dropped, or its process died) the other side
//! reads end of stream.
//!
//! Views are opened before crossing into a child. A forked child inherits a
//! copy of the view it does not own and has to close it, see
//! [`Channel::raw_fds`].
//!
//! # Example
//!
//! ```no_run
//! use sandbridge::{Channel, Received};
//!
//! let (mut host, mut peer) = Channel::open()?;
//! let child = std::thread::spawn(move || {
//!     peer.listen(|host, n: u32| host.send(&(n + 1)))
//! });
//!
//! host.send(&1u32)?;
//! assert_eq!(host.receive::<u32>()?, Received::Message(2));
//! host.stop()?;
//! child.join().unwrap()?;
//! # Ok::<(), sandbridge::BridgeError>(())
//! ```

mod frame;

use std::collections::VecDeque;
use std::io::{ErrorKind, PipeReader, PipeWriter};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, trace};

use crate::error::{BridgeError, Result};
use frame::{Frame, read_frame, write_frame};

/// Which end of the channel a view speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Peer,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Host => Role::Peer,
            Role::Peer => Role::Host,
        }
    }
}

/// Result of reading from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received<T> {
    Message(T),
    /// The other side stopped or went away, or this side's read end is closed
    EndOfStream,
}

impl<T> Received<T> {
    pub fn into_message(self) -> Option<T> {
        match self {
            Received::Message(value) => Some(value),
            Received::EndOfStream => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Received::EndOfStream)
    }
}

// The pipe ends one view owns
struct Ends {
    reader: PipeReader,
    writer: PipeWriter,
}

/// One side's view of a host/peer channel
pub struct Channel {
    role: Role,
    ends: Option<Ends>,
    // Bodies queued by `pretend_message_was_sent`
    injected: Mutex<VecDeque<Vec<u8>>>,
}

impl Channel {
    /// Create the pipes and return the `(host, peer)` views.
    ///
    /// Call this before crossing the boundary so both sides share working
    /// pipe ends.
    pub fn open() -> Result<(Channel, Channel)> {
        let (from_host, to_peer) = std::io::pipe()?;
        let (from_peer, to_host) = std::io::pipe()?;

        debug!(
            host_read = from_peer.as_raw_fd(),
            host_write = to_peer.as_raw_fd(),
            peer_read = from_host.as_raw_fd(),
            peer_write = to_host.as_raw_fd(),
            "Channel opened"
        );

        Ok((
            Channel::with_ends(Role::Host, from_peer, to_peer),
            Channel::with_ends(Role::Peer, from_host, to_host),
        ))
    }

    fn with_ends(role: Role, reader: PipeReader, writer: PipeWriter) -> Channel {
        Channel {
            role,
            ends: Some(Ends { reader, writer }),
            injected: Mutex::new(VecDeque::new()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.ends.is_none()
    }

    /// Descriptor this side reads from; `None` once stopped
    pub fn read_fd(&self) -> Option<RawFd> {
        self.ends.as_ref().map(|e| e.reader.as_raw_fd())
    }

    /// Descriptor this side writes to; `None` once stopped
    pub fn write_fd(&self) -> Option<RawFd> {
        self.ends.as_ref().map(|e| e.writer.as_raw_fd())
    }

    /// Every descriptor this view holds.
    ///
    /// A forked child inherits the other side's view but never runs its
    /// destructor, so it must close these numbers itself; otherwise the
    /// child keeps that view's write end open and its own reads never see
    /// end of stream.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.read_fd().into_iter().chain(self.write_fd()).collect()
    }

    /// Send one value to the other side.
    ///
    /// May block while the pipe buffer is full; there is no flow control
    /// beyond what the OS provides.
    pub fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let ends = self.ends.as_ref().ok_or(BridgeError::ChannelClosed)?;
        write_frame(&ends.writer, &Frame::Message(value))
    }

    /// Block for the next value from the other side
    pub fn receive<T: DeserializeOwned>(&self) -> Result<Received<T>> {
        let Some(ends) = self.ends.as_ref() else {
            return Ok(Received::EndOfStream);
        };

        if let Some(body) = self.take_injected() {
            return Ok(Received::Message(serde_json::from_slice(&body)?));
        }

        match read_frame(&ends.reader)? {
            Some(Frame::Message(value)) => Ok(Received::Message(value)),
            Some(Frame::Stop) => {
                trace!(role = ?self.role, "Stop frame received");
                Ok(Received::EndOfStream)
            }
            None => {
                trace!(role = ?self.role, "Channel reached EOF");
                Ok(Received::EndOfStream)
            }
        }
    }

    /// Hand every value to `callback` until the other side stops.
    ///
    /// The callback gets this channel back so it can reply or stop.
    pub fn listen<T, F>(&mut self, mut callback: F) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnMut(&mut Channel, T) -> Result<()>,
    {
        while let Received::Message(value) = self.receive()? {
            callback(self, value)?;
        }
        Ok(())
    }

    /// Tell the other side to stop, then close both pipe ends held by this
    /// view. Later receives on this view return end of stream and sends
    /// fail. Calling it again is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        let Some(ends) = self.ends.take() else {
            return Ok(());
        };

        match write_frame(&ends.writer, &Frame::<()>::Stop) {
            Ok(()) => {}
            // The other side already closed everything
            Err(BridgeError::Io(e)) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(role = ?self.role, "Peer gone before stop frame");
            }
            Err(e) => return Err(e),
        }

        debug!(role = ?self.role, "Channel stopped");
        Ok(())
    }

    /// Make the next receive on this side return `value`, as if the other
    /// side had sent it. Debug aid.
    ///
    /// The value is queued ahead of anything still in the pipe and does not
    /// make [`read_fd`](Self::read_fd) readable.
    pub fn pretend_message_was_sent<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        if self.ends.is_none() {
            return Err(BridgeError::ChannelClosed);
        }
        let body = serde_json::to_vec(value)?;
        self.injected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(body);
        Ok(())
    }

    fn take_injected(&self) -> Option<Vec<u8>> {
        self.injected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.role)
            .field("read_fd", &self.read_fd())
            .field("write_fd", &self.write_fd())
            .finish()
    }
}
