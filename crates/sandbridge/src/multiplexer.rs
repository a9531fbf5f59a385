//! Readiness-driven dispatch over a dynamic set of file descriptors
//!
//! A [`Multiplexer`] owns a map from raw fd to handler and runs on exactly one
//! thread. Handlers receive the multiplexer itself, so registering and
//! unregistering handles is only possible from inside the loop. The one
//! operation allowed from other threads is termination, through a
//! [`StopHandle`].

use std::collections::BTreeMap;
use std::io::{PipeReader, PipeWriter, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, trace};

use crate::error::{BridgeError, Result};

/// What the loop does after a handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Return from [`Multiplexer::run`] without dispatching the rest of the batch
    Stop,
}

type Handler<S> = Box<dyn FnMut(&mut Multiplexer<S>, &mut S, RawFd) -> Result<Flow> + Send>;

struct Registration<S> {
    generation: u64,
    // Taken out while the handler runs
    handler: Option<Handler<S>>,
}

/// Single-threaded readiness loop over registered handles
pub struct Multiplexer<S> {
    handlers: BTreeMap<RawFd, Registration<S>>,
    next_generation: u64,
    wake_rx: PipeReader,
    wake_tx: Arc<PipeWriter>,
}

/// Terminates a running [`Multiplexer::run`] from any thread
#[derive(Clone)]
pub struct StopHandle {
    wake_tx: Arc<PipeWriter>,
}

impl StopHandle {
    pub fn stop(&self) -> Result<()> {
        (&*self.wake_tx).write_all(&[1])?;
        Ok(())
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("fd", &self.wake_tx.as_raw_fd())
            .finish()
    }
}

impl<S> Multiplexer<S> {
    pub fn new() -> Result<Self> {
        let (wake_rx, wake_tx) = std::io::pipe()?;
        Ok(Self {
            handlers: BTreeMap::new(),
            next_generation: 0,
            wake_rx,
            wake_tx: Arc::new(wake_tx),
        })
    }

    /// Watch `fd`, replacing any handler already registered for it.
    ///
    /// Extra arguments for the handler are bound by capturing them in the
    /// closure.
    pub fn register<F>(&mut self, fd: RawFd, handler: F)
    where
        F: FnMut(&mut Multiplexer<S>, &mut S, RawFd) -> Result<Flow> + Send + 'static,
    {
        self.next_generation += 1;
        trace!(fd, generation = self.next_generation, "register handle");
        self.handlers.insert(
            fd,
            Registration {
                generation: self.next_generation,
                handler: Some(Box::new(handler)),
            },
        );
    }

    /// Stop watching `fd`. No-op if it is not registered.
    pub fn unregister(&mut self, fd: RawFd) {
        if self.handlers.remove(&fd).is_some() {
            trace!(fd, "unregister handle");
        }
    }

    /// Drop every registered handler
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.handlers.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            wake_tx: Arc::clone(&self.wake_tx),
        }
    }

    /// Dispatch readiness until a handler returns [`Flow::Stop`], a handler
    /// fails, a [`StopHandle`] fires, or nothing is left to watch.
    ///
    /// Ready handles are dispatched in ascending fd order. Handler errors are
    /// returned unchanged.
    pub fn run(&mut self, state: &mut S) -> Result<()> {
        loop {
            if self.handlers.is_empty() {
                debug!("No handles registered, leaving loop");
                return Ok(());
            }

            let Some(batch) = self.wait()? else {
                debug!("Stop requested, leaving loop");
                return Ok(());
            };

            for (fd, generation) in batch {
                if self.dispatch(state, fd, generation)? == Flow::Stop {
                    debug!(fd, "Handler requested stop");
                    return Ok(());
                }
            }
        }
    }

    /// Block until something is readable. `None` means a stop was requested.
    fn wait(&mut self) -> Result<Option<Vec<(RawFd, u64)>>> {
        let watched: Vec<(RawFd, u64)> = self
            .handlers
            .iter()
            .map(|(fd, reg)| (*fd, reg.generation))
            .collect();
        let wake_fd = self.wake_rx.as_raw_fd();

        let revents = loop {
            // SAFETY: every registered fd is owned by a live object whose
            // owner unregisters it before closing; the wake pipe is owned
            // by self. None outlive this call.
            let mut fds: Vec<PollFd> = std::iter::once(wake_fd)
                .chain(watched.iter().map(|(fd, _)| *fd))
                .map(|fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
                .collect();

            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            break fds
                .iter()
                .map(|pfd| pfd.revents().unwrap_or(PollFlags::empty()))
                .collect::<Vec<_>>();
        };

        if !revents[0].is_empty() {
            let mut drain = [0u8; 64];
            let _ = (&self.wake_rx).read(&mut drain)?;
            return Ok(None);
        }

        let ready_flags = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let mut batch = Vec::new();
        for ((fd, generation), flags) in watched.into_iter().zip(revents.into_iter().skip(1)) {
            if flags.contains(PollFlags::POLLNVAL) {
                return Err(BridgeError::Multiplexer(format!(
                    "handle {} was closed while still registered",
                    fd
                )));
            }
            if flags.intersects(ready_flags) {
                batch.push((fd, generation));
            }
        }
        trace!(ready = batch.len(), "poll returned");
        Ok(Some(batch))
    }

    fn dispatch(&mut self, state: &mut S, fd: RawFd, generation: u64) -> Result<Flow> {
        // Skip handles unregistered or replaced earlier in this batch
        let handler = match self.handlers.get_mut(&fd) {
            Some(reg) if reg.generation == generation => reg.handler.take(),
            _ => None,
        };
        let Some(mut handler) = handler else {
            return Ok(Flow::Continue);
        };

        let flow = handler(self, state, fd);

        if let Some(reg) = self.handlers.get_mut(&fd)
            && reg.generation == generation
        {
            reg.handler = Some(handler);
        }
        flow
    }
}
