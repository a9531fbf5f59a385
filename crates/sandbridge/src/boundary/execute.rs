use std::any::Any;
use std::io::{PipeWriter, Read, Write};
use std::os::fd::AsRawFd;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error, warn};

use super::{AttachOptions, Attached, Boundary};
use crate::channel::Channel;
use crate::constants::{CHILD_PATH, CHILD_SHELL, CHILD_TERM, DEFAULT_EXECUTE_TIMEOUT_SECS};
use crate::error::{RemoteError, Result};
use crate::protocol::Outcome;

/// Options for [`BoundaryExt::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Deadline for the callable inside the child
    pub timeout: Duration,

    /// Passed through to [`Boundary::attach`]. `wait` is not honored:
    /// `execute` always waits for the child itself.
    pub attach: AttachOptions,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_EXECUTE_TIMEOUT_SECS),
            attach: AttachOptions::default(),
        }
    }
}

impl ExecuteOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result-returning calls and channels on top of any [`Boundary`]
pub trait BoundaryExt: Boundary {
    /// Run `callable` inside the child and hand its result back.
    ///
    /// The child starts from a minimal environment. An error returned by the
    /// callable comes back as [`BridgeError::Remote`] with the same kind and
    /// message; overrunning `timeout` comes back as [`BridgeError::Timeout`].
    /// `Ok(None)` means the child wrote nothing, e.g. it died first.
    ///
    /// The outcome is read to EOF before the child is reaped, so the call
    /// never races the child and outcomes larger than a pipe buffer are fine.
    ///
    /// [`BridgeError::Remote`]: crate::BridgeError::Remote
    /// [`BridgeError::Timeout`]: crate::BridgeError::Timeout
    fn execute<T, E, F>(&self, callable: F, options: ExecuteOptions) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<RemoteError> + Send + 'static,
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    {
        let (mut reader, writer) = std::io::pipe()?;
        let read_fd = reader.as_raw_fd();
        let timeout = options.timeout;
        let attach = AttachOptions {
            wait: false,
            ..options.attach
        };

        let attached = self.attach(
            Box::new(move || {
                reset_environment();
                let _ = nix::unistd::close(read_fd);
                let outcome = run_with_timeout(callable, timeout);
                if let Err(e) = write_outcome(writer, &outcome) {
                    error!("Failed to report outcome to host: {}", e);
                }
            }),
            &attach,
        )?;
        // The task, and with it our copy of the write end, is gone by now

        let mut bytes = Vec::new();
        let read = reader.read_to_end(&mut bytes);
        let status = match attached {
            Attached::Spawned(pid) => self.wait(pid)?,
            Attached::Finished(status) => status,
        };
        read?;
        debug!(?status, bytes = bytes.len(), "Boundary call finished");

        if bytes.is_empty() {
            warn!(?status, "Child produced no outcome");
            return Ok(None);
        }

        let outcome: Outcome<T> = serde_json::from_slice(&bytes)?;
        outcome.into_result().map(Some)
    }

    /// Spawn a child that feeds every message from the host to `handler`,
    /// and return the host's end of the channel.
    ///
    /// The child runs until the host stops or drops the channel. Reap it with
    /// [`Boundary::wait`] on the returned pid.
    fn open_channel<T, F>(&self, handler: F, options: &AttachOptions) -> Result<(Channel, Attached)>
    where
        T: DeserializeOwned,
        F: FnMut(&mut Channel, T) -> Result<()> + Send + 'static,
    {
        let (host, mut peer) = Channel::open()?;
        let attach = AttachOptions {
            wait: false,
            ..options.clone()
        };

        // Closed in the child, or its listener never sees the host go away
        let inherited = host.raw_fds();
        let attached = self.attach(
            Box::new(move || {
                for fd in inherited {
                    let _ = nix::unistd::close(fd);
                }
                if let Err(e) = peer.listen(handler) {
                    error!("Channel listener failed inside child: {}", e);
                }
            }),
            &attach,
        )?;
        Ok((host, attached))
    }
}

impl<B: Boundary + ?Sized> BoundaryExt for B {}

/// Replace the inherited environment with a fixed minimal one.
fn reset_environment() {
    // SAFETY: only called in a freshly forked child, before any other
    // thread has been started in it.
    unsafe {
        for (key, _) in std::env::vars_os() {
            std::env::remove_var(key);
        }
        std::env::set_var("PATH", CHILD_PATH);
        std::env::set_var("TERM", CHILD_TERM);
        std::env::set_var("SHELL", CHILD_SHELL);
    }
}

fn run_with_timeout<T, E, F>(callable: F, timeout: Duration) -> Outcome<T>
where
    T: Send + 'static,
    E: Into<RemoteError> + Send + 'static,
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return Outcome::Raise(RemoteError::capture(&e)),
    };

    let outcome = runtime.block_on(async move {
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(callable)).await {
            Ok(Ok(Ok(value))) => Outcome::Return(value),
            Ok(Ok(Err(err))) => Outcome::Raise(err.into()),
            Ok(Err(join_err)) if join_err.is_panic() => Outcome::Raise(RemoteError::new(
                "panic",
                panic_message(join_err.into_panic()),
            )),
            Ok(Err(join_err)) => Outcome::Raise(RemoteError::capture(&join_err)),
            Err(_) => Outcome::timed_out(timeout),
        }
    });

    // A timed-out callable is still running on a blocking thread; the
    // process exits right after, so do not wait for it.
    runtime.shutdown_background();
    outcome
}

fn write_outcome<T: Serialize>(mut writer: PipeWriter, outcome: &Outcome<T>) -> Result<()> {
    let bytes = serde_json::to_vec(outcome)?;
    writer.write_all(&bytes)?;
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "callable panicked".to_string()
    }
}
