//! Crossing into the isolated child
//!
//! [`Boundary`] is the one capability this crate needs from whatever creates
//! the isolated context: run a task inside it, optionally waiting for it to
//! finish. [`ForkBoundary`] provides it with a plain `fork(2)`.
//! [`BoundaryExt`] builds result-returning calls and channels on top.

mod execute;
mod fork;

use std::collections::BTreeMap;

pub use nix::unistd::Pid;

use crate::error::Result;

pub use execute::{BoundaryExt, ExecuteOptions};
pub use fork::ForkBoundary;

/// Work to run inside the child
pub type ChildTask = Box<dyn FnOnce() + Send + 'static>;

/// Options handed to [`Boundary::attach`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    /// Block until the task has finished
    pub wait: bool,

    /// Implementation-specific settings, passed through untouched
    pub extra: BTreeMap<String, String>,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            wait: true,
            extra: BTreeMap::new(),
        }
    }
}

impl AttachOptions {
    pub fn detached() -> Self {
        Self {
            wait: false,
            ..Self::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
}

impl ChildStatus {
    pub fn success(&self) -> bool {
        matches!(self, ChildStatus::Exited(0))
    }
}

/// What [`Boundary::attach`] hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attached {
    /// `wait` was set and the child is gone
    Finished(ChildStatus),
    /// The child is still running; reap it with [`Boundary::wait`]
    Spawned(Pid),
}

impl Attached {
    pub fn pid(&self) -> Option<Pid> {
        match self {
            Attached::Spawned(pid) => Some(*pid),
            Attached::Finished(_) => None,
        }
    }
}

/// Runs work inside the isolated child context.
///
/// Implementations must run the task in a separate process: callers such as
/// [`BoundaryExt::execute`] rewrite the environment inside the task.
pub trait Boundary {
    fn attach(&self, task: ChildTask, options: &AttachOptions) -> Result<Attached>;

    /// Block until a spawned child has exited
    fn wait(&self, pid: Pid) -> Result<ChildStatus>;
}
