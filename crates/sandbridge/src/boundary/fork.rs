use std::panic::AssertUnwindSafe;

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use tracing::{debug, trace};

use super::{Attached, AttachOptions, Boundary, ChildStatus, ChildTask};
use crate::constants::CHILD_PANIC_EXIT_CODE;
use crate::error::Result;

/// Runs tasks in a forked child process.
///
/// No namespaces, cgroups or other isolation are set up: the child is an
/// ordinary copy of the calling process that runs the task and `_exit`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkBoundary;

impl Boundary for ForkBoundary {
    fn attach(&self, task: ChildTask, options: &AttachOptions) -> Result<Attached> {
        for (key, value) in &options.extra {
            trace!(key = %key, value = %value, "Ignoring attach option");
        }

        // SAFETY: the child only runs `task` on the forking thread and then
        // leaves through `_exit`, never returning into the caller's frames.
        match unsafe { fork() }? {
            ForkResult::Child => {
                let code = match std::panic::catch_unwind(AssertUnwindSafe(task)) {
                    Ok(()) => 0,
                    Err(_) => CHILD_PANIC_EXIT_CODE,
                };
                // SAFETY: skips atexit handlers and stdio flushing that
                // belong to the parent's copy of this process.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(task);
                debug!(pid = child.as_raw(), wait = options.wait, "Forked child");
                if options.wait {
                    Ok(Attached::Finished(self.wait(child)?))
                } else {
                    Ok(Attached::Spawned(child))
                }
            }
        }
    }

    fn wait(&self, pid: Pid) -> Result<ChildStatus> {
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(pid = pid.as_raw(), code, "Child exited");
                    return Ok(ChildStatus::Exited(code));
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!(pid = pid.as_raw(), ?signal, "Child killed by signal");
                    return Ok(ChildStatus::Signaled(signal as i32));
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
