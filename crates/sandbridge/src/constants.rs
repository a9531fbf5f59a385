/// Default bound on a boundary call (1 hour)
pub const DEFAULT_EXECUTE_TIMEOUT_SECS: u64 = 3600;

/// Bytes read from a tunneled socket per readiness event (64 KB)
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Largest frame accepted on a channel (16 MB)
pub const MAX_FRAME_SIZE_BYTES: usize = 16 * 1024 * 1024;

/// Length prefix of every channel frame (big-endian u32)
pub const FRAME_HEADER_BYTES: usize = 4;

/// PATH installed in the child before a boundary call runs
pub const CHILD_PATH: &str = "/usr/bin:/bin:/usr/sbin";

/// TERM installed in the child before a boundary call runs
pub const CHILD_TERM: &str = "linux";

/// SHELL installed in the child before a boundary call runs
pub const CHILD_SHELL: &str = "/bin/sh";

/// Exit status of a forked child whose task panicked
pub const CHILD_PANIC_EXIT_CODE: i32 = 101;
