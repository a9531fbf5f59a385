use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, RemoteError, Result};

/// What a boundary call produced inside the child, as written back to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum Outcome<T> {
    /// The callable returned normally
    Return(T),

    /// The callable failed (or panicked)
    Raise(RemoteError),

    /// The callable was still running when its deadline passed
    TimedOut { timeout_ms: u64 },
}

impl<T> Outcome<T> {
    pub fn timed_out(timeout: Duration) -> Self {
        Outcome::TimedOut {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Re-raise the child's failure in the caller's context
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Return(value) => Ok(value),
            Outcome::Raise(err) => Err(BridgeError::Remote(err)),
            Outcome::TimedOut { timeout_ms } => {
                Err(BridgeError::Timeout(Duration::from_millis(timeout_ms)))
            }
        }
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Outcome::Return(_))
    }
}
