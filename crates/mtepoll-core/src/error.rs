//! Reactor error types.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorError {
    /// Could not create the multiplexer or the notifier. Fatal at
    /// process scope.
    SystemInit(i32),
    /// OS error with errno.
    Os(i32),
    /// Thread spawn failed.
    SpawnFailed,
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemInit(e) => write!(f, "reactor init failed: errno {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::SpawnFailed => write!(f, "failed to spawn reactor thread"),
        }
    }
}

impl std::error::Error for ReactorError {}

pub type Result<T> = std::result::Result<T, ReactorError>;
