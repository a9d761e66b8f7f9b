//! Error types for runtime construction.
//!
//! Only startup is fallible: once the loop runs, problems are logged
//! and the offending message is discarded (see the crate docs). A
//! service's own failures never cross the message boundary as errors.

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RtError>;

/// Errors that can occur while bringing the runtime up
#[derive(Debug)]
pub enum RtError {
    /// Poller or descriptor setup failed
    Io(std::io::Error),

    /// A worker thread could not be spawned
    WorkerSpawn(std::io::Error),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtError::Io(e) => write!(f, "i/o setup failed: {}", e),
            RtError::WorkerSpawn(e) => write!(f, "worker spawn failed: {}", e),
        }
    }
}

impl std::error::Error for RtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RtError::Io(e) | RtError::WorkerSpawn(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for RtError {
    fn from(e: std::io::Error) -> Self {
        RtError::Io(e)
    }
}
