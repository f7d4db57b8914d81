//! Error types for tagcomm.

use std::io;

/// Setup and configuration errors.
///
/// The send/recv/progress hot path does not thread error codes through:
/// posting errors are either retried internally (would-block) or fatal
/// (transport faults), and precondition violations are assertions.
#[derive(Debug)]
pub enum Error {
    /// IO error from the allocator or the transport layer.
    Io(io::Error),
    /// Thread-safe mode was requested but the transport cannot provide it.
    ThreadSafetyUnsupported,
    /// Rank is outside the process group.
    InvalidRank(i32),
    /// The transport returned an error code during setup.
    Transport(&'static str, i32),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::ThreadSafetyUnsupported => {
                write!(f, "transport does not support thread-safe mode")
            }
            Error::InvalidRank(r) => write!(f, "rank {} is outside the process group", r),
            Error::Transport(what, code) => write!(f, "{} failed with code {}", what, code),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for tagcomm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Print a message to stderr and abort the process.
///
/// Used for transport faults that leave no way to make local forward
/// progress (completion-queue error entries, unreachable endpoints).
pub(crate) fn fatal(msg: std::fmt::Arguments<'_>) -> ! {
    eprintln!("[tagcomm FATAL] {}", msg);
    std::process::abort();
}
