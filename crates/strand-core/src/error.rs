//! Error types for the strand runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Recoverable runtime errors
///
/// Contract violations are not represented here. Those go through
/// `fatal_assert!` and never return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// An OS call failed (epoll_ctl, pipe2, mmap, thread spawn, ...)
    Os { op: &'static str, errno: i32 },

    /// Operation not legal in the current state
    InvalidState,

    /// Negative or otherwise unusable descriptor
    InvalidFd(i32),

    /// Direction already registered for this descriptor
    AlreadyRegistered,

    /// Direction not registered for this descriptor
    NotRegistered,

    /// Operation timed out
    Timeout,

    /// No scheduler / reactor is running on this thread
    NotInitialized,

    /// Rejected configuration
    Config(String),
}

impl SchedError {
    /// Build an `Os` error from an operation name and raw errno
    #[inline]
    pub fn os(op: &'static str, errno: i32) -> Self {
        SchedError::Os { op, errno }
    }

    /// Raw errno, if this came from the OS
    pub fn errno(&self) -> Option<i32> {
        match self {
            SchedError::Os { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Os { op, errno } => {
                write!(f, "{} failed: {}", op, std::io::Error::from_raw_os_error(*errno))
            }
            SchedError::InvalidState => write!(f, "invalid state for operation"),
            SchedError::InvalidFd(fd) => write!(f, "invalid file descriptor {}", fd),
            SchedError::AlreadyRegistered => write!(f, "event already registered"),
            SchedError::NotRegistered => write!(f, "event not registered"),
            SchedError::Timeout => write!(f, "operation timed out"),
            SchedError::NotInitialized => write!(f, "no scheduler running on this thread"),
            SchedError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<SchedError> for std::io::Error {
    fn from(e: SchedError) -> Self {
        match e {
            SchedError::Os { errno, .. } => std::io::Error::from_raw_os_error(errno),
            SchedError::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, e),
            SchedError::InvalidFd(_) => std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            other => std::io::Error::other(other),
        }
    }
}
