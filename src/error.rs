//! Error classification shared by the exclusive and multiplexed pools.
//!
//! Each subsystem has its own error enum ([`PoolError`](crate::pool::PoolError),
//! [`MuxError`](crate::mux::MuxError), [`FrameError`](crate::codec::FrameError)).
//! All of them map onto a small set of kinds so callers can decide between
//! retrying, re-acquiring, or giving up without matching every variant.

use std::fmt;

/// Broad category of a pool or transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A pool or queue is at its limit. Retry later or back off.
    Capacity,

    /// The pool or connection has been torn down. Re-acquire.
    Closed,

    /// Duplicate stream id, unparseable frame, short write.
    /// Fatal to the affected stream or physical connection only.
    Protocol,

    /// Dial, read, or write failure on one connection.
    Io,

    /// Invalid setup (unsupported network, missing codec).
    Config,
}

impl ErrorKind {
    /// Whether a caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Capacity | ErrorKind::Closed | ErrorKind::Io)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Capacity => "capacity",
            ErrorKind::Closed => "closed",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Io => "io",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Capacity.is_retryable());
        assert!(ErrorKind::Closed.is_retryable());
        assert!(ErrorKind::Io.is_retryable());
        assert!(!ErrorKind::Protocol.is_retryable());
        assert!(!ErrorKind::Config.is_retryable());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::Capacity.to_string(), "capacity");
        assert_eq!(ErrorKind::Config.to_string(), "config");
    }
}
