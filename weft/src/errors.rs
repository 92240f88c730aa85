use crate::task::TaskState;
use std::io;
use std::sync::Arc;

/// A centralized error type for all runtime, reactor and stream operations.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RuntimeError {
    /// An operation was invoked on a task in a state where it is not defined.
    #[error("invalid task state for `{op}`: expected {expected:?}, found {actual:?}")]
    InvalidState {
        op: &'static str,
        expected: TaskState,
        actual: TaskState,
    },

    /// Cooperative cancellation, delivered at the task's next suspension point.
    #[error("task terminated")]
    Terminated,

    /// Injected by a timer into a suspended caller.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Stream-level failure: closed endpoint, read/write error, handshake
    /// failure, write buffer overflow, write timeout.
    #[error("connection: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Arc<io::Error>>,
    },

    #[error("send on closed channel")]
    ChannelClosed,

    /// Unlock by a non-owner, `done` without `add`, and friends.
    #[error("sync misuse: {0}")]
    SyncMisuse(String),

    /// Reactor invariant violation, e.g. registering on a stopped reactor.
    #[error("reactor: {0}")]
    Reactor(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    /// A panic escaped a task's entry; captured, not propagated.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl RuntimeError {
    pub fn connection(message: impl Into<String>) -> Self {
        RuntimeError::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection_io(message: impl Into<String>, source: io::Error) -> Self {
        RuntimeError::Connection {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// The failure category, used by `Outcome::resolve` to acknowledge an
    /// expected error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::InvalidState { .. } => ErrorKind::State,
            RuntimeError::Terminated => ErrorKind::Terminated,
            RuntimeError::Timeout(_) => ErrorKind::Timeout,
            RuntimeError::Connection { .. } => ErrorKind::Connection,
            RuntimeError::ChannelClosed => ErrorKind::ChannelClosed,
            RuntimeError::SyncMisuse(_) => ErrorKind::SyncMisuse,
            RuntimeError::Reactor(_) => ErrorKind::Reactor,
            RuntimeError::Argument(_) => ErrorKind::Argument,
            RuntimeError::Panicked(_) => ErrorKind::Panicked,
        }
    }
}

impl PartialEq for RuntimeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::InvalidState {
                    op: a,
                    expected: b,
                    actual: c,
                },
                Self::InvalidState {
                    op: x,
                    expected: y,
                    actual: z,
                },
            ) => a == x && b == y && c == z,
            (Self::Terminated, Self::Terminated) => true,
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::Connection { message: a, .. }, Self::Connection { message: b, .. }) => a == b,
            (Self::ChannelClosed, Self::ChannelClosed) => true,
            (Self::SyncMisuse(a), Self::SyncMisuse(b)) => a == b,
            (Self::Reactor(a), Self::Reactor(b)) => a == b,
            (Self::Argument(a), Self::Argument(b)) => a == b,
            (Self::Panicked(a), Self::Panicked(b)) => a == b,
            _ => false,
        }
    }
}

/// Coarse error category, the unit of acknowledgement for [`Outcome::resolve`].
///
/// [`Outcome::resolve`]: crate::runtime::Outcome::resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    State,
    Terminated,
    Timeout,
    Connection,
    ChannelClosed,
    SyncMisuse,
    Reactor,
    Argument,
    Panicked,
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // Errors cross task boundaries and land in both task results and
    // outcomes, so they must stay cheap to clone and thread-portable.
    assert_impl_all!(RuntimeError: std::error::Error, Clone, Send, Sync);

    #[test]
    fn test_kind_mapping() {
        assert_eq!(RuntimeError::Terminated.kind(), ErrorKind::Terminated);
        assert_eq!(RuntimeError::ChannelClosed.kind(), ErrorKind::ChannelClosed);
        assert_eq!(
            RuntimeError::connection("peer went away").kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            RuntimeError::Timeout("write timeout".into()).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_eq_ignores_io_source() {
        let a = RuntimeError::connection_io(
            "read failed",
            io::Error::new(io::ErrorKind::BrokenPipe, "pipe"),
        );
        let b = RuntimeError::connection("read failed");
        assert_eq!(a, b);
    }
}
