use std::error::Error;
use std::fmt::{self, Debug};

/// Classes of failure shared by every broker driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transport is unreachable or the broker is not connected.
    Connection,

    /// An operation targeted a topic that was never initialized.
    TopicNotInitialized,

    /// A delivery was acked or rejected after it was already resolved.
    InvalidManagerState,

    /// A registered handler failed.
    Handler,

    /// The operation conflicts with an active consumption loop.
    Consuming,

    /// Invalid registration or definition.
    Configuration,

    /// Waiting for a result timed out.
    Timeout,

    /// Any other transport failure.
    Transport,
}

impl ErrorKind {
    /// Whether retrying the same call later may succeed.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection error",
            Self::TopicNotInitialized => "topic not initialized",
            Self::InvalidManagerState => "invalid manager state",
            Self::Handler => "handler error",
            Self::Consuming => "consumption conflict",
            Self::Configuration => "configuration error",
            Self::Timeout => "timeout",
            Self::Transport => "transport error",
        };
        write!(f, "{name}")
    }
}

/// Marker trait for broker errors
pub trait BrokerError: Debug + Error + Send + Sync + 'static {
    /// The class of the failure.
    fn kind(&self) -> ErrorKind;
}

/// Marker trait for handler errors
pub trait HandlerError: Debug + Error + Send + Sync + 'static {}
