use crate::error::ErrorKind;

use std::error::Error as StdError;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Boxed error returned by transports when relaying a resolution.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Lifecycle of a single delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    /// Handed to a handler, not yet resolved.
    Delivered,

    /// Processed successfully.
    Acked,

    /// Processing failed.
    Rejected,
}

impl DeliveryState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Delivered => 0,
            Self::Acked => 1,
            Self::Rejected => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Delivered,
            1 => Self::Acked,
            _ => Self::Rejected,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Acked => write!(f, "acked"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// The decision a handler takes about a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// See [`MessageManager::ack`].
    Ack,

    /// See [`MessageManager::reject`].
    Reject,
}

impl Resolution {
    const fn target(self) -> DeliveryState {
        match self {
            Self::Ack => DeliveryState::Acked,
            Self::Reject => DeliveryState::Rejected,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Errors returned by a [`MessageManager`].
#[derive(Debug, Error)]
pub enum Error {
    /// The delivery was already resolved.
    #[error("cannot {attempted} message {message_id}: delivery already {state}")]
    InvalidManagerState {
        /// The message the manager is bound to.
        message_id: Uuid,

        /// The state the delivery was in.
        state: DeliveryState,

        /// The resolution that was attempted.
        attempted: Resolution,
    },

    /// The transport failed to record the resolution.
    #[error("failed to relay {0} to transport: {1}")]
    Transport(Resolution, #[source] BoxError),
}

impl Error {
    /// The class of the failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidManagerState { .. } => ErrorKind::InvalidManagerState,
            Self::Transport(..) => ErrorKind::Transport,
        }
    }
}

/// Relays delivery resolutions to the underlying transport.
///
/// Implemented by broker drivers. Each call happens at most once per delivery.
#[async_trait]
pub trait Acknowledger: Debug + Send + Sync + 'static {
    /// The transport must not redeliver this message to the same consumer group.
    async fn ack(&self) -> Result<(), BoxError>;

    /// The transport decides whether to requeue or dead-letter the message.
    async fn reject(&self) -> Result<(), BoxError>;
}

/// Per-delivery handle used by a handler to ack or reject a message.
///
/// Exactly one of [`ack`](Self::ack) or [`reject`](Self::reject) succeeds, once.
/// Clones share the same delivery state.
#[derive(Clone, Debug)]
pub struct MessageManager {
    acknowledger: Arc<dyn Acknowledger>,
    message_id: Uuid,
    state: Arc<AtomicU8>,
}

impl MessageManager {
    /// Creates a manager for a freshly delivered message.
    pub fn new(message_id: Uuid, acknowledger: impl Acknowledger) -> Self {
        Self {
            acknowledger: Arc::new(acknowledger),
            message_id,
            state: Arc::new(AtomicU8::new(DeliveryState::Delivered.as_u8())),
        }
    }

    /// Marks the message as successfully processed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManagerState`] if the delivery was already resolved,
    /// or [`Error::Transport`] if the transport could not record the ack.
    pub async fn ack(&self) -> Result<(), Error> {
        self.resolve(Resolution::Ack).await
    }

    /// Marks the message as failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManagerState`] if the delivery was already resolved,
    /// or [`Error::Transport`] if the transport could not record the reject.
    pub async fn reject(&self) -> Result<(), Error> {
        self.resolve(Resolution::Reject).await
    }

    /// The id of the message this manager is bound to.
    pub const fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// The current state of the delivery.
    pub fn state(&self) -> DeliveryState {
        DeliveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the delivery reached a terminal state.
    pub fn is_resolved(&self) -> bool {
        self.state() != DeliveryState::Delivered
    }

    async fn resolve(&self, resolution: Resolution) -> Result<(), Error> {
        // The state is claimed before relaying so racing callers cannot both win.
        if let Err(current) = self.state.compare_exchange(
            DeliveryState::Delivered.as_u8(),
            resolution.target().as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(Error::InvalidManagerState {
                message_id: self.message_id,
                state: DeliveryState::from_u8(current),
                attempted: resolution,
            });
        }

        let relayed = match resolution {
            Resolution::Ack => self.acknowledger.ack().await,
            Resolution::Reject => self.acknowledger.reject().await,
        };

        relayed.map_err(|e| Error::Transport(resolution, e))
    }
}
