use courier_broker::{BrokerError, ErrorKind};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while resolving a delivery.
#[derive(Debug, Error)]
pub enum Error {
    /// The delivery is no longer tracked as in flight.
    #[error("delivery {delivery_id} of message {message_id} is no longer in flight")]
    UnknownDelivery {
        /// The delivery being resolved.
        delivery_id: Uuid,

        /// The message it carried.
        message_id: Uuid,
    },

    /// The simulated transport is unreachable.
    #[error("transport of broker `{0}` is unreachable")]
    Unreachable(String),
}

impl BrokerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownDelivery { .. } => ErrorKind::Transport,
            Self::Unreachable(_) => ErrorKind::Connection,
        }
    }
}
