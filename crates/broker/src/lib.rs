//! Abstract interface for transport-agnostic message brokers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Brokers publish to topics and dispatch deliveries to registered consumers.
pub mod broker;

/// Consumer registrations bind handlers to topics and consumer groups.
pub mod consumer;

/// Consumer handlers process delivered messages.
pub mod consumer_handler;

/// Helpers for running a consumption loop until shutdown.
pub mod consumption;

/// Broker definitions and connection retry.
pub mod definition;

/// Error taxonomy shared by broker drivers.
pub mod error;

/// Message managers resolve a single delivery.
pub mod manager;

/// Message envelopes.
pub mod message;

pub use broker::{Broker, BrokerOptions, HandlerErrorPolicy};
pub use consumer::ConsumerRegistration;
pub use consumer_handler::{FnHandler, HandlerFailure, MessageHandler, handler_fn};
pub use consumption::consume_until;
pub use definition::{BrokerDefinition, connect_with_retry};
pub use error::{BrokerError, ErrorKind, HandlerError};
pub use manager::{Acknowledger, BoxError, DeliveryState, MessageManager, Resolution};
pub use message::MessageMeta;
