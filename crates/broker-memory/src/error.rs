use std::time::Duration;

use courier_broker::{BrokerError, ErrorKind};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the in-memory broker.
#[derive(Debug, Error)]
pub enum Error {
    /// No answer arrived in time.
    #[error("no answer on `{answer_topic}` for request {request_id} within {timeout:?}")]
    AnswerTimeout {
        /// The answer topic waited on.
        answer_topic: String,

        /// The request the answer was expected for.
        request_id: Uuid,

        /// How long the caller waited.
        timeout: Duration,
    },

    /// The answer topic was never initialized.
    #[error("answer topic `{0}` was not initialized")]
    AnswerTopicNotInitialized(String),

    /// A consumption loop is already running.
    #[error("broker `{0}` is already consuming")]
    AlreadyConsuming(String),

    /// Consumers cannot be registered while consuming.
    #[error("cannot register consumer `{0}` while the broker is consuming")]
    ConsumingActive(String),

    /// The consumer id is already registered on the topic.
    #[error("consumer `{consumer_id}` is already registered on topic `{topic}`")]
    DuplicateConsumer {
        /// The duplicated consumer id.
        consumer_id: String,

        /// The topic it was registered on.
        topic: String,
    },

    /// A handler failed under the fatal handler error policy.
    #[error("consumer `{consumer_id}` failed on message {message_id}: {reason}")]
    Handler {
        /// The consumer whose handler failed.
        consumer_id: String,

        /// The message being handled.
        message_id: Uuid,

        /// The handler's error, rendered.
        reason: String,
    },

    /// The broker is not connected.
    #[error("broker `{0}` is not connected")]
    NotConnected(String),

    /// A message was published to a topic other than the one it was created for.
    #[error("message {message_id} belongs to topic `{message_topic}`, not `{topic}`")]
    TopicMismatch {
        /// The message id.
        message_id: Uuid,

        /// The topic recorded in the message.
        message_topic: String,

        /// The topic it was published to.
        topic: String,
    },

    /// The topic was never initialized.
    #[error("topic `{0}` was not initialized")]
    TopicNotInitialized(String),

    /// The simulated transport is unreachable.
    #[error("transport of broker `{0}` is unreachable")]
    Unreachable(String),
}

impl BrokerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::AnswerTimeout { .. } => ErrorKind::Timeout,
            Self::AnswerTopicNotInitialized(_) | Self::TopicNotInitialized(_) => {
                ErrorKind::TopicNotInitialized
            }
            Self::AlreadyConsuming(_) | Self::ConsumingActive(_) => ErrorKind::Consuming,
            Self::DuplicateConsumer { .. } | Self::TopicMismatch { .. } => {
                ErrorKind::Configuration
            }
            Self::Handler { .. } => ErrorKind::Handler,
            Self::NotConnected(_) | Self::Unreachable(_) => ErrorKind::Connection,
        }
    }
}
