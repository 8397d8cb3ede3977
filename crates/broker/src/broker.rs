use crate::consumer::ConsumerRegistration;
use crate::error::BrokerError;
use crate::message::MessageMeta;

use std::collections::HashSet;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

/// Marker trait for broker options
pub trait BrokerOptions: Clone + Debug + Send + Sync + 'static {}

/// What a driver does after a handler fails (returns an error or panics).
///
/// The failure is always logged first. A failed handler never acks its delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HandlerErrorPolicy {
    /// Reject the delivery if the handler left it unresolved, then keep consuming.
    #[default]
    Reject,

    /// Reject the delivery if unresolved, then stop consuming and return the error.
    Fatal,
}

/// A trait representing a transport-agnostic message broker.
///
/// Topics must be passed to [`initialize`](Self::initialize) before they are
/// published to or consumed from. Consumers are registered before
/// [`start_consuming`](Self::start_consuming) and stay registered for the life of
/// the broker.
#[async_trait]
pub trait Broker<T = Bytes>
where
    Self: Clone + Debug + Send + Sync + 'static,
    T: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// The options for the broker.
    type Options: BrokerOptions;

    /// The name of the broker definition.
    fn name(&self) -> &str;

    /// Establishes the transport connection. A no-op when already connected.
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Releases transport resources. Safe to call when never connected or already closed.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Ensures the given topics exist and are ready for publish and consume.
    async fn initialize(&self, topics: HashSet<String>) -> Result<(), Self::Error>;

    /// Ensures the given answer topics exist.
    async fn initialize_answer_topics(&self, topics: HashSet<String>) -> Result<(), Self::Error>;

    /// Registers a consumer for a topic.
    async fn add_topic_consumer(
        &self,
        topic: &str,
        consumer: ConsumerRegistration<T>,
    ) -> Result<(), Self::Error>;

    /// Dispatches inbound messages to registered consumers until
    /// [`end_consuming`](Self::end_consuming) is called or the transport fails.
    async fn start_consuming(&self) -> Result<(), Self::Error>;

    /// Signals the consumption loop to return once the in-flight handler completes.
    ///
    /// May be called from any task or thread.
    fn end_consuming(&self);

    /// Publishes a batch of messages, preserving their order within the topic.
    async fn publish(&self, topic: &str, messages: Vec<MessageMeta<T>>)
    -> Result<(), Self::Error>;

    /// Best-effort count of messages waiting in a topic. Zero when unknown.
    async fn get_topic_approximate_messages_count(&self, topic: &str) -> u64;

    /// Publishes the answer to a request message.
    async fn publish_answer(
        &self,
        answer_topic: &str,
        request_id: Uuid,
        message: MessageMeta<T>,
    ) -> Result<(), Self::Error>;

    /// Waits for the answer to a request message.
    async fn get_answer(
        &self,
        answer_topic: &str,
        request_id: Uuid,
        timeout: Duration,
    ) -> Result<MessageMeta<T>, Self::Error>;
}
