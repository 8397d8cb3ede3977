//! In-memory implementation of the broker crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod acknowledger;
mod error;
mod topic;

pub use acknowledger::Error as AcknowledgeError;
pub use error::Error;
pub use topic::GroupStats;

use acknowledger::MemoryAcknowledger;
use topic::{Delivery, TopicState};

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_broker::{
    Broker, BrokerDefinition, BrokerOptions, ConsumerRegistration, HandlerErrorPolicy,
    MessageManager, MessageMeta,
};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_MAX_DELIVERIES: u32 = 3;

/// Options for the in-memory broker.
#[derive(Clone, Debug)]
pub struct MemoryBrokerOptions {
    /// What to do when a handler fails.
    pub handler_error_policy: HandlerErrorPolicy,

    /// Delivery attempts per message before a reject dead-letters it.
    pub max_deliveries: u32,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            handler_error_policy: HandlerErrorPolicy::default(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }
}

impl BrokerOptions for MemoryBrokerOptions {}

type AnswerTopics<T> = HashMap<String, HashMap<Uuid, MessageMeta<T>>>;

struct Inner<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    answer_notify: Notify,
    answer_topics: Mutex<AnswerTopics<T>>,
    connected: AtomicBool,
    consuming: AtomicBool,
    definition: BrokerDefinition,
    delivery_notify: Notify,
    failing_connects: AtomicU32,
    name: String,
    options: MemoryBrokerOptions,
    reachable: AtomicBool,
    rotation: AtomicUsize,
    shutdown_token: SyncMutex<CancellationToken>,
    topics: Mutex<HashMap<String, TopicState<T>>>,
}

impl<T> Inner<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// An in-memory broker.
///
/// Topics are append-only logs; every consumer group keeps its own cursor, so
/// groups see every message while consumers inside a group share them.
pub struct MemoryBroker<T = Bytes>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MemoryBroker<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for MemoryBroker<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("name", &self.inner.name)
            .field("connected", &self.inner.connected.load(Ordering::SeqCst))
            .field("consuming", &self.inner.consuming.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<T> MemoryBroker<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    /// Creates a new in-memory broker from its definition.
    #[must_use]
    pub fn new(definition: &BrokerDefinition, options: MemoryBrokerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                answer_notify: Notify::new(),
                answer_topics: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
                consuming: AtomicBool::new(false),
                definition: definition.clone(),
                delivery_notify: Notify::new(),
                failing_connects: AtomicU32::new(0),
                name: definition.name.clone(),
                options,
                reachable: AtomicBool::new(true),
                rotation: AtomicUsize::new(0),
                shutdown_token: SyncMutex::new(CancellationToken::new()),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The definition the broker was created from.
    #[must_use]
    pub fn definition(&self) -> &BrokerDefinition {
        &self.inner.definition
    }

    /// Whether the broker is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether a consumption loop is running.
    #[must_use]
    pub fn is_consuming(&self) -> bool {
        self.inner.consuming.load(Ordering::SeqCst)
    }

    /// Simulates the transport going away or coming back.
    ///
    /// While unreachable, connecting, publishing and resolving deliveries fail,
    /// and a running consumption loop exits with a connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.inner.connected.store(false, Ordering::SeqCst);
            warn!(broker = %self.inner.name, "transport unreachable");
        }
        self.inner.delivery_notify.notify_one();
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Delivery counters of a consumer group.
    pub async fn stats(&self, topic: &str, group_id: &str) -> Option<GroupStats> {
        self.inner.topics.lock().await.get(topic)?.stats(group_id)
    }

    /// Messages a consumer group abandoned after their last delivery attempt.
    pub async fn dead_letters(&self, topic: &str, group_id: &str) -> Vec<MessageMeta<T>> {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .and_then(|topic| topic.group(group_id))
            .map(|group| group.dead_letters().to_vec())
            .unwrap_or_default()
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if !self.inner.is_reachable() {
            return Err(Error::Unreachable(self.inner.name.clone()));
        }
        if !self.is_connected() {
            return Err(Error::NotConnected(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Hands deliveries left unresolved by an earlier run back to their groups.
    async fn requeue_abandoned(&self) {
        let max_deliveries = self.inner.options.max_deliveries;
        let mut topics = self.inner.topics.lock().await;
        for (topic_name, topic) in topics.iter_mut() {
            let requeued = topic.requeue_in_flight(max_deliveries);
            if requeued > 0 {
                warn!(
                    broker = %self.inner.name,
                    topic = %topic_name,
                    count = requeued,
                    "requeued deliveries left unresolved by the previous run"
                );
            }
        }
    }

    async fn next_delivery(&self) -> Option<Delivery<T>> {
        let mut topics = self.inner.topics.lock().await;

        let lanes: Vec<(String, String)> = topics
            .iter()
            .flat_map(|(name, topic)| {
                topic
                    .group_ids()
                    .map(move |group_id| (name.clone(), group_id.clone()))
            })
            .collect();
        if lanes.is_empty() {
            return None;
        }

        // Start from a different lane each time so one busy group cannot starve the rest.
        let start = self.inner.rotation.fetch_add(1, Ordering::Relaxed);
        for offset in 0..lanes.len() {
            let (topic_name, group_id) = &lanes[(start + offset) % lanes.len()];
            let delivery = topics
                .get_mut(topic_name)
                .and_then(|topic| topic.next_delivery(topic_name, group_id));
            if delivery.is_some() {
                return delivery;
            }
        }

        None
    }

    async fn consume(&self, shutdown_token: &CancellationToken) -> Result<(), Error> {
        loop {
            if shutdown_token.is_cancelled() {
                return Ok(());
            }
            if !self.inner.is_reachable() {
                error!(broker = %self.inner.name, "transport lost while consuming");
                return Err(Error::Unreachable(self.inner.name.clone()));
            }

            match self.next_delivery().await {
                Some(delivery) => self.dispatch(delivery).await?,
                None => {
                    tokio::select! {
                        () = shutdown_token.cancelled() => return Ok(()),
                        () = self.inner.delivery_notify.notified() => {}
                    }
                }
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery<T>) -> Result<(), Error> {
        let Delivery {
            consumer,
            delivery_id,
            group_id,
            message,
            topic,
        } = delivery;
        let message_id = message.id();
        let consumer_id = consumer.id().to_string();

        let manager = MessageManager::new(
            message_id,
            MemoryAcknowledger::new(
                self.inner.clone(),
                topic.clone(),
                group_id.clone(),
                delivery_id,
                message_id,
            ),
        );

        debug!(
            topic = %topic,
            group = %group_id,
            consumer = %consumer_id,
            %message_id,
            attempt = message.attempt(),
            "dispatching message"
        );

        // Spawned so a panicking handler is reported instead of unwinding the loop.
        let outcome = tokio::spawn({
            let manager = manager.clone();
            async move { consumer.dispatch(message, manager).await }
        })
        .await;

        let reason = match outcome {
            Ok(Ok(())) => {
                if !manager.is_resolved() {
                    warn!(
                        %message_id,
                        consumer = %consumer_id,
                        "handler returned without resolving the delivery"
                    );
                }
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("handler panicked: {e}"),
        };

        error!(
            topic = %topic,
            group = %group_id,
            consumer = %consumer_id,
            %message_id,
            "handler failed: {reason}"
        );

        if !manager.is_resolved() {
            if let Err(e) = manager.reject().await {
                warn!(%message_id, "failed to reject after handler failure: {e}");
            }
        }

        match self.inner.options.handler_error_policy {
            HandlerErrorPolicy::Reject => Ok(()),
            HandlerErrorPolicy::Fatal => Err(Error::Handler {
                consumer_id,
                message_id,
                reason,
            }),
        }
    }
}

#[async_trait]
impl<T> Broker<T> for MemoryBroker<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    type Error = Error;

    type Options = MemoryBrokerOptions;

    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn connect(&self) -> Result<(), Self::Error> {
        let failing = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing || !self.inner.is_reachable() {
            return Err(Error::Unreachable(self.inner.name.clone()));
        }

        if !self.inner.connected.swap(true, Ordering::SeqCst) {
            info!(broker = %self.inner.name, "connected");
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            info!(broker = %self.inner.name, "closed");
        }
        if self.is_consuming() {
            self.end_consuming();
        }

        Ok(())
    }

    async fn initialize(&self, topics: HashSet<String>) -> Result<(), Self::Error> {
        self.ensure_connected()?;

        let mut state = self.inner.topics.lock().await;
        for topic in topics {
            state.entry(topic.clone()).or_insert_with(|| {
                info!(broker = %self.inner.name, %topic, "topic initialized");
                TopicState::new()
            });
        }

        Ok(())
    }

    async fn initialize_answer_topics(&self, topics: HashSet<String>) -> Result<(), Self::Error> {
        self.ensure_connected()?;

        let mut state = self.inner.answer_topics.lock().await;
        for topic in topics {
            state.entry(topic.clone()).or_insert_with(|| {
                info!(broker = %self.inner.name, %topic, "answer topic initialized");
                HashMap::new()
            });
        }

        Ok(())
    }

    async fn add_topic_consumer(
        &self,
        topic: &str,
        consumer: ConsumerRegistration<T>,
    ) -> Result<(), Self::Error> {
        if self.is_consuming() {
            return Err(Error::ConsumingActive(consumer.id().to_string()));
        }

        let mut topics = self.inner.topics.lock().await;
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| Error::TopicNotInitialized(topic.to_string()))?;

        info!(
            broker = %self.inner.name,
            %topic,
            consumer = consumer.id(),
            group = consumer.group_id(),
            "consumer registered"
        );
        state.register(topic, consumer)
    }

    async fn start_consuming(&self) -> Result<(), Self::Error> {
        if self.inner.consuming.swap(true, Ordering::SeqCst) {
            // The token belongs to the running loop; leave it alone.
            return Err(Error::AlreadyConsuming(self.inner.name.clone()));
        }

        if let Err(e) = self.ensure_connected() {
            // A stop requested before a failed start must not cut the next run short.
            *self.inner.shutdown_token.lock() = CancellationToken::new();
            self.inner.consuming.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let shutdown_token = self.inner.shutdown_token.lock().clone();
        info!(broker = %self.inner.name, "consuming start");

        self.requeue_abandoned().await;

        let result = self.consume(&shutdown_token).await;

        *self.inner.shutdown_token.lock() = CancellationToken::new();
        self.inner.consuming.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => info!(broker = %self.inner.name, "consuming stopped"),
            Err(e) => error!(broker = %self.inner.name, "consuming failed: {e}"),
        }

        result
    }

    fn end_consuming(&self) {
        debug!(broker = %self.inner.name, "was notified about interruption");
        self.inner.shutdown_token.lock().cancel();
    }

    async fn publish(
        &self,
        topic: &str,
        messages: Vec<MessageMeta<T>>,
    ) -> Result<(), Self::Error> {
        self.ensure_connected()?;

        if let Some(stray) = messages.iter().find(|message| message.topic() != topic) {
            return Err(Error::TopicMismatch {
                message_id: stray.id(),
                message_topic: stray.topic().to_string(),
                topic: topic.to_string(),
            });
        }

        let mut topics = self.inner.topics.lock().await;
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| Error::TopicNotInitialized(topic.to_string()))?;

        if messages.is_empty() {
            return Ok(());
        }

        debug!(broker = %self.inner.name, %topic, count = messages.len(), "publishing messages");
        state.append(messages);
        drop(topics);

        self.inner.delivery_notify.notify_one();

        Ok(())
    }

    async fn get_topic_approximate_messages_count(&self, topic: &str) -> u64 {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .map_or(0, TopicState::approximate_count)
    }

    async fn publish_answer(
        &self,
        answer_topic: &str,
        request_id: Uuid,
        message: MessageMeta<T>,
    ) -> Result<(), Self::Error> {
        self.ensure_connected()?;

        let mut answer_topics = self.inner.answer_topics.lock().await;
        let answers = answer_topics
            .get_mut(answer_topic)
            .ok_or_else(|| Error::AnswerTopicNotInitialized(answer_topic.to_string()))?;

        debug!(broker = %self.inner.name, %answer_topic, %request_id, "publishing answer");
        answers.insert(request_id, message);
        drop(answer_topics);

        self.inner.answer_notify.notify_waiters();

        Ok(())
    }

    async fn get_answer(
        &self,
        answer_topic: &str,
        request_id: Uuid,
        timeout: Duration,
    ) -> Result<MessageMeta<T>, Self::Error> {
        self.ensure_connected()?;

        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Registered before checking so an answer published in between still wakes us.
            let notified = self.inner.answer_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut answer_topics = self.inner.answer_topics.lock().await;
                let answers = answer_topics.get_mut(answer_topic).ok_or_else(|| {
                    Error::AnswerTopicNotInitialized(answer_topic.to_string())
                })?;
                if let Some(answer) = answers.remove(&request_id) {
                    return Ok(answer);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::AnswerTimeout {
                    answer_topic: answer_topic.to_string(),
                    request_id,
                    timeout,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use courier_broker::{BoxError, BrokerError, ErrorKind, handler_fn};
    use tracing_test::traced_test;

    fn broker() -> MemoryBroker<String> {
        MemoryBroker::new(
            &BrokerDefinition::new("test_broker"),
            MemoryBrokerOptions::default(),
        )
    }

    fn topics(names: &[&str]) -> HashSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn noop_consumer(id: &str, group_id: &str) -> ConsumerRegistration<String> {
        ConsumerRegistration::new(
            id,
            group_id,
            handler_fn(|_: MessageMeta<String>, manager: MessageManager| async move {
                manager.ack().await?;
                Ok::<_, BoxError>(())
            }),
        )
    }

    #[tokio::test]
    async fn test_connect_and_close_are_idempotent() {
        let broker = broker();

        broker.close().await.unwrap();
        assert!(!broker.is_connected());

        broker.connect().await.unwrap();
        broker.connect().await.unwrap();
        assert!(broker.is_connected());

        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert!(!broker.is_connected());

        broker.connect().await.unwrap();
        assert!(broker.is_connected());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = broker();

        let err = broker.initialize(topics(&["orders"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);

        let err = broker.start_consuming().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);

        broker.set_reachable(false);
        let err = broker.connect().await.unwrap_err();
        assert_matches!(err, Error::Unreachable(_));

        broker.set_reachable(true);
        broker.fail_next_connects(2);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        broker.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_uninitialized_topics() {
        let broker = broker();
        broker.connect().await.unwrap();

        let err = broker
            .publish("orders", vec![MessageMeta::new("orders", "a".to_string())])
            .await
            .unwrap_err();
        assert_matches!(&err, Error::TopicNotInitialized(topic) if topic == "orders");
        assert_eq!(err.kind(), ErrorKind::TopicNotInitialized);

        let err = broker
            .add_topic_consumer("orders", noop_consumer("c1", "g1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TopicNotInitialized);

        assert_eq!(broker.get_topic_approximate_messages_count("orders").await, 0);
    }

    #[tokio::test]
    async fn test_publish_rejects_foreign_messages() {
        let broker = broker();
        broker.connect().await.unwrap();
        broker.initialize(topics(&["orders", "invoices"])).await.unwrap();

        let err = broker
            .publish(
                "orders",
                vec![
                    MessageMeta::new("orders", "a".to_string()),
                    MessageMeta::new("invoices", "b".to_string()),
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        // Nothing from the rejected batch was appended.
        assert_eq!(broker.get_topic_approximate_messages_count("orders").await, 0);
    }

    #[tokio::test]
    async fn test_initialize_keeps_existing_messages() {
        let broker = broker();
        broker.connect().await.unwrap();
        broker.initialize(topics(&["orders"])).await.unwrap();
        broker
            .publish(
                "orders",
                vec![
                    MessageMeta::new("orders", "a".to_string()),
                    MessageMeta::new("orders", "b".to_string()),
                ],
            )
            .await
            .unwrap();

        broker.initialize(topics(&["orders"])).await.unwrap();
        assert_eq!(broker.get_topic_approximate_messages_count("orders").await, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_registration_rejected_while_consuming() {
        let broker = broker();
        broker.connect().await.unwrap();
        broker.initialize(topics(&["orders"])).await.unwrap();
        broker
            .add_topic_consumer("orders", noop_consumer("c1", "g1"))
            .await
            .unwrap();

        let consuming = tokio::spawn({
            let broker = broker.clone();
            async move { broker.start_consuming().await }
        });
        while !broker.is_consuming() {
            tokio::task::yield_now().await;
        }

        let err = broker
            .add_topic_consumer("orders", noop_consumer("c2", "g1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consuming);

        let err = broker.start_consuming().await.unwrap_err();
        assert_matches!(err, Error::AlreadyConsuming(_));

        broker.end_consuming();
        consuming.await.unwrap().unwrap();
        assert!(!broker.is_consuming());

        assert!(logs_contain("consuming start"));
        assert!(logs_contain("consuming stopped"));
    }

    #[tokio::test]
    async fn test_answer_round_trip() {
        let broker = broker();
        broker.connect().await.unwrap();
        broker
            .initialize_answer_topics(topics(&["orders__answer"]))
            .await
            .unwrap();

        let request = MessageMeta::new("orders", "request".to_string());
        let waiter = tokio::spawn({
            let broker = broker.clone();
            let request_id = request.id();
            async move {
                broker
                    .get_answer("orders__answer", request_id, Duration::from_secs(1))
                    .await
            }
        });

        let answer = request.child("orders__answer", "answer".to_string());
        broker
            .publish_answer("orders__answer", request.id(), answer.clone())
            .await
            .unwrap();

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received, answer);
        assert_eq!(received.parent_id(), Some(request.id()));
    }

    #[tokio::test]
    async fn test_answer_timeout() {
        let broker = broker();
        broker.connect().await.unwrap();

        let err = broker
            .get_answer("missing", Uuid::new_v4(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TopicNotInitialized);

        broker
            .initialize_answer_topics(topics(&["orders__answer"]))
            .await
            .unwrap();
        let err = broker
            .get_answer("orders__answer", Uuid::new_v4(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_matches!(err, Error::AnswerTimeout { .. });
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
