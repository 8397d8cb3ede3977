#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use courier_broker::{
    BoxError, Broker, BrokerDefinition, ConsumerRegistration, MessageManager, MessageMeta,
    handler_fn,
};
use courier_broker_memory::{Error, GroupStats, MemoryBroker, MemoryBrokerOptions};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One delivery as seen by a handler.
#[derive(Clone, Debug)]
pub struct Received {
    pub attempt: u32,
    pub consumer: String,
    pub message_id: Uuid,
    pub payload: String,
    pub topic: String,
}

/// Collects deliveries from every registration it hands out.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    received: Arc<Mutex<Vec<Received>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registration that records, then acks.
    pub fn acking(&self, id: &str, group_id: &str) -> ConsumerRegistration<String> {
        let received = self.received.clone();
        let consumer = id.to_string();

        ConsumerRegistration::new(
            id,
            group_id,
            handler_fn(move |message: MessageMeta<String>, manager: MessageManager| {
                let received = received.clone();
                let consumer = consumer.clone();
                async move {
                    received.lock().push(Received {
                        attempt: message.attempt(),
                        consumer,
                        message_id: message.id(),
                        payload: message.payload().clone(),
                        topic: message.topic().to_string(),
                    });
                    manager.ack().await?;
                    Ok::<_, BoxError>(())
                }
            }),
        )
    }

    /// A registration that records, then rejects.
    pub fn rejecting(&self, id: &str, group_id: &str) -> ConsumerRegistration<String> {
        let received = self.received.clone();
        let consumer = id.to_string();

        ConsumerRegistration::new(
            id,
            group_id,
            handler_fn(move |message: MessageMeta<String>, manager: MessageManager| {
                let received = received.clone();
                let consumer = consumer.clone();
                async move {
                    received.lock().push(Received {
                        attempt: message.attempt(),
                        consumer,
                        message_id: message.id(),
                        payload: message.payload().clone(),
                        topic: message.topic().to_string(),
                    });
                    manager.reject().await?;
                    Ok::<_, BoxError>(())
                }
            }),
        )
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|received| received.payload.clone())
            .collect()
    }
}

pub fn broker(options: MemoryBrokerOptions) -> MemoryBroker<String> {
    MemoryBroker::new(&BrokerDefinition::new("test_broker"), options)
}

/// A connected broker with the given topics initialized.
pub async fn connected_broker(topics: &[&str], options: MemoryBrokerOptions) -> MemoryBroker<String> {
    let broker = broker(options);
    broker.connect().await.unwrap();
    broker
        .initialize(topics.iter().map(ToString::to_string).collect::<HashSet<_>>())
        .await
        .unwrap();
    broker
}

pub fn messages(topic: &str, payloads: &[&str]) -> Vec<MessageMeta<String>> {
    payloads
        .iter()
        .map(|payload| MessageMeta::new(topic, (*payload).to_string()))
        .collect()
}

pub fn spawn_consuming(broker: &MemoryBroker<String>) -> JoinHandle<Result<(), Error>> {
    let broker = broker.clone();
    tokio::spawn(async move { broker.start_consuming().await })
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within five seconds");
}

/// Polls a group's stats until `check` holds, failing the test after five seconds.
pub async fn wait_for_stats(
    broker: &MemoryBroker<String>,
    topic: &str,
    group_id: &str,
    check: impl Fn(&GroupStats) -> bool,
) -> GroupStats {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(stats) = broker.stats(topic, group_id).await {
                if check(&stats) {
                    return stats;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stats not reached within five seconds")
}

/// Ends consumption and waits for the loop to return.
pub async fn stop(broker: &MemoryBroker<String>, consuming: JoinHandle<Result<(), Error>>) {
    broker.end_consuming();
    tokio::time::timeout(Duration::from_secs(5), consuming)
        .await
        .expect("consumption did not stop")
        .unwrap()
        .unwrap();
}
