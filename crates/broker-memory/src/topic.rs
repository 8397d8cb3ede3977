use crate::error::Error;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Debug;

use courier_broker::{ConsumerRegistration, MessageMeta};
use uuid::Uuid;

/// Delivery counters of one consumer group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// Deliveries handed to handlers, redeliveries included.
    pub delivered: u64,

    /// Deliveries acked.
    pub acked: u64,

    /// Deliveries rejected.
    pub rejected: u64,

    /// Rejected deliveries requeued for another attempt.
    pub redelivered: u64,

    /// Rejected deliveries abandoned after their last attempt.
    pub dead_lettered: u64,

    /// Deliveries handed out and not yet resolved.
    pub in_flight: u64,

    /// Messages waiting to be delivered.
    pub pending: u64,
}

/// A message selected for a consumer.
#[derive(Debug)]
pub struct Delivery<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    pub consumer: ConsumerRegistration<T>,
    pub delivery_id: Uuid,
    pub group_id: String,
    pub message: MessageMeta<T>,
    pub topic: String,
}

/// What a reject did with the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Queued for another attempt.
    Requeued,

    /// Out of attempts.
    DeadLettered,
}

#[derive(Debug)]
struct InFlight<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    message: MessageMeta<T>,
    sequence: u64,
}

#[derive(Debug)]
pub struct GroupState<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    consumers: Vec<ConsumerRegistration<T>>,
    cursor: usize,
    dead_letters: Vec<MessageMeta<T>>,
    // Keyed by delivery id, so the same message can be in flight twice.
    in_flight: HashMap<Uuid, InFlight<T>>,
    next_consumer: usize,
    next_sequence: u64,
    redeliveries: VecDeque<MessageMeta<T>>,
    stats: GroupStats,
}

impl<T> GroupState<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            consumers: Vec::new(),
            cursor: 0,
            dead_letters: Vec::new(),
            in_flight: HashMap::new(),
            next_consumer: 0,
            next_sequence: 0,
            redeliveries: VecDeque::new(),
            stats: GroupStats::default(),
        }
    }

    fn pending(&self, log_len: usize) -> usize {
        log_len.saturating_sub(self.cursor) + self.redeliveries.len()
    }

    /// Requeues `message` for another attempt, or dead-letters it once
    /// `max_deliveries` attempts were spent.
    fn retry_or_dead_letter(&mut self, message: MessageMeta<T>, max_deliveries: u32) -> Rejection {
        if message.attempt() < max_deliveries {
            self.redeliveries.push_back(message.redelivered());
            self.stats.redelivered += 1;
            Rejection::Requeued
        } else {
            self.dead_letters.push(message);
            self.stats.dead_lettered += 1;
            Rejection::DeadLettered
        }
    }

    /// Records an ack. Returns `false` if the delivery is no longer in flight.
    pub fn ack(&mut self, delivery_id: Uuid) -> bool {
        if self.in_flight.remove(&delivery_id).is_none() {
            return false;
        }
        self.stats.acked += 1;
        true
    }

    /// Records a reject. Returns `None` if the delivery is no longer in flight.
    pub fn reject(&mut self, delivery_id: Uuid, max_deliveries: u32) -> Option<Rejection> {
        let InFlight { message, .. } = self.in_flight.remove(&delivery_id)?;
        self.stats.rejected += 1;
        Some(self.retry_or_dead_letter(message, max_deliveries))
    }

    /// Takes back every unresolved delivery, oldest first, as if each had been rejected
    /// by the transport. Returns how many there were.
    pub fn requeue_in_flight(&mut self, max_deliveries: u32) -> usize {
        let mut abandoned: Vec<InFlight<T>> =
            self.in_flight.drain().map(|(_, in_flight)| in_flight).collect();
        abandoned.sort_by_key(|in_flight| in_flight.sequence);

        let count = abandoned.len();
        for InFlight { message, .. } in abandoned {
            self.retry_or_dead_letter(message, max_deliveries);
        }
        count
    }

    pub fn dead_letters(&self) -> &[MessageMeta<T>] {
        &self.dead_letters
    }
}

/// A topic's log and the consumer groups reading it.
#[derive(Debug)]
pub struct TopicState<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    groups: BTreeMap<String, GroupState<T>>,
    log: Vec<MessageMeta<T>>,
}

impl<T> TopicState<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    pub const fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    /// Adds a consumer to its group; new groups read the log from the start.
    pub fn register(&mut self, topic: &str, consumer: ConsumerRegistration<T>) -> Result<(), Error> {
        let duplicate = self
            .groups
            .values()
            .flat_map(|group| group.consumers.iter())
            .any(|existing| existing.id() == consumer.id());
        if duplicate {
            return Err(Error::DuplicateConsumer {
                consumer_id: consumer.id().to_string(),
                topic: topic.to_string(),
            });
        }

        self.groups
            .entry(consumer.group_id().to_string())
            .or_insert_with(GroupState::new)
            .consumers
            .push(consumer);

        Ok(())
    }

    pub fn append(&mut self, messages: Vec<MessageMeta<T>>) {
        self.log.extend(messages);
    }

    pub fn group_ids(&self) -> impl Iterator<Item = &String> {
        self.groups.keys()
    }

    pub fn group_mut(&mut self, group_id: &str) -> Option<&mut GroupState<T>> {
        self.groups.get_mut(group_id)
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupState<T>> {
        self.groups.get(group_id)
    }

    /// Hands the group's next message to one of its consumers, round-robin.
    ///
    /// Redeliveries go before unseen log entries.
    pub fn next_delivery(&mut self, topic: &str, group_id: &str) -> Option<Delivery<T>> {
        let Self { groups, log } = self;
        let group = groups.get_mut(group_id)?;
        if group.consumers.is_empty() {
            return None;
        }

        let message = if let Some(message) = group.redeliveries.pop_front() {
            message
        } else {
            let message = log.get(group.cursor)?.clone();
            group.cursor += 1;
            message
        };

        let consumer = group.consumers[group.next_consumer % group.consumers.len()].clone();
        group.next_consumer = (group.next_consumer + 1) % group.consumers.len();

        let delivery_id = Uuid::new_v4();
        group.in_flight.insert(
            delivery_id,
            InFlight {
                message: message.clone(),
                sequence: group.next_sequence,
            },
        );
        group.next_sequence += 1;
        group.stats.delivered += 1;

        Some(Delivery {
            consumer,
            delivery_id,
            group_id: group_id.to_string(),
            message,
            topic: topic.to_string(),
        })
    }

    /// Requeues the unresolved deliveries of every group. Returns how many there were.
    pub fn requeue_in_flight(&mut self, max_deliveries: u32) -> usize {
        self.groups
            .values_mut()
            .map(|group| group.requeue_in_flight(max_deliveries))
            .sum()
    }

    pub fn stats(&self, group_id: &str) -> Option<GroupStats> {
        let group = self.groups.get(group_id)?;
        Some(GroupStats {
            in_flight: group.in_flight.len() as u64,
            pending: group.pending(self.log.len()) as u64,
            ..group.stats
        })
    }

    /// The largest backlog across groups, or the log length without groups.
    pub fn approximate_count(&self) -> u64 {
        let count = if self.groups.is_empty() {
            self.log.len()
        } else {
            self.groups
                .values()
                .map(|group| group.pending(self.log.len()))
                .max()
                .unwrap_or_default()
        };
        count as u64
    }
}
