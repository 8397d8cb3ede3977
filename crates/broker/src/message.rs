use std::collections::HashMap;
use std::fmt::Debug;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The envelope of a single message moving between a broker and its handlers.
///
/// Once published a `MessageMeta` is never mutated. Retrying a delivery produces
/// a re-wrapped copy (see [`MessageMeta::redelivered`]).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct MessageMeta<T = Bytes> {
    id: Uuid,
    topic: String,
    payload: T,
    headers: HashMap<String, String>,
    correlation_id: Option<String>,
    parent_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    attempt: u32,
}

impl<T> MessageMeta<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    /// Creates a new message for the given topic with a fresh id.
    pub fn new(topic: impl Into<String>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            headers: HashMap::new(),
            correlation_id: None,
            parent_id: None,
            created_at: Utc::now(),
            attempt: 1,
        }
    }

    /// Adds a header to the message.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the correlation id used to trace a chain of messages.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Creates a message caused by this one.
    ///
    /// The child gets a fresh id, records this message as its parent, keeps the
    /// headers, and inherits the correlation id (or this message's id when there
    /// is none yet).
    pub fn child<C>(&self, topic: impl Into<String>, payload: C) -> MessageMeta<C>
    where
        C: Clone + Debug + Send + Sync + 'static,
    {
        MessageMeta {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            headers: self.headers.clone(),
            correlation_id: Some(
                self.correlation_id
                    .clone()
                    .unwrap_or_else(|| self.id.to_string()),
            ),
            parent_id: Some(self.id),
            created_at: Utc::now(),
            attempt: 1,
        }
    }

    /// Returns a copy for another delivery attempt of the same message.
    #[must_use]
    pub fn redelivered(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// The message id, unique within its topic.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The topic the message was published to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The message payload.
    pub const fn payload(&self) -> &T {
        &self.payload
    }

    /// Consumes the message, returning its payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Gets a header value by key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// All headers of the message.
    pub const fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// The correlation id, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The id of the message that caused this one, if any.
    pub const fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    /// When the message was created.
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The delivery attempt this copy represents, starting at 1.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_is_first_attempt() {
        let message = MessageMeta::new("orders", Bytes::from("payload"));

        assert_eq!(message.topic(), "orders");
        assert_eq!(message.payload(), &Bytes::from("payload"));
        assert_eq!(message.attempt(), 1);
        assert!(message.parent_id().is_none());
        assert!(message.correlation_id().is_none());
    }

    #[test]
    fn test_child_inherits_correlation() {
        let parent = MessageMeta::new("orders", 1_u32).with_header("tenant", "acme");
        let child = parent.child("invoices", "invoice".to_string());

        assert_ne!(child.id(), parent.id());
        assert_eq!(child.parent_id(), Some(parent.id()));
        assert_eq!(child.correlation_id(), Some(parent.id().to_string().as_str()));
        assert_eq!(child.header("tenant"), Some("acme"));
        assert_eq!(child.topic(), "invoices");

        let grandchild = child.child("receipts", ());
        assert_eq!(grandchild.correlation_id(), child.correlation_id());
        assert_eq!(grandchild.parent_id(), Some(child.id()));
    }

    #[test]
    fn test_redelivered_keeps_identity() {
        let message = MessageMeta::new("orders", "a".to_string()).with_correlation_id("trace-1");
        let retry = message.redelivered();

        assert_eq!(retry.id(), message.id());
        assert_eq!(retry.correlation_id(), Some("trace-1"));
        assert_eq!(retry.attempt(), 2);
        assert_eq!(message.attempt(), 1);
    }
}
