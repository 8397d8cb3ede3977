mod error;

pub use error::Error;

use crate::Inner;
use crate::topic::{GroupState, Rejection};

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use courier_broker::{Acknowledger, BoxError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Records the resolution of one delivery in its group.
pub struct MemoryAcknowledger<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    delivery_id: Uuid,
    group_id: String,
    inner: Arc<Inner<T>>,
    message_id: Uuid,
    topic: String,
}

impl<T> MemoryAcknowledger<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    pub const fn new(
        inner: Arc<Inner<T>>,
        topic: String,
        group_id: String,
        delivery_id: Uuid,
        message_id: Uuid,
    ) -> Self {
        Self {
            delivery_id,
            group_id,
            inner,
            message_id,
            topic,
        }
    }

    fn unknown_delivery(&self) -> Error {
        Error::UnknownDelivery {
            delivery_id: self.delivery_id,
            message_id: self.message_id,
        }
    }

    /// Runs `resolve` against the delivery's group while the transport is reachable.
    async fn with_group<R>(
        &self,
        resolve: impl FnOnce(&mut GroupState<T>) -> Option<R> + Send,
    ) -> Result<R, Error> {
        if !self.inner.is_reachable() {
            return Err(Error::Unreachable(self.inner.name.clone()));
        }

        let mut topics = self.inner.topics.lock().await;
        topics
            .get_mut(&self.topic)
            .and_then(|topic| topic.group_mut(&self.group_id))
            .and_then(resolve)
            .ok_or_else(|| self.unknown_delivery())
    }
}

impl<T> Debug for MemoryAcknowledger<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAcknowledger")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("delivery_id", &self.delivery_id)
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T> Acknowledger for MemoryAcknowledger<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    async fn ack(&self) -> Result<(), BoxError> {
        self.with_group(|group| group.ack(self.delivery_id).then_some(()))
            .await?;

        debug!(topic = %self.topic, group = %self.group_id, message_id = %self.message_id, "acked");

        Ok(())
    }

    async fn reject(&self) -> Result<(), BoxError> {
        let max_deliveries = self.inner.options.max_deliveries;
        let rejection = self
            .with_group(|group| group.reject(self.delivery_id, max_deliveries))
            .await?;

        match rejection {
            Rejection::Requeued => {
                debug!(topic = %self.topic, group = %self.group_id, message_id = %self.message_id, "rejected; requeued");
                self.inner.delivery_notify.notify_one();
            }
            Rejection::DeadLettered => {
                warn!(topic = %self.topic, group = %self.group_id, message_id = %self.message_id, "rejected; dead-lettered");
            }
        }

        Ok(())
    }
}
