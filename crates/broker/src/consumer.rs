use crate::consumer_handler::MessageHandler;
use crate::manager::{BoxError, MessageManager};
use crate::message::MessageMeta;

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

#[async_trait]
trait ErasedHandler<T>: Send + Sync + 'static
where
    T: Clone + Debug + Send + Sync + 'static,
{
    async fn dispatch(&self, message: MessageMeta<T>, manager: MessageManager)
    -> Result<(), BoxError>;
}

#[async_trait]
impl<X, T> ErasedHandler<T> for X
where
    X: MessageHandler<T>,
    T: Clone + Debug + Send + Sync + 'static,
{
    async fn dispatch(
        &self,
        message: MessageMeta<T>,
        manager: MessageManager,
    ) -> Result<(), BoxError> {
        self.handle(message, manager)
            .await
            .map_err(|e| Box::new(e) as BoxError)
    }
}

/// A handler bound to a consumer group, registered against a topic.
///
/// Registrations sharing a `group_id` on a topic compete for its messages;
/// registrations in different groups each receive every message.
pub struct ConsumerRegistration<T = Bytes>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    group_id: String,
    handler: Arc<dyn ErasedHandler<T>>,
    id: String,
}

impl<T> Clone for ConsumerRegistration<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            group_id: self.group_id.clone(),
            handler: self.handler.clone(),
            id: self.id.clone(),
        }
    }
}

impl<T> Debug for ConsumerRegistration<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

impl<T> ConsumerRegistration<T>
where
    T: Clone + Debug + Send + Sync + 'static,
{
    /// Creates a registration with an explicit consumer id.
    pub fn new<X>(id: impl Into<String>, group_id: impl Into<String>, handler: X) -> Self
    where
        X: MessageHandler<T>,
    {
        Self {
            group_id: group_id.into(),
            handler: Arc::new(handler),
            id: id.into(),
        }
    }

    /// Creates a registration whose id is derived from the group name.
    pub fn for_group<X>(group_id: impl Into<String>, handler: X) -> Self
    where
        X: MessageHandler<T>,
    {
        let group_id = group_id.into();
        let id = format!("{group_id}__{}", Uuid::new_v4());
        Self::new(id, group_id, handler)
    }

    /// The consumer id, unique per registration.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The consumer group the registration belongs to.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Invokes the handler for one delivery.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler returned, boxed.
    pub async fn dispatch(
        &self,
        message: MessageMeta<T>,
        manager: MessageManager,
    ) -> Result<(), BoxError> {
        self.handler.dispatch(message, manager).await
    }
}
