use crate::error::HandlerError;
use crate::manager::{BoxError, MessageManager};
use crate::message::MessageMeta;

use std::fmt::{self, Debug};
use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A trait representing the handler of a consumer registration.
///
/// The handler owns the [`MessageManager`] it is given and is expected to ack or
/// reject through it, possibly after handing it off to another task. Returning
/// an error never acks the message.
///
/// A delivery whose manager is dropped unresolved stays in flight until the
/// consumption run ends; drivers redeliver it when the next run starts, and a
/// late ack or reject through the old manager then fails with
/// [`Error::Transport`](crate::manager::Error::Transport).
#[async_trait]
pub trait MessageHandler<T = Bytes>
where
    Self: Debug + Send + Sync + 'static,
    T: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: HandlerError;

    /// Handles a delivered message.
    async fn handle(&self, message: MessageMeta<T>, manager: MessageManager)
    -> Result<(), Self::Error>;
}

/// Error produced by a [`FnHandler`].
#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerFailure(#[source] pub BoxError);

impl HandlerError for HandlerFailure {}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wraps an async closure taking `(MessageMeta<T>, MessageManager)` as a handler.
pub const fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<T, F, Fut, E> MessageHandler<T> for FnHandler<F>
where
    T: Clone + Debug + Send + Sync + 'static,
    F: Fn(MessageMeta<T>, MessageManager) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    type Error = HandlerFailure;

    async fn handle(
        &self,
        message: MessageMeta<T>,
        manager: MessageManager,
    ) -> Result<(), Self::Error> {
        (self.f)(message, manager)
            .await
            .map_err(|e| HandlerFailure(e.into()))
    }
}
