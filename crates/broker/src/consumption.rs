use crate::broker::Broker;

use std::fmt::Debug;
use std::future::Future;

use tracing::info;

/// Runs [`Broker::start_consuming`] until `shutdown` resolves.
///
/// Once `shutdown` completes (for example `tokio::signal::ctrl_c()`), the broker
/// is asked to end consumption and the loop returns after its in-flight handler.
///
/// # Errors
///
/// Returns whatever error terminated the consumption loop.
pub async fn consume_until<B, T, F>(broker: &B, shutdown: F) -> Result<(), B::Error>
where
    B: Broker<T>,
    T: Clone + Debug + Send + Sync + 'static,
    F: Future + Send + 'static,
{
    let stopper = broker.clone();
    let watcher = tokio::spawn(async move {
        shutdown.await;
        info!(broker = stopper.name(), "interruption detected; ending consumption");
        stopper.end_consuming();
    });

    let result = broker.start_consuming().await;
    watcher.abort();

    result
}
