use crate::error::SourceError;
use crate::status::WeatherStatus;
use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Opaque handle returned by [`WeatherSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type Handler = Arc<dyn Fn(&Arc<WeatherStatus>) -> anyhow::Result<()> + Send + Sync>;

/// Wraps a closure as a subscription [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Arc<WeatherStatus>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Ordered multicast list of subscription handlers.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Handler)>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, handler));
        id
    }

    /// Removes the handler registered under `id`. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().retain(|(entry_id, _)| *entry_id != id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `status` to every subscriber in subscription order.
    ///
    /// Handlers run outside the lock on a snapshot of the list. A handler that
    /// fails or panics is logged and skipped; later handlers still run.
    /// Returns the number of handlers that accepted the record.
    pub fn publish(&self, source: &str, status: &Arc<WeatherStatus>) -> usize {
        let snapshot: Vec<(SubscriptionId, Handler)> = self.lock().clone();
        let mut delivered = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(status))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    tracing::warn!(source = %source, subscription = id.0, error = %err, "subscriber failed");
                }
                Err(_) => {
                    tracing::error!(source = %source, subscription = id.0, "subscriber panicked");
                }
            }
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Handler)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Capability shared by every weather data source.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    fn name(&self) -> &str;

    fn subscribers(&self) -> &Subscribers;

    /// Runs until `cancel` fires. Transient failures are handled inside the
    /// loop; only fatal startup failures are returned.
    async fn listen(&self, cancel: CancellationToken) -> Result<(), SourceError>;

    fn subscribe(&self, handler: Handler) -> SubscriptionId {
        self.subscribers().subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers().unsubscribe(id)
    }

    fn publish(&self, status: WeatherStatus) -> usize {
        self.subscribers().publish(self.name(), &Arc::new(status))
    }
}

/// Sleeps for `delay` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn backoff(cancel: &CancellationToken, delay: std::time::Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Drives `work` until it completes or `cancel` fires. Returns `None` when
/// cancelled; `work` is dropped at that point.
pub async fn until_cancelled<F: std::future::Future>(
    cancel: &CancellationToken,
    work: F,
) -> Option<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        output = work => Some(output),
    }
}
