use crate::error::SourceError;
use crate::source::{Subscribers, WeatherSource};
use crate::status::{Datapoint, WeatherStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Source driven by the test: `listen` parks until cancelled and records are
/// injected with [`ManualSource::push`].
pub struct ManualSource {
    name: String,
    subscribers: Subscribers,
    failure: Option<String>,
    /// When set, `listen` keeps running after cancellation until released.
    linger: Option<Notify>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl ManualSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: Subscribers::new(),
            failure: None,
            linger: None,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// A source whose `listen` fails immediately with `message`.
    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new(name)
        }
    }

    /// A source that only stops after cancellation once [`release`] is
    /// called.
    ///
    /// [`release`]: ManualSource::release
    pub fn lingering(name: &str) -> Self {
        Self {
            linger: Some(Notify::new()),
            ..Self::new(name)
        }
    }

    pub fn release(&self) {
        if let Some(linger) = &self.linger {
            linger.notify_one();
        }
    }

    pub fn push(&self, status: WeatherStatus) -> usize {
        self.publish(status)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl WeatherSource for ManualSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    async fn listen(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(SourceError::Provider {
                provider: "manual",
                message: message.clone(),
            });
        }
        cancel.cancelled().await;
        if let Some(linger) = &self.linger {
            linger.notified().await;
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn status_with_temp(
    source: &str,
    temp_c: f64,
    quality: f64,
    observed_at: Option<DateTime<Utc>>,
) -> WeatherStatus {
    let mut status = WeatherStatus::from_source(source, Utc::now());
    status.source_timestamp = observed_at;
    status.temp_c = Some(Datapoint::new(temp_c, quality));
    status
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
