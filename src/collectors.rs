pub mod conditions;
pub mod openweathermap;
pub mod tempest_ble;
pub mod tempest_cloud;
pub mod tempest_udp;

use crate::config::SourcesConfig;
use crate::error::SourceError;
use crate::source::{backoff, WeatherSource};
use crate::status::WeatherStatus;
use openweathermap::{OpenWeatherMapConfig, OpenWeatherMapSource};
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempest_ble::{TempestBleConfig, TempestBleSource};
use tempest_cloud::{TempestCloudConfig, TempestCloudSource};
use tempest_udp::{TempestUdpConfig, TempestUdpSource};
use tokio_util::sync::CancellationToken;
use url::Url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// HTTP client shared by the REST pollers.
pub fn http_client() -> Result<Client, SourceError> {
    Ok(Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("weather-fusion/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Builds every source enabled in `sources`, in a fixed order.
pub fn build_sources(sources: &SourcesConfig) -> Result<Vec<Arc<dyn WeatherSource>>, SourceError> {
    let mut built: Vec<Arc<dyn WeatherSource>> = Vec::new();

    if let Some(config) = &sources.tempest_udp {
        built.push(Arc::new(TempestUdpSource::new(
            TempestUdpConfig::from_source_config(config)?,
        )));
    }
    if let Some(config) = &sources.tempest_ble {
        built.push(Arc::new(TempestBleSource::new(
            TempestBleConfig::from_source_config(config)?,
        )));
    }

    if sources.openweathermap.is_some() || sources.tempest_cloud.is_some() {
        let http = http_client()?;
        if let Some(config) = &sources.openweathermap {
            built.push(Arc::new(OpenWeatherMapSource::new(
                OpenWeatherMapConfig::from_source_config(config)?,
                http.clone(),
            )));
        }
        if let Some(config) = &sources.tempest_cloud {
            built.push(Arc::new(TempestCloudSource::new(
                TempestCloudConfig::from_source_config(config)?,
                http,
            )));
        }
    }

    Ok(built)
}

/// Poll, publish, sleep `interval`; repeat until `cancel` fires. A failed poll
/// is logged and retried after the same interval.
pub(crate) async fn run_poll_loop<S, F, Fut>(
    source: &S,
    interval: Duration,
    cancel: &CancellationToken,
    poll: F,
) where
    S: WeatherSource + ?Sized,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<WeatherStatus, SourceError>>,
{
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = poll() => outcome,
        };
        match outcome {
            Ok(status) => {
                source.publish(status);
            }
            Err(err) => {
                tracing::warn!(
                    source = %source.name(),
                    error = %err,
                    retry_in_secs = interval.as_secs_f64(),
                    "weather poll failed"
                );
            }
        }
        if !backoff(cancel, interval).await {
            break;
        }
    }
    tracing::info!(source = %source.name(), "poller stopped");
}

/// GETs `url` and returns the body. A non-success status is logged with its
/// body and reported as a provider error.
pub(crate) async fn get_text(
    http: &Client,
    url: &Url,
    provider: &'static str,
) -> Result<String, SourceError> {
    let response = http.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(provider, url = %url.path(), "HTTP {status}: {body}");
        return Err(SourceError::Provider {
            provider,
            message: format!("HTTP {status}"),
        });
    }
    Ok(response.text().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::source::handler;
    use crate::test_support::ManualSource;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn builds_only_enabled_sources_in_order() {
        let sources = SourcesConfig {
            tempest_udp: Some(SourceConfig::new()),
            tempest_cloud: Some(
                SourceConfig::new()
                    .with("station_id", 1)
                    .with("token", "t"),
            ),
            ..SourcesConfig::default()
        };
        let built = build_sources(&sources).unwrap();
        let names: Vec<&str> = built.iter().map(|source| source.name()).collect();
        assert_eq!(names, vec!["tempest_udp", "tempest_cloud"]);
    }

    #[test]
    fn invalid_section_fails_the_build() {
        let sources = SourcesConfig {
            tempest_udp: Some(SourceConfig::new().with("port", json!("not-a-port"))),
            ..SourcesConfig::default()
        };
        assert!(matches!(
            build_sources(&sources),
            Err(SourceError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_retries_after_failures_until_cancelled() {
        let source = ManualSource::new("poller");
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        source.subscribe(handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let attempts = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let poll = || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let cancel = cancel.clone();
            async move {
                if attempt == 2 {
                    cancel.cancel();
                }
                if attempt % 2 == 0 {
                    Err(SourceError::Provider {
                        provider: "test",
                        message: "down".to_string(),
                    })
                } else {
                    Ok(WeatherStatus::default())
                }
            }
        };

        run_poll_loop(&source, Duration::from_secs(300), &cancel, poll).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    fn local_client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    async fn serve_once(response: &'static str) -> Url {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await;
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        Url::parse(&format!("http://{addr}/data")).unwrap()
    }

    #[tokio::test]
    async fn error_status_becomes_a_provider_error() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-type: text/html\r\ncontent-length: 20\r\nconnection: close\r\n\r\n<h1>maintenance</h1>",
        )
        .await;
        let err = get_text(&local_client(), &url, "test")
            .await
            .unwrap_err();
        match err {
            SourceError::Provider { provider, message } => {
                assert_eq!(provider, "test");
                assert!(message.contains("503"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_status_returns_the_body() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"cod\":200}",
        )
        .await;
        let body = get_text(&local_client(), &url, "test").await.unwrap();
        assert_eq!(body, r#"{"cod":200}"#);
    }
}
