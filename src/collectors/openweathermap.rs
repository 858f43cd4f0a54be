//! OpenWeatherMap current-weather poller.
//!
//! Every non-reserved config key is forwarded as a query parameter, so the
//! location can be given as `zip`, `q`, `id` or `lat`/`lon` along with `appid`.

use crate::collectors::{get_text, run_poll_loop};
use crate::config::SourceConfig;
use crate::error::{ConfigError, SourceError};
use crate::source::{Subscribers, WeatherSource};
use crate::status::{Datapoint, PrecipType, WeatherStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org/data/2.5/weather";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);
const SOURCE_NAME: &str = "openweathermap";

/// Keys read by the collector itself; never forwarded to the API.
const RESERVED_KEYS: &[&str] = &["poll_interval_seconds", "base_url", "units"];

#[derive(Debug, Clone)]
pub struct OpenWeatherMapConfig {
    pub url: Url,
    pub poll_interval: Duration,
}

impl OpenWeatherMapConfig {
    pub fn from_source_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let base_url = config
            .string("base_url")?
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let mut params = Vec::new();
        for (key, value) in config.iter() {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            let value = match value {
                JsonValue::Null => continue,
                JsonValue::String(value) => value.clone(),
                JsonValue::Number(value) => value.to_string(),
                JsonValue::Bool(value) => value.to_string(),
                other => {
                    return Err(ConfigError::InvalidKey {
                        key: key.clone(),
                        reason: format!("cannot be sent as a query parameter: {other}"),
                    })
                }
            };
            params.push((key.clone(), value));
        }
        params.push(("units".to_string(), "metric".to_string()));

        let url = Url::parse_with_params(&base_url, &params).map_err(|err| {
            ConfigError::InvalidKey {
                key: "base_url".to_string(),
                reason: err.to_string(),
            }
        })?;

        Ok(Self {
            url,
            poll_interval: config
                .seconds("poll_interval_seconds")?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    cod: Option<JsonValue>,
    message: Option<JsonValue>,
    dt: Option<i64>,
    main: Option<MainBlock>,
    wind: Option<WindBlock>,
    #[serde(default)]
    weather: Vec<WeatherBlock>,
    rain: Option<RainBlock>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WindBlock {
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WeatherBlock {
    id: Option<i64>,
    description: Option<String>,
    icon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RainBlock {
    #[serde(rename = "1h")]
    one_hour_mm: Option<f64>,
}

/// `cod` arrives as either a number or a string.
fn cod_is_success(cod: Option<&JsonValue>) -> bool {
    match cod {
        Some(JsonValue::Number(code)) => code.as_i64() == Some(200),
        Some(JsonValue::String(code)) => code.trim() == "200",
        _ => false,
    }
}

fn precip_from_weather_id(id: i64) -> Option<Datapoint<PrecipType>> {
    match id {
        // Thunderstorm and drizzle groups say nothing reliable about rain now.
        200..=399 | 500..=599 => Some(Datapoint::new(PrecipType::Rain, 0.0)),
        600..=699 => Some(Datapoint::new(PrecipType::Snow, 0.75)),
        _ => None,
    }
}

/// Maps one current-weather response body to a record.
pub fn parse_response(body: &str, now: DateTime<Utc>) -> Result<WeatherStatus, SourceError> {
    let response: CurrentWeather = serde_json::from_str(body)?;
    if !cod_is_success(response.cod.as_ref()) {
        let message = match response.message {
            Some(JsonValue::String(message)) => message,
            Some(other) => other.to_string(),
            None => format!("unexpected cod {:?}", response.cod),
        };
        return Err(SourceError::Provider {
            provider: SOURCE_NAME,
            message,
        });
    }

    let mut status = WeatherStatus::from_source(SOURCE_NAME, now);
    status.source_timestamp = response
        .dt
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    if let Some(main) = &response.main {
        status.temp_c = main.temp.map(|v| Datapoint::new(v, 0.5));
        status.humidity_pct = main.humidity.map(|v| Datapoint::new(v, 0.5));
        status.pressure_mb = main.pressure.map(|v| Datapoint::new(v, 0.5));
    }
    status.wind_avg_mps = response
        .wind
        .as_ref()
        .and_then(|wind| wind.speed)
        .map(|v| Datapoint::new(v, 0.75));

    if let Some(weather) = response.weather.first() {
        status.condition = weather
            .description
            .clone()
            .map(|description| Datapoint::new(description, 1.0));
        status.icon = weather.icon.clone().map(|icon| Datapoint::new(icon, 1.0));
        status.precip_type = weather.id.and_then(precip_from_weather_id);
    }

    if let Some(one_hour_mm) = response.rain.as_ref().and_then(|rain| rain.one_hour_mm) {
        status.precip_type = Some(Datapoint::new(PrecipType::Rain, 0.75));
        status.rain_rate_mm_per_min = Some(Datapoint::new(one_hour_mm / 60.0, 0.75));
    }

    Ok(status)
}

pub struct OpenWeatherMapSource {
    config: OpenWeatherMapConfig,
    http: Client,
    subscribers: Subscribers,
}

impl OpenWeatherMapSource {
    pub fn new(config: OpenWeatherMapConfig, http: Client) -> Self {
        Self {
            config,
            http,
            subscribers: Subscribers::new(),
        }
    }

    async fn poll_once(&self) -> Result<WeatherStatus, SourceError> {
        let body = get_text(&self.http, &self.config.url, SOURCE_NAME).await?;
        parse_response(&body, Utc::now())
    }
}

#[async_trait]
impl WeatherSource for OpenWeatherMapSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    async fn listen(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            "openweathermap poller started"
        );
        run_poll_loop(self, self.config.poll_interval, &cancel, || self.poll_once()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"{
        "coord": {"lon": -81.43, "lat": 41.31},
        "weather": [{"id": 501, "main": "Rain", "description": "moderate rain", "icon": "10d"}],
        "main": {"temp": 12.4, "feels_like": 11.8, "pressure": 1012, "humidity": 81},
        "wind": {"speed": 4.12, "deg": 200},
        "rain": {"1h": 1.8},
        "dt": 1700000000,
        "cod": 200
    }"#;

    #[test]
    fn maps_fields_and_qualities() {
        let now = Utc::now();
        let status = parse_response(SAMPLE, now).unwrap();

        assert_eq!(status.source.as_deref(), Some("openweathermap"));
        assert_eq!(status.host_timestamp, Some(now));
        assert_eq!(status.source_timestamp, DateTime::from_timestamp(1_700_000_000, 0));
        assert_eq!(status.temp_c, Some(Datapoint::new(12.4, 0.5)));
        assert_eq!(status.pressure_mb, Some(Datapoint::new(1012.0, 0.5)));
        assert_eq!(status.wind_avg_mps, Some(Datapoint::new(4.12, 0.75)));
        assert_eq!(
            status.condition,
            Some(Datapoint::new("moderate rain".to_string(), 1.0))
        );
        assert_eq!(status.icon, Some(Datapoint::new("10d".to_string(), 1.0)));
        // rain.1h overrides the weather-id guess.
        assert_eq!(status.precip_type, Some(Datapoint::new(PrecipType::Rain, 0.75)));
        let rate = status.rain_rate_mm_per_min.unwrap();
        assert!((rate.value.unwrap() - 0.03).abs() < 1e-9);
        assert!((rate.quality - 0.75).abs() < 1e-9);
    }

    #[test]
    fn weather_id_groups_map_to_precipitation() {
        let body = |id: i64| {
            json!({"cod": "200", "weather": [{"id": id, "description": "x", "icon": "01d"}]})
                .to_string()
        };
        let now = Utc::now();
        assert_eq!(
            parse_response(&body(211), now).unwrap().precip_type,
            Some(Datapoint::new(PrecipType::Rain, 0.0))
        );
        assert_eq!(
            parse_response(&body(601), now).unwrap().precip_type,
            Some(Datapoint::new(PrecipType::Snow, 0.75))
        );
        assert_eq!(parse_response(&body(800), now).unwrap().precip_type, None);
    }

    #[test]
    fn provider_errors_carry_the_message() {
        let body = json!({"cod": 401, "message": "Invalid API key."}).to_string();
        match parse_response(&body, Utc::now()) {
            Err(SourceError::Provider { provider, message }) => {
                assert_eq!(provider, "openweathermap");
                assert_eq!(message, "Invalid API key.");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            parse_response("<html>", Utc::now()),
            Err(SourceError::Json(_))
        ));
    }

    #[test]
    fn url_forwards_non_reserved_keys_and_forces_metric() {
        let config = OpenWeatherMapConfig::from_source_config(
            &SourceConfig::new()
                .with("appid", "secret")
                .with("zip", 44094)
                .with("units", "imperial")
                .with("poll_interval_seconds", 600),
        )
        .unwrap();

        let pairs: Vec<(String, String)> = config
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("appid".to_string(), "secret".to_string())));
        assert!(pairs.contains(&("zip".to_string(), "44094".to_string())));
        assert!(pairs.contains(&("units".to_string(), "metric".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "poll_interval_seconds"));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "units").count(), 1);
        assert_eq!(config.poll_interval, Duration::from_secs(600));
        assert!(config.url.as_str().starts_with(DEFAULT_BASE_URL));
    }
}
