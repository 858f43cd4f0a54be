//! WeatherFlow cloud REST poller: latest station observation plus the
//! current conditions block of `better_forecast`.

use crate::collectors::{get_text, run_poll_loop};
use crate::collectors::tempest_udp::rain_hail_policy;
use crate::config::SourceConfig;
use crate::error::{ConfigError, SourceError};
use crate::source::{Subscribers, WeatherSource};
use crate::status::{value, Datapoint, PrecipType, RainHailPolicy, WeatherStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://swd.weatherflow.com/swd/rest";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);
const SOURCE_NAME: &str = "tempest_cloud";
const DAYLIGHT_LUX: f64 = 100.0;

#[derive(Debug, Clone, Copy)]
enum IconCode {
    Fixed(&'static str),
    /// Family code; the `d`/`n` suffix comes from the observed light level.
    DayNight(&'static str),
}

const ICON_TABLE: &[(&str, IconCode)] = &[
    ("clear-day", IconCode::Fixed("01d")),
    ("clear-night", IconCode::Fixed("01n")),
    ("cloudy", IconCode::DayNight("03")),
    ("foggy", IconCode::DayNight("50")),
    ("partly-cloudy-day", IconCode::Fixed("02d")),
    ("partly-cloudy-night", IconCode::Fixed("02n")),
    ("possibly-rainy-day", IconCode::Fixed("09d")),
    ("possibly-rainy-night", IconCode::Fixed("09n")),
    ("possibly-sleet-day", IconCode::Fixed("09d")),
    ("possibly-sleet-night", IconCode::Fixed("09n")),
    ("possibly-snow-day", IconCode::Fixed("13d")),
    ("possibly-snow-night", IconCode::Fixed("13n")),
    ("possibly-thunderstorm-day", IconCode::Fixed("11d")),
    ("possibly-thunderstorm-night", IconCode::Fixed("11n")),
    ("rainy", IconCode::DayNight("10")),
    ("sleet", IconCode::DayNight("10")),
    ("snow", IconCode::DayNight("50")),
    ("thunderstorm", IconCode::DayNight("11")),
    // No windy icon exists; shown as partly cloudy.
    ("windy", IconCode::DayNight("02")),
];

/// Translates a WeatherFlow icon name into a `"10d"` style icon code.
pub fn icon_code(name: &str, illuminance_lux: Option<f64>) -> Option<String> {
    let (_, code) = ICON_TABLE.iter().find(|(entry, _)| *entry == name)?;
    Some(match code {
        IconCode::Fixed(code) => (*code).to_string(),
        IconCode::DayNight(family) => {
            let daylight = illuminance_lux.map_or(true, |lux| lux > DAYLIGHT_LUX);
            format!("{family}{}", if daylight { 'd' } else { 'n' })
        }
    })
}

#[derive(Debug, Clone)]
pub struct TempestCloudConfig {
    pub observation_url: Url,
    pub forecast_url: Url,
    pub poll_interval: Duration,
    pub precip_code_3: RainHailPolicy,
}

impl TempestCloudConfig {
    pub fn from_source_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let station_id = config.required_string("station_id")?;
        let token = config.required_string("token")?;
        let base_url = config
            .string("base_url")?
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = base_url.trim_end_matches('/');

        let invalid_base = |err: url::ParseError| ConfigError::InvalidKey {
            key: "base_url".to_string(),
            reason: err.to_string(),
        };
        let observation_url = Url::parse_with_params(
            &format!("{base_url}/observations/station/{station_id}"),
            &[("token", token.as_str())],
        )
        .map_err(invalid_base)?;
        let forecast_url = Url::parse_with_params(
            &format!("{base_url}/better_forecast"),
            &[("station_id", station_id.as_str()), ("token", token.as_str())],
        )
        .map_err(invalid_base)?;

        Ok(Self {
            observation_url,
            forecast_url,
            poll_interval: config
                .seconds("poll_interval_seconds")?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            precip_code_3: rain_hail_policy(config)?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResponseStatus {
    status_code: Option<i64>,
    status_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ObservationResponse {
    #[serde(default)]
    status: ResponseStatus,
    #[serde(default)]
    obs: Vec<Observation>,
}

#[derive(Debug, Deserialize)]
struct Observation {
    timestamp: Option<i64>,
    air_temperature: Option<f64>,
    relative_humidity: Option<f64>,
    barometric_pressure: Option<f64>,
    brightness: Option<f64>,
    uv: Option<f64>,
    wind_avg: Option<f64>,
    precip: Option<f64>,
    precip_accum_last_1hr: Option<f64>,
    lightning_strike_count: Option<f64>,
    lightning_strike_last_distance: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ForecastResponse {
    #[serde(default)]
    status: ResponseStatus,
    current_conditions: Option<CurrentConditions>,
}

#[derive(Debug, Deserialize)]
struct CurrentConditions {
    conditions: Option<String>,
    icon: Option<String>,
}

fn succeeded(status: &ResponseStatus) -> bool {
    status.status_code == Some(0)
}

/// Builds one record from both response bodies. Fails only when neither
/// body reports success.
pub fn build_status(
    observation: &ObservationResponse,
    forecast: &ForecastResponse,
    now: DateTime<Utc>,
    policy: RainHailPolicy,
) -> Result<WeatherStatus, SourceError> {
    let observation_ok = succeeded(&observation.status);
    let forecast_ok = succeeded(&forecast.status);
    if !observation_ok && !forecast_ok {
        let message = observation
            .status
            .status_message
            .clone()
            .or_else(|| forecast.status.status_message.clone())
            .unwrap_or_else(|| "no successful response".to_string());
        return Err(SourceError::Provider {
            provider: SOURCE_NAME,
            message,
        });
    }

    let mut status = WeatherStatus::from_source(SOURCE_NAME, now);

    if let Some(obs) = observation.obs.first().filter(|_| observation_ok) {
        status.source_timestamp = obs
            .timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        let dp = |reading: Option<f64>, quality: f64| reading.map(|v| Datapoint::new(v, quality));
        status.temp_c = dp(obs.air_temperature, 0.75);
        status.humidity_pct = dp(obs.relative_humidity, 0.75);
        status.pressure_mb = dp(obs.barometric_pressure, 0.75);
        status.illuminance_lux = dp(obs.brightness, 0.5);
        status.uv_index = dp(obs.uv, 0.5);
        status.wind_avg_mps = dp(obs.wind_avg, 0.5);
        status.precip_type = obs.precip.map(|code| {
            Datapoint::new(
                PrecipType::from_weatherflow_code(code.round() as i64, policy),
                0.5,
            )
        });
        // Hourly accumulation is smoother than the one-minute UDP reading.
        status.rain_rate_mm_per_min = dp(obs.precip_accum_last_1hr.map(|mm| mm / 60.0), 0.75);

        let strikes = obs.lightning_strike_count.map(|count| count.round() as i64);
        status.lightning_count = strikes.map(|count| Datapoint::new(count, 0.75));
        if strikes.is_some_and(|count| count > 0) {
            status.lightning_distance_km = dp(obs.lightning_strike_last_distance, 0.75);
        }
    }

    if let Some(current) = forecast.current_conditions.as_ref().filter(|_| forecast_ok) {
        // A forecast guess, more reliable than local inference only.
        status.condition = current
            .conditions
            .clone()
            .map(|conditions| Datapoint::new(conditions, 0.25));
        let lux = value(&status.illuminance_lux).copied();
        status.icon = current
            .icon
            .as_deref()
            .and_then(|name| icon_code(name, lux))
            .map(|icon| Datapoint::new(icon, 0.25));
    }

    Ok(status)
}

pub struct TempestCloudSource {
    config: TempestCloudConfig,
    http: Client,
    subscribers: Subscribers,
}

impl TempestCloudSource {
    pub fn new(config: TempestCloudConfig, http: Client) -> Self {
        Self {
            config,
            http,
            subscribers: Subscribers::new(),
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, url: &Url) -> Result<T, SourceError> {
        let body = get_text(&self.http, url, SOURCE_NAME).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn poll_once(&self) -> Result<WeatherStatus, SourceError> {
        let (observation, forecast) = tokio::try_join!(
            self.fetch::<ObservationResponse>(&self.config.observation_url),
            self.fetch::<ForecastResponse>(&self.config.forecast_url),
        )?;
        build_status(&observation, &forecast, Utc::now(), self.config.precip_code_3)
    }
}

#[async_trait]
impl WeatherSource for TempestCloudSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    async fn listen(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            "tempest cloud poller started"
        );
        run_poll_loop(self, self.config.poll_interval, &cancel, || self.poll_once()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn observation(body: serde_json::Value) -> ObservationResponse {
        serde_json::from_value(body).unwrap()
    }

    fn forecast(body: serde_json::Value) -> ForecastResponse {
        serde_json::from_value(body).unwrap()
    }

    fn ok_observation(brightness: f64, strikes: i64) -> ObservationResponse {
        observation(json!({
            "status": {"status_code": 0, "status_message": "SUCCESS"},
            "station_id": 1234,
            "obs": [{
                "timestamp": 1700000000,
                "air_temperature": 9.5,
                "relative_humidity": 88,
                "barometric_pressure": 1003.2,
                "brightness": brightness,
                "uv": 0.4,
                "wind_avg": 2.2,
                "precip": 3,
                "precip_accum_last_1hr": 3.0,
                "lightning_strike_count": strikes,
                "lightning_strike_last_distance": 17
            }]
        }))
    }

    fn ok_forecast(icon: &str) -> ForecastResponse {
        forecast(json!({
            "status": {"status_code": 0, "status_message": "SUCCESS"},
            "current_conditions": {"conditions": "Rain Likely", "icon": icon}
        }))
    }

    fn failed_forecast() -> ForecastResponse {
        forecast(json!({"status": {"status_code": 401, "status_message": "UNAUTHORIZED"}}))
    }

    #[test]
    fn icon_table_entries() {
        assert_eq!(icon_code("clear-night", Some(50_000.0)).as_deref(), Some("01n"));
        assert_eq!(icon_code("rainy", None).as_deref(), Some("10d"));
        assert_eq!(icon_code("rainy", Some(100.0)).as_deref(), Some("10n"));
        assert_eq!(icon_code("snow", Some(101.0)).as_deref(), Some("50d"));
        assert_eq!(icon_code("windy", Some(5.0)).as_deref(), Some("02n"));
        assert_eq!(icon_code("possibly-sleet-day", None).as_deref(), Some("09d"));
        assert_eq!(icon_code("tornado", None), None);
    }

    #[test]
    fn combines_observation_and_forecast() {
        let now = Utc::now();
        let status = build_status(
            &ok_observation(20.0, 2),
            &ok_forecast("rainy"),
            now,
            RainHailPolicy::Hail,
        )
        .unwrap();

        assert_eq!(status.source.as_deref(), Some("tempest_cloud"));
        assert_eq!(status.source_timestamp, DateTime::from_timestamp(1_700_000_000, 0));
        assert_eq!(status.temp_c, Some(Datapoint::new(9.5, 0.75)));
        assert_eq!(status.illuminance_lux, Some(Datapoint::new(20.0, 0.5)));
        assert_eq!(status.precip_type, Some(Datapoint::new(PrecipType::Hail, 0.5)));
        assert_eq!(status.rain_rate_mm_per_min, Some(Datapoint::new(0.05, 0.75)));
        assert_eq!(status.lightning_count, Some(Datapoint::new(2, 0.75)));
        assert_eq!(status.lightning_distance_km, Some(Datapoint::new(17.0, 0.75)));
        assert_eq!(
            status.condition,
            Some(Datapoint::new("Rain Likely".to_string(), 0.25))
        );
        // 20 lux is night for the icon table.
        assert_eq!(status.icon, Some(Datapoint::new("10n".to_string(), 0.25)));
    }

    #[test]
    fn lightning_distance_needs_strikes() {
        let status = build_status(
            &ok_observation(20_000.0, 0),
            &ok_forecast("cloudy"),
            Utc::now(),
            RainHailPolicy::Rain,
        )
        .unwrap();
        assert_eq!(status.lightning_count, Some(Datapoint::new(0, 0.75)));
        assert!(status.lightning_distance_km.is_none());
        assert_eq!(status.precip_type, Some(Datapoint::new(PrecipType::Rain, 0.5)));
    }

    #[test]
    fn one_failed_body_still_yields_a_record() {
        let status = build_status(
            &ok_observation(20_000.0, 0),
            &failed_forecast(),
            Utc::now(),
            RainHailPolicy::Hail,
        )
        .unwrap();
        assert!(status.temp_c.is_some());
        assert!(status.condition.is_none());

        let failed_obs = observation(json!({"status": {"status_code": 404}}));
        let status =
            build_status(&failed_obs, &ok_forecast("foggy"), Utc::now(), RainHailPolicy::Hail)
                .unwrap();
        assert!(status.temp_c.is_none());
        assert_eq!(value(&status.icon).map(String::as_str), Some("50d"));
    }

    #[test]
    fn both_bodies_failing_is_a_provider_error() {
        let failed_obs = observation(json!({"status": {"status_code": 404, "status_message": "NOT FOUND"}}));
        match build_status(&failed_obs, &failed_forecast(), Utc::now(), RainHailPolicy::Hail) {
            Err(SourceError::Provider { message, .. }) => assert_eq!(message, "NOT FOUND"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn urls_carry_station_and_token() {
        let config = TempestCloudConfig::from_source_config(
            &SourceConfig::new()
                .with("station_id", 1234)
                .with("token", "abc"),
        )
        .unwrap();
        assert_eq!(
            config.observation_url.as_str(),
            "https://swd.weatherflow.com/swd/rest/observations/station/1234?token=abc"
        );
        assert_eq!(
            config.forecast_url.as_str(),
            "https://swd.weatherflow.com/swd/rest/better_forecast?station_id=1234&token=abc"
        );
        assert!(matches!(
            TempestCloudConfig::from_source_config(&SourceConfig::new().with("station_id", 1)),
            Err(ConfigError::MissingKey(_))
        ));
    }
}
