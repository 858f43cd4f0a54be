//! WeatherFlow Tempest local UDP broadcast listener.
//!
//! The hub broadcasts JSON datagrams on port 50222. Three observation types
//! carry overlapping fields: `obs_st` (everything), `obs_air` and `obs_sky`.
//! Readings are merged into one running record; a fresh `obs_st` masks the
//! narrow types until it ages past the freshness window.

use crate::collectors::conditions::update_condition_and_icon;
use crate::config::SourceConfig;
use crate::error::{ConfigError, SourceError};
use crate::source::{backoff, Subscribers, WeatherSource};
use crate::status::{Datapoint, PrecipType, RainHailPolicy, WeatherStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_UDP_PORT: u16 = 50222;
const DEFAULT_OBS_ST_MAX_AGE: Duration = Duration::from_secs(120);
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const MAX_DATAGRAM_LEN: usize = 4096;

const OBS_ST: &str = "obs_st";
const OBS_AIR: &str = "obs_air";
const OBS_SKY: &str = "obs_sky";

/// Offsets of the air fields inside `obs[0]`.
#[derive(Debug, Clone, Copy)]
struct AirIndex {
    time: usize,
    pressure: usize,
    temperature: usize,
    humidity: usize,
    lightning_count: usize,
    lightning_distance: usize,
}

/// Offsets of the sky fields inside `obs[0]`.
#[derive(Debug, Clone, Copy)]
struct SkyIndex {
    time: usize,
    illuminance: usize,
    uv: usize,
    rain_amount: usize,
    wind_avg: usize,
    precip_type: usize,
}

// obs_air: time, pressure, temperature, humidity, strike count, strike
// distance, battery, report interval.
const OBS_AIR_INDEX: AirIndex = AirIndex {
    time: 0,
    pressure: 1,
    temperature: 2,
    humidity: 3,
    lightning_count: 4,
    lightning_distance: 5,
};

// obs_sky: time, illuminance, uv, rain amount, wind lull, wind avg, wind gust,
// wind direction, battery, report interval, solar radiation, day rain
// accumulation, precip type, wind sample interval.
const OBS_SKY_INDEX: SkyIndex = SkyIndex {
    time: 0,
    illuminance: 1,
    uv: 2,
    rain_amount: 3,
    wind_avg: 5,
    precip_type: 12,
};

// obs_st: time, wind lull, wind avg, wind gust, wind direction, wind sample
// interval, pressure, temperature, humidity, illuminance, uv, solar radiation,
// rain amount, precip type, strike distance, strike count, battery, report
// interval.
const OBS_ST_AIR_INDEX: AirIndex = AirIndex {
    time: 0,
    pressure: 6,
    temperature: 7,
    humidity: 8,
    lightning_count: 15,
    lightning_distance: 14,
};

const OBS_ST_SKY_INDEX: SkyIndex = SkyIndex {
    time: 0,
    illuminance: 9,
    uv: 10,
    rain_amount: 12,
    wind_avg: 2,
    precip_type: 13,
};

#[derive(Debug, Clone)]
pub struct TempestUdpConfig {
    pub port: u16,
    pub obs_st_max_age: Duration,
    pub allowed_hub_ips: Option<BTreeSet<IpAddr>>,
    pub allowed_hub_sns: Option<BTreeSet<String>>,
    pub allowed_station_sns: Option<BTreeSet<String>>,
    pub precip_code_3: RainHailPolicy,
}

impl Default for TempestUdpConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_UDP_PORT,
            obs_st_max_age: DEFAULT_OBS_ST_MAX_AGE,
            allowed_hub_ips: None,
            allowed_hub_sns: None,
            allowed_station_sns: None,
            precip_code_3: RainHailPolicy::default(),
        }
    }
}

impl TempestUdpConfig {
    pub fn from_source_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let port = match config.u64("port")? {
            Some(port) => u16::try_from(port).map_err(|_| ConfigError::InvalidKey {
                key: "port".to_string(),
                reason: format!("{port} is not a valid UDP port"),
            })?,
            None => defaults.port,
        };
        let allowed_hub_ips = config
            .string_set("allowed_hub_ips")?
            .map(|ips| {
                ips.iter()
                    .map(|ip| {
                        ip.parse::<IpAddr>().map_err(|err| ConfigError::InvalidKey {
                            key: "allowed_hub_ips".to_string(),
                            reason: format!("{ip}: {err}"),
                        })
                    })
                    .collect::<Result<BTreeSet<_>, _>>()
            })
            .transpose()?;

        Ok(Self {
            port,
            obs_st_max_age: config
                .seconds("obs_st_max_age_seconds")?
                .unwrap_or(defaults.obs_st_max_age),
            allowed_hub_ips,
            allowed_hub_sns: config.string_set("allowed_hub_sns")?,
            allowed_station_sns: config.string_set("allowed_station_sns")?,
            precip_code_3: rain_hail_policy(config)?,
        })
    }
}

/// Reads the `precip_code_3` policy key shared by the WeatherFlow sources.
pub(crate) fn rain_hail_policy(config: &SourceConfig) -> Result<RainHailPolicy, ConfigError> {
    match config.string("precip_code_3")?.as_deref() {
        None => Ok(RainHailPolicy::default()),
        Some(raw) if raw.eq_ignore_ascii_case("hail") => Ok(RainHailPolicy::Hail),
        Some(raw) if raw.eq_ignore_ascii_case("rain") => Ok(RainHailPolicy::Rain),
        Some(raw) => Err(ConfigError::InvalidKey {
            key: "precip_code_3".to_string(),
            reason: format!("expected \"hail\" or \"rain\", got {raw:?}"),
        }),
    }
}

/// One decoded datagram. Only the fields this collector reads are kept.
#[derive(Debug, Clone, Deserialize)]
pub struct TempestMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub hub_sn: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub obs: Option<Vec<Vec<JsonValue>>>,
}

pub struct TempestUdpSource {
    config: TempestUdpConfig,
    subscribers: Subscribers,
    record: Mutex<WeatherStatus>,
}

impl TempestUdpSource {
    pub fn new(config: TempestUdpConfig) -> Self {
        Self {
            config,
            subscribers: Subscribers::new(),
            record: Mutex::new(WeatherStatus::default()),
        }
    }

    /// Copy of the running record.
    pub fn snapshot(&self) -> WeatherStatus {
        self.lock_record().clone()
    }

    /// Decodes, filters and applies one datagram. Returns `true` when a
    /// record was published.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr, now: DateTime<Utc>) -> bool {
        let msg: TempestMessage = match serde_json::from_slice(data) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::trace!(from = %from, error = %err, "dropping malformed datagram");
                return false;
            }
        };
        if !self.is_allowed(&msg, from) {
            return false;
        }
        if !self.apply_message(&msg, now) {
            return false;
        }
        self.publish(self.snapshot());
        true
    }

    /// Applies `msg` to the running record. Returns `true` when any field
    /// was written.
    pub fn apply_message(&self, msg: &TempestMessage, now: DateTime<Utc>) -> bool {
        apply_to_record(&mut self.lock_record(), msg, now, &self.config)
    }

    fn is_allowed(&self, msg: &TempestMessage, from: SocketAddr) -> bool {
        if let Some(allowed) = &self.config.allowed_hub_ips {
            if !allowed.contains(&from.ip()) {
                tracing::debug!(from = %from, "datagram from IP not in allowed list");
                return false;
            }
        }
        if let Some(allowed) = &self.config.allowed_hub_sns {
            if !msg.hub_sn.as_ref().is_some_and(|sn| allowed.contains(sn)) {
                tracing::debug!(hub_sn = ?msg.hub_sn, "datagram from hub not in allowed list");
                return false;
            }
        }
        if let Some(allowed) = &self.config.allowed_station_sns {
            if !msg
                .serial_number
                .as_ref()
                .is_some_and(|sn| allowed.contains(sn))
            {
                tracing::debug!(serial_number = ?msg.serial_number, "datagram from station not in allowed list");
                return false;
            }
        }
        true
    }

    fn lock_record(&self) -> MutexGuard<'_, WeatherStatus> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WeatherSource for TempestUdpSource {
    fn name(&self) -> &str {
        "tempest_udp"
    }

    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    async fn listen(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| SourceError::Bind { addr, source })?;
        tracing::info!(bind = %addr, "tempest UDP listener bound");

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.handle_datagram(&buf[..len], from, Utc::now());
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "tempest UDP receive failed");
                        if !backoff(&cancel, RECV_ERROR_BACKOFF).await {
                            break;
                        }
                    }
                },
            }
        }

        drop(socket);
        tracing::info!(bind = %addr, "tempest UDP listener released");
        Ok(())
    }
}

/// Merges `msg` into `record`. Returns `true` when fields were written.
fn apply_to_record(
    record: &mut WeatherStatus,
    msg: &TempestMessage,
    now: DateTime<Utc>,
    config: &TempestUdpConfig,
) -> bool {
    let Some(obs) = msg.obs.as_ref().and_then(|obs| obs.first()) else {
        return false;
    };
    let policy = config.precip_code_3;

    match msg.kind.as_deref() {
        Some(OBS_ST) => {
            apply_air(record, obs, OBS_ST_AIR_INDEX, now);
            apply_sky(record, obs, OBS_ST_SKY_INDEX, now, policy);
            record.source = Some(OBS_ST.to_string());
        }
        Some(OBS_AIR) => {
            if combined_is_fresh(record, now, config.obs_st_max_age) {
                return false;
            }
            apply_air(record, obs, OBS_AIR_INDEX, now);
            record.source = Some(OBS_AIR.to_string());
        }
        Some(OBS_SKY) => {
            if combined_is_fresh(record, now, config.obs_st_max_age) {
                return false;
            }
            apply_sky(record, obs, OBS_SKY_INDEX, now, policy);
            record.source = Some(OBS_SKY.to_string());
        }
        _ => return false,
    }

    update_condition_and_icon(record);
    true
}

/// True while the running record came from `obs_st` within `max_age`.
fn combined_is_fresh(record: &WeatherStatus, now: DateTime<Utc>, max_age: Duration) -> bool {
    if record.source.as_deref() != Some(OBS_ST) {
        return false;
    }
    let Some(received) = record.host_timestamp else {
        return false;
    };
    // A timestamp in the future counts as age zero.
    (now - received).to_std().map_or(true, |age| age <= max_age)
}

fn apply_air(record: &mut WeatherStatus, obs: &[JsonValue], idx: AirIndex, now: DateTime<Utc>) {
    record.host_timestamp = Some(now);
    record.source_timestamp = obs_time(obs, idx.time);
    record.temp_c = Some(Datapoint::from_option(obs_f64(obs, idx.temperature), 1.0));
    record.humidity_pct = Some(Datapoint::from_option(obs_f64(obs, idx.humidity), 1.0));
    record.pressure_mb = Some(Datapoint::from_option(obs_f64(obs, idx.pressure), 1.0));
    record.lightning_count = Some(Datapoint::from_option(obs_i64(obs, idx.lightning_count), 1.0));
    record.lightning_distance_km = Some(Datapoint::from_option(
        obs_f64(obs, idx.lightning_distance),
        1.0,
    ));
}

fn apply_sky(
    record: &mut WeatherStatus,
    obs: &[JsonValue],
    idx: SkyIndex,
    now: DateTime<Utc>,
    policy: RainHailPolicy,
) {
    record.host_timestamp = Some(now);
    record.source_timestamp = obs_time(obs, idx.time);
    record.illuminance_lux = Some(Datapoint::from_option(obs_f64(obs, idx.illuminance), 1.0));
    record.uv_index = Some(Datapoint::from_option(obs_f64(obs, idx.uv), 1.0));
    record.wind_avg_mps = Some(Datapoint::from_option(obs_f64(obs, idx.wind_avg), 1.0));
    // The one-minute rain amount is noisy.
    record.rain_rate_mm_per_min = Some(Datapoint::from_option(obs_f64(obs, idx.rain_amount), 0.5));
    record.precip_type = Some(Datapoint::from_option(
        obs_i64(obs, idx.precip_type).map(|code| PrecipType::from_weatherflow_code(code, policy)),
        1.0,
    ));
}

fn obs_f64(obs: &[JsonValue], idx: usize) -> Option<f64> {
    obs.get(idx)?.as_f64()
}

fn obs_i64(obs: &[JsonValue], idx: usize) -> Option<i64> {
    let value = obs.get(idx)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|v| v.round() as i64))
}

fn obs_time(obs: &[JsonValue], idx: usize) -> Option<DateTime<Utc>> {
    obs_i64(obs, idx).and_then(|secs| DateTime::from_timestamp(secs, 0))
}
