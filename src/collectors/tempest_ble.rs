//! WeatherFlow Tempest Bluetooth LE listener.
//!
//! The station notifies fixed-layout little-endian packets on one
//! characteristic. Byte 0 selects the layout; each decoded packet updates the
//! running record, which is then published in full.

use crate::config::SourceConfig;
use crate::error::{ConfigError, DecodeError, SourceError};
use crate::source::{backoff, until_cancelled, Subscribers, WeatherSource};
use crate::status::{Datapoint, WeatherStatus};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6a223200_4f03_41b0_ce48_7b3880d357d6);
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6a223201_4f03_41b0_ce48_7b3880d357d6);

const SOURCE_NAME: &str = "tempest_ble";
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const SCAN_TIMEOUT: Duration = Duration::from_secs(30);
const SCAN_POLL: Duration = Duration::from_secs(1);

pub const STATUS_PACKET: u8 = 0x1A;
pub const SKY_PACKET: u8 = 0x52;
pub const WIND_PACKET: u8 = 0x53;
pub const AIR_PACKET: u8 = 0x54;

const STATUS_PACKET_LEN: usize = 20;
const SKY_PACKET_LEN: usize = 19;
const WIND_PACKET_LEN: usize = 18;
const AIR_PACKET_LEN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusPacket {
    pub battery_volts: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPacket {
    pub illuminance_lux: u32,
    pub uv_index: f64,
    pub solar_radiation_wm2: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindPacket {
    pub avg_mps: f64,
    pub direction_deg: i16,
    pub lull_mps: f64,
    pub gust_mps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirPacket {
    pub temp_c: f64,
    pub humidity_pct: f64,
    pub lightning_count: u8,
    pub lightning_distance_km: u8,
    pub pressure_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlePacket {
    Status(StatusPacket),
    Sky(SkyPacket),
    Wind(WindPacket),
    Air(AirPacket),
}

fn check_layout(buf: &[u8], expected: u8, needed: usize) -> Result<(), DecodeError> {
    let actual = *buf.first().ok_or(DecodeError::Empty)?;
    if actual != expected {
        return Err(DecodeError::UnexpectedType { expected, actual });
    }
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            packet_type: expected,
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn hundredths_i16(buf: &[u8], at: usize) -> f64 {
    f64::from(i16::from_le_bytes([buf[at], buf[at + 1]])) / 100.0
}

pub fn decode_status(buf: &[u8]) -> Result<StatusPacket, DecodeError> {
    check_layout(buf, STATUS_PACKET, STATUS_PACKET_LEN)?;
    let millivolts = u16::from_le_bytes([buf[17], buf[18]]);
    Ok(StatusPacket {
        battery_volts: f64::from(millivolts) / 1000.0,
    })
}

pub fn decode_sky(buf: &[u8]) -> Result<SkyPacket, DecodeError> {
    check_layout(buf, SKY_PACKET, SKY_PACKET_LEN)?;
    Ok(SkyPacket {
        illuminance_lux: u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]),
        uv_index: f64::from(u16::from_le_bytes([buf[11], buf[12]])) / 100.0,
        solar_radiation_wm2: u16::from_le_bytes([buf[17], buf[18]]),
    })
}

pub fn decode_wind(buf: &[u8]) -> Result<WindPacket, DecodeError> {
    check_layout(buf, WIND_PACKET, WIND_PACKET_LEN)?;
    Ok(WindPacket {
        avg_mps: hundredths_i16(buf, 7),
        direction_deg: i16::from_le_bytes([buf[9], buf[10]]),
        lull_mps: hundredths_i16(buf, 11),
        gust_mps: hundredths_i16(buf, 13),
    })
}

pub fn decode_air(buf: &[u8]) -> Result<AirPacket, DecodeError> {
    check_layout(buf, AIR_PACKET, AIR_PACKET_LEN)?;
    let pressure = u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]);
    Ok(AirPacket {
        temp_c: hundredths_i16(buf, 7),
        humidity_pct: hundredths_i16(buf, 9),
        lightning_count: buf[11],
        lightning_distance_km: buf[13],
        pressure_mb: f64::from(pressure) / 100.0,
    })
}

/// Dispatches on the discriminator byte.
pub fn decode_packet(buf: &[u8]) -> Result<BlePacket, DecodeError> {
    match *buf.first().ok_or(DecodeError::Empty)? {
        STATUS_PACKET => decode_status(buf).map(BlePacket::Status),
        SKY_PACKET => decode_sky(buf).map(BlePacket::Sky),
        WIND_PACKET => decode_wind(buf).map(BlePacket::Wind),
        AIR_PACKET => decode_air(buf).map(BlePacket::Air),
        other => Err(DecodeError::UnknownType(other)),
    }
}

fn apply_packet(record: &mut WeatherStatus, packet: &BlePacket) {
    match packet {
        BlePacket::Status(_) => {}
        BlePacket::Sky(sky) => {
            record.illuminance_lux = Some(Datapoint::new(f64::from(sky.illuminance_lux), 1.0));
            record.uv_index = Some(Datapoint::new(sky.uv_index, 1.0));
        }
        BlePacket::Wind(wind) => {
            record.wind_avg_mps = Some(Datapoint::new(wind.avg_mps, 1.0));
        }
        BlePacket::Air(air) => {
            record.temp_c = Some(Datapoint::new(air.temp_c, 1.0));
            record.humidity_pct = Some(Datapoint::new(air.humidity_pct, 1.0));
            record.pressure_mb = Some(Datapoint::new(air.pressure_mb, 1.0));
            record.lightning_count = Some(Datapoint::new(i64::from(air.lightning_count), 1.0));
            record.lightning_distance_km =
                Some(Datapoint::new(f64::from(air.lightning_distance_km), 1.0));
        }
    }
}

#[derive(Debug, Clone)]
pub struct TempestBleConfig {
    pub station_mac: BDAddr,
    pub reconnect_delay: Duration,
}

impl TempestBleConfig {
    pub fn from_source_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let raw_mac = config.required_string("station_mac")?;
        let station_mac = raw_mac
            .parse::<BDAddr>()
            .map_err(|err| ConfigError::InvalidKey {
                key: "station_mac".to_string(),
                reason: format!("{raw_mac}: {err}"),
            })?;
        Ok(Self {
            station_mac,
            reconnect_delay: config
                .seconds("reconnect_delay_seconds")?
                .unwrap_or(DEFAULT_RECONNECT_DELAY),
        })
    }
}

enum SessionEnd {
    Cancelled,
    StreamClosed,
}

pub struct TempestBleSource {
    config: TempestBleConfig,
    subscribers: Subscribers,
    record: Mutex<WeatherStatus>,
}

impl TempestBleSource {
    pub fn new(config: TempestBleConfig) -> Self {
        Self {
            config,
            subscribers: Subscribers::new(),
            record: Mutex::new(WeatherStatus::default()),
        }
    }

    pub fn snapshot(&self) -> WeatherStatus {
        self.lock_record().clone()
    }

    /// Decodes one notification payload and publishes the running record.
    /// Returns `false` when the payload did not decode.
    pub fn handle_notification(&self, data: &[u8], now: DateTime<Utc>) -> bool {
        let packet = match decode_packet(data) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(error = %err, len = data.len(), "skipping tempest BLE packet");
                return false;
            }
        };
        let status = {
            let mut record = self.lock_record();
            apply_packet(&mut record, &packet);
            record.source = Some(SOURCE_NAME.to_string());
            record.host_timestamp = Some(now);
            record.source_timestamp = Some(now);
            record.clone()
        };
        self.publish(status);
        true
    }

    fn lock_record(&self) -> MutexGuard<'_, WeatherStatus> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_session(&self, cancel: &CancellationToken) -> Result<SessionEnd, SourceError> {
        let adapter = first_adapter().await?;
        let Some(peripheral) = self.find_station(&adapter, cancel).await? else {
            return Ok(SessionEnd::Cancelled);
        };

        let Some(connected) = until_cancelled(cancel, peripheral.connect()).await else {
            disconnect(&peripheral).await;
            return Ok(SessionEnd::Cancelled);
        };
        connected?;
        tracing::info!(station = %self.config.station_mac, "tempest BLE connected");

        let result = self.consume(&peripheral, cancel).await;
        disconnect(&peripheral).await;
        result
    }

    async fn find_station(
        &self,
        adapter: &Adapter,
        cancel: &CancellationToken,
    ) -> Result<Option<Peripheral>, SourceError> {
        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await?;
        let deadline = tokio::time::Instant::now() + SCAN_TIMEOUT;
        let found = loop {
            let peripherals = adapter.peripherals().await?;
            if let Some(peripheral) = peripherals
                .into_iter()
                .find(|peripheral| peripheral.address() == self.config.station_mac)
            {
                break Some(peripheral);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            if !backoff(cancel, SCAN_POLL).await {
                if let Err(err) = adapter.stop_scan().await {
                    tracing::debug!(error = %err, "failed to stop BLE scan");
                }
                return Ok(None);
            }
        };
        if let Err(err) = adapter.stop_scan().await {
            tracing::debug!(error = %err, "failed to stop BLE scan");
        }
        found
            .map(Some)
            .ok_or_else(|| SourceError::StationNotFound(self.config.station_mac.to_string()))
    }

    async fn consume(
        &self,
        peripheral: &Peripheral,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, SourceError> {
        let opened = until_cancelled(cancel, open_notifications(peripheral)).await;
        let Some(notifications) = opened else {
            return Ok(SessionEnd::Cancelled);
        };
        let mut notifications = notifications?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                next = notifications.next() => match next {
                    Some(notification) if notification.uuid == NOTIFY_CHARACTERISTIC_UUID => {
                        self.handle_notification(&notification.value, Utc::now());
                    }
                    Some(_) => {}
                    None => return Ok(SessionEnd::StreamClosed),
                },
            }
        }
    }
}

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

async fn open_notifications(peripheral: &Peripheral) -> Result<Notifications, SourceError> {
    peripheral.discover_services().await?;
    let characteristic = peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == NOTIFY_CHARACTERISTIC_UUID)
        .ok_or_else(|| SourceError::Provider {
            provider: SOURCE_NAME,
            message: format!("characteristic {NOTIFY_CHARACTERISTIC_UUID} not found"),
        })?;
    peripheral.subscribe(&characteristic).await?;
    Ok(peripheral.notifications().await?)
}

async fn first_adapter() -> Result<Adapter, SourceError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(SourceError::NoAdapter)
}

async fn disconnect(peripheral: &Peripheral) {
    match peripheral.is_connected().await {
        Ok(false) => {}
        _ => {
            if let Err(err) = peripheral.disconnect().await {
                tracing::debug!(error = %err, "tempest BLE disconnect failed");
            }
        }
    }
}

#[async_trait]
impl WeatherSource for TempestBleSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    async fn listen(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        loop {
            match self.run_session(&cancel).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::StreamClosed) => {
                    tracing::info!(station = %self.config.station_mac, "tempest BLE disconnected");
                }
                Err(err) => {
                    tracing::warn!(
                        station = %self.config.station_mac,
                        error = %err,
                        retry_in_secs = self.config.reconnect_delay.as_secs_f64(),
                        "tempest BLE session failed"
                    );
                }
            }
            if !backoff(&cancel, self.config.reconnect_delay).await {
                break;
            }
        }
        tracing::info!(station = %self.config.station_mac, "tempest BLE listener stopped");
        Ok(())
    }
}
