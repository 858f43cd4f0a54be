use crate::config::SourceConfig;
use crate::error::ConfigError;
use crate::status::{WeatherStatus, FIELDS};
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const AGGREGATE_SOURCE: &str = "aggregate";
const DEFAULT_DECAY_RATE: f64 = 0.005;

#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    /// Quality lost per second of age.
    pub decay_rate: f64,
    /// Candidates older than this are ignored.
    pub max_age: Option<Duration>,
    /// Stop the aggregate when any child fails.
    pub fail_fast: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            decay_rate: DEFAULT_DECAY_RATE,
            max_age: None,
            fail_fast: false,
        }
    }
}

impl FusionConfig {
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let decay_rate = config.f64("decay_rate")?.unwrap_or(DEFAULT_DECAY_RATE);
        if !decay_rate.is_finite() || decay_rate < 0.0 {
            return Err(ConfigError::InvalidKey {
                key: "decay_rate".to_string(),
                reason: format!("{decay_rate} must be a non-negative number"),
            });
        }
        Ok(Self {
            decay_rate,
            max_age: config.seconds("max_age_seconds")?,
            fail_fast: config.bool("fail_fast")?.unwrap_or(false),
        })
    }
}

/// Seconds since the record was observed. Records without timestamps and
/// records from the future count as fresh.
fn age_seconds(record: &WeatherStatus, now: DateTime<Utc>) -> f64 {
    record
        .age_reference()
        .map(|observed| (now - observed).num_milliseconds() as f64 / 1000.0)
        .map_or(0.0, |age| age.max(0.0))
}

/// Picks, field by field, the datapoint with the highest age-adjusted
/// quality. `records` must be in registration order; ties go to the earlier
/// record. The chosen datapoint keeps its raw quality.
pub fn fuse<'a, I>(records: I, now: DateTime<Utc>, config: &FusionConfig) -> WeatherStatus
where
    I: IntoIterator<Item = &'a WeatherStatus>,
{
    let candidates: Vec<(&WeatherStatus, f64)> = records
        .into_iter()
        .map(|record| (record, age_seconds(record, now)))
        .filter(|(_, age)| {
            config
                .max_age
                .map_or(true, |max_age| *age <= max_age.as_secs_f64())
        })
        .collect();

    let mut fused = WeatherStatus::from_source(AGGREGATE_SOURCE, now);
    for field in FIELDS {
        let mut best: Option<(&WeatherStatus, f64)> = None;
        for &(record, age) in &candidates {
            let Some(quality) = (field.quality)(record) else {
                continue;
            };
            let adjusted = quality - age * config.decay_rate;
            if best.map_or(true, |(_, best_adjusted)| adjusted > best_adjusted) {
                best = Some((record, adjusted));
            }
        }
        if let Some((record, _)) = best {
            (field.copy)(record, &mut fused);
        }
    }
    fused
}
