use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single reading paired with a trust score.
///
/// `quality` is source-relative: 1.0 is a direct sensor reading, 0.5-0.75 a
/// good but indirect reading, ~0.25 a forecast and anything <= 0 a heuristic
/// guess. A `None` value means "no reading" and is never treated as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint<T> {
    pub value: Option<T>,
    pub quality: f64,
}

impl<T> Datapoint<T> {
    pub fn new(value: T, quality: f64) -> Self {
        Self {
            value: Some(value),
            quality,
        }
    }

    pub fn missing(quality: f64) -> Self {
        Self {
            value: None,
            quality,
        }
    }

    pub fn from_option(value: Option<T>, quality: f64) -> Self {
        Self { value, quality }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

/// Value of an optional datapoint field, `None` when the field is absent or
/// carries no value.
pub fn value<T>(field: &Option<Datapoint<T>>) -> Option<&T> {
    field.as_ref().and_then(Datapoint::value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecipType {
    None,
    Rain,
    Hail,
    Snow,
}

/// How the WeatherFlow precipitation code 3 ("rain + hail, experimental")
/// is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RainHailPolicy {
    #[default]
    Hail,
    Rain,
}

impl PrecipType {
    /// Decodes a WeatherFlow precipitation code (0 none, 1 rain, 2 hail,
    /// 3 rain + hail).
    pub fn from_weatherflow_code(code: i64, policy: RainHailPolicy) -> Self {
        match code {
            1 => PrecipType::Rain,
            2 => PrecipType::Hail,
            3 => match policy {
                RainHailPolicy::Hail => PrecipType::Hail,
                RainHailPolicy::Rain => PrecipType::Rain,
            },
            _ => PrecipType::None,
        }
    }
}

/// One observation from one source. The schema is closed: every datapoint
/// field is listed in [`FIELDS`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherStatus {
    pub source: Option<String>,
    pub host_timestamp: Option<DateTime<Utc>>,
    pub source_timestamp: Option<DateTime<Utc>>,

    pub temp_c: Option<Datapoint<f64>>,
    pub humidity_pct: Option<Datapoint<f64>>,
    pub pressure_mb: Option<Datapoint<f64>>,

    pub illuminance_lux: Option<Datapoint<f64>>,
    pub uv_index: Option<Datapoint<f64>>,
    pub wind_avg_mps: Option<Datapoint<f64>>,

    pub precip_type: Option<Datapoint<PrecipType>>,
    pub rain_rate_mm_per_min: Option<Datapoint<f64>>,
    pub lightning_count: Option<Datapoint<i64>>,
    pub lightning_distance_km: Option<Datapoint<f64>>,

    pub condition: Option<Datapoint<String>>,
    pub icon: Option<Datapoint<String>>,
}

impl WeatherStatus {
    pub fn from_source(source: impl Into<String>, host_timestamp: DateTime<Utc>) -> Self {
        Self {
            source: Some(source.into()),
            host_timestamp: Some(host_timestamp),
            ..Self::default()
        }
    }

    /// Timestamp the observation's age is measured from.
    pub fn age_reference(&self) -> Option<DateTime<Utc>> {
        self.source_timestamp.or(self.host_timestamp)
    }

    /// Number of datapoint fields currently holding a value.
    pub fn populated_fields(&self) -> usize {
        FIELDS
            .iter()
            .filter(|field| (field.quality)(self).is_some())
            .count()
    }
}

/// Static accessor pair for one datapoint-typed field of [`WeatherStatus`].
pub struct FieldDescriptor {
    pub name: &'static str,
    /// Quality of the field, `Some` only when the field holds a value.
    pub quality: fn(&WeatherStatus) -> Option<f64>,
    /// Copies the field (value and raw quality) from one record to another.
    pub copy: fn(&WeatherStatus, &mut WeatherStatus),
}

impl std::fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .finish()
    }
}

macro_rules! datapoint_fields {
    ($($field:ident),* $(,)?) => {
        mod accessors {
            $(
                pub mod $field {
                    use crate::status::WeatherStatus;

                    pub fn quality(status: &WeatherStatus) -> Option<f64> {
                        status
                            .$field
                            .as_ref()
                            .filter(|dp| dp.value.is_some())
                            .map(|dp| dp.quality)
                    }

                    pub fn copy(from: &WeatherStatus, to: &mut WeatherStatus) {
                        to.$field = from.$field.clone();
                    }
                }
            )*
        }

        pub static FIELDS: &[FieldDescriptor] = &[
            $(FieldDescriptor {
                name: stringify!($field),
                quality: accessors::$field::quality,
                copy: accessors::$field::copy,
            },)*
        ];
    };
}

datapoint_fields!(
    temp_c,
    humidity_pct,
    pressure_mb,
    illuminance_lux,
    uv_index,
    wind_avg_mps,
    precip_type,
    rain_rate_mm_per_min,
    lightning_count,
    lightning_distance_km,
    condition,
    icon,
);
