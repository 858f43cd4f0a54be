//! Heuristic condition and icon inference for local station readings.
//!
//! These are rough guesses from a handful of sensors; each rule carries a
//! fixed quality so any real forecast or observed condition wins in fusion.

use crate::status::{value, Datapoint, PrecipType, WeatherStatus};

const LIGHTNING_NEARBY_KM: f64 = 12.0;
const SHOWER_RAIN_MM_PER_MIN: f64 = 0.5;
const MIST_HUMIDITY_PCT: f64 = 95.0;
const MIST_MAX_LUX: f64 = 20_000.0;
const CLEAR_SKY_LUX: f64 = 100_000.0;
const SCATTERED_CLOUDS_LUX: f64 = 5_000.0;
const CLOUDY_LUX: f64 = 500.0;
const DAYLIGHT_LUX: f64 = 5_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    ClearSky,
    ScatteredClouds,
    Cloudy,
    ShowerRain,
    Rain,
    Lightning,
    Snow,
    Mist,
    Unknown,
}

impl Condition {
    pub fn as_str(self) -> &'static str {
        match self {
            Condition::ClearSky => "clear sky",
            Condition::ScatteredClouds => "scattered clouds",
            Condition::Cloudy => "cloudy",
            Condition::ShowerRain => "shower rain",
            Condition::Rain => "rain",
            Condition::Lightning => "lightning",
            Condition::Snow => "snow",
            Condition::Mist => "mist",
            Condition::Unknown => "unknown",
        }
    }

    /// Two-digit icon family, `None` for conditions without an icon.
    pub fn icon_family(self) -> Option<&'static str> {
        match self {
            Condition::ClearSky => Some("01"),
            Condition::ScatteredClouds => Some("02"),
            Condition::Cloudy => Some("03"),
            Condition::ShowerRain => Some("09"),
            Condition::Rain => Some("10"),
            Condition::Lightning => Some("11"),
            Condition::Snow => Some("13"),
            Condition::Mist => Some("50"),
            Condition::Unknown => None,
        }
    }
}

/// Infers the current condition and the quality the guess deserves.
/// First matching rule wins.
pub fn infer_condition(status: &WeatherStatus) -> Option<(Condition, f64)> {
    let lightning_count = value(&status.lightning_count).copied().unwrap_or(0);
    let lightning_distance = value(&status.lightning_distance_km).copied();
    if lightning_count > 0 && lightning_distance.is_some_and(|km| km < LIGHTNING_NEARBY_KM) {
        return Some((Condition::Lightning, 1.0));
    }

    match value(&status.precip_type) {
        Some(PrecipType::Rain) => {
            let rate = value(&status.rain_rate_mm_per_min).copied();
            return Some(match rate {
                Some(rate) if rate < SHOWER_RAIN_MM_PER_MIN => (Condition::ShowerRain, 0.5),
                _ => (Condition::Rain, 1.0),
            });
        }
        Some(PrecipType::Hail) | Some(PrecipType::Snow) => return Some((Condition::Snow, 0.0)),
        Some(PrecipType::None) | None => {}
    }

    let lux = *value(&status.illuminance_lux)?;
    let humidity = value(&status.humidity_pct).copied();
    if humidity.is_some_and(|pct| pct >= MIST_HUMIDITY_PCT) && lux < MIST_MAX_LUX {
        return Some((Condition::Mist, 0.0));
    }
    Some(if lux > CLEAR_SKY_LUX {
        (Condition::ClearSky, 0.0)
    } else if lux > SCATTERED_CLOUDS_LUX {
        // Also matches dawn, dusk and winter light.
        (Condition::ScatteredClouds, -1.0)
    } else if lux > CLOUDY_LUX {
        (Condition::Cloudy, -1.0)
    } else {
        // Too dark for a light sensor to say anything about cloud cover.
        (Condition::Unknown, -1.0)
    })
}

/// Icon code for `condition`: family plus `d`/`n` from the light level.
pub fn icon_for(condition: Condition, status: &WeatherStatus) -> Option<String> {
    let family = condition.icon_family()?;
    let daylight = value(&status.illuminance_lux).map_or(true, |lux| *lux > DAYLIGHT_LUX);
    Some(format!("{family}{}", if daylight { 'd' } else { 'n' }))
}

/// Recomputes `condition` and `icon` on `status` in place.
pub fn update_condition_and_icon(status: &mut WeatherStatus) {
    match infer_condition(status) {
        Some((condition, quality)) => {
            status.icon = icon_for(condition, status).map(|icon| Datapoint::new(icon, quality));
            status.condition = Some(Datapoint::new(condition.as_str().to_string(), quality));
        }
        None => {
            status.condition = None;
            status.icon = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> WeatherStatus {
        WeatherStatus::default()
    }

    #[test]
    fn nearby_lightning_wins_over_everything() {
        let mut ws = status();
        ws.lightning_count = Some(Datapoint::new(3, 1.0));
        ws.lightning_distance_km = Some(Datapoint::new(5.0, 1.0));
        ws.precip_type = Some(Datapoint::new(PrecipType::Rain, 1.0));
        ws.illuminance_lux = Some(Datapoint::new(120_000.0, 1.0));

        update_condition_and_icon(&mut ws);
        let condition = ws.condition.unwrap();
        assert_eq!(condition.value.as_deref(), Some("lightning"));
        assert!((condition.quality - 1.0).abs() < 1e-9);
        assert_eq!(ws.icon.unwrap().value.as_deref(), Some("11d"));
    }

    #[test]
    fn distant_lightning_falls_through_to_rain() {
        let mut ws = status();
        ws.lightning_count = Some(Datapoint::new(2, 1.0));
        ws.lightning_distance_km = Some(Datapoint::new(30.0, 1.0));
        ws.precip_type = Some(Datapoint::new(PrecipType::Rain, 1.0));
        ws.rain_rate_mm_per_min = Some(Datapoint::new(0.1, 0.5));

        assert_eq!(infer_condition(&ws), Some((Condition::ShowerRain, 0.5)));
        ws.rain_rate_mm_per_min = Some(Datapoint::new(1.2, 0.5));
        assert_eq!(infer_condition(&ws), Some((Condition::Rain, 1.0)));
    }

    #[test]
    fn hail_is_reported_as_snow_with_no_confidence() {
        let mut ws = status();
        ws.precip_type = Some(Datapoint::new(PrecipType::Hail, 1.0));
        assert_eq!(infer_condition(&ws), Some((Condition::Snow, 0.0)));
    }

    #[test]
    fn light_bands_and_mist() {
        let mut ws = status();
        ws.precip_type = Some(Datapoint::new(PrecipType::None, 1.0));
        ws.humidity_pct = Some(Datapoint::new(97.0, 1.0));
        ws.illuminance_lux = Some(Datapoint::new(8_000.0, 1.0));
        assert_eq!(infer_condition(&ws), Some((Condition::Mist, 0.0)));

        ws.humidity_pct = Some(Datapoint::new(60.0, 1.0));
        assert_eq!(infer_condition(&ws), Some((Condition::ScatteredClouds, -1.0)));
        ws.illuminance_lux = Some(Datapoint::new(150_000.0, 1.0));
        assert_eq!(infer_condition(&ws), Some((Condition::ClearSky, 0.0)));
        ws.illuminance_lux = Some(Datapoint::new(1_000.0, 1.0));
        assert_eq!(infer_condition(&ws), Some((Condition::Cloudy, -1.0)));
        assert_eq!(icon_for(Condition::Cloudy, &ws).as_deref(), Some("03n"));
    }

    #[test]
    fn darkness_reports_unknown_without_icon() {
        let mut ws = status();
        ws.illuminance_lux = Some(Datapoint::new(3.0, 1.0));
        update_condition_and_icon(&mut ws);
        assert_eq!(
            ws.condition.and_then(|c| c.value).as_deref(),
            Some("unknown")
        );
        assert!(ws.icon.is_none());
    }

    #[test]
    fn no_light_reading_means_no_condition() {
        let mut ws = status();
        ws.condition = Some(Datapoint::new("stale".to_string(), 0.0));
        update_condition_and_icon(&mut ws);
        assert!(ws.condition.is_none());
        assert!(ws.icon.is_none());
    }
}
