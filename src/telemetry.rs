use std::collections::BTreeMap;

use crate::site::{FeatureKind, SensorRole, SiteConfig};
use crate::types::{
    DerivedFeatures, RepresentativeMethod, RepresentativeReading, RoomStats, RoomTelemetry,
    SensorReading, SensorWithReading, SensorsNow, StatSummary, TelemetrySummary,
};

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn to_stats(values: &[f64]) -> Option<StatSummary> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    Some(StatSummary {
        min: round2(min),
        max: round2(max),
        mean: round2(mean),
        count: finite.len(),
    })
}

fn summarize_room(
    room_id: &str,
    site: &SiteConfig,
    lookup: &BTreeMap<&str, &SensorReading>,
) -> RoomTelemetry {
    let room_sensors = site.sensors_in_room(room_id);

    let sensor_summaries: Vec<SensorWithReading> = room_sensors
        .iter()
        .map(|sensor| SensorWithReading {
            sensor_id: sensor.id.clone(),
            reading: lookup.get(sensor.id.as_str()).map(|r| (*r).clone()),
        })
        .collect();

    // Stats describe comfort in the occupied zone, so radiator-proximity
    // sensors are excluded unless they are all the room has.
    let comfort_sensors: Vec<_> = room_sensors
        .iter()
        .filter(|s| s.role != SensorRole::RadiatorProximity)
        .collect();
    let stats_sensors: Vec<&str> = if comfort_sensors.is_empty() {
        room_sensors.iter().map(|s| s.id.as_str()).collect()
    } else {
        comfort_sensors.iter().map(|s| s.id.as_str()).collect()
    };

    let temp_values: Vec<f64> = stats_sensors
        .iter()
        .filter_map(|id| lookup.get(id).map(|r| r.temp_f))
        .collect();
    let rh_values: Vec<f64> = stats_sensors
        .iter()
        .filter_map(|id| lookup.get(id).map(|r| r.rh_pct))
        .collect();

    let primary = room_sensors.iter().find(|s| s.is_primary_for_room);
    let primary_reading = primary.and_then(|s| lookup.get(s.id.as_str()));
    let fallback_reading = sensor_summaries.iter().find_map(|s| s.reading.as_ref());

    let representative = match (primary_reading, fallback_reading) {
        (Some(reading), _) => Some(RepresentativeReading {
            sensor_id: reading.sensor_id.clone(),
            temp_f: round2(reading.temp_f),
            rh_pct: round2(reading.rh_pct),
            method: RepresentativeMethod::PrimarySensor,
        }),
        (None, Some(reading)) => Some(RepresentativeReading {
            sensor_id: reading.sensor_id.clone(),
            temp_f: round2(reading.temp_f),
            rh_pct: round2(reading.rh_pct),
            method: RepresentativeMethod::FirstAvailable,
        }),
        (None, None) => None,
    };

    RoomTelemetry {
        room_id: room_id.to_string(),
        sensors: sensor_summaries,
        stats: RoomStats {
            temp_f: to_stats(&temp_values),
            rh_pct: to_stats(&rh_values),
        },
        representative,
    }
}

fn compute_features(site: &SiteConfig, lookup: &BTreeMap<&str, &SensorReading>) -> DerivedFeatures {
    let mut features = DerivedFeatures::new();
    for def in &site.features {
        let value = match &def.kind {
            FeatureKind::TempDelta {
                minuend_sensor_id,
                subtrahend_sensor_id,
            } => {
                let minuend = lookup.get(minuend_sensor_id.as_str()).map(|r| r.temp_f);
                let subtrahend = lookup.get(subtrahend_sensor_id.as_str()).map(|r| r.temp_f);
                match (minuend, subtrahend) {
                    (Some(a), Some(b)) if a.is_finite() && b.is_finite() => Some(round2(a - b)),
                    _ => None,
                }
            }
        };
        features.insert(def.id.clone(), value);
    }
    features
}

/// Reduce raw per-sensor readings into per-room statistics and derived
/// scalar features. Pure function of its inputs; empty readings are fine.
pub fn summarize(site: &SiteConfig, sensors_now: &SensorsNow) -> TelemetrySummary {
    let lookup: BTreeMap<&str, &SensorReading> = sensors_now
        .readings
        .iter()
        .map(|r| (r.sensor_id.as_str(), r))
        .collect();

    let rooms = site
        .rooms
        .iter()
        .map(|room| summarize_room(&room.id, site, &lookup))
        .collect();

    TelemetrySummary {
        rooms,
        features: compute_features(site, &lookup),
    }
}

fn f_to_c(f: f64) -> f64 {
    (f - 32.0) * (5.0 / 9.0)
}

fn c_to_f(c: f64) -> f64 {
    c * (9.0 / 5.0) + 32.0
}

/// Magnus-formula dew point, in °F. Approximation good enough for control
/// heuristics and logging.
pub fn dew_point_f(temp_f: f64, rh_pct: f64) -> f64 {
    let t = f_to_c(temp_f);
    let rh = (rh_pct.clamp(0.0, 100.0).max(1e-6)) / 100.0;
    let a = 17.625;
    let b = 243.04;

    let gamma = rh.ln() + (a * t) / (b + t);
    let dew_c = (b * gamma) / (a - gamma);
    c_to_f(dew_c)
}

/// Approximate absolute humidity in g/m^3 via saturation vapor pressure
/// (Magnus) and the ideal gas law.
pub fn absolute_humidity_gm3(temp_f: f64, rh_pct: f64) -> f64 {
    let t = f_to_c(temp_f);
    let rh = rh_pct.clamp(0.0, 100.0) / 100.0;

    let es = 6.112 * ((17.67 * t) / (t + 243.5)).exp();
    let e = rh * es;

    216.7 * (e / (t + 273.15))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::test_site_config;

    fn reading(sensor_id: &str, temp_f: f64, rh_pct: f64) -> SensorReading {
        SensorReading {
            sensor_id: sensor_id.to_string(),
            temp_f,
            rh_pct,
        }
    }

    fn sensors_now(readings: Vec<SensorReading>) -> SensorsNow {
        SensorsNow {
            observation_time_utc: "2024-01-01T12:00:00Z".to_string(),
            readings,
        }
    }

    #[test]
    fn radiator_proximity_excluded_from_room_stats() {
        let site = test_site_config();
        let now = sensors_now(vec![
            reading("living_center", 70.0, 40.0),
            reading("living_radiator", 95.0, 20.0),
        ]);
        let summary = summarize(&site, &now);
        let living = summary
            .rooms
            .iter()
            .find(|r| r.room_id == "living_room")
            .unwrap();
        let temp = living.stats.temp_f.unwrap();
        assert_eq!(temp.mean, 70.0);
        assert_eq!(temp.count, 1);
    }

    #[test]
    fn radiator_only_room_falls_back_to_all_sensors() {
        let mut site = test_site_config();
        // Make living_room radiator-only.
        site.sensors.retain(|s| s.id != "living_center");
        let now = sensors_now(vec![reading("living_radiator", 95.0, 20.0)]);
        let summary = summarize(&site, &now);
        let living = summary
            .rooms
            .iter()
            .find(|r| r.room_id == "living_room")
            .unwrap();
        assert_eq!(living.stats.temp_f.unwrap().mean, 95.0);
    }

    #[test]
    fn representative_prefers_primary_sensor() {
        let site = test_site_config();
        let now = sensors_now(vec![
            reading("living_radiator", 95.0, 20.0),
            reading("living_center", 70.5, 40.0),
        ]);
        let summary = summarize(&site, &now);
        let living = summary
            .rooms
            .iter()
            .find(|r| r.room_id == "living_room")
            .unwrap();
        let rep = living.representative.as_ref().unwrap();
        assert_eq!(rep.sensor_id, "living_center");
        assert_eq!(rep.method, RepresentativeMethod::PrimarySensor);
        assert_eq!(rep.temp_f, 70.5);
    }

    #[test]
    fn representative_falls_back_to_first_available() {
        let site = test_site_config();
        // Primary (living_center) not reporting.
        let now = sensors_now(vec![reading("living_radiator", 95.0, 20.0)]);
        let summary = summarize(&site, &now);
        let living = summary
            .rooms
            .iter()
            .find(|r| r.room_id == "living_room")
            .unwrap();
        let rep = living.representative.as_ref().unwrap();
        assert_eq!(rep.sensor_id, "living_radiator");
        assert_eq!(rep.method, RepresentativeMethod::FirstAvailable);
    }

    #[test]
    fn empty_readings_produce_no_stats_and_no_error() {
        let site = test_site_config();
        let summary = summarize(&site, &sensors_now(vec![]));
        for room in &summary.rooms {
            assert!(room.stats.temp_f.is_none());
            assert!(room.stats.rh_pct.is_none());
            assert!(room.representative.is_none());
        }
        assert_eq!(summary.features["living_radiator_delta_f"], None);
    }

    #[test]
    fn feature_delta_computed_when_both_inputs_present() {
        let site = test_site_config();
        let now = sensors_now(vec![
            reading("living_radiator", 95.25, 20.0),
            reading("living_center", 70.0, 40.0),
        ]);
        let summary = summarize(&site, &now);
        assert_eq!(summary.features["living_radiator_delta_f"], Some(25.25));
    }

    #[test]
    fn stats_round_to_two_decimals() {
        let site = test_site_config();
        let now = sensors_now(vec![
            reading("kitchen_main", 70.004, 40.006),
        ]);
        let summary = summarize(&site, &now);
        let kitchen = summary.rooms.iter().find(|r| r.room_id == "kitchen").unwrap();
        assert_eq!(kitchen.stats.temp_f.unwrap().mean, 70.0);
        assert_eq!(kitchen.stats.rh_pct.unwrap().mean, 40.01);
    }

    #[test]
    fn dew_point_sanity() {
        // 70°F at 50% RH is a dew point just above 50°F.
        let dp = dew_point_f(70.0, 50.0);
        assert!((49.0..52.0).contains(&dp), "dew point {dp}");
        // Saturated air: dew point equals air temperature.
        assert!((dew_point_f(70.0, 100.0) - 70.0).abs() < 0.2);
    }

    #[test]
    fn absolute_humidity_sanity() {
        // ~21°C at 50% RH is roughly 9 g/m^3.
        let ah = absolute_humidity_gm3(70.0, 50.0);
        assert!((8.0..10.5).contains(&ah), "absolute humidity {ah}");
    }
}
