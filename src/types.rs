use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Single outdoor snapshot from the weather provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherNow {
    pub temp_f: f64,
    pub rh_pct: f64,
    #[serde(default)]
    pub wind_mph: Option<f64>,
    #[serde(default)]
    pub wind_dir_deg: Option<f64>,
    #[serde(default)]
    pub precip_in_hr: Option<f64>,
    #[serde(default)]
    pub conditions: Option<String>,
    pub observation_time_utc: String,
}

/// Instantaneous measurement from one indoor sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub temp_f: f64,
    pub rh_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorsNow {
    pub observation_time_utc: String,
    pub readings: Vec<SensorReading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Power {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransomDirection {
    Exhaust,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransomSpeed {
    Low,
    Med,
    High,
    Turbo,
}

/// Commanded state for a transom fan unit. `set_temp_f` is meaningful when
/// `auto` is true; valid range 60-90.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransomState {
    pub power: Power,
    pub direction: TransomDirection,
    pub speed: TransomSpeed,
    pub auto: bool,
    pub set_temp_f: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlugState {
    pub power: Power,
}

/// Canonical device-state shape for both decision actions and applied
/// actuation outcomes. Internally tagged so stored records stay
/// self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceState {
    Transom(TransomState),
    Plug(PlugState),
}

impl DeviceState {
    /// Type-specific state equality: transoms compare power, direction,
    /// speed, auto and set_temp_f; plugs compare power only. States of
    /// different kinds are never equal.
    pub fn same_state(&self, other: &DeviceState) -> bool {
        match (self, other) {
            (DeviceState::Transom(a), DeviceState::Transom(b)) => {
                a.power == b.power
                    && a.direction == b.direction
                    && a.speed == b.speed
                    && a.auto == b.auto
                    && a.set_temp_f == b.set_temp_f
            }
            (DeviceState::Plug(a), DeviceState::Plug(b)) => a.power == b.power,
            _ => false,
        }
    }

    /// Short human label used in trend summaries.
    pub fn describe(&self) -> String {
        match self {
            DeviceState::Transom(t) => {
                if t.power == Power::Off {
                    "OFF".to_string()
                } else {
                    format!("{}/{}", direction_label(t.direction), speed_label(t.speed))
                }
            }
            DeviceState::Plug(p) => power_label(p.power).to_string(),
        }
    }

    pub fn power(&self) -> Power {
        match self {
            DeviceState::Transom(t) => t.power,
            DeviceState::Plug(p) => p.power,
        }
    }
}

pub fn power_label(power: Power) -> &'static str {
    match power {
        Power::On => "ON",
        Power::Off => "OFF",
    }
}

pub fn direction_label(direction: TransomDirection) -> &'static str {
    match direction {
        TransomDirection::Exhaust => "EXHAUST",
        TransomDirection::Direct => "DIRECT",
    }
}

pub fn speed_label(speed: TransomSpeed) -> &'static str {
    match speed {
        TransomSpeed::Low => "LOW",
        TransomSpeed::Med => "MED",
        TransomSpeed::High => "HIGH",
        TransomSpeed::Turbo => "TURBO",
    }
}

/// One utterance from the imagined comfort panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelNote {
    pub speaker: String,
    pub notes: String,
}

/// Per-target delta prediction attached to a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub target_id: String,
    #[serde(default)]
    pub temp_f_delta: Option<f64>,
    #[serde(default)]
    pub rh_pct_delta: Option<f64>,
}

/// Structured output of the LLM panel: device commands plus rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub panel: Vec<PanelNote>,
    pub actions: BTreeMap<String, DeviceState>,
    pub hypothesis: String,
    pub confidence_0_1: f64,
    #[serde(default)]
    pub predictions: Vec<Prediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response_id: Option<String>,
}

/// Outcome of the actuation pass. `applied` is the state believed to be in
/// effect on each device, which may differ from the decision's request when
/// a webhook call failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuationResult {
    pub applied: BTreeMap<String, DeviceState>,
    pub errors: Vec<String>,
    pub actuation_ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomStats {
    #[serde(default)]
    pub temp_f: Option<StatSummary>,
    #[serde(default)]
    pub rh_pct: Option<StatSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepresentativeMethod {
    PrimarySensor,
    FirstAvailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepresentativeReading {
    pub sensor_id: String,
    pub temp_f: f64,
    pub rh_pct: f64,
    pub method: RepresentativeMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorWithReading {
    pub sensor_id: String,
    #[serde(default)]
    pub reading: Option<SensorReading>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomTelemetry {
    pub room_id: String,
    pub sensors: Vec<SensorWithReading>,
    pub stats: RoomStats,
    #[serde(default)]
    pub representative: Option<RepresentativeReading>,
}

/// Feature id -> value; a missing input yields None rather than an error.
pub type DerivedFeatures = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub rooms: Vec<RoomTelemetry>,
    pub features: DerivedFeatures,
}

/// The unit of persistence: one full cycle, immutable once written.
/// Keyed by `decision_id`, ordered by `timestamp_utc_iso`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub decision_id: String,
    pub llm_model: String,
    pub prompt_template_version: String,
    pub site_config_id: String,
    pub timestamp_local_iso: String,
    pub timestamp_utc_iso: String,
    pub weather: WeatherNow,
    pub sensors: SensorsNow,
    pub telemetry: TelemetrySummary,
    pub features: DerivedFeatures,
    pub decision: Decision,
    pub actuation: ActuationResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transom(power: Power, set_temp_f: i64) -> DeviceState {
        DeviceState::Transom(TransomState {
            power,
            direction: TransomDirection::Exhaust,
            speed: TransomSpeed::Low,
            auto: false,
            set_temp_f,
        })
    }

    #[test]
    fn transom_equality_covers_all_fields() {
        let a = transom(Power::On, 70);
        assert!(a.same_state(&transom(Power::On, 70)));
        assert!(!a.same_state(&transom(Power::On, 71)));
        assert!(!a.same_state(&transom(Power::Off, 70)));
    }

    #[test]
    fn plug_equality_is_power_only() {
        let on = DeviceState::Plug(PlugState { power: Power::On });
        let off = DeviceState::Plug(PlugState { power: Power::Off });
        assert!(on.same_state(&DeviceState::Plug(PlugState { power: Power::On })));
        assert!(!on.same_state(&off));
    }

    #[test]
    fn mismatched_kinds_never_equal() {
        let plug = DeviceState::Plug(PlugState { power: Power::On });
        assert!(!plug.same_state(&transom(Power::On, 70)));
    }

    #[test]
    fn device_state_serializes_with_kind_tag() {
        let plug = DeviceState::Plug(PlugState { power: Power::On });
        let json = serde_json::to_value(&plug).unwrap();
        assert_eq!(json["kind"], "plug");
        assert_eq!(json["power"], "ON");

        let back: DeviceState = serde_json::from_value(json).unwrap();
        assert!(back.same_state(&plug));
    }

    #[test]
    fn describe_labels_transom_direction_and_speed() {
        let t = DeviceState::Transom(TransomState {
            power: Power::On,
            direction: TransomDirection::Direct,
            speed: TransomSpeed::Turbo,
            auto: true,
            set_temp_f: 68,
        });
        assert_eq!(t.describe(), "DIRECT/TURBO");
        assert_eq!(transom(Power::Off, 70).describe(), "OFF");
    }
}
