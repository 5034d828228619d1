use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::site::{DeviceKind, Sensor, SensorRole, SiteConfig};
use crate::types::{CycleRecord, DeviceState};

const SUMMARY_MAX_CHARS_DEFAULT: usize = 1200;
const HYPOTHESIS_CELL_MAX_CHARS: usize = 200;
const ERRORS_CELL_MAX_CHARS: usize = 280;

/// Sensors worth a column pair in the prompt history: primaries, anything
/// tagged for it, and the proximity sensors that explain radiator/window
/// effects. Falls back to all sensors when nothing qualifies.
fn pick_sensors_for_prompt(site: &SiteConfig) -> Vec<&Sensor> {
    let prioritized: Vec<&Sensor> = site
        .sensors
        .iter()
        .filter(|s| {
            s.is_primary_for_room
                || s.has_tag("prompt_history")
                || s.role == SensorRole::RadiatorProximity
                || s.role == SensorRole::WindowProximity
        })
        .collect();
    if !prioritized.is_empty() {
        return prioritized;
    }
    site.sensors.iter().collect()
}

fn device_columns(device_id: &str, kind: DeviceKind, suffix: &str) -> Vec<String> {
    let mut columns = vec![format!("device__{device_id}__power_{suffix}")];
    if kind == DeviceKind::Transom {
        columns.push(format!("device__{device_id}__direction_{suffix}"));
        columns.push(format!("device__{device_id}__speed_{suffix}"));
    }
    columns
}

/// Deterministic column list derived purely from the site config, shared by
/// the prompt history table and the spreadsheet mirror. Must stay stable
/// across runs so historical rows remain columnar-consistent.
pub fn build_prompt_history_header(site: &SiteConfig) -> Vec<String> {
    let mut header: Vec<String> = vec![
        "timestamp_local_iso".to_string(),
        "timestamp_utc_iso".to_string(),
        "weather__outside__temp_f".to_string(),
        "weather__outside__rh_pct".to_string(),
        "weather__outside__wind_mph".to_string(),
        "weather__outside__wind_dir_deg".to_string(),
        "weather__outside__precip_in_hr".to_string(),
    ];

    for sensor in pick_sensors_for_prompt(site) {
        header.push(format!("temp_f__{}", sensor.id));
        header.push(format!("rh__{}", sensor.id));
    }

    for room in site.rooms.iter().filter(|r| !r.exterior) {
        header.push(format!("temp_f_mean__{}", room.id));
        header.push(format!("rh_mean__{}", room.id));
    }

    for feature in &site.features {
        header.push(format!("feature__{}", feature.id));
    }

    for device in &site.devices {
        header.extend(device_columns(&device.id, device.kind, "req"));
    }
    for device in &site.devices {
        header.extend(device_columns(&device.id, device.kind, "applied"));
    }

    header.push("hypothesis".to_string());
    header.push("confidence_0_1".to_string());
    header.push("actuation_ok".to_string());
    header.push("actuation_errors_compact".to_string());

    header
}

/// The spreadsheet mirror uses the identical column contract.
pub fn build_sheet_header(site: &SiteConfig) -> Vec<String> {
    build_prompt_history_header(site)
}

fn fmt_f64(value: f64) -> String {
    format!("{}", value)
}

fn fmt_opt_f64(value: Option<f64>) -> String {
    value.map(fmt_f64).unwrap_or_default()
}

fn flatten_device_state(
    state: Option<&DeviceState>,
    device_id: &str,
    kind: DeviceKind,
    suffix: &str,
    into: &mut BTreeMap<String, String>,
) {
    let power = match state {
        Some(s) => crate::types::power_label(s.power()).to_string(),
        None => String::new(),
    };
    into.insert(format!("device__{device_id}__power_{suffix}"), power);

    if kind == DeviceKind::Transom {
        let (direction, speed) = match state {
            Some(DeviceState::Transom(t)) => (
                crate::types::direction_label(t.direction).to_string(),
                crate::types::speed_label(t.speed).to_string(),
            ),
            _ => (String::new(), String::new()),
        };
        into.insert(format!("device__{device_id}__direction_{suffix}"), direction);
        into.insert(format!("device__{device_id}__speed_{suffix}"), speed);
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Project one cycle record into a row matching `header`. Missing values
/// render as the empty string.
pub fn cycle_record_to_row(
    record: &CycleRecord,
    site: &SiteConfig,
    header: &[String],
) -> Vec<String> {
    let mut values: BTreeMap<String, String> = BTreeMap::new();

    values.insert("timestamp_local_iso".into(), record.timestamp_local_iso.clone());
    values.insert("timestamp_utc_iso".into(), record.timestamp_utc_iso.clone());
    values.insert("weather__outside__temp_f".into(), fmt_f64(record.weather.temp_f));
    values.insert("weather__outside__rh_pct".into(), fmt_f64(record.weather.rh_pct));
    values.insert(
        "weather__outside__wind_mph".into(),
        fmt_opt_f64(record.weather.wind_mph),
    );
    values.insert(
        "weather__outside__wind_dir_deg".into(),
        fmt_opt_f64(record.weather.wind_dir_deg),
    );
    values.insert(
        "weather__outside__precip_in_hr".into(),
        fmt_opt_f64(record.weather.precip_in_hr),
    );

    for sensor in pick_sensors_for_prompt(site) {
        let reading = record
            .sensors
            .readings
            .iter()
            .find(|r| r.sensor_id == sensor.id);
        values.insert(
            format!("temp_f__{}", sensor.id),
            reading.map(|r| fmt_f64(r.temp_f)).unwrap_or_default(),
        );
        values.insert(
            format!("rh__{}", sensor.id),
            reading.map(|r| fmt_f64(r.rh_pct)).unwrap_or_default(),
        );
    }

    for room in site.rooms.iter().filter(|r| !r.exterior) {
        let room_telemetry = record.telemetry.rooms.iter().find(|r| r.room_id == room.id);
        values.insert(
            format!("temp_f_mean__{}", room.id),
            fmt_opt_f64(room_telemetry.and_then(|r| r.stats.temp_f.map(|s| s.mean))),
        );
        values.insert(
            format!("rh_mean__{}", room.id),
            fmt_opt_f64(room_telemetry.and_then(|r| r.stats.rh_pct.map(|s| s.mean))),
        );
    }

    for feature in &site.features {
        values.insert(
            format!("feature__{}", feature.id),
            fmt_opt_f64(record.features.get(&feature.id).copied().flatten()),
        );
    }

    for device in &site.devices {
        flatten_device_state(
            record.decision.actions.get(&device.id),
            &device.id,
            device.kind,
            "req",
            &mut values,
        );
    }
    for device in &site.devices {
        flatten_device_state(
            record.actuation.applied.get(&device.id),
            &device.id,
            device.kind,
            "applied",
            &mut values,
        );
    }

    values.insert(
        "hypothesis".into(),
        truncate_chars(&record.decision.hypothesis, HYPOTHESIS_CELL_MAX_CHARS),
    );
    values.insert(
        "confidence_0_1".into(),
        fmt_f64(record.decision.confidence_0_1),
    );
    values.insert(
        "actuation_ok".into(),
        record.actuation.actuation_ok.to_string(),
    );
    let compact_errors = record.actuation.errors.join(" | ");
    values.insert(
        "actuation_errors_compact".into(),
        truncate_chars(&compact_errors, ERRORS_CELL_MAX_CHARS),
    );

    header
        .iter()
        .map(|key| values.get(key).cloned().unwrap_or_default())
        .collect()
}

fn describe_state(state: Option<&DeviceState>) -> String {
    match state {
        Some(s) => s.describe(),
        None => "unknown".to_string(),
    }
}

fn states_equal(a: Option<&DeviceState>, b: Option<&DeviceState>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_state(b),
        // A device absent from both applied maps is not a change.
        (None, None) => true,
        _ => false,
    }
}

/// Scan backward through the window for the most recent applied-state
/// change on any device.
fn find_last_actuation_change(records: &[CycleRecord], site: &SiteConfig) -> Option<String> {
    for i in (1..records.len()).rev() {
        let current = &records[i];
        let prev = &records[i - 1];

        for device in &site.devices {
            let now_state = current.actuation.applied.get(&device.id);
            let prev_state = prev.actuation.applied.get(&device.id);
            if !states_equal(now_state, prev_state) {
                return Some(format!(
                    "{} changed {} -> {} at {}",
                    device.id,
                    describe_state(prev_state),
                    describe_state(now_state),
                    current.timestamp_local_iso
                ));
            }
        }
    }
    None
}

fn format_delta_line(
    label: &str,
    start: Option<f64>,
    end: Option<f64>,
    unit: &str,
) -> Option<String> {
    let (start, end) = (start?, end?);
    let delta = end - start;
    let delta_str = if delta == 0.0 {
        "0".to_string()
    } else {
        format!("{:.1}", delta)
    };
    Some(format!("{label}: {end:.1}{unit} (\u{394} {delta_str}{unit})"))
}

fn room_mean(record: &CycleRecord, room_id: &str, temp: bool) -> Option<f64> {
    let room = record.telemetry.rooms.iter().find(|r| r.room_id == room_id)?;
    if temp {
        room.stats.temp_f.map(|s| s.mean)
    } else {
        room.stats.rh_pct.map(|s| s.mean)
    }
}

fn summarize_trends(records: &[CycleRecord], site: &SiteConfig) -> Vec<String> {
    if records.is_empty() {
        return Vec::new();
    }
    let first = &records[0];
    let last = &records[records.len() - 1];
    let mut lines = Vec::new();

    lines.push(format!(
        "window: {} rows ({} -> {})",
        records.len(),
        first.timestamp_local_iso,
        last.timestamp_local_iso
    ));

    lines.push(
        find_last_actuation_change(records, site)
            .unwrap_or_else(|| "last actuation change: none (all stable in window)".to_string()),
    );

    for room in site.rooms.iter().filter(|r| !r.exterior) {
        if let Some(line) = format_delta_line(
            &format!("{} temp", room.id),
            room_mean(first, &room.id, true),
            room_mean(last, &room.id, true),
            "\u{b0}F",
        ) {
            lines.push(line);
        }
        if let Some(line) = format_delta_line(
            &format!("{} RH", room.id),
            room_mean(first, &room.id, false),
            room_mean(last, &room.id, false),
            "%RH",
        ) {
            lines.push(line);
        }
    }

    for feature in &site.features {
        if let Some(line) = format_delta_line(
            &format!("feature {}", feature.id),
            first.features.get(&feature.id).copied().flatten(),
            last.features.get(&feature.id).copied().flatten(),
            "",
        ) {
            lines.push(line);
        }
    }

    lines
}

/// Char-boundary-safe truncation of the joined summary lines.
fn cap_summary(lines: &[String], max_chars: usize) -> String {
    truncate_chars(&lines.join("\n"), max_chars)
}

pub struct HistoryWindowParams<'a> {
    pub records: &'a [CycleRecord],
    pub site: &'a SiteConfig,
    pub max_rows: usize,
    pub max_minutes: Option<i64>,
    pub summary_max_chars: Option<usize>,
}

pub struct HistoryWindow {
    /// Header plus data rows; always at least the header.
    pub history_rows: Vec<Vec<String>>,
    pub history_summary: String,
    /// Applied map of the most recent record in the *unfiltered* list, so
    /// actuation state survives gaps wider than the prompt window.
    pub last_applied: Option<BTreeMap<String, DeviceState>>,
}

fn parse_utc(timestamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Turn the unbounded record history into a bounded, information-dense
/// window for the next prompt.
pub fn build_prompt_history_window(params: HistoryWindowParams<'_>) -> HistoryWindow {
    let header = build_prompt_history_header(params.site);

    if params.records.is_empty() {
        return HistoryWindow {
            history_rows: vec![header],
            history_summary: "No history available (store unreachable or empty).".to_string(),
            last_applied: None,
        };
    }

    let latest = &params.records[params.records.len() - 1];

    // Cutoff is anchored to the last record, not wall-clock now, so the
    // filter is reproducible against a fixed dataset.
    let cutoff = params
        .max_minutes
        .and_then(|mins| parse_utc(&latest.timestamp_utc_iso).map(|t| t - Duration::minutes(mins)));

    let recent: Vec<&CycleRecord> = match cutoff {
        Some(cutoff) => params
            .records
            .iter()
            .filter(|rec| {
                parse_utc(&rec.timestamp_utc_iso)
                    .map(|t| t >= cutoff)
                    .unwrap_or(false)
            })
            .collect(),
        None => params.records.iter().collect(),
    };

    let start = recent.len().saturating_sub(params.max_rows);
    let trimmed: Vec<CycleRecord> = recent[start..].iter().map(|r| (*r).clone()).collect();

    let mut history_rows = vec![header.clone()];
    history_rows.extend(
        trimmed
            .iter()
            .map(|rec| cycle_record_to_row(rec, params.site, &header)),
    );

    let summary = cap_summary(
        &summarize_trends(&trimmed, params.site),
        params.summary_max_chars.unwrap_or(SUMMARY_MAX_CHARS_DEFAULT),
    );

    HistoryWindow {
        history_rows,
        history_summary: summary,
        last_applied: Some(latest.actuation.applied.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::test_site_config;
    use crate::telemetry;
    use crate::types::{
        ActuationResult, Decision, DeviceState, PlugState, Power, SensorReading, SensorsNow,
        TransomDirection, TransomSpeed, TransomState, WeatherNow,
    };
    use chrono::TimeZone;

    fn test_actions() -> BTreeMap<String, DeviceState> {
        let mut actions = BTreeMap::new();
        actions.insert(
            "kitchen_transom".to_string(),
            DeviceState::Transom(TransomState {
                power: Power::On,
                direction: TransomDirection::Exhaust,
                speed: TransomSpeed::Low,
                auto: false,
                set_temp_f: 70,
            }),
        );
        actions.insert(
            "bathroom_transom".to_string(),
            DeviceState::Transom(TransomState {
                power: Power::Off,
                direction: TransomDirection::Exhaust,
                speed: TransomSpeed::Low,
                auto: false,
                set_temp_f: 70,
            }),
        );
        actions.insert(
            "kitchen_vornado_630".to_string(),
            DeviceState::Plug(PlugState { power: Power::Off }),
        );
        actions.insert(
            "living_vornado_630".to_string(),
            DeviceState::Plug(PlugState { power: Power::On }),
        );
        actions
    }

    fn build_record(idx: i64, base_minutes_step: i64) -> CycleRecord {
        let site = test_site_config();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let timestamp = base + Duration::minutes(idx * base_minutes_step);
        let iso = timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let sensors = SensorsNow {
            observation_time_utc: iso.clone(),
            readings: site
                .sensors
                .iter()
                .enumerate()
                .map(|(i, s)| SensorReading {
                    sensor_id: s.id.clone(),
                    temp_f: 70.0 + idx as f64 + i as f64,
                    rh_pct: 40.0 + idx as f64 + i as f64,
                })
                .collect(),
        };
        let summary = telemetry::summarize(&site, &sensors);
        let actions = test_actions();

        CycleRecord {
            decision_id: format!("decision_{idx}"),
            llm_model: "test-model".to_string(),
            prompt_template_version: "v1".to_string(),
            site_config_id: site.site.id.clone(),
            timestamp_local_iso: iso.clone(),
            timestamp_utc_iso: iso,
            weather: WeatherNow {
                temp_f: 60.0 + idx as f64,
                rh_pct: 50.0 + idx as f64,
                wind_mph: Some(5.0),
                wind_dir_deg: Some(180.0),
                precip_in_hr: Some(0.0),
                conditions: Some("clear".to_string()),
                observation_time_utc: "2024-01-01T12:00:00Z".to_string(),
            },
            sensors,
            features: summary.features.clone(),
            telemetry: summary,
            decision: Decision {
                panel: Vec::new(),
                actions: actions.clone(),
                hypothesis: "test decision".to_string(),
                confidence_0_1: 0.5,
                predictions: Vec::new(),
                llm_response_id: None,
            },
            actuation: ActuationResult {
                applied: actions,
                errors: Vec::new(),
                actuation_ok: true,
            },
        }
    }

    #[test]
    fn empty_history_still_returns_header_row() {
        let site = test_site_config();
        let window = build_prompt_history_window(HistoryWindowParams {
            records: &[],
            site: &site,
            max_rows: 10,
            max_minutes: None,
            summary_max_chars: None,
        });
        assert_eq!(window.history_rows.len(), 1);
        assert!(window.history_summary.contains("No history available"));
        assert!(window.last_applied.is_none());
    }

    #[test]
    fn header_is_deterministic() {
        let site = test_site_config();
        assert_eq!(build_prompt_history_header(&site), build_prompt_history_header(&site));
        assert_eq!(build_sheet_header(&site), build_prompt_history_header(&site));
    }

    #[test]
    fn header_shape_follows_site_config() {
        let site = test_site_config();
        let header = build_prompt_history_header(&site);
        // All four test sensors are prompt-relevant.
        assert!(header.contains(&"temp_f__kitchen_main".to_string()));
        assert!(header.contains(&"rh__bath_window".to_string()));
        // Exterior room gets no mean columns.
        assert!(!header.contains(&"temp_f_mean__outside".to_string()));
        assert!(header.contains(&"temp_f_mean__living_room".to_string()));
        // Transoms carry direction/speed; plugs only power.
        assert!(header.contains(&"device__kitchen_transom__direction_req".to_string()));
        assert!(!header.contains(&"device__living_vornado_630__direction_req".to_string()));
        assert_eq!(header.last().unwrap(), "actuation_errors_compact");
    }

    #[test]
    fn three_records_in_window_yield_four_rows() {
        let site = test_site_config();
        let records: Vec<CycleRecord> = (0..3).map(|i| build_record(i, 5)).collect();
        let window = build_prompt_history_window(HistoryWindowParams {
            records: &records,
            site: &site,
            max_rows: 10,
            max_minutes: Some(180),
            summary_max_chars: Some(500),
        });
        assert_eq!(window.history_rows.len(), 4);
        assert!(window.history_rows[1].iter().any(|cell| !cell.is_empty()));
        assert!(window.history_summary.contains("window:"));
        assert!(window.last_applied.is_some());
    }

    #[test]
    fn time_window_filter_drops_old_records() {
        let site = test_site_config();
        // 50 records spaced 5 minutes apart; 180-minute window from the
        // latest keeps 37 of them, max_rows then keeps the last 10.
        let records: Vec<CycleRecord> = (0..50).map(|i| build_record(i, 5)).collect();
        let window = build_prompt_history_window(HistoryWindowParams {
            records: &records,
            site: &site,
            max_rows: 10,
            max_minutes: Some(180),
            summary_max_chars: None,
        });
        assert_eq!(window.history_rows.len(), 11);
        // Chronological order preserved: last row is the latest record.
        let last_row = window.history_rows.last().unwrap();
        assert_eq!(last_row[1], records[49].timestamp_utc_iso);

        // Without max_rows pressure the time filter alone keeps 37.
        let window = build_prompt_history_window(HistoryWindowParams {
            records: &records,
            site: &site,
            max_rows: 100,
            max_minutes: Some(180),
            summary_max_chars: None,
        });
        assert_eq!(window.history_rows.len(), 38);
    }

    #[test]
    fn missing_values_render_as_empty_string() {
        let site = test_site_config();
        let mut record = build_record(0, 5);
        record.weather.wind_mph = None;
        record.sensors.readings.clear();
        record.telemetry = telemetry::summarize(&site, &record.sensors);
        record.features = record.telemetry.features.clone();

        let header = build_prompt_history_header(&site);
        let row = cycle_record_to_row(&record, &site, &header);
        let wind_idx = header.iter().position(|h| h == "weather__outside__wind_mph").unwrap();
        let temp_idx = header.iter().position(|h| h == "temp_f__kitchen_main").unwrap();
        assert_eq!(row[wind_idx], "");
        assert_eq!(row[temp_idx], "");
        assert!(!row.iter().any(|cell| cell == "null" || cell == "undefined"));
    }

    #[test]
    fn summary_reports_last_actuation_change() {
        let site = test_site_config();
        let mut records: Vec<CycleRecord> = (0..3).map(|i| build_record(i, 5)).collect();
        records[2].actuation.applied.insert(
            "living_vornado_630".to_string(),
            DeviceState::Plug(PlugState { power: Power::Off }),
        );
        let window = build_prompt_history_window(HistoryWindowParams {
            records: &records,
            site: &site,
            max_rows: 10,
            max_minutes: None,
            summary_max_chars: None,
        });
        assert!(
            window.history_summary.contains("living_vornado_630 changed ON -> OFF"),
            "{}",
            window.history_summary
        );
    }

    #[test]
    fn stable_window_reports_no_change() {
        let site = test_site_config();
        let records: Vec<CycleRecord> = (0..3).map(|i| build_record(i, 5)).collect();
        let window = build_prompt_history_window(HistoryWindowParams {
            records: &records,
            site: &site,
            max_rows: 10,
            max_minutes: None,
            summary_max_chars: None,
        });
        assert!(window
            .history_summary
            .contains("none (all stable in window)"));
    }

    #[test]
    fn summary_truncation_is_char_safe_and_marked() {
        let lines = vec!["\u{394}\u{b0}F summary line that keeps going".repeat(20)];
        let capped = cap_summary(&lines, 50);
        assert!(capped.ends_with("..."));
        assert_eq!(capped.chars().count(), 50);
    }

    #[test]
    fn last_applied_survives_time_filtering() {
        let site = test_site_config();
        // Latest record is far newer than the rest; window filters the old
        // ones out but last_applied still comes from the latest record.
        let mut records: Vec<CycleRecord> = (0..3).map(|i| build_record(i, 5)).collect();
        let mut latest = build_record(1000, 5);
        latest.actuation.applied.insert(
            "kitchen_vornado_630".to_string(),
            DeviceState::Plug(PlugState { power: Power::On }),
        );
        records.push(latest);

        let window = build_prompt_history_window(HistoryWindowParams {
            records: &records,
            site: &site,
            max_rows: 10,
            max_minutes: Some(30),
            summary_max_chars: None,
        });
        let applied = window.last_applied.unwrap();
        assert!(applied["kitchen_vornado_630"]
            .same_state(&DeviceState::Plug(PlugState { power: Power::On })));
    }

    #[test]
    fn hypothesis_cell_capped_at_200_chars() {
        let site = test_site_config();
        let mut record = build_record(0, 5);
        record.decision.hypothesis = "x".repeat(500);
        let header = build_prompt_history_header(&site);
        let row = cycle_record_to_row(&record, &site, &header);
        let idx = header.iter().position(|h| h == "hypothesis").unwrap();
        assert_eq!(row[idx].chars().count(), 200);
        assert!(row[idx].ends_with("..."));
    }
}
