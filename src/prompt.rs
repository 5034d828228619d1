use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::history;
use crate::site::{DeviceKind, SiteConfig};
use crate::telemetry::{absolute_humidity_gm3, dew_point_f};
use crate::types::{SensorsNow, TelemetrySummary, WeatherNow};

/// Bumped whenever the rendered document structure changes, so stored
/// records can be matched to the template that produced their prompt.
pub const PROMPT_TEMPLATE_VERSION: &str = "builtin-v3";

/// RFC4180-style CSV: cells containing comma, quote, or newline are quoted
/// with internal quotes doubled.
pub fn to_csv(rows: &[Vec<String>]) -> String {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|cell| {
                    if cell.contains(',')
                        || cell.contains('"')
                        || cell.contains('\n')
                        || cell.contains('\r')
                    {
                        format!("\"{}\"", cell.replace('"', "\"\""))
                    } else {
                        cell.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}", v),
        None => "?".to_string(),
    }
}

fn build_weather_line(weather: &WeatherNow) -> String {
    let mut parts = vec![
        format!("{:.1}\u{b0}F", weather.temp_f),
        format!("{:.0}% RH", weather.rh_pct),
    ];
    if let Some(conditions) = &weather.conditions {
        parts.push(format!("conditions: {}", conditions));
    }
    parts.push(format!(
        "wind: {} mph @ {}\u{b0}",
        fmt_opt(weather.wind_mph),
        fmt_opt(weather.wind_dir_deg)
    ));
    parts.push(format!("precip: {} in/hr", fmt_opt(weather.precip_in_hr)));
    parts.join("; ")
}

/// Undirected room adjacency from per-room neighbor lists plus explicit
/// connection edges. BTree containers keep the rendering deterministic.
fn build_adjacency(site: &SiteConfig) -> BTreeMap<String, BTreeSet<String>> {
    let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut add_edge = |adjacency: &mut BTreeMap<String, BTreeSet<String>>, a: &str, b: &str| {
        adjacency.entry(a.to_string()).or_default().insert(b.to_string());
        adjacency.entry(b.to_string()).or_default().insert(a.to_string());
    };

    for room in &site.rooms {
        for neighbor in &room.connected_room_ids {
            add_edge(&mut adjacency, &room.id, neighbor);
        }
    }
    for conn in &site.connections {
        add_edge(&mut adjacency, &conn.from, &conn.to);
    }
    adjacency
}

fn device_capabilities(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::Transom => {
            "power ON/OFF, direction EXHAUST/DIRECT, speed LOW/MED/HIGH/TURBO, auto with set_temp_f 60-90"
        }
        DeviceKind::Plug => "power ON/OFF",
    }
}

pub struct PromptParams<'a> {
    pub weather: &'a WeatherNow,
    pub sensors: &'a SensorsNow,
    pub telemetry: &'a TelemetrySummary,
    pub history_rows: &'a [Vec<String>],
    pub history_summary: &'a str,
    pub timezone: &'a str,
    pub prompt_max_chars: Option<usize>,
    pub site: &'a SiteConfig,
    pub curator_labels: &'a [String],
}

pub struct PromptOutput {
    pub prompt: String,
    pub prompt_version: String,
    pub site_config_id: String,
}

fn render(params: &PromptParams<'_>, history_csv: &str) -> String {
    let site = params.site;
    let mut out = String::new();

    let _ = writeln!(out, "# Comfort control decision request");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "You are an imagined panel of comfort scientists advising on fan and plug states for {} ({}).",
        site.site.label, site.site.id
    );
    let _ = writeln!(out, "Panel members:");
    for label in params.curator_labels {
        let _ = writeln!(out, "- {}", label);
    }
    if let Some(notes) = &site.site.notes {
        let _ = writeln!(out);
        let _ = writeln!(out, "Site notes: {}", notes);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Timezone: {}", params.timezone);
    let _ = writeln!(out, "Outdoor now: {}", build_weather_line(params.weather));
    let _ = writeln!(
        out,
        "Indoor sensors observed at: {}",
        params.sensors.observation_time_utc
    );

    let _ = writeln!(out);
    let _ = writeln!(out, "## Rooms and sensors");
    for room in &site.rooms {
        let _ = writeln!(out, "### {} ({})", room.label, room.id);
        let room_telemetry = params
            .telemetry
            .rooms
            .iter()
            .find(|r| r.room_id == room.id);
        for sensor in site.sensors_in_room(&room.id) {
            let reading = params
                .sensors
                .readings
                .iter()
                .find(|r| r.sensor_id == sensor.id);
            match reading {
                Some(r) => {
                    let _ = writeln!(
                        out,
                        "- {}: {:.1}\u{b0}F, {:.1}% RH (dew point {:.1}\u{b0}F, abs humidity {:.2} g/m3)",
                        sensor.id,
                        r.temp_f,
                        r.rh_pct,
                        dew_point_f(r.temp_f, r.rh_pct),
                        absolute_humidity_gm3(r.temp_f, r.rh_pct)
                    );
                }
                None => {
                    let _ = writeln!(out, "- {}: no reading", sensor.id);
                }
            }
        }
        if let Some(stats) = room_telemetry.and_then(|r| r.stats.temp_f) {
            let _ = writeln!(
                out,
                "- room mean: {:.2}\u{b0}F over {} sensor(s)",
                stats.mean, stats.count
            );
        }
    }

    let adjacency = build_adjacency(site);
    if !adjacency.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Room adjacency");
        for (room, neighbors) in &adjacency {
            let _ = writeln!(
                out,
                "- {} <-> {}",
                room,
                neighbors.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Controllable devices");
    for device in &site.devices {
        let _ = writeln!(
            out,
            "- {} ({}, in {}): {}",
            device.id,
            device.label,
            device.room_id,
            device_capabilities(device.kind)
        );
    }

    if !site.features.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Derived features");
        for feature in &site.features {
            let value = params
                .telemetry
                .features
                .get(&feature.id)
                .copied()
                .flatten();
            let rendered = match value {
                Some(v) => format!("{}", (v * 100.0).round() / 100.0),
                None => String::new(),
            };
            let _ = writeln!(out, "- {} ({}): {}", feature.id, feature.description, rendered);
        }
    }

    if !params.history_summary.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Recent trends");
        let _ = writeln!(out, "{}", params.history_summary);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Cycle history (CSV)");
    let _ = writeln!(out, "{}", history_csv);

    out
}

/// Merge live telemetry, history window, and static site topology into one
/// bounded-length prompt. When the full render exceeds the budget the
/// history row window shrinks geometrically (by ceil(window/3) each step)
/// until the document fits; the header-only render is emitted as-is if even
/// that overflows, so the CSV block is never cut mid-row.
pub fn build_prompt(params: PromptParams<'_>) -> PromptOutput {
    let fallback_header = history::build_prompt_history_header(params.site);
    let rows: Vec<Vec<String>> = if params.history_rows.is_empty() {
        vec![fallback_header]
    } else {
        params.history_rows.to_vec()
    };
    let header = rows[0].clone();
    let data_rows = &rows[1..];

    let mut prompt = render(&params, &to_csv(&rows));

    if let Some(max_chars) = params.prompt_max_chars {
        if prompt.chars().count() > max_chars {
            let mut window = data_rows.len();
            let mut fitted = false;
            while window > 0 {
                let mut candidate_rows = vec![header.clone()];
                candidate_rows.extend_from_slice(&data_rows[data_rows.len() - window..]);
                let candidate = render(&params, &to_csv(&candidate_rows));
                if candidate.chars().count() <= max_chars {
                    prompt = candidate;
                    fitted = true;
                    break;
                }
                window -= window.div_ceil(3);
            }
            if !fitted {
                prompt = render(&params, &to_csv(&[header]));
            }
        }
    }

    PromptOutput {
        prompt,
        prompt_version: PROMPT_TEMPLATE_VERSION.to_string(),
        site_config_id: params.site.site.id.clone(),
    }
}
