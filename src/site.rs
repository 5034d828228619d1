use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteDetails {
    pub id: String,
    pub label: String,
    pub timezone: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub exterior: bool,
    #[serde(default)]
    pub connected_room_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    #[default]
    General,
    Center,
    RadiatorProximity,
    WindowProximity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub room_id: String,
    #[serde(default)]
    pub role: SensorRole,
    #[serde(default)]
    pub is_primary_for_room: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Sensor {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Transom,
    Plug,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub room_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Derived-metric definition. Values are computed per cycle from raw sensor
/// readings; a missing input yields a null value, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    /// Temperature difference between two sensors (minuend - subtrahend),
    /// e.g. radiator-vs-room-center delta.
    TempDelta {
        minuend_sensor_id: String,
        subtrahend_sensor_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDef {
    pub id: String,
    pub description: String,
    #[serde(flatten)]
    pub kind: FeatureKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

/// Static site topology, loaded once at process start and immutable for the
/// process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub site: SiteDetails,
    pub curators: Vec<String>,
    pub rooms: Vec<Room>,
    pub sensors: Vec<Sensor>,
    pub devices: Vec<Device>,
    #[serde(default)]
    pub features: Vec<FeatureDef>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl SiteConfig {
    /// Panel speaker labels derived from the curator list.
    pub fn curator_labels(&self) -> Vec<String> {
        self.curators
            .iter()
            .map(|name| format!("{} (imagined panel)", name))
            .collect()
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.iter().find(|r| r.id == room_id)
    }

    pub fn sensors_in_room(&self, room_id: &str) -> Vec<&Sensor> {
        self.sensors.iter().filter(|s| s.room_id == room_id).collect()
    }

    /// Referential integrity: every sensor/device/connection/feature must
    /// point at things that exist.
    pub fn validate(&self) -> Result<()> {
        if self.curators.is_empty() {
            bail!("site config has no curators");
        }
        for sensor in &self.sensors {
            if self.room(&sensor.room_id).is_none() {
                bail!("sensor '{}' references unknown room '{}'", sensor.id, sensor.room_id);
            }
        }
        for device in &self.devices {
            if self.room(&device.room_id).is_none() {
                bail!("device '{}' references unknown room '{}'", device.id, device.room_id);
            }
        }
        for room in &self.rooms {
            for neighbor in &room.connected_room_ids {
                if self.room(neighbor).is_none() {
                    bail!("room '{}' lists unknown neighbor '{}'", room.id, neighbor);
                }
            }
        }
        for conn in &self.connections {
            if self.room(&conn.from).is_none() || self.room(&conn.to).is_none() {
                bail!("connection {} -> {} references an unknown room", conn.from, conn.to);
            }
        }
        for feature in &self.features {
            match &feature.kind {
                FeatureKind::TempDelta {
                    minuend_sensor_id,
                    subtrahend_sensor_id,
                } => {
                    for sensor_id in [minuend_sensor_id, subtrahend_sensor_id] {
                        if !self.sensors.iter().any(|s| &s.id == sensor_id) {
                            bail!(
                                "feature '{}' references unknown sensor '{}'",
                                feature.id,
                                sensor_id
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn load_site_config<P: AsRef<Path>>(path: P) -> Result<SiteConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read site config at {}", path.display()))?;
    let config: SiteConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Site config parse error ({})", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Site config validation error ({})", path.display()))?;
    Ok(config)
}

/// Stable content hash of the site config, stored alongside each cycle
/// record so historical rows can be traced to the topology that produced
/// them. serde_json emits struct fields in declaration order, so the digest
/// is reproducible for a fixed config.
pub fn site_config_hash(config: &SiteConfig) -> String {
    let bytes = serde_json::to_vec(config).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
pub(crate) fn test_site_config() -> SiteConfig {
    serde_json::from_value(serde_json::json!({
        "site": {
            "id": "apt-3f",
            "label": "Third-floor apartment",
            "timezone": "America/New_York",
            "location": { "lat": 40.69, "lon": -73.98 }
        },
        "curators": ["Gail S. Brager", "Ole Fanger"],
        "rooms": [
            { "id": "kitchen", "label": "Kitchen", "connected_room_ids": ["living_room"] },
            { "id": "living_room", "label": "Living room" },
            { "id": "bathroom", "label": "Bathroom" },
            { "id": "outside", "label": "Outside", "exterior": true }
        ],
        "sensors": [
            { "id": "kitchen_main", "room_id": "kitchen", "is_primary_for_room": true },
            { "id": "living_center", "room_id": "living_room", "role": "center",
              "is_primary_for_room": true, "tags": ["prompt_history"] },
            { "id": "living_radiator", "room_id": "living_room", "role": "radiator_proximity" },
            { "id": "bath_window", "room_id": "bathroom", "role": "window_proximity" }
        ],
        "devices": [
            { "id": "kitchen_transom", "room_id": "kitchen", "kind": "transom", "label": "Kitchen transom fan" },
            { "id": "bathroom_transom", "room_id": "bathroom", "kind": "transom", "label": "Bathroom transom fan" },
            { "id": "kitchen_vornado_630", "room_id": "kitchen", "kind": "plug", "label": "Kitchen circulator plug" },
            { "id": "living_vornado_630", "room_id": "living_room", "kind": "plug", "label": "Living room circulator plug" }
        ],
        "features": [
            { "id": "living_radiator_delta_f",
              "description": "Radiator-proximity minus room-center temperature",
              "kind": "temp_delta",
              "minuend_sensor_id": "living_radiator",
              "subtrahend_sensor_id": "living_center" }
        ],
        "connections": [
            { "from": "living_room", "to": "bathroom" }
        ]
    }))
    .expect("test site config is valid")
}
