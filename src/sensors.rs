use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;

use crate::types::{SensorReading, SensorsNow};

/// One line of the sensor mapping file: which payload keys feed which
/// logical sensor id.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingEntry {
    pub id: String,
    pub temp_key: String,
    pub humidity_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingFile {
    pub sensors: Vec<MappingEntry>,
}

pub async fn load_mapping(path: &str) -> Result<MappingFile> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read sensor mapping {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse sensor mapping {path}"))
}

/// Numbers may arrive as JSON numbers or numeric strings; anything else is
/// a hard error rather than a silent zero.
fn coerce_number(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .context("non-finite number"),
        Value::String(s) => {
            let parsed: f64 = s
                .trim()
                .parse()
                .with_context(|| format!("expected number, got {s:?}"))?;
            if !parsed.is_finite() {
                bail!("expected finite number, got {s:?}");
            }
            Ok(parsed)
        }
        other => bail!("expected number, got {other}"),
    }
}

/// Map a flat gateway payload through the mapping file. Every mapped key
/// must be present and numeric; a broken payload blocks the cycle rather
/// than feeding partial data to the panel.
pub fn map_readings(mapping: &MappingFile, payload: &Value) -> Result<Vec<SensorReading>> {
    let mut readings = Vec::with_capacity(mapping.sensors.len());
    for entry in &mapping.sensors {
        let temp = payload
            .get(&entry.temp_key)
            .with_context(|| format!("sensor '{}': payload missing key '{}'", entry.id, entry.temp_key))?;
        let rh = payload
            .get(&entry.humidity_key)
            .with_context(|| {
                format!("sensor '{}': payload missing key '{}'", entry.id, entry.humidity_key)
            })?;
        readings.push(SensorReading {
            sensor_id: entry.id.clone(),
            temp_f: coerce_number(temp)
                .with_context(|| format!("sensor '{}' temperature", entry.id))?,
            rh_pct: coerce_number(rh)
                .with_context(|| format!("sensor '{}' humidity", entry.id))?,
        });
    }
    Ok(readings)
}

/// Fetch live readings from an Ecowitt-style local gateway. The gateway is
/// expected to serve a flat JSON object whose keys are named in the
/// mapping file.
pub struct GatewaySensors {
    client: reqwest::Client,
    gateway_url: String,
    mapping_path: String,
    timeout: Duration,
}

impl GatewaySensors {
    pub fn new(gateway_url: String, mapping_path: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            gateway_url,
            mapping_path,
            timeout,
        }
    }

    pub async fn read(&self) -> Result<SensorsNow> {
        let mapping = load_mapping(&self.mapping_path).await?;
        let url = format!(
            "{}/get_livedata_info",
            self.gateway_url.trim_end_matches('/')
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!(
                    "sensor gateway request timed out after {}s",
                    self.timeout.as_secs()
                )
            } else {
                anyhow::anyhow!("sensor gateway request failed: {e}")
            }
        })?;

        if !response.status().is_success() {
            bail!("sensor gateway returned {}", response.status());
        }

        let payload: Value = response
            .json()
            .await
            .context("Failed to parse sensor gateway payload")?;

        Ok(SensorsNow {
            observation_time_utc: Utc::now().to_rfc3339(),
            readings: map_readings(&mapping, &payload)?,
        })
    }
}

/// Read sensor values from a local JSON file shaped like a gateway payload.
/// Used for development and dry runs.
pub async fn read_mock_sensors(mapping_path: &str, mock_path: &str) -> Result<SensorsNow> {
    let mapping = load_mapping(mapping_path).await?;
    let raw = fs::read_to_string(mock_path)
        .await
        .with_context(|| format!("Failed to read mock sensors {mock_path}"))?;
    let payload: Value =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {mock_path}"))?;

    Ok(SensorsNow {
        observation_time_utc: Utc::now().to_rfc3339(),
        readings: map_readings(&mapping, &payload)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping() -> MappingFile {
        MappingFile {
            sensors: vec![
                MappingEntry {
                    id: "kitchen_main".to_string(),
                    temp_key: "temp1f".to_string(),
                    humidity_key: "humidity1".to_string(),
                },
                MappingEntry {
                    id: "living_center".to_string(),
                    temp_key: "temp2f".to_string(),
                    humidity_key: "humidity2".to_string(),
                },
            ],
        }
    }

    #[test]
    fn maps_numeric_and_string_values() {
        let payload = json!({
            "temp1f": 72.9,
            "humidity1": "30",
            "temp2f": "68.2",
            "humidity2": 41
        });
        let readings = map_readings(&mapping(), &payload).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].sensor_id, "kitchen_main");
        assert_eq!(readings[0].temp_f, 72.9);
        assert_eq!(readings[0].rh_pct, 30.0);
        assert_eq!(readings[1].temp_f, 68.2);
    }

    #[test]
    fn missing_key_is_an_error() {
        let payload = json!({"temp1f": 72.9, "humidity1": 30});
        let err = map_readings(&mapping(), &payload).unwrap_err().to_string();
        assert!(err.contains("living_center"), "{err}");
    }

    #[test]
    fn non_numeric_value_is_an_error() {
        let payload = json!({
            "temp1f": "--", "humidity1": 30,
            "temp2f": 68.2, "humidity2": 41
        });
        assert!(map_readings(&mapping(), &payload).is_err());
    }

    #[test]
    fn mapping_file_parses_from_json() {
        let raw = r#"{"sensors": [{"id": "kitchen_main", "temp_key": "temp1f", "humidity_key": "humidity1"}]}"#;
        let mapping: MappingFile = serde_json::from_str(raw).unwrap();
        assert_eq!(mapping.sensors.len(), 1);
        assert_eq!(mapping.sensors[0].temp_key, "temp1f");
    }

    #[tokio::test]
    async fn mock_sensors_read_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let mapping_path = dir.path().join("mapping.json");
        let mock_path = dir.path().join("mock.json");
        std::fs::write(
            &mapping_path,
            r#"{"sensors": [{"id": "kitchen_main", "temp_key": "temp1f", "humidity_key": "humidity1"}]}"#,
        )
        .unwrap();
        std::fs::write(&mock_path, r#"{"temp1f": 70.5, "humidity1": 45}"#).unwrap();

        let now = read_mock_sensors(
            mapping_path.to_str().unwrap(),
            mock_path.to_str().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(now.readings.len(), 1);
        assert_eq!(now.readings[0].temp_f, 70.5);
    }
}
