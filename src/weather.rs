use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Deserialize;

use crate::types::WeatherNow;

const OPEN_METEO_URL: &str = "https://api.open-meteo.com/v1/forecast";

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    current: Option<OpenMeteoCurrent>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoCurrent {
    temperature_2m: f64,
    relative_humidity_2m: f64,
    #[serde(default)]
    wind_speed_10m: Option<f64>,
    #[serde(default)]
    wind_direction_10m: Option<f64>,
    #[serde(default)]
    precipitation: Option<f64>,
}

#[derive(Clone)]
pub struct WeatherClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl WeatherClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url(OPEN_METEO_URL.to_string(), timeout)
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url,
            timeout,
        }
    }

    /// Current outdoor conditions in imperial units. Timeouts surface as a
    /// distinct error so the cycle can name the failure in its fallback.
    pub async fn current(&self, lat: f64, lon: f64, timezone: &str) -> Result<WeatherNow> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                (
                    "current",
                    "temperature_2m,relative_humidity_2m,wind_speed_10m,wind_direction_10m,precipitation"
                        .to_string(),
                ),
                ("temperature_unit", "fahrenheit".to_string()),
                ("wind_speed_unit", "mph".to_string()),
                ("precipitation_unit", "inch".to_string()),
                ("timezone", timezone.to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!(
                        "weather request timed out after {}s",
                        self.timeout.as_secs()
                    )
                } else {
                    anyhow::anyhow!("weather request failed: {e}")
                }
            })?;

        if !response.status().is_success() {
            bail!("Open-Meteo returned {}", response.status());
        }

        let parsed: OpenMeteoResponse = response
            .json()
            .await
            .context("Failed to parse Open-Meteo response")?;
        let current = parsed
            .current
            .context("Open-Meteo response missing current block")?;

        Ok(WeatherNow {
            temp_f: current.temperature_2m,
            rh_pct: current.relative_humidity_2m,
            wind_mph: current.wind_speed_10m,
            wind_dir_deg: current.wind_direction_10m,
            precip_in_hr: current.precipitation,
            conditions: None,
            observation_time_utc: Utc::now().to_rfc3339(),
        })
    }
}
