use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::actuate::{actuate_diff, Actuator, WebhookActuator};
use crate::config::{AppConfig, SensorSource};
use crate::history::{build_prompt_history_window, HistoryWindow, HistoryWindowParams};
use crate::llm::{fallback_decision, DecisionClient};
use crate::prompt::{build_prompt, PromptOutput, PromptParams};
use crate::sanity::apply_sanity;
use crate::sensors::{read_mock_sensors, GatewaySensors};
use crate::site::{site_config_hash, SiteConfig};
use crate::store::{sync_csv_mirror, CycleStore};
use crate::telemetry::summarize;
use crate::types::{ActuationResult, CycleRecord, SensorsNow, WeatherNow};
use crate::weather::WeatherClient;

pub type SharedLastRecord = Arc<RwLock<Option<CycleRecord>>>;

fn fallback_weather(reason: &str) -> WeatherNow {
    WeatherNow {
        temp_f: 0.0,
        rh_pct: 0.0,
        wind_mph: None,
        wind_dir_deg: None,
        precip_in_hr: None,
        conditions: Some(format!("unavailable ({reason})")),
        observation_time_utc: Utc::now().to_rfc3339(),
    }
}

fn fallback_sensors() -> SensorsNow {
    SensorsNow {
        observation_time_utc: Utc::now().to_rfc3339(),
        readings: Vec::new(),
    }
}

struct CycleInputs {
    weather: WeatherNow,
    sensors: SensorsNow,
    window: HistoryWindow,
    blocking_errors: Vec<String>,
}

/// Owns the long-lived handles one control cycle needs. Constructed once at
/// startup and shared by the scheduler and the HTTP server.
pub struct CycleRunner {
    config: AppConfig,
    site: SiteConfig,
    site_hash: String,
    curator_labels: Vec<String>,
    store: Arc<CycleStore>,
    weather: WeatherClient,
    decider: DecisionClient,
    actuator: Box<dyn Actuator>,
    gateway: Option<GatewaySensors>,
    last_record: SharedLastRecord,
}

impl CycleRunner {
    pub fn new(
        config: AppConfig,
        site: SiteConfig,
        store: Arc<CycleStore>,
        last_record: SharedLastRecord,
    ) -> Self {
        let http_timeout = Duration::from_secs(config.http_timeout_secs);
        let weather = WeatherClient::new(http_timeout);
        // The panel gets more headroom than plain HTTP calls.
        let decider = DecisionClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            http_timeout * 3,
        );
        let actuator: Box<dyn Actuator> = Box::new(WebhookActuator::new(
            config.transom_webhook_url.clone(),
            config.transom_webhook_token.clone(),
            config.plug_webhook_url.clone(),
            config.plug_webhook_token.clone(),
            http_timeout,
        ));
        let gateway = match (&config.sensor_source, &config.sensor_gateway_url) {
            (SensorSource::LocalGateway, Some(url)) => Some(GatewaySensors::new(
                url.clone(),
                config.sensor_mapping_path.clone(),
                http_timeout,
            )),
            _ => None,
        };

        let site_hash = site_config_hash(&site);
        let curator_labels = site.curator_labels();
        Self {
            config,
            site,
            site_hash,
            curator_labels,
            store,
            weather,
            decider,
            actuator,
            gateway,
            last_record,
        }
    }

    pub fn with_weather_client(mut self, weather: WeatherClient) -> Self {
        self.weather = weather;
        self
    }

    pub fn with_actuator(mut self, actuator: Box<dyn Actuator>) -> Self {
        self.actuator = actuator;
        self
    }

    pub fn last_record(&self) -> SharedLastRecord {
        Arc::clone(&self.last_record)
    }

    fn timezone(&self) -> &str {
        if self.site.site.timezone.is_empty() {
            &self.config.timezone
        } else {
            &self.site.site.timezone
        }
    }

    fn now_local_iso(&self) -> String {
        match self.timezone().parse::<Tz>() {
            Ok(tz) => Utc::now().with_timezone(&tz).to_rfc3339(),
            Err(_) => {
                warn!(timezone = %self.timezone(), "unknown timezone, using UTC");
                Utc::now().to_rfc3339()
            }
        }
    }

    async fn fetch_sensors(&self) -> Result<SensorsNow> {
        match self.config.sensor_source {
            SensorSource::LocalGateway => match &self.gateway {
                Some(gateway) => gateway.read().await,
                None => anyhow::bail!("sensor_gateway_url required for local_gateway source"),
            },
            SensorSource::Mock => {
                read_mock_sensors(
                    &self.config.sensor_mapping_path,
                    &self.config.mock_sensors_path,
                )
                .await
            }
        }
    }

    /// Collect every cycle input, degrading rather than aborting: each
    /// failed fetch becomes a blocking error and a placeholder value.
    async fn gather(&self) -> CycleInputs {
        let mut blocking_errors = Vec::new();

        let (lat, lon) = match &self.site.site.location {
            Some(loc) => (loc.lat, loc.lon),
            None => (self.config.home_lat, self.config.home_lon),
        };
        let weather = match self.weather.current(lat, lon, self.timezone()).await {
            Ok(weather) => weather,
            Err(e) => {
                let msg = format!("Weather fetch failed: {e:#}");
                error!("{msg}");
                blocking_errors.push(msg.clone());
                fallback_weather(&msg)
            }
        };

        let sensors = match self.fetch_sensors().await {
            Ok(sensors) => sensors,
            Err(e) => {
                let msg = format!("Sensor fetch failed: {e:#}");
                error!("{msg}");
                blocking_errors.push(msg);
                fallback_sensors()
            }
        };

        let records = match self.store.recent_records(self.config.history_rows) {
            Ok(records) => records,
            Err(e) => {
                let msg = format!("Failed to read history: {e:#}");
                error!("{msg}");
                blocking_errors.push(msg);
                Vec::new()
            }
        };

        let window = build_prompt_history_window(HistoryWindowParams {
            records: &records,
            site: &self.site,
            max_rows: self.config.history_rows,
            max_minutes: self.config.history_max_minutes,
            summary_max_chars: Some(self.config.summary_max_chars),
        });

        CycleInputs {
            weather,
            sensors,
            window,
            blocking_errors,
        }
    }

    fn assemble_prompt(&self, inputs: &CycleInputs) -> PromptOutput {
        let telemetry = summarize(&self.site, &inputs.sensors);
        build_prompt(PromptParams {
            weather: &inputs.weather,
            sensors: &inputs.sensors,
            telemetry: &telemetry,
            history_rows: &inputs.window.history_rows,
            history_summary: &inputs.window.history_summary,
            timezone: self.timezone(),
            prompt_max_chars: Some(self.config.prompt_max_chars),
            site: &self.site,
            curator_labels: &self.curator_labels,
        })
    }

    /// Render the prompt the next cycle would send, without deciding or
    /// actuating anything.
    pub async fn render_prompt(&self) -> String {
        let inputs = self.gather().await;
        self.assemble_prompt(&inputs).prompt
    }

    pub async fn run_once(&self) -> Result<CycleRecord> {
        let decision_id = format!("decision_{}", Uuid::new_v4());
        let timestamp_utc_iso = Utc::now().to_rfc3339();
        let timestamp_local_iso = self.now_local_iso();
        info!(%decision_id, %timestamp_local_iso, "cycle start");

        let inputs = self.gather().await;
        let telemetry = summarize(&self.site, &inputs.sensors);
        let prompt_output = self.assemble_prompt(&inputs);

        let mut decision_errors: Vec<String> = Vec::new();
        let decision = if !inputs.blocking_errors.is_empty() {
            fallback_decision(
                &inputs.blocking_errors.join("; "),
                &self.curator_labels,
                &self.site,
            )
        } else {
            match self.decider.decide(&prompt_output.prompt, &self.site).await {
                Ok(decision) => decision,
                Err(e) => {
                    let msg = format!("{e:#}");
                    error!("LLM decision failed: {msg}");
                    decision_errors.push(msg.clone());
                    fallback_decision(&msg, &self.curator_labels, &self.site)
                }
            }
        };

        let decision = apply_sanity(decision, &self.site);

        let actuation = if !inputs.blocking_errors.is_empty() || !decision_errors.is_empty() {
            // Degraded cycles never touch devices; the no-op decision is
            // recorded as-is so the history shows what happened.
            let mut errors = inputs.blocking_errors.clone();
            errors.extend(decision_errors.iter().cloned());
            ActuationResult {
                applied: decision.actions.clone(),
                errors,
                actuation_ok: false,
            }
        } else {
            actuate_diff(
                &self.site,
                self.actuator.as_ref(),
                &decision,
                &decision_id,
                inputs.window.last_applied.as_ref(),
                self.config.dry_run,
            )
            .await
        };

        let mut record = CycleRecord {
            decision_id: decision_id.clone(),
            llm_model: self.config.llm_model.clone(),
            prompt_template_version: prompt_output.prompt_version,
            site_config_id: prompt_output.site_config_id,
            timestamp_local_iso,
            timestamp_utc_iso,
            weather: inputs.weather,
            sensors: inputs.sensors,
            features: telemetry.features.clone(),
            telemetry,
            decision,
            actuation,
        };

        if let Err(e) = self.store.insert_record(&record, &self.site_hash) {
            let msg = format!("Failed to persist cycle record: {e:#}");
            error!("{msg}");
            record.actuation.errors.push(msg);
        }

        if let Err(e) = sync_csv_mirror(
            &self.store,
            &self.site,
            &self.config.mirror_csv_path,
            self.config.sheet_sync_rows,
        ) {
            let msg = format!("Failed to sync CSV mirror (non-blocking): {e:#}");
            warn!("{msg}");
            record.actuation.errors.push(msg);
        }

        *self.last_record.write().await = Some(record.clone());

        info!(
            %decision_id,
            confidence = record.decision.confidence_0_1,
            actuation_errors = record.actuation.errors.len(),
            "cycle complete"
        );
        Ok(record)
    }
}
